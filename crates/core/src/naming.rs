//! Naming conventions for brand builds.
//!
//! Generates the slug, the platform package identifier, and the durable
//! artifact file name from brand parameters.

use chrono::{DateTime, Utc};

use crate::hashing::sha256_hex;

/// Hex characters of `sha256(brand_id)` appended to the package identifier.
pub const PACKAGE_SUFFIX_LEN: usize = 6;

/// Lowercase, collapse every run of non-alphanumerics into one `-`, trim.
///
/// Returns `"app"` when nothing alphanumeric remains.
///
/// # Examples
///
/// ```
/// use brandkit_core::naming::slugify;
///
/// assert_eq!(slugify("Acme Rides"), "acme-rides");
/// assert_eq!(slugify("  Taxi__Co!! "), "taxi-co");
/// assert_eq!(slugify("***"), "app");
/// ```
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "app".to_string()
    } else {
        slug
    }
}

/// Build a reverse-DNS package identifier unique to one brand.
///
/// Convention: `{prefix}.{name}{suffix}` where `name` keeps only lowercase
/// ASCII alphanumerics and `suffix` is the first [`PACKAGE_SUFFIX_LEN`] hex
/// characters of `sha256(brand_id)`. A name that is empty or starts with a
/// digit gets an `app` prefix so the segment stays a valid identifier.
pub fn package_identifier(prefix: &str, company_name: &str, brand_id: &str) -> String {
    let mut segment: String = company_name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if segment.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        segment.insert_str(0, "app");
    }
    let digest = sha256_hex(brand_id.as_bytes());
    let suffix = &digest[..PACKAGE_SUFFIX_LEN];
    let prefix = prefix.trim_end_matches('.');
    format!("{prefix}.{segment}{suffix}")
}

/// Durable artifact file name: `{slug}-v{version}-{YYYYMMDDHHMMSSmmm}.{ext}`.
pub fn artifact_filename(slug: &str, version: &str, at: DateTime<Utc>, ext: &str) -> String {
    let stamp = at.format("%Y%m%d%H%M%S%3f");
    format!("{slug}-v{version}-{stamp}.{ext}")
}

/// Variant of [`artifact_filename`] with a `-{n}` disambiguator before the
/// extension, used when the plain name is already taken.
pub fn artifact_filename_with_counter(
    slug: &str,
    version: &str,
    at: DateTime<Utc>,
    ext: &str,
    n: u32,
) -> String {
    let stamp = at.format("%Y%m%d%H%M%S%3f");
    format!("{slug}-v{version}-{stamp}-{n}.{ext}")
}

/// Workspace directory key: 8 hex characters of the job id.
///
/// Taken from the random tail: the leading characters of a v7 id are a
/// timestamp and repeat across jobs submitted close together.
pub fn workspace_key(job_id: &uuid::Uuid) -> String {
    let hex = job_id.simple().to_string();
    hex[hex.len() - 8..].to_string()
}
