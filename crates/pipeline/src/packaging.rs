//! Locating the compiled artifact and moving it to durable storage.

use std::path::{Path, PathBuf};

use brandkit_core::naming::{artifact_filename, artifact_filename_with_counter, slugify};
use chrono::{DateTime, Utc};

const ARTIFACT_EXTENSIONS: [&str; 2] = ["apk", "aab"];

#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    #[error("No build artifact found (searched: {searched})")]
    NotFound { searched: String },

    #[error("Failed to store artifact at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A stored artifact, ready for publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub file_name: String,
    /// `{brand-id-slug}/{file_name}`, used as the remote object key.
    pub object_key: String,
    pub size_bytes: u64,
}

/// Naming inputs for [`store_artifact`].
#[derive(Debug, Clone)]
pub struct ArtifactNaming<'a> {
    pub brand_id: &'a str,
    pub brand_slug: &'a str,
    pub version: &'a str,
    pub at: DateTime<Utc>,
}

/// First existing candidate under `project`. Candidates that are
/// directories are searched for the alphabetically first `.apk`/`.aab`.
pub async fn locate_artifact(
    project: &Path,
    candidates: &[PathBuf],
) -> Result<PathBuf, PackagingError> {
    for candidate in candidates {
        let path = project.join(candidate);
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            continue;
        };
        if meta.is_file() {
            return Ok(path);
        }
        if meta.is_dir() {
            if let Some(found) = first_artifact_in(&path).await {
                return Ok(found);
            }
        }
    }
    Err(PackagingError::NotFound {
        searched: candidates
            .iter()
            .map(|c| c.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

async fn first_artifact_in(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut found = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_artifact = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| ARTIFACT_EXTENSIONS.contains(&e));
        if is_artifact && entry.file_type().await.is_ok_and(|t| t.is_file()) {
            found.push(path);
        }
    }
    found.sort();
    found.into_iter().next()
}

/// Copy `source` to `{output_dir}/{brand-id-slug}/{artifact name}`.
///
/// An existing file with the same name is never overwritten; a `-{n}`
/// counter is appended instead.
pub async fn store_artifact(
    source: &Path,
    output_dir: &Path,
    naming: &ArtifactNaming<'_>,
) -> Result<StoredArtifact, PackagingError> {
    let brand_dir_name = slugify(naming.brand_id);
    let brand_dir = output_dir.join(&brand_dir_name);
    tokio::fs::create_dir_all(&brand_dir)
        .await
        .map_err(|source| PackagingError::Io {
            path: brand_dir.clone(),
            source,
        })?;

    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("apk")
        .to_ascii_lowercase();

    let mut file_name = artifact_filename(naming.brand_slug, naming.version, naming.at, &ext);
    let mut n = 1;
    while tokio::fs::try_exists(brand_dir.join(&file_name))
        .await
        .unwrap_or(false)
    {
        file_name =
            artifact_filename_with_counter(naming.brand_slug, naming.version, naming.at, &ext, n);
        n += 1;
    }

    let dest = brand_dir.join(&file_name);
    let size_bytes = tokio::fs::copy(source, &dest)
        .await
        .map_err(|source| PackagingError::Io {
            path: dest.clone(),
            source,
        })?;

    Ok(StoredArtifact {
        object_key: format!("{brand_dir_name}/{file_name}"),
        path: dest,
        file_name,
        size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_ARTIFACT_CANDIDATES;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn candidates() -> Vec<PathBuf> {
        DEFAULT_ARTIFACT_CANDIDATES.iter().map(PathBuf::from).collect()
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, b"binary").expect("write");
    }

    #[tokio::test]
    async fn prefers_the_canonical_release_apk() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("android/app/build/outputs/apk/release/app-release.apk"));
        touch(&dir.path().join("android/app/build/outputs/apk/release/aaa.apk"));

        let found = locate_artifact(dir.path(), &candidates()).await.expect("found");
        assert!(found.ends_with("app-release.apk"));
    }

    #[tokio::test]
    async fn falls_back_to_bundle_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("android/app/build/outputs/bundle/release/app.aab"));
        touch(&dir.path().join("android/app/build/outputs/bundle/release/notes.txt"));

        let found = locate_artifact(dir.path(), &candidates()).await.expect("found");
        assert!(found.ends_with("app.aab"));
    }

    #[tokio::test]
    async fn missing_artifact_lists_searched_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = locate_artifact(dir.path(), &candidates()).await.unwrap_err();
        assert_matches!(err, PackagingError::NotFound { ref searched } if searched.contains("app-release.apk"));
    }

    #[tokio::test]
    async fn store_never_overwrites_same_timestamp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("app-release.apk");
        touch(&source);
        let out = dir.path().join("out");
        let naming = ArtifactNaming {
            brand_id: "Brand 1",
            brand_slug: "acme",
            version: "1.0.0",
            at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        };

        let first = store_artifact(&source, &out, &naming).await.expect("first");
        let second = store_artifact(&source, &out, &naming).await.expect("second");

        assert_eq!(first.file_name, "acme-v1.0.0-20260301120000000.apk");
        assert_eq!(second.file_name, "acme-v1.0.0-20260301120000000-1.apk");
        assert_eq!(first.object_key, "brand-1/acme-v1.0.0-20260301120000000.apk");
        assert!(first.path.starts_with(out.join("brand-1")));
        assert!(second.path.is_file());
        assert_eq!(first.size_bytes, 6);
    }
}
