//! Rewrites a copied template project for one brand.
//!
//! Four independent edits, applied by the worker in order with progress
//! reported between them: the app manifest, the icon asset, the theme
//! constants, and the brand identity constants. The template reads the two
//! constant files at its own build time.

use std::path::{Path, PathBuf};

use brandkit_core::brand::{BrandCustomization, LogoError};
use brandkit_core::naming::{package_identifier, slugify};
use serde_json::{json, Map, Value};

pub const MANIFEST_FILE: &str = "app.json";
pub const ICON_FILE: &str = "assets/logo.png";
pub const THEME_FILE: &str = "src/constants/colors.ts";
pub const BRAND_FILE: &str = "src/constants/brand.ts";

/// Android `versionCode` written into every manifest.
const VERSION_CODE: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CustomizationError {
    #[error("Manifest not found at {0}")]
    ManifestMissing(PathBuf),

    #[error("Manifest is malformed: {0}")]
    ManifestMalformed(String),

    #[error("Invalid logo: {0}")]
    Logo(#[from] LogoError),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Identity derived while rewriting the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub display_name: String,
    pub slug: String,
    pub package_id: String,
}

#[derive(Debug, Clone)]
pub struct TemplateCustomizer {
    bundle_prefix: String,
    app_version: String,
}

impl TemplateCustomizer {
    pub fn new(bundle_prefix: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            bundle_prefix: bundle_prefix.into(),
            app_version: app_version.into(),
        }
    }

    pub fn identity(&self, brand_id: &str, brand: &BrandCustomization) -> AppIdentity {
        let display_name = brand.company_name.trim().to_string();
        AppIdentity {
            slug: slugify(&display_name),
            package_id: package_identifier(&self.bundle_prefix, &display_name, brand_id),
            display_name,
        }
    }

    /// Rewrite name, slug, version, and package identifiers in `app.json`.
    pub async fn rewrite_manifest(
        &self,
        project: &Path,
        brand_id: &str,
        brand: &BrandCustomization,
    ) -> Result<AppIdentity, CustomizationError> {
        let path = project.join(MANIFEST_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CustomizationError::ManifestMissing(path));
            }
            Err(source) => return Err(CustomizationError::Io { path, source }),
        };
        let mut manifest: Value = serde_json::from_str(&raw)
            .map_err(|e| CustomizationError::ManifestMalformed(e.to_string()))?;

        let identity = self.identity(brand_id, brand);
        apply_manifest(&mut manifest, &identity, &self.app_version, brand)?;

        let pretty = serde_json::to_string_pretty(&manifest)
            .map_err(|e| CustomizationError::ManifestMalformed(e.to_string()))?;
        write_file(&path, pretty.as_bytes()).await?;
        Ok(identity)
    }

    /// Decode and store the logo. Returns `false` when no logo was given.
    pub async fn write_icon(
        &self,
        project: &Path,
        brand: &BrandCustomization,
    ) -> Result<bool, CustomizationError> {
        let Some(bytes) = brand.decode_logo()? else {
            return Ok(false);
        };
        write_file(&project.join(ICON_FILE), &bytes).await?;
        Ok(true)
    }

    /// Regenerate the theme constants. Returns `false` when the template has
    /// no theme file to replace.
    pub async fn write_theme(
        &self,
        project: &Path,
        brand: &BrandCustomization,
    ) -> Result<bool, CustomizationError> {
        let path = project.join(THEME_FILE);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::warn!(path = %path.display(), "Theme file missing from template, skipping");
            return Ok(false);
        }
        write_file(&path, render_theme(brand).as_bytes()).await?;
        Ok(true)
    }

    /// Write the brand identity constants.
    pub async fn write_brand_identity(
        &self,
        project: &Path,
        brand_id: &str,
        brand: &BrandCustomization,
    ) -> Result<(), CustomizationError> {
        let contents = render_brand(brand_id, brand.company_name.trim());
        write_file(&project.join(BRAND_FILE), contents.as_bytes()).await
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn apply_manifest(
    manifest: &mut Value,
    identity: &AppIdentity,
    version: &str,
    brand: &BrandCustomization,
) -> Result<(), CustomizationError> {
    let root = manifest
        .as_object_mut()
        .ok_or_else(|| CustomizationError::ManifestMalformed("top level is not an object".into()))?;
    let expo = object_entry(root, "expo")?;

    expo.insert("name".into(), json!(identity.display_name));
    expo.insert("slug".into(), json!(identity.slug));
    expo.insert("version".into(), json!(version));

    let has_logo = brand.logo.is_some();
    if has_logo {
        expo.insert("icon".into(), json!(format!("./{ICON_FILE}")));
    }

    let android = object_entry(expo, "android")?;
    android.insert("package".into(), json!(identity.package_id));
    android.insert("versionCode".into(), json!(VERSION_CODE));
    if has_logo {
        android.insert(
            "adaptiveIcon".into(),
            json!({
                "foregroundImage": format!("./{ICON_FILE}"),
                "backgroundColor": brand.primary_color,
            }),
        );
    }

    let ios = object_entry(expo, "ios")?;
    ios.insert("bundleIdentifier".into(), json!(identity.package_id));
    Ok(())
}

/// Get `key` as an object, creating it when absent.
fn object_entry<'a>(
    map: &'a mut Map<String, Value>,
    key: &str,
) -> Result<&'a mut Map<String, Value>, CustomizationError> {
    map.entry(key)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| CustomizationError::ManifestMalformed(format!("'{key}' is not an object")))
}

fn render_theme(brand: &BrandCustomization) -> String {
    format!(
        "// Generated for this brand build. Edits are overwritten.\n\
         export const Colors = {{\n\
         \x20 primary: '{primary}',\n\
         \x20 secondary: '{secondary}',\n\
         \x20 tertiary: '{tertiary}',\n\
         \x20 background: '#FFFFFF',\n\
         \x20 surface: '#F5F5F5',\n\
         \x20 text: '#1A1A1A',\n\
         \x20 textSecondary: '#6B6B6B',\n\
         \x20 border: '#E0E0E0',\n\
         \x20 success: '#2E7D32',\n\
         \x20 warning: '#F9A825',\n\
         \x20 error: '#C62828',\n\
         \x20 white: '#FFFFFF',\n\
         \x20 black: '#000000',\n\
         }};\n\
         \n\
         export const Shadows = {{\n\
         \x20 small: {{ shadowColor: '#000', shadowOffset: {{ width: 0, height: 1 }}, shadowOpacity: 0.1, shadowRadius: 2, elevation: 2 }},\n\
         \x20 medium: {{ shadowColor: '#000', shadowOffset: {{ width: 0, height: 2 }}, shadowOpacity: 0.15, shadowRadius: 4, elevation: 4 }},\n\
         }};\n\
         \n\
         export default Colors;\n",
        primary = escape_ts(&brand.primary_color),
        secondary = escape_ts(&brand.secondary_color),
        tertiary = escape_ts(&brand.tertiary_color),
    )
}

fn render_brand(brand_id: &str, brand_name: &str) -> String {
    format!(
        "// Generated for this brand build. Edits are overwritten.\n\
         export const BRAND_ID = '{}';\n\
         export const BRAND_NAME = '{}';\n\
         export const IS_WHITE_LABEL = true;\n",
        escape_ts(brand_id),
        escape_ts(brand_name),
    )
}

/// Escape for a single-quoted TypeScript string literal.
fn escape_ts(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), CustomizationError> {
    let io = |source| CustomizationError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io)?;
    }
    tokio::fs::write(path, contents).await.map_err(io)
}
