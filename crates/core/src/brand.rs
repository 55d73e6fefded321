//! Brand customization parameters and their validation.
//!
//! A [`BrandCustomization`] is the parameter set a submission carries: the
//! display name, theme colors, an optional PNG logo, and the build mode.
//! Shape validation happens at submission time; logo decoding happens
//! inside the customization stage so a malformed asset fails the job rather
//! than the request.

use std::io::Cursor;
use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{ImageFormat, ImageReader};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::build_job::BuildMode;
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum length of the company display name, in characters.
pub const MAX_COMPANY_NAME_LENGTH: usize = 100;

/// Maximum decoded logo size (5 MiB).
pub const MAX_LOGO_BYTES: usize = 5 * 1024 * 1024;

pub const DEFAULT_PRIMARY_COLOR: &str = "#FFFFFF";
pub const DEFAULT_SECONDARY_COLOR: &str = "#000000";
pub const DEFAULT_TERTIARY_COLOR: &str = "#F4B400";

/// `#RGB`, `#RRGGBB`, or `#RRGGBBAA`.
static HEX_COLOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#(?:[0-9a-fA-F]{3}|[0-9a-fA-F]{6}|[0-9a-fA-F]{8})$").expect("valid regex")
});

fn default_primary() -> String {
    DEFAULT_PRIMARY_COLOR.to_string()
}

fn default_secondary() -> String {
    DEFAULT_SECONDARY_COLOR.to_string()
}

fn default_tertiary() -> String {
    DEFAULT_TERTIARY_COLOR.to_string()
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Parameters that turn the shared template into one brand's app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandCustomization {
    pub company_name: String,
    /// Base64 PNG, optionally wrapped in a `data:image/png;base64,` URL.
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default = "default_primary")]
    pub primary_color: String,
    #[serde(default = "default_secondary")]
    pub secondary_color: String,
    #[serde(default = "default_tertiary")]
    pub tertiary_color: String,
    /// Keep the artifact local; skip the upload.
    #[serde(default)]
    pub local_only: bool,
    #[serde(default)]
    pub build_mode: BuildMode,
}

/// Why a logo payload could not be turned into an icon.
#[derive(Debug, thiserror::Error)]
pub enum LogoError {
    #[error("logo is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("logo exceeds {MAX_LOGO_BYTES} bytes")]
    TooLarge,

    #[error("logo is not a PNG image")]
    NotPng,

    #[error("logo image is unreadable: {0}")]
    Unreadable(String),
}

impl BrandCustomization {
    /// Customization with default colors, no logo, native mode.
    pub fn new(company_name: impl Into<String>) -> Self {
        Self {
            company_name: company_name.into(),
            logo: None,
            primary_color: default_primary(),
            secondary_color: default_secondary(),
            tertiary_color: default_tertiary(),
            local_only: false,
            build_mode: BuildMode::Native,
        }
    }

    /// Check the shape of every field. Does not decode the logo.
    pub fn validate(&self) -> Result<(), CoreError> {
        let name = self.company_name.trim();
        if name.is_empty() {
            return Err(CoreError::Validation("company_name must not be blank".into()));
        }
        if name.chars().count() > MAX_COMPANY_NAME_LENGTH {
            return Err(CoreError::Validation(format!(
                "company_name must be at most {MAX_COMPANY_NAME_LENGTH} characters"
            )));
        }
        for (field, value) in [
            ("primary_color", &self.primary_color),
            ("secondary_color", &self.secondary_color),
            ("tertiary_color", &self.tertiary_color),
        ] {
            if !is_hex_color(value) {
                return Err(CoreError::Validation(format!(
                    "{field} must be a hex color like #1A2B3C, got '{value}'"
                )));
            }
        }
        if self.logo.as_deref().is_some_and(|l| l.trim().is_empty()) {
            return Err(CoreError::Validation("logo must not be empty when provided".into()));
        }
        Ok(())
    }

    /// Decode the logo into PNG bytes, if one was supplied.
    pub fn decode_logo(&self) -> Result<Option<Vec<u8>>, LogoError> {
        self.logo.as_deref().map(decode_png_payload).transpose()
    }
}

/// Whether `value` is an accepted hex color literal.
pub fn is_hex_color(value: &str) -> bool {
    HEX_COLOR_RE.is_match(value)
}

/// Decode a base64 (or data-URL) payload and require it to be a PNG.
pub fn decode_png_payload(payload: &str) -> Result<Vec<u8>, LogoError> {
    let encoded = match payload.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => payload,
    };
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD.decode(compact)?;
    if bytes.len() > MAX_LOGO_BYTES {
        return Err(LogoError::TooLarge);
    }

    let reader = ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()
        .map_err(|e| LogoError::Unreadable(e.to_string()))?;
    if reader.format() != Some(ImageFormat::Png) {
        return Err(LogoError::NotPng);
    }
    reader
        .into_dimensions()
        .map_err(|e| LogoError::Unreadable(e.to_string()))?;

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn png_base64() -> String {
        let img = image::RgbaImage::new(2, 2);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).expect("encode png");
        STANDARD.encode(out.into_inner())
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(BrandCustomization::new("Acme Rides").validate().is_ok());
    }

    #[test]
    fn blank_name_is_rejected() {
        let result = BrandCustomization::new("   ").validate();
        assert_matches!(result, Err(CoreError::Validation(_)));
    }

    #[test]
    fn bad_color_is_rejected() {
        let mut brand = BrandCustomization::new("Acme");
        brand.secondary_color = "blue".into();
        assert_matches!(brand.validate(), Err(CoreError::Validation(msg)) if msg.contains("secondary_color"));
    }

    #[test]
    fn hex_color_forms() {
        assert!(is_hex_color("#fff"));
        assert!(is_hex_color("#1A2B3C"));
        assert!(is_hex_color("#1A2B3C80"));
        assert!(!is_hex_color("1A2B3C"));
        assert!(!is_hex_color("#12345"));
    }

    #[test]
    fn deserializes_with_defaults() {
        let brand: BrandCustomization =
            serde_json::from_str(r#"{"company_name": "Acme"}"#).expect("deserialize");
        assert_eq!(brand.primary_color, DEFAULT_PRIMARY_COLOR);
        assert_eq!(brand.tertiary_color, DEFAULT_TERTIARY_COLOR);
        assert_eq!(brand.build_mode, BuildMode::Native);
        assert!(!brand.local_only);
    }

    #[test]
    fn data_url_prefix_is_stripped() {
        let payload = format!("data:image/png;base64,{}", png_base64());
        let bytes = decode_png_payload(&payload).expect("valid png");
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[test]
    fn non_png_logo_is_rejected() {
        let payload = STANDARD.encode(b"GIF89a not really a gif");
        assert_matches!(decode_png_payload(&payload), Err(LogoError::NotPng));
    }

    #[test]
    fn garbage_logo_is_an_encoding_error() {
        assert_matches!(decode_png_payload("%%%not-base64%%%"), Err(LogoError::Encoding(_)));
    }
}
