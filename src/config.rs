//! Service configuration.
//!
//! Settings come from an optional JSON file named by `CONVERTER_CONFIG`,
//! then individual environment variables override the file. Encoding
//! parameters are layered: built-in defaults, then the catalog defaults of
//! the target format, then the `defaults` block of the file, then the
//! request.

use crate::catalog::FormatCatalog;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "CONVERTER_CONFIG";
pub const BIND_ENV: &str = "CONVERTER_BIND";
pub const PORT_ENV: &str = "CONVERTER_PORT";
pub const WORK_DIR_ENV: &str = "CONVERTER_WORK_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind: String,
    pub port: u16,
    /// Each request gets its own job directory under here.
    pub work_dir: PathBuf,
    pub keep_outputs: bool,
    pub workers: usize,
    pub defaults: ParameterOverrides,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8002,
            work_dir: std::env::temp_dir().join("image-batch-converter"),
            keep_outputs: false,
            workers: 0,
            defaults: ParameterOverrides::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConversionError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`ServiceConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConversionError> {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = match var(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if let Some(bind) = var(BIND_ENV) {
            config.bind = bind;
        }
        if let Some(port) = var(PORT_ENV) {
            config.port = port.parse().map_err(|e| config_error(format!("{PORT_ENV} must be a port number: {e}")))?;
        }
        if let Some(dir) = var(WORK_DIR_ENV) {
            config.work_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConversionError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| config_error(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&raw).map_err(|e| config_error(format!("invalid {}: {e}", path.display())))
    }

    /// Parameters for one request converting to `target_extension`.
    pub fn encode_parameters(
        &self,
        catalog: &FormatCatalog,
        target_extension: &str,
        request: &ParameterOverrides,
    ) -> Result<EncodeParameters, ConversionError> {
        let mut params = match catalog.lookup(target_extension) {
            Some(spec) => EncodeParameters::default().for_format(spec),
            None => EncodeParameters::default(),
        };
        self.defaults.apply(&mut params)?;
        request.apply(&mut params)?;
        Ok(params.clamped())
    }
}

/// Optional encoding settings, as they arrive from a config file or a
/// request. Out-of-range numbers are clamped, not rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterOverrides {
    pub jpeg_quality: Option<i64>,
    pub jpeg_progressive: Option<bool>,
    pub webp_quality: Option<i64>,
    #[serde(alias = "png_compression_level")]
    pub png_compress_level: Option<i64>,
    pub tiff_compression: Option<String>,
    #[serde(alias = "background_color")]
    pub background_hex: Option<String>,
    pub brand_tag: Option<String>,
    #[serde(alias = "naming_style")]
    pub name_style: Option<String>,
    #[serde(alias = "overwrite_existing")]
    pub overwrite: Option<bool>,
}

impl ParameterOverrides {
    /// Sets a field from a text form value. Returns `Ok(false)` for names
    /// that are not encoding settings.
    pub fn set_field(&mut self, name: &str, value: &str) -> Result<bool, ConversionError> {
        let value = value.trim();
        match name {
            "jpeg_quality" => self.jpeg_quality = parse_number(name, value)?,
            "jpeg_progressive" => self.jpeg_progressive = parse_flag(name, value)?,
            "webp_quality" => self.webp_quality = parse_number(name, value)?,
            "png_compress_level" | "png_compression_level" => self.png_compress_level = parse_number(name, value)?,
            "tiff_compression" => self.tiff_compression = non_empty(value),
            "background_hex" | "background_color" => self.background_hex = non_empty(value),
            "brand_tag" => self.brand_tag = Some(value.to_string()),
            "name_style" | "naming_style" => self.name_style = non_empty(value),
            "overwrite" | "overwrite_existing" => self.overwrite = parse_flag(name, value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn apply(&self, params: &mut EncodeParameters) -> Result<(), ConversionError> {
        if let Some(q) = self.jpeg_quality {
            params.jpeg_quality = q.clamp(1, 95) as u8;
        }
        if let Some(p) = self.jpeg_progressive {
            params.jpeg_progressive = p;
        }
        if let Some(q) = self.webp_quality {
            params.webp_quality = q.clamp(0, 100) as u8;
        }
        if let Some(level) = self.png_compress_level {
            params.png_compression_level = level.clamp(0, 9) as u8;
        }
        if let Some(compression) = &self.tiff_compression {
            params.tiff_compression = Some(compression.clone());
        }
        if let Some(hex) = &self.background_hex {
            params.background_color = hex.parse()?;
        }
        if let Some(tag) = &self.brand_tag {
            params.brand_tag = tag.clone();
        }
        if let Some(style) = &self.name_style {
            params.naming_style = style.parse()?;
        }
        if let Some(overwrite) = self.overwrite {
            params.overwrite_existing = overwrite;
        }
        Ok(())
    }
}

fn config_error(message: String) -> ConversionError {
    ConversionError::Config { message }
}

fn non_empty(value: &str) -> Option<String> {
    Some(value.to_string()).filter(|v| !v.is_empty())
}

fn parse_number(name: &str, value: &str) -> Result<Option<i64>, ConversionError> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<i64>()
        .map(Some)
        .map_err(|_| config_error(format!("{name} must be an integer, got '{value}'")))
}

fn parse_flag(name: &str, value: &str) -> Result<Option<bool>, ConversionError> {
    match value.to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "true" | "on" | "yes" => Ok(Some(true)),
        "0" | "false" | "off" | "no" => Ok(Some(false)),
        _ => Err(config_error(format!("{name} must be a boolean, got '{value}'"))),
    }
}
