use crate::catalog::{EncoderId, EncoderSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("unrecognized file")]
    UnreadableImage,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported output format: {format}")]
    UnsupportedFormat { format: String },

    #[error("{encoder} encoder failed: {message}")]
    Encode { encoder: EncoderId, message: String },

    #[error("could not write archive: {message}")]
    ArchiveWrite { message: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl ConversionError {
    pub(crate) fn encode(encoder: EncoderId, err: impl fmt::Display) -> Self {
        Self::Encode {
            encoder,
            message: err.to_string(),
        }
    }
}

/// Upper bound on the buffer reserved up front from a declared input size.
const MAX_PREALLOCATION: u64 = 1 << 26;

/// Where the bytes of an uploaded file come from.
pub enum InputSource {
    Memory(Vec<u8>),
    File(PathBuf),
    Reader(Box<dyn Read + Send>),
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
            Self::File(path) => write!(f, "File({})", path.display()),
            Self::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

#[derive(Debug)]
pub struct InputFile {
    pub original_name: String,
    pub source: InputSource,
    pub size: u64,
}

impl InputFile {
    pub fn from_bytes(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            original_name: name.into(),
            size: content.len() as u64,
            source: InputSource::Memory(content),
        }
    }

    /// Builds an input backed by a file on disk. A missing file is not an
    /// error here; it surfaces as an IO failure when the file is converted.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let original_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self {
            original_name,
            source: InputSource::File(path),
            size,
        }
    }

    pub fn from_reader(name: impl Into<String>, reader: Box<dyn Read + Send>, size: u64) -> Self {
        Self {
            original_name: name.into(),
            source: InputSource::Reader(reader),
            size,
        }
    }

    pub(crate) fn read_all(self) -> Result<Vec<u8>, ConversionError> {
        match self.source {
            InputSource::Memory(bytes) => Ok(bytes),
            InputSource::File(path) => Ok(std::fs::read(path)?),
            InputSource::Reader(mut reader) => {
                let mut buf = Vec::with_capacity(self.size.min(MAX_PREALLOCATION) as usize);
                reader.read_to_end(&mut buf)?;
                Ok(buf)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgbColor(pub u8, pub u8, pub u8);

impl RgbColor {
    pub const WHITE: RgbColor = RgbColor(255, 255, 255);

    pub fn to_array(self) -> [u8; 3] {
        [self.0, self.1, self.2]
    }
}

impl FromStr for RgbColor {
    type Err = ConversionError;

    /// Parses `#RRGGBB` (the leading `#` is optional).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim().trim_start_matches('#');
        let invalid = || ConversionError::Config {
            message: format!("invalid color '{s}', expected #RRGGBB"),
        };
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(invalid());
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
        Ok(RgbColor(channel(0)?, channel(2)?, channel(4)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingStyle {
    Prefix,
    #[default]
    Suffix,
}

impl FromStr for NamingStyle {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prefix" => Ok(Self::Prefix),
            "suffix" | "" => Ok(Self::Suffix),
            other => Err(ConversionError::Config {
                message: format!("unknown naming style '{other}'"),
            }),
        }
    }
}

/// Parameters applied uniformly to every file of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeParameters {
    pub jpeg_quality: u8,         // 1-95
    pub jpeg_progressive: bool,
    pub webp_quality: u8,         // 0-100
    pub png_compression_level: u8, // 0-9
    pub tiff_compression: Option<String>,
    pub background_color: RgbColor,
    pub overwrite_existing: bool,
    pub naming_style: NamingStyle,
    pub brand_tag: String,
}

impl Default for EncodeParameters {
    fn default() -> Self {
        Self {
            jpeg_quality: 85,
            jpeg_progressive: true,
            webp_quality: 85,
            png_compression_level: 6,
            tiff_compression: None,
            background_color: RgbColor::WHITE,
            overwrite_existing: false,
            naming_style: NamingStyle::Suffix,
            brand_tag: "converte-tudo".to_string(),
        }
    }
}

impl EncodeParameters {
    /// Returns a copy with every numeric field forced into its valid range.
    pub fn clamped(&self) -> Self {
        Self {
            jpeg_quality: self.jpeg_quality.clamp(1, 95),
            webp_quality: self.webp_quality.min(100),
            png_compression_level: self.png_compression_level.min(9),
            tiff_compression: self
                .tiff_compression
                .as_ref()
                .map(|c| c.trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty()),
            ..self.clone()
        }
    }

    /// Layers the catalog defaults of `spec` over these parameters.
    pub fn for_format(&self, spec: &EncoderSpec) -> Self {
        let defaults = spec.default_params;
        let mut params = self.clone();
        match spec.encoder {
            EncoderId::Jpeg => {
                if let Some(quality) = defaults.quality {
                    params.jpeg_quality = quality;
                }
                if let Some(progressive) = defaults.progressive {
                    params.jpeg_progressive = progressive;
                }
            }
            EncoderId::Webp => {
                if let Some(quality) = defaults.quality {
                    params.webp_quality = quality;
                }
            }
            _ => {}
        }
        if let Some(level) = defaults.compression_level {
            params.png_compression_level = level;
        }
        params
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionOutcome {
    pub source_name: String,
    pub succeeded: bool,
    pub output_path: Option<PathBuf>,
    pub output_encoder: Option<EncoderId>,
    pub used_fallback: bool,
    /// Failure text, or a note on a success that took a shortcut or the
    /// fallback path.
    pub reason: Option<String>,
}

impl ConversionOutcome {
    pub(crate) fn converted(
        source_name: &str,
        path: PathBuf,
        encoder: EncoderId,
        used_fallback: bool,
        reason: Option<String>,
    ) -> Self {
        Self {
            source_name: source_name.to_string(),
            succeeded: true,
            output_path: Some(path),
            output_encoder: Some(encoder),
            used_fallback,
            reason,
        }
    }

    pub(crate) fn failed(source_name: &str, reason: impl Into<String>) -> Self {
        Self {
            source_name: source_name.to_string(),
            succeeded: false,
            output_path: None,
            output_encoder: None,
            used_fallback: false,
            reason: Some(reason.into()),
        }
    }

    pub fn output_basename(&self) -> Option<String> {
        self.output_path
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub succeeded: bool,
    pub archive_path: Option<PathBuf>,
    pub converted_count: usize,
    pub fallback_count: usize,
    pub per_file_outcomes: Vec<ConversionOutcome>,
}

impl BatchOutcome {
    pub(crate) fn empty() -> Self {
        Self {
            succeeded: false,
            archive_path: None,
            converted_count: 0,
            fallback_count: 0,
            per_file_outcomes: Vec::new(),
        }
    }

    /// Outcomes of the files that did not convert, in input order.
    pub fn failures(&self) -> impl Iterator<Item = &ConversionOutcome> {
        self.per_file_outcomes.iter().filter(|o| !o.succeeded)
    }

    pub fn failure_reports(&self) -> Vec<FailureReport> {
        self.failures()
            .map(|o| FailureReport {
                source: o.source_name.clone(),
                reason: o.reason.clone().unwrap_or_default(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureReport {
    pub source: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FormatCatalog;

    #[test]
    fn parses_hex_colors() {
        assert_eq!("#FF8000".parse::<RgbColor>().unwrap(), RgbColor(255, 128, 0));
        assert_eq!("0a0b0c".parse::<RgbColor>().unwrap(), RgbColor(10, 11, 12));
        assert!("#FFF".parse::<RgbColor>().is_err());
        assert!("#GGGGGG".parse::<RgbColor>().is_err());
    }

    #[test]
    fn clamps_numeric_fields() {
        let params = EncodeParameters {
            jpeg_quality: 0,
            webp_quality: 250,
            png_compression_level: 12,
            tiff_compression: Some("  LZW ".into()),
            ..EncodeParameters::default()
        }
        .clamped();
        assert_eq!(params.jpeg_quality, 1);
        assert_eq!(params.webp_quality, 100);
        assert_eq!(params.png_compression_level, 9);
        assert_eq!(params.tiff_compression.as_deref(), Some("lzw"));

        let high = EncodeParameters {
            jpeg_quality: 100,
            tiff_compression: Some(" ".into()),
            ..EncodeParameters::default()
        }
        .clamped();
        assert_eq!(high.jpeg_quality, 95);
        assert_eq!(high.tiff_compression, None);
    }

    #[test]
    fn format_defaults_layer_over_batch_parameters() {
        let catalog = FormatCatalog::standard();
        let base = EncodeParameters {
            jpeg_quality: 40,
            jpeg_progressive: false,
            png_compression_level: 1,
            ..EncodeParameters::default()
        };
        let jpeg = base.for_format(catalog.lookup("jpg").unwrap());
        assert_eq!((jpeg.jpeg_quality, jpeg.jpeg_progressive), (85, true));
        assert_eq!(jpeg.png_compression_level, 1);

        let png = base.for_format(catalog.lookup("png").unwrap());
        assert_eq!(png.png_compression_level, 6);
        assert_eq!(png.jpeg_quality, 40);

        assert_eq!(base.for_format(catalog.lookup("bmp").unwrap()), base);
    }

    #[test]
    fn naming_style_parses_case_insensitively() {
        assert_eq!("PREFIX".parse::<NamingStyle>().unwrap(), NamingStyle::Prefix);
        assert_eq!("".parse::<NamingStyle>().unwrap(), NamingStyle::Suffix);
        assert!("middle".parse::<NamingStyle>().is_err());
    }

    #[test]
    fn reader_inputs_are_drained() {
        let input = InputFile::from_reader("r.bin", Box::new(std::io::Cursor::new(vec![1, 2, 3])), 3);
        assert_eq!(input.read_all().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn declared_reader_size_is_not_trusted() {
        let input = InputFile::from_reader("big.bin", Box::new(std::io::Cursor::new(vec![4, 5])), u64::MAX);
        assert_eq!(input.read_all().unwrap(), vec![4, 5]);
    }
}
