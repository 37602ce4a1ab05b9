//! Output formats this converter can write.
//!
//! The catalog is a closed table: adding an output format means adding an
//! [`EncoderSpec`] row (and, for a new container, an [`EncoderId`] with its
//! [`Capabilities`]). Lookups never fail loudly; a miss tells the caller to
//! take the PNG fallback path.

use serde::Serialize;
use std::fmt;

/// Internal identifier for a concrete image container/codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EncoderId {
    Jpeg,
    Png,
    Bmp,
    Gif,
    Tiff,
    Webp,
    Ico,
    Cur,
    Ppm,
    Pcx,
    Eps,
    Xbm,
    Xpm,
    Tga,
    Sgi,
    Im,
}

impl EncoderId {
    /// The format every normalized image can be written to.
    pub const FALLBACK: EncoderId = EncoderId::Png;

    pub fn name(self) -> &'static str {
        match self {
            Self::Jpeg => "JPEG",
            Self::Png => "PNG",
            Self::Bmp => "BMP",
            Self::Gif => "GIF",
            Self::Tiff => "TIFF",
            Self::Webp => "WEBP",
            Self::Ico => "ICO",
            Self::Cur => "CUR",
            Self::Ppm => "PPM",
            Self::Pcx => "PCX",
            Self::Eps => "EPS",
            Self::Xbm => "XBM",
            Self::Xpm => "XPM",
            Self::Tga => "TGA",
            Self::Sgi => "SGI",
            Self::Im => "IM",
        }
    }

    pub fn capabilities(self) -> Capabilities {
        use ColorStrategy::*;
        let (supports_alpha, supports_gray, strategy) = match self {
            Self::Jpeg | Self::Bmp | Self::Pcx | Self::Eps | Self::Sgi | Self::Im => {
                (false, true, Flatten)
            }
            Self::Png | Self::Tga => (true, true, PreserveAlpha),
            Self::Webp | Self::Ico | Self::Cur => (true, false, PreserveAlpha),
            Self::Gif => (true, false, Palette { keep_transparency: true }),
            Self::Xpm => (false, false, Palette { keep_transparency: false }),
            Self::Xbm => (false, false, Bilevel),
            Self::Ppm => (false, true, NetpbmFamily),
            Self::Tiff => (true, true, Restricted),
        };
        Capabilities {
            supports_alpha,
            supports_gray,
            max_colors: matches!(strategy, Palette { .. }).then_some(256),
            strategy,
        }
    }
}

impl fmt::Display for EncoderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How pixel data is reshaped before it reaches an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorStrategy {
    /// No alpha channel: composite transparency over the background color.
    Flatten,
    /// Alpha-capable container: keep transparency, expand everything to
    /// direct color.
    PreserveAlpha,
    /// Adaptive palette of at most 256 entries.
    Palette { keep_transparency: bool },
    /// 1-bit monochrome.
    Bilevel,
    /// Bit depth chosen by the requested sibling extension (pbm/pgm/ppm).
    NetpbmFamily,
    /// Only RGB, RGBA or grayscale are accepted.
    Restricted,
    /// Anything not described by the table.
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_alpha: bool,
    pub supports_gray: bool,
    pub max_colors: Option<u16>,
    pub strategy: ColorStrategy,
}

impl Capabilities {
    /// Descriptor used for encoders the table does not know about.
    pub const GENERIC: Capabilities = Capabilities {
        supports_alpha: true,
        supports_gray: true,
        max_colors: None,
        strategy: ColorStrategy::Generic,
    };
}

/// Encoder settings a format starts out with before batch parameters apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FormatDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progressive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u8>,
}

impl FormatDefaults {
    pub const NONE: FormatDefaults = FormatDefaults {
        quality: None,
        progressive: None,
        compression_level: None,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EncoderSpec {
    pub extension: &'static str,
    pub encoder: EncoderId,
    pub supports_alpha: bool,
    pub default_params: FormatDefaults,
}

const fn entry(extension: &'static str, encoder: EncoderId, supports_alpha: bool) -> EncoderSpec {
    EncoderSpec {
        extension,
        encoder,
        supports_alpha,
        default_params: FormatDefaults::NONE,
    }
}

const JPEG_DEFAULTS: FormatDefaults = FormatDefaults {
    quality: Some(85),
    progressive: Some(true),
    compression_level: None,
};

const fn jpeg(extension: &'static str) -> EncoderSpec {
    EncoderSpec {
        default_params: JPEG_DEFAULTS,
        ..entry(extension, EncoderId::Jpeg, false)
    }
}

static STANDARD_ENTRIES: &[EncoderSpec] = &[
    jpeg("jpg"),
    jpeg("jpeg"),
    jpeg("jfif"),
    EncoderSpec {
        default_params: FormatDefaults {
            quality: None,
            progressive: None,
            compression_level: Some(6),
        },
        ..entry("png", EncoderId::Png, true)
    },
    entry("bmp", EncoderId::Bmp, false),
    entry("gif", EncoderId::Gif, true),
    entry("tif", EncoderId::Tiff, true),
    entry("tiff", EncoderId::Tiff, true),
    EncoderSpec {
        default_params: FormatDefaults {
            quality: Some(85),
            progressive: None,
            compression_level: None,
        },
        ..entry("webp", EncoderId::Webp, true)
    },
    entry("ico", EncoderId::Ico, true),
    entry("ppm", EncoderId::Ppm, false),
    entry("pgm", EncoderId::Ppm, false),
    entry("pbm", EncoderId::Ppm, false),
    entry("pcx", EncoderId::Pcx, false),
    entry("eps", EncoderId::Eps, false),
    entry("xbm", EncoderId::Xbm, false),
    entry("xpm", EncoderId::Xpm, false),
    entry("tga", EncoderId::Tga, true),
    entry("sgi", EncoderId::Sgi, false),
    entry("im", EncoderId::Im, false),
    entry("cur", EncoderId::Cur, true),
];

#[derive(Debug, Clone, Copy)]
pub struct FormatCatalog {
    entries: &'static [EncoderSpec],
}

impl Default for FormatCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl FormatCatalog {
    pub const fn standard() -> Self {
        Self {
            entries: STANDARD_ENTRIES,
        }
    }

    /// Builds a catalog over a custom table. Extensions must be lowercase
    /// and unique.
    pub const fn from_entries(entries: &'static [EncoderSpec]) -> Self {
        Self { entries }
    }

    /// Case-insensitive exact match; a leading dot is ignored.
    pub fn lookup(&self, extension: &str) -> Option<&'static EncoderSpec> {
        let ext = normalize_extension(extension);
        self.entries.iter().find(|spec| spec.extension == ext)
    }

    pub fn is_supported(&self, extension: &str) -> bool {
        self.lookup(extension).is_some()
    }

    pub fn entries(&self) -> &'static [EncoderSpec] {
        self.entries
    }

    pub fn extensions(&self) -> impl Iterator<Item = &'static str> {
        self.entries.iter().map(|spec| spec.extension)
    }
}

/// Lowercases an extension and strips surrounding whitespace and leading dots.
pub fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn lookup_is_case_insensitive_and_ignores_dot() {
        let catalog = FormatCatalog::standard();
        assert_eq!(catalog.lookup("JPG").map(|s| s.encoder), Some(EncoderId::Jpeg));
        assert_eq!(catalog.lookup(".Tiff").map(|s| s.encoder), Some(EncoderId::Tiff));
        assert_eq!(catalog.lookup("pgm").map(|s| s.encoder), Some(EncoderId::Ppm));
        assert_eq!(catalog.lookup("cur").map(|s| s.encoder), Some(EncoderId::Cur));
    }

    #[test]
    fn unknown_extensions_are_absent() {
        let catalog = FormatCatalog::standard();
        assert!(catalog.lookup("xyz").is_none());
        assert!(catalog.lookup("").is_none());
        assert!(!catalog.is_supported("jpeg2000"));
    }

    #[test]
    fn extensions_are_unique_and_lowercase() {
        let catalog = FormatCatalog::standard();
        let mut seen = HashSet::new();
        for ext in catalog.extensions() {
            assert_eq!(ext, ext.to_ascii_lowercase());
            assert!(seen.insert(ext), "duplicate extension {ext}");
        }
        assert_eq!(seen.len(), 21);
    }

    #[test]
    fn alpha_flag_matches_capabilities() {
        for spec in FormatCatalog::standard().entries() {
            assert_eq!(spec.supports_alpha, spec.encoder.capabilities().supports_alpha);
        }
    }

    #[test]
    fn custom_tables_only_know_their_entries() {
        static TABLE: &[EncoderSpec] = &[entry("png", EncoderId::Png, true), entry("pnm", EncoderId::Ppm, false)];
        let catalog = FormatCatalog::from_entries(TABLE);
        assert_eq!(catalog.lookup(".PNM").map(|s| s.encoder), Some(EncoderId::Ppm));
        assert!(!catalog.is_supported("jpg"));
        assert_eq!(catalog.extensions().collect::<Vec<_>>(), vec!["png", "pnm"]);
    }

    #[test]
    fn palette_formats_cap_colors() {
        assert_eq!(EncoderId::Gif.capabilities().max_colors, Some(256));
        assert_eq!(EncoderId::Xpm.capabilities().max_colors, Some(256));
        assert_eq!(EncoderId::Png.capabilities().max_colors, None);
    }
}
