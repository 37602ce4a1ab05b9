use crate::catalog::{normalize_extension, EncoderId, FormatCatalog};
use crate::decoder::{self, DecodedImage};
use crate::image_processor::ImageProcessor;
use crate::normalizer;
use crate::types::*;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Reason attached to a success that reused an existing output file.
pub const ALREADY_EXISTED: &str = "already existed";
const FALLBACK_EXTENSION: &str = "png";
const DEFAULT_STEM: &str = "image";

/// Converts uploaded images to a requested format, falling back to PNG when
/// the format is unknown or its encoder rejects the image.
pub struct ImagesConverter {
    params: EncodeParameters,
    catalog: FormatCatalog,
    processor: ImageProcessor,
}

impl ImagesConverter {
    pub fn new(params: EncodeParameters) -> Self {
        Self::with_catalog(params, FormatCatalog::standard())
    }

    pub fn with_catalog(params: EncodeParameters, catalog: FormatCatalog) -> Self {
        let params = params.clamped();
        Self {
            processor: ImageProcessor::new(&params),
            params,
            catalog,
        }
    }

    pub fn params(&self) -> &EncodeParameters {
        &self.params
    }

    pub fn catalog(&self) -> &FormatCatalog {
        &self.catalog
    }

    /// Converts one file into `out_dir`. Never fails: every error ends up in
    /// the returned outcome.
    pub fn convert_one(&self, input: InputFile, out_dir: &Path, out_ext: &str) -> ConversionOutcome {
        let source_name = input.original_name.clone();
        log::debug!("Converting {} ({} bytes) to {}", source_name, input.size, out_ext);

        let decoded = match input.read_all().and_then(|bytes| decoder::decode(&bytes)) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("Skipping {}: {}", source_name, e);
                return ConversionOutcome::failed(&source_name, e.to_string());
            }
        };

        let stem = source_stem(&source_name);
        let requested = normalize_extension(out_ext);
        let fallback_cause = match self.catalog.lookup(&requested) {
            None => ConversionError::UnsupportedFormat {
                format: requested.clone(),
            }
            .to_string(),
            Some(spec) => {
                let destination = out_dir.join(self.output_name(&stem, &requested));
                match self.write_output(&decoded, spec.encoder, &requested, &destination) {
                    Ok(note) => {
                        return ConversionOutcome::converted(&source_name, destination, spec.encoder, false, note)
                    }
                    Err(e) => format!("target format failed ({}): {}", spec.encoder, e),
                }
            }
        };

        log::warn!("{}: {}; falling back to PNG", source_name, fallback_cause);
        let destination = out_dir.join(self.output_name(&stem, FALLBACK_EXTENSION));
        match self.write_output(&decoded, EncoderId::FALLBACK, FALLBACK_EXTENSION, &destination) {
            Ok(_) => ConversionOutcome::converted(
                &source_name,
                destination,
                EncoderId::FALLBACK,
                true,
                Some(fallback_cause),
            ),
            Err(e) => {
                log::error!("Fallback PNG failed for {}: {}", source_name, e);
                ConversionOutcome::failed(&source_name, format!("{fallback_cause}; fallback PNG failed: {e}"))
            }
        }
    }

    /// Returns a note when the destination was reused instead of written.
    fn write_output(
        &self,
        decoded: &DecodedImage,
        encoder: EncoderId,
        extension: &str,
        destination: &Path,
    ) -> Result<Option<String>, ConversionError> {
        let overwrite = self.params.overwrite_existing;
        if !overwrite && destination.exists() {
            log::debug!("{} already exists, reusing it", destination.display());
            return Ok(Some(ALREADY_EXISTED.to_string()));
        }

        let normalized = normalizer::normalize(&decoded.image, encoder, self.params.background_color, extension);
        let bytes = self.processor.encode(&normalized, encoder, &decoded.metadata)?;
        if overwrite {
            fs::write(destination, &bytes)?;
        } else {
            // another worker may have created it since the check above
            match OpenOptions::new().write(true).create_new(true).open(destination) {
                Ok(mut file) => file.write_all(&bytes)?,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    log::debug!("{} appeared while encoding, reusing it", destination.display());
                    return Ok(Some(ALREADY_EXISTED.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        log::debug!("Wrote {} ({} bytes)", destination.display(), bytes.len());
        Ok(None)
    }

    /// `tag--stem.ext` or `stem--tag.ext`; just `stem.ext` when the brand tag
    /// has no usable characters.
    pub fn output_name(&self, stem: &str, extension: &str) -> String {
        let tag = slugify(&self.params.brand_tag);
        if tag.is_empty() {
            return format!("{stem}.{extension}");
        }
        match self.params.naming_style {
            NamingStyle::Prefix => format!("{tag}--{stem}.{extension}"),
            NamingStyle::Suffix => format!("{stem}--{tag}.{extension}"),
        }
    }

    pub fn output_path(&self, out_dir: &Path, source_name: &str, extension: &str) -> PathBuf {
        out_dir.join(self.output_name(&source_stem(source_name), &normalize_extension(extension)))
    }
}

/// Replaces path separators so an uploaded name can never leave the output
/// directory.
pub fn sanitize_filename(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

/// Stem of the sanitized name, or "image" when nothing is left.
pub fn source_stem(name: &str) -> String {
    let sanitized = sanitize_filename(name.trim());
    Path::new(&sanitized)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_STEM.to_string())
}

/// Lowercase, ASCII alphanumerics separated by single hyphens.
pub fn slugify(tag: &str) -> String {
    let mut slug = String::with_capacity(tag.len());
    for c in tag.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn png_bytes(img: DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    fn rgb_png(width: u32, height: u32) -> Vec<u8> {
        png_bytes(DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([30, 60, 90]))))
    }

    #[test]
    fn corrupt_input_fails_without_fallback() {
        let dir = TempDir::new().unwrap();
        let converter = ImagesConverter::new(EncodeParameters::default());
        let outcome = converter.convert_one(
            InputFile::from_bytes("broken.dat", b"definitely not an image".to_vec()),
            dir.path(),
            "png",
        );
        assert!(!outcome.succeeded);
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.reason.as_deref(), Some("unrecognized file"));
        assert!(outcome.output_path.is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn missing_input_is_an_io_failure() {
        let dir = TempDir::new().unwrap();
        let converter = ImagesConverter::new(EncodeParameters::default());
        let outcome = converter.convert_one(
            InputFile::from_path(dir.path().join("nope.png")),
            dir.path(),
            "png",
        );
        assert!(!outcome.succeeded);
        assert!(outcome.reason.unwrap().starts_with("IO error"));
    }

    #[test]
    fn transparent_png_to_jpeg_is_composited_on_white() {
        let dir = TempDir::new().unwrap();
        // opaque marker stays in the first 16x16 block so chroma cannot bleed into (24, 24)
        let mut img = RgbaImage::from_pixel(32, 32, Rgba([255, 0, 0, 0]));
        for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            img.put_pixel(x, y, Rgba([0, 0, 255, 255]));
        }
        let converter = ImagesConverter::new(EncodeParameters::default());
        let outcome = converter.convert_one(
            InputFile::from_bytes("logo.png", png_bytes(DynamicImage::ImageRgba8(img))),
            dir.path(),
            "jpeg",
        );

        assert!(outcome.succeeded);
        assert!(!outcome.used_fallback);
        assert_eq!(outcome.output_encoder, Some(EncoderId::Jpeg));
        assert_eq!(outcome.output_basename().as_deref(), Some("logo--converte-tudo.jpeg"));
        let written = image::open(outcome.output_path.unwrap()).unwrap();
        assert!(!written.color().has_alpha());
        let rgb = written.to_rgb8();
        let Rgb([r, g, b]) = *rgb.get_pixel(24, 24);
        assert!(r > 245 && g > 245 && b > 245, "expected white, got {r} {g} {b}");
        let Rgb([r, _, b]) = *rgb.get_pixel(0, 0);
        assert!(b > r, "opaque marker lost: {r} {b}");
    }

    #[test]
    fn concurrent_writers_of_one_name_write_it_once() {
        use rayon::prelude::*;

        let dir = TempDir::new().unwrap();
        let converter = ImagesConverter::new(EncodeParameters::default());
        let png = rgb_png(48, 48);
        let outcomes: Vec<ConversionOutcome> = (0..8)
            .into_par_iter()
            .map(|_| converter.convert_one(InputFile::from_bytes("same.png", png.clone()), dir.path(), "bmp"))
            .collect();

        assert!(outcomes.iter().all(|o| o.succeeded));
        let written = outcomes.iter().filter(|o| o.reason.is_none()).count();
        let reused = outcomes
            .iter()
            .filter(|o| o.reason.as_deref() == Some(ALREADY_EXISTED))
            .count();
        assert_eq!((written, reused), (1, 7));
        let back = image::open(dir.path().join("same--converte-tudo.bmp")).unwrap();
        assert_eq!(back.dimensions(), (48, 48));
    }

    #[test]
    fn custom_catalog_limits_the_target_formats() {
        use crate::catalog::{EncoderSpec, FormatDefaults};

        static PNG_ONLY: &[EncoderSpec] = &[EncoderSpec {
            extension: "png",
            encoder: EncoderId::Png,
            supports_alpha: true,
            default_params: FormatDefaults::NONE,
        }];
        let dir = TempDir::new().unwrap();
        let converter =
            ImagesConverter::with_catalog(EncodeParameters::default(), FormatCatalog::from_entries(PNG_ONLY));
        let outcome = converter.convert_one(InputFile::from_bytes("a.png", rgb_png(4, 4)), dir.path(), "jpg");
        assert!(outcome.used_fallback);
        assert_eq!(outcome.output_encoder, Some(EncoderId::Png));
        assert_eq!(outcome.reason.as_deref(), Some("unsupported output format: jpg"));
    }

    #[test]
    fn unsupported_extension_falls_back_to_png() {
        let dir = TempDir::new().unwrap();
        let converter = ImagesConverter::new(EncodeParameters::default());
        let outcome = converter.convert_one(InputFile::from_bytes("a.png", rgb_png(4, 4)), dir.path(), "XYZ");

        assert!(outcome.succeeded);
        assert!(outcome.used_fallback);
        assert_eq!(outcome.output_encoder, Some(EncoderId::Png));
        assert_eq!(outcome.reason.as_deref(), Some("unsupported output format: xyz"));
        assert_eq!(outcome.output_basename().as_deref(), Some("a--converte-tudo.png"));
    }

    #[test]
    fn encoder_rejection_falls_back_to_png() {
        let dir = TempDir::new().unwrap();
        let converter = ImagesConverter::new(EncodeParameters::default());
        let wide = png_bytes(DynamicImage::ImageLuma8(image::GrayImage::new(70_000, 1)));
        let outcome = converter.convert_one(InputFile::from_bytes("wide.png", wide), dir.path(), "jpg");

        assert!(outcome.succeeded);
        assert!(outcome.used_fallback);
        assert_eq!(outcome.output_encoder, Some(EncoderId::Png));
        assert!(outcome.reason.unwrap().starts_with("target format failed (JPEG)"));
        let written = image::open(outcome.output_path.unwrap()).unwrap();
        assert_eq!(written.dimensions(), (70_000, 1));
    }

    #[test]
    fn existing_output_is_reused_when_overwrite_is_off() {
        let dir = TempDir::new().unwrap();
        let converter = ImagesConverter::new(EncodeParameters::default());
        let first = converter.convert_one(InputFile::from_bytes("p.png", rgb_png(8, 8)), dir.path(), "bmp");
        let path = first.output_path.unwrap();
        fs::write(&path, b"sentinel").unwrap();

        let second = converter.convert_one(InputFile::from_bytes("p.png", rgb_png(8, 8)), dir.path(), "bmp");
        assert!(second.succeeded);
        assert!(!second.used_fallback);
        assert_eq!(second.reason.as_deref(), Some(ALREADY_EXISTED));
        assert_eq!(fs::read(&path).unwrap(), b"sentinel");
    }

    #[test]
    fn overwrite_reencodes_existing_output() {
        let dir = TempDir::new().unwrap();
        let params = EncodeParameters {
            overwrite_existing: true,
            ..EncodeParameters::default()
        };
        let converter = ImagesConverter::new(params);
        let path = converter.output_path(dir.path(), "p.png", "bmp");
        fs::write(&path, b"sentinel").unwrap();

        let outcome = converter.convert_one(InputFile::from_bytes("p.png", rgb_png(8, 8)), dir.path(), "bmp");
        assert!(outcome.succeeded);
        assert_eq!(outcome.reason, None);
        assert!(fs::read(&path).unwrap().starts_with(b"BM"));
    }

    #[test]
    fn fallback_also_reuses_existing_png() {
        let dir = TempDir::new().unwrap();
        let converter = ImagesConverter::new(EncodeParameters::default());
        let path = converter.output_path(dir.path(), "q.jpg", "png");
        fs::write(&path, b"kept").unwrap();

        let outcome = converter.convert_one(InputFile::from_bytes("q.jpg", rgb_png(3, 3)), dir.path(), "nope");
        assert!(outcome.succeeded);
        assert!(outcome.used_fallback);
        assert_eq!(fs::read(&path).unwrap(), b"kept");
    }

    #[test]
    fn naming_follows_style_and_brand() {
        let prefix = ImagesConverter::new(EncodeParameters {
            naming_style: NamingStyle::Prefix,
            brand_tag: "My Brand!".into(),
            ..EncodeParameters::default()
        });
        assert_eq!(prefix.output_name("photo", "gif"), "my-brand--photo.gif");

        let bare = ImagesConverter::new(EncodeParameters {
            brand_tag: "  ".into(),
            ..EncodeParameters::default()
        });
        assert_eq!(bare.output_name("photo", "gif"), "photo.gif");
    }

    #[test]
    fn stems_are_sanitized() {
        assert_eq!(source_stem("../etc/passwd.png"), ".._etc_passwd");
        assert_eq!(source_stem("a\\b.tar.gz"), "a_b.tar");
        assert_eq!(source_stem(""), "image");
        assert_eq!(slugify("--Converte  Tudo--"), "converte-tudo");
    }

    #[test]
    fn pgm_request_writes_grayscale() {
        let dir = TempDir::new().unwrap();
        let converter = ImagesConverter::new(EncodeParameters::default());
        let outcome = converter.convert_one(InputFile::from_bytes("g.png", rgb_png(5, 5)), dir.path(), "pgm");
        assert!(outcome.succeeded);
        let bytes = fs::read(outcome.output_path.unwrap()).unwrap();
        assert!(bytes.starts_with(b"P5"));
    }
}
