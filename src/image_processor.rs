use crate::catalog::EncoderId;
use crate::codecs::{exif_ifd, icon, raster, text, webp_container, Raster};
use crate::decoder::ImageMetadata;
use crate::normalizer::{self, IndexedImage, NormalizedImage, PixelLayout};
use crate::types::*;
use image::codecs::bmp::BmpEncoder;
use image::codecs::ico::{IcoEncoder, IcoFrame};
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::pnm::{PnmEncoder, PnmSubtype, SampleEncoding};
use image::codecs::tga::TgaEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, GenericImageView, GrayImage, ImageEncoder, RgbImage, RgbaImage};
use std::borrow::Cow;
use std::io::Cursor;
use tiff::encoder::colortype::{self, ColorType as TiffColorType};
use tiff::encoder::compression::{Compression, Deflate, Lzw, Packbits, Uncompressed};
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

type CodecResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// EPS output is laid out for this print resolution.
pub const EPS_DPI: u32 = 300;
const PCX_DPI: u16 = 72;
const CURSOR_HOTSPOT: (u16, u16) = (0, 0);
/// TIFF tag holding an embedded ICC profile.
const TIFF_ICC_PROFILE: u16 = 34675;
/// Name written into containers that carry one (XBM, XPM, SGI, IM).
const EMBEDDED_NAME: &str = "image";

/// Encodes normalized images with the batch's parameters.
pub struct ImageProcessor {
    params: EncodeParameters,
}

impl ImageProcessor {
    pub fn new(params: &EncodeParameters) -> Self {
        Self {
            params: params.clamped(),
        }
    }

    pub fn params(&self) -> &EncodeParameters {
        &self.params
    }

    /// Encodes `image` for `encoder`, carrying `metadata` where the
    /// container supports it. Codec failures come back as
    /// [`ConversionError::Encode`] with the codec's own message.
    pub fn encode(
        &self,
        image: &NormalizedImage,
        encoder: EncoderId,
        metadata: &ImageMetadata,
    ) -> Result<Vec<u8>, ConversionError> {
        let mut out = Vec::new();
        let result = match encoder {
            EncoderId::Jpeg => self.encode_jpeg(image, metadata, &mut out),
            EncoderId::Png => self.encode_png(image, metadata, &mut out),
            EncoderId::Webp => self.encode_webp(image, metadata, &mut out),
            EncoderId::Gif => self.encode_gif(image, &mut out),
            EncoderId::Tiff => self.encode_tiff(image, metadata, &mut out),
            EncoderId::Bmp => encode_direct(BmpEncoder::new(&mut out), image),
            EncoderId::Tga => encode_direct(TgaEncoder::new(&mut out), image),
            EncoderId::Ico => self.encode_icon(image, false, &mut out),
            EncoderId::Cur => self.encode_icon(image, true, &mut out),
            EncoderId::Ppm => self.encode_netpbm(image, &mut out),
            EncoderId::Pcx => {
                let pixels = self.opaque(image);
                raster::write_pcx(&mut out, pixels.raster(), PCX_DPI).map_err(Into::into)
            }
            EncoderId::Eps => {
                let pixels = self.opaque(image);
                text::write_eps(&mut out, pixels.raster(), EPS_DPI).map_err(Into::into)
            }
            EncoderId::Sgi => {
                let pixels = self.opaque(image);
                raster::write_sgi(&mut out, pixels.raster(), EMBEDDED_NAME).map_err(Into::into)
            }
            EncoderId::Im => {
                let pixels = self.opaque(image);
                raster::write_im(&mut out, pixels.raster(), EMBEDDED_NAME).map_err(Into::into)
            }
            EncoderId::Xbm => {
                let bilevel = self.conform(image, EncoderId::Xbm);
                match bilevel.as_ref() {
                    NormalizedImage::Bilevel(img) => text::write_xbm(&mut out, img, EMBEDDED_NAME).map_err(Into::into),
                    other => Err(format!("XBM needs a 1-bit image, got {:?}", other.layout()).into()),
                }
            }
            EncoderId::Xpm => self
                .palette(image, EncoderId::Xpm)
                .and_then(|palette| text::write_xpm(&mut out, &palette, EMBEDDED_NAME).map_err(Into::into)),
        };
        result.map_err(|e| ConversionError::encode(encoder, e))?;

        log::debug!("Encoded {} ({:?}): {} bytes", encoder, image.layout(), out.len());
        Ok(out)
    }

    fn encode_jpeg(&self, image: &NormalizedImage, metadata: &ImageMetadata, out: &mut Vec<u8>) -> CodecResult {
        let pixels = self.opaque(image);
        let (width, height) = pixels.raster().dimensions();
        let width = u16::try_from(width).map_err(|_| format!("width {width} exceeds the JPEG limit of 65535"))?;
        let height = u16::try_from(height).map_err(|_| format!("height {height} exceeds the JPEG limit of 65535"))?;
        let color = match pixels {
            OpaquePixels::Gray(_) => jpeg_encoder::ColorType::Luma,
            OpaquePixels::Rgb(_) => jpeg_encoder::ColorType::Rgb,
        };

        let mut encoder = jpeg_encoder::Encoder::new(&mut *out, self.params.jpeg_quality);
        encoder.set_progressive(self.params.jpeg_progressive);
        encoder.set_optimized_huffman_tables(true);
        encoder.set_sampling_factor(jpeg_encoder::SamplingFactor::F_2_2);
        if let Some(exif) = &metadata.exif {
            let mut segment = Vec::with_capacity(exif.len() + 6);
            segment.extend_from_slice(b"Exif\0\0");
            segment.extend_from_slice(exif);
            if let Err(e) = encoder.add_app_segment(1, &segment) {
                log::warn!("Dropping EXIF block from JPEG output: {}", e);
            }
        }
        if let Some(icc) = &metadata.icc_profile {
            if let Err(e) = encoder.add_icc_profile(icc) {
                log::warn!("Dropping ICC profile from JPEG output: {}", e);
            }
        }
        encoder.encode(pixels.raster().samples(), width, height, color)?;
        Ok(())
    }

    fn encode_png(&self, image: &NormalizedImage, metadata: &ImageMetadata, out: &mut Vec<u8>) -> CodecResult {
        let compression = match self.params.png_compression_level {
            0 => CompressionType::Uncompressed,
            level => CompressionType::Level(level),
        };
        let mut encoder = PngEncoder::new_with_quality(&mut *out, compression, PngFilter::Adaptive);
        if let Some(icc) = &metadata.icc_profile {
            if let Err(e) = encoder.set_icc_profile(icc.clone()) {
                log::debug!("PNG encoder refused ICC profile: {}", e);
            }
        }
        encode_direct(encoder, image)
    }

    fn encode_webp(&self, image: &NormalizedImage, metadata: &ImageMetadata, out: &mut Vec<u8>) -> CodecResult {
        let (width, height) = image.dimensions();
        let (pixels, color) = direct_color(image);
        let encoder = match color {
            ExtendedColorType::Rgba8 => webp::Encoder::from_rgba(&pixels, width, height),
            ExtendedColorType::Rgb8 => webp::Encoder::from_rgb(&pixels, width, height),
            _ => {
                let rgb = image.to_dynamic().to_rgb8();
                return self.encode_webp(&NormalizedImage::Rgb(rgb), metadata, out);
            }
        };

        let mut config = webp::WebPConfig::new().map_err(|_| "failed to initialise WebP configuration")?;
        config.lossless = 0;
        config.quality = self.params.webp_quality as f32;
        config.method = 6;
        let memory = encoder
            .encode_advanced(&config)
            .map_err(|e| format!("{e:?}"))?;
        match &metadata.icc_profile {
            Some(icc) => {
                let has_alpha = color == ExtendedColorType::Rgba8;
                out.extend(webp_container::embed_icc(&memory, icc, width, height, has_alpha)?);
            }
            None => out.extend_from_slice(&memory),
        }
        Ok(())
    }

    fn encode_gif(&self, image: &NormalizedImage, out: &mut Vec<u8>) -> CodecResult {
        let indexed = self.palette(image, EncoderId::Gif)?;
        let width = u16::try_from(indexed.width).map_err(|_| "width exceeds the GIF limit of 65535")?;
        let height = u16::try_from(indexed.height).map_err(|_| "height exceeds the GIF limit of 65535")?;
        let palette: Vec<u8> = indexed.palette.iter().flatten().copied().collect();

        let mut encoder = gif::Encoder::new(&mut *out, width, height, &palette)?;
        let frame = gif::Frame {
            width,
            height,
            buffer: Cow::Borrowed(&indexed.indices),
            transparent: indexed.transparent_index,
            ..gif::Frame::default()
        };
        encoder.write_frame(&frame)?;
        Ok(())
    }

    fn encode_tiff(&self, image: &NormalizedImage, metadata: &ImageMetadata, out: &mut Vec<u8>) -> CodecResult {
        match self.params.tiff_compression.as_deref() {
            None | Some("none") | Some("raw") => write_tiff(out, image, Uncompressed, metadata),
            Some("tiff_lzw") | Some("lzw") => write_tiff(out, image, Lzw, metadata),
            Some("tiff_deflate") | Some("tiff_adobe_deflate") | Some("deflate") | Some("adobe_deflate") => {
                write_tiff(out, image, Deflate::default(), metadata)
            }
            Some("packbits") => write_tiff(out, image, Packbits, metadata),
            Some(other) => Err(format!("unknown TIFF compression '{other}'").into()),
        }
    }

    fn encode_icon(&self, image: &NormalizedImage, cursor: bool, out: &mut Vec<u8>) -> CodecResult {
        let source = image.to_dynamic();
        let (width, height) = source.dimensions();
        let frames = icon::icon_sizes(width, height)
            .into_iter()
            .map(|size| {
                let frame = square_frame(&source, size);
                IcoFrame::as_png(frame.as_bytes(), size, size, frame.color().into())
            })
            .collect::<Result<Vec<_>, _>>()?;
        IcoEncoder::new(&mut *out).encode_images(&frames)?;

        if cursor {
            icon::into_cursor(out, CURSOR_HOTSPOT)?;
        }
        Ok(())
    }

    fn encode_netpbm(&self, image: &NormalizedImage, out: &mut Vec<u8>) -> CodecResult {
        let (width, height) = image.dimensions();
        match image {
            NormalizedImage::Bilevel(img) => raster::write_pbm(out, img)?,
            NormalizedImage::Gray(img) => PnmEncoder::new(&mut *out)
                .with_subtype(PnmSubtype::Graymap(SampleEncoding::Binary))
                .write_image(img.as_raw(), width, height, ExtendedColorType::L8)?,
            other => {
                let pixels = self.opaque(other);
                PnmEncoder::new(&mut *out)
                    .with_subtype(PnmSubtype::Pixmap(SampleEncoding::Binary))
                    .write_image(pixels.to_rgb().as_raw(), width, height, ExtendedColorType::Rgb8)?
            }
        }
        Ok(())
    }

    /// Re-normalizes `image` when its layout is not legal for `encoder`.
    fn conform<'a>(&self, image: &'a NormalizedImage, encoder: EncoderId) -> Cow<'a, NormalizedImage> {
        let legal = match encoder {
            EncoderId::Xbm => image.layout() == PixelLayout::Bilevel,
            EncoderId::Gif | EncoderId::Xpm => image.layout() == PixelLayout::Indexed,
            _ => true,
        };
        if legal {
            Cow::Borrowed(image)
        } else {
            let ext = encoder.name().to_ascii_lowercase();
            Cow::Owned(normalizer::normalize(
                &image.to_dynamic(),
                encoder,
                self.params.background_color,
                &ext,
            ))
        }
    }

    fn palette<'a>(&self, image: &'a NormalizedImage, encoder: EncoderId) -> Result<Cow<'a, IndexedImage>, Box<dyn std::error::Error + Send + Sync>> {
        match self.conform(image, encoder) {
            Cow::Borrowed(NormalizedImage::Indexed(img)) => Ok(Cow::Borrowed(img)),
            Cow::Owned(NormalizedImage::Indexed(img)) => Ok(Cow::Owned(img)),
            other => Err(format!("{encoder} needs a palette image, got {:?}", other.layout()).into()),
        }
    }

    /// Gray or RGB pixels, compositing any transparency over the background.
    fn opaque<'a>(&self, image: &'a NormalizedImage) -> OpaquePixels<'a> {
        match image {
            NormalizedImage::Bilevel(img) | NormalizedImage::Gray(img) => OpaquePixels::Gray(Cow::Borrowed(img)),
            NormalizedImage::Rgb(img) => OpaquePixels::Rgb(Cow::Borrowed(img)),
            other => OpaquePixels::Rgb(Cow::Owned(normalizer::flatten(
                &other.to_dynamic(),
                self.params.background_color,
            ))),
        }
    }
}

enum OpaquePixels<'a> {
    Gray(Cow<'a, GrayImage>),
    Rgb(Cow<'a, RgbImage>),
}

impl OpaquePixels<'_> {
    fn raster(&self) -> Raster<'_> {
        match self {
            OpaquePixels::Gray(img) => Raster::Gray(img),
            OpaquePixels::Rgb(img) => Raster::Rgb(img),
        }
    }

    fn to_rgb(&self) -> Cow<'_, RgbImage> {
        match self {
            OpaquePixels::Gray(img) => Cow::Owned(DynamicImage::ImageLuma8(img.as_ref().clone()).to_rgb8()),
            OpaquePixels::Rgb(img) => Cow::Borrowed(img.as_ref()),
        }
    }
}

/// Raw samples in a layout every direct-color encoder accepts.
fn direct_color(image: &NormalizedImage) -> (Cow<'_, [u8]>, ExtendedColorType) {
    match image {
        NormalizedImage::Bilevel(img) | NormalizedImage::Gray(img) => {
            (Cow::Borrowed(img.as_raw().as_slice()), ExtendedColorType::L8)
        }
        NormalizedImage::Rgb(img) => (Cow::Borrowed(img.as_raw().as_slice()), ExtendedColorType::Rgb8),
        NormalizedImage::Rgba(img) => (Cow::Borrowed(img.as_raw().as_slice()), ExtendedColorType::Rgba8),
        NormalizedImage::Indexed(img) if img.transparent_index.is_some() => {
            (Cow::Owned(img.to_rgba().into_raw()), ExtendedColorType::Rgba8)
        }
        NormalizedImage::Indexed(img) => (Cow::Owned(img.to_rgb().into_raw()), ExtendedColorType::Rgb8),
    }
}

fn encode_direct(encoder: impl ImageEncoder, image: &NormalizedImage) -> CodecResult {
    let (width, height) = image.dimensions();
    let (pixels, color) = direct_color(image);
    encoder.write_image(&pixels, width, height, color)?;
    Ok(())
}

fn write_tiff<D: Compression>(out: &mut Vec<u8>, image: &NormalizedImage, compression: D, metadata: &ImageMetadata) -> CodecResult {
    let (width, height) = image.dimensions();
    let (pixels, color) = direct_color(image);
    let mut encoder = TiffEncoder::new(Cursor::new(out))?;
    match color {
        ExtendedColorType::L8 => write_tiff_image::<colortype::Gray8, D>(&mut encoder, width, height, &pixels, compression, metadata),
        ExtendedColorType::Rgba8 => write_tiff_image::<colortype::RGBA8, D>(&mut encoder, width, height, &pixels, compression, metadata),
        _ => write_tiff_image::<colortype::RGB8, D>(&mut encoder, width, height, &pixels, compression, metadata),
    }
}

fn write_tiff_image<C, D>(
    encoder: &mut TiffEncoder<Cursor<&mut Vec<u8>>>,
    width: u32,
    height: u32,
    pixels: &[u8],
    compression: D,
    metadata: &ImageMetadata,
) -> CodecResult
where
    C: TiffColorType<Inner = u8>,
    D: Compression,
{
    let mut image = encoder.new_image_with_compression::<C, D>(width, height, compression)?;
    if let Some(icc) = &metadata.icc_profile {
        image.encoder().write_tag(Tag::Unknown(TIFF_ICC_PROFILE), icc.as_slice())?;
    }
    if let Some(exif) = &metadata.exif {
        let carried = exif_ifd::write_exif(image.encoder(), exif)?;
        log::debug!("Carried {} EXIF fields into TIFF", carried);
    }
    image.write_data(pixels)?;
    Ok(())
}

/// Scales `source` into a `size` x `size` frame, centering non-square
/// sources on a transparent canvas.
fn square_frame(source: &DynamicImage, size: u32) -> DynamicImage {
    let (width, height) = source.dimensions();
    if width == height {
        return source.resize_exact(size, size, FilterType::Lanczos3);
    }
    let fitted: RgbaImage = source.resize(size, size, FilterType::Lanczos3).to_rgba8();
    let mut canvas = RgbaImage::new(size, size);
    let x = (size - fitted.width().min(size)) / 2;
    let y = (size - fitted.height().min(size)) / 2;
    imageops::overlay(&mut canvas, &fitted, x as i64, y as i64);
    DynamicImage::ImageRgba8(canvas)
}
