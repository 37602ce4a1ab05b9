//! Color-mode normalization.
//!
//! Every container has a hard constraint on the channel layouts it can
//! store. [`normalize`] maps any decoded image onto a layout the target
//! encoder accepts, driven by the encoder's [`Capabilities`] rather than by
//! the concrete format.

use crate::catalog::{normalize_extension, Capabilities, ColorStrategy, EncoderId};
use crate::types::RgbColor;
use color_quant::NeuQuant;
use image::imageops::{self, BiLevel};
use image::{ColorType, DynamicImage, GrayImage, Rgb, RgbImage, Rgba, RgbaImage};
use std::collections::HashMap;

/// Alpha values below this are treated as fully transparent when only 1-bit
/// transparency can be stored.
const ALPHA_THRESHOLD: u8 = 128;

/// NeuQuant sampling factor; 10 is the reference quality/speed tradeoff.
const QUANT_SAMPLE_FACTOR: i32 = 10;

/// Channel layout of a normalized image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Bilevel,
    Gray,
    Rgb,
    Rgba,
    Indexed,
}

/// Palette image with at most 256 colors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedImage {
    pub width: u32,
    pub height: u32,
    pub palette: Vec<[u8; 3]>,
    pub indices: Vec<u8>,
    pub transparent_index: Option<u8>,
}

impl IndexedImage {
    pub fn color_count(&self) -> usize {
        self.palette.len()
    }

    pub fn to_rgba(&self) -> RgbaImage {
        RgbaImage::from_fn(self.width, self.height, |x, y| {
            let idx = self.indices[(y * self.width + x) as usize];
            let [r, g, b] = self.palette[idx as usize];
            let a = if Some(idx) == self.transparent_index { 0 } else { 255 };
            Rgba([r, g, b, a])
        })
    }

    pub fn to_rgb(&self) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let idx = self.indices[(y * self.width + x) as usize];
            Rgb(self.palette[idx as usize])
        })
    }
}

/// An image whose layout is legal for the encoder it was normalized for.
#[derive(Debug, Clone)]
pub enum NormalizedImage {
    /// 1-bit data stored one byte per pixel, every value 0 or 255.
    Bilevel(GrayImage),
    Gray(GrayImage),
    Rgb(RgbImage),
    Rgba(RgbaImage),
    Indexed(IndexedImage),
}

impl NormalizedImage {
    pub fn layout(&self) -> PixelLayout {
        match self {
            Self::Bilevel(_) => PixelLayout::Bilevel,
            Self::Gray(_) => PixelLayout::Gray,
            Self::Rgb(_) => PixelLayout::Rgb,
            Self::Rgba(_) => PixelLayout::Rgba,
            Self::Indexed(_) => PixelLayout::Indexed,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Bilevel(img) | Self::Gray(img) => img.dimensions(),
            Self::Rgb(img) => img.dimensions(),
            Self::Rgba(img) => img.dimensions(),
            Self::Indexed(img) => (img.width, img.height),
        }
    }

    pub fn has_alpha(&self) -> bool {
        match self {
            Self::Rgba(_) => true,
            Self::Indexed(img) => img.transparent_index.is_some(),
            _ => false,
        }
    }

    pub fn to_dynamic(&self) -> DynamicImage {
        match self {
            Self::Bilevel(img) | Self::Gray(img) => DynamicImage::ImageLuma8(img.clone()),
            Self::Rgb(img) => DynamicImage::ImageRgb8(img.clone()),
            Self::Rgba(img) => DynamicImage::ImageRgba8(img.clone()),
            Self::Indexed(img) if img.transparent_index.is_some() => {
                DynamicImage::ImageRgba8(img.to_rgba())
            }
            Self::Indexed(img) => DynamicImage::ImageRgb8(img.to_rgb()),
        }
    }
}

/// Normalizes `image` for `encoder`. `requested_extension` selects the
/// sibling format when one encoder serves several extensions (pbm/pgm/ppm).
pub fn normalize(
    image: &DynamicImage,
    encoder: EncoderId,
    background: RgbColor,
    requested_extension: &str,
) -> NormalizedImage {
    let normalized = normalize_with(image, encoder.capabilities(), background, requested_extension);
    log::debug!(
        "Normalized {:?} to {:?} for {}",
        image.color(),
        normalized.layout(),
        encoder
    );
    normalized
}

pub fn normalize_with(
    image: &DynamicImage,
    caps: Capabilities,
    background: RgbColor,
    requested_extension: &str,
) -> NormalizedImage {
    let has_alpha = image.color().has_alpha();
    let gray = is_gray(image.color());

    match caps.strategy {
        ColorStrategy::Flatten => {
            if has_alpha {
                NormalizedImage::Rgb(flatten(image, background))
            } else if gray && caps.supports_gray {
                NormalizedImage::Gray(image.to_luma8())
            } else {
                NormalizedImage::Rgb(image.to_rgb8())
            }
        }
        ColorStrategy::PreserveAlpha => {
            if has_alpha {
                NormalizedImage::Rgba(image.to_rgba8())
            } else if gray && caps.supports_gray {
                NormalizedImage::Gray(image.to_luma8())
            } else {
                NormalizedImage::Rgb(image.to_rgb8())
            }
        }
        ColorStrategy::Palette { keep_transparency } => {
            let max_colors = caps.max_colors.unwrap_or(256).min(256) as usize;
            let rgba = if has_alpha && !keep_transparency {
                DynamicImage::ImageRgb8(flatten(image, background)).to_rgba8()
            } else {
                image.to_rgba8()
            };
            NormalizedImage::Indexed(quantize(&rgba, max_colors, keep_transparency && has_alpha))
        }
        ColorStrategy::Bilevel => NormalizedImage::Bilevel(bilevel(image, background)),
        ColorStrategy::NetpbmFamily => match normalize_extension(requested_extension).as_str() {
            "pbm" => NormalizedImage::Bilevel(bilevel(image, background)),
            "pgm" => NormalizedImage::Gray(opaque(image, background).to_luma8()),
            _ => NormalizedImage::Rgb(opaque(image, background).to_rgb8()),
        },
        ColorStrategy::Restricted => match image {
            DynamicImage::ImageLuma8(img) => NormalizedImage::Gray(img.clone()),
            DynamicImage::ImageRgb8(img) => NormalizedImage::Rgb(img.clone()),
            DynamicImage::ImageRgba8(img) => NormalizedImage::Rgba(img.clone()),
            other if other.color().has_alpha() => NormalizedImage::Rgba(other.to_rgba8()),
            other => NormalizedImage::Rgb(other.to_rgb8()),
        },
        ColorStrategy::Generic => {
            if has_alpha {
                NormalizedImage::Rgba(image.to_rgba8())
            } else if let DynamicImage::ImageLuma8(img) = image {
                NormalizedImage::Gray(img.clone())
            } else {
                NormalizedImage::Rgb(image.to_rgb8())
            }
        }
    }
}

fn is_gray(color: ColorType) -> bool {
    matches!(
        color,
        ColorType::L8 | ColorType::L16 | ColorType::La8 | ColorType::La16
    )
}

/// Composites the image over an opaque canvas of `background`.
pub fn flatten(image: &DynamicImage, background: RgbColor) -> RgbImage {
    let rgba = image.to_rgba8();
    let [br, bg, bb] = background.to_array();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let Rgba([r, g, b, a]) = *rgba.get_pixel(x, y);
        let blend = |src: u8, dst: u8| -> u8 {
            let a = a as u32;
            ((src as u32 * a + dst as u32 * (255 - a) + 127) / 255) as u8
        };
        Rgb([blend(r, br), blend(g, bg), blend(b, bb)])
    })
}

fn opaque(image: &DynamicImage, background: RgbColor) -> DynamicImage {
    if image.color().has_alpha() {
        DynamicImage::ImageRgb8(flatten(image, background))
    } else {
        image.clone()
    }
}

/// Floyd-Steinberg dithered 1-bit image; transparency becomes background.
fn bilevel(image: &DynamicImage, background: RgbColor) -> GrayImage {
    let mut gray = opaque(image, background).to_luma8();
    imageops::dither(&mut gray, &BiLevel);
    gray
}

/// Builds a palette image. An exact palette is used when the image has few
/// enough colors, NeuQuant otherwise. With `keep_transparency`, pixels below
/// the alpha threshold share one reserved transparent entry.
fn quantize(rgba: &RgbaImage, max_colors: usize, keep_transparency: bool) -> IndexedImage {
    let (width, height) = rgba.dimensions();
    let is_clear = |p: &Rgba<u8>| keep_transparency && p[3] < ALPHA_THRESHOLD;
    let any_clear = rgba.pixels().any(|p| is_clear(p));
    let budget = if any_clear { max_colors - 1 } else { max_colors };

    let mut exact: HashMap<[u8; 3], u8> = HashMap::new();
    let mut palette: Vec<[u8; 3]> = Vec::new();
    let mut fits = true;
    for p in rgba.pixels().filter(|p| !is_clear(p)) {
        let key = [p[0], p[1], p[2]];
        if exact.contains_key(&key) {
            continue;
        }
        if palette.len() == budget {
            fits = false;
            break;
        }
        exact.insert(key, palette.len() as u8);
        palette.push(key);
    }

    let mut indices = Vec::with_capacity((width * height) as usize);
    if fits {
        let transparent = palette.len() as u8;
        for p in rgba.pixels() {
            indices.push(if is_clear(p) { transparent } else { exact[&[p[0], p[1], p[2]]] });
        }
    } else {
        let opaque: Vec<u8> = rgba
            .pixels()
            .filter(|p| !is_clear(p))
            .flat_map(|p| [p[0], p[1], p[2], 255])
            .collect();
        let quant = NeuQuant::new(QUANT_SAMPLE_FACTOR, budget, &opaque);
        palette = quant
            .color_map_rgb()
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect();
        let transparent = palette.len() as u8;
        for p in rgba.pixels() {
            indices.push(if is_clear(p) {
                transparent
            } else {
                quant.index_of(&[p[0], p[1], p[2], 255]) as u8
            });
        }
    }

    let transparent_index = if any_clear {
        let idx = palette.len() as u8;
        palette.push([0, 0, 0]);
        Some(idx)
    } else {
        None
    };
    if palette.is_empty() {
        palette.push([0, 0, 0]);
    }

    IndexedImage {
        width,
        height,
        palette,
        indices,
        transparent_index,
    }
}
