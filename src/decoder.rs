use crate::types::ConversionError;
use exif::{In, Tag};
use image::{DynamicImage, ImageDecoder, ImageError, ImageReader};
use std::io::{self, Cursor};

/// A decoded input image plus the metadata worth carrying into the output.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: DynamicImage,
    pub metadata: ImageMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Raw EXIF (TIFF structure, no `Exif\0\0` prefix) with the orientation
    /// already applied to the pixels and reset to 1.
    pub exif: Option<Vec<u8>>,
    pub icc_profile: Option<Vec<u8>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    #[default]
    Normal,
    MirroredHorizontal,
    CW180,
    MirroredVertical,
    MirroredHorizontalAnd270CW,
    CW90,
    MirroredHorizontalAnd90CW,
    CW270,
}

impl From<u32> for Orientation {
    fn from(value: u32) -> Self {
        match value {
            2 => Self::MirroredHorizontal,
            3 => Self::CW180,
            4 => Self::MirroredVertical,
            5 => Self::MirroredHorizontalAnd270CW,
            6 => Self::CW90,
            7 => Self::MirroredHorizontalAnd90CW,
            8 => Self::CW270,
            _ => Self::Normal,
        }
    }
}

impl Orientation {
    #[must_use]
    pub fn apply(self, img: DynamicImage) -> DynamicImage {
        match self {
            Self::Normal => img,
            Self::MirroredHorizontal => img.fliph(),
            Self::CW180 => img.rotate180(),
            Self::MirroredVertical => img.flipv(),
            Self::MirroredHorizontalAnd270CW => img.fliph().rotate270(),
            Self::CW90 => img.rotate90(),
            Self::MirroredHorizontalAnd90CW => img.fliph().rotate90(),
            Self::CW270 => img.rotate270(),
        }
    }
}

/// Decodes `bytes` as an image of any format the `image` crate recognizes and
/// rotates it upright according to its EXIF orientation.
pub fn decode(bytes: &[u8]) -> Result<DecodedImage, ConversionError> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let mut decoder = reader.into_decoder().map_err(classify)?;
    let icc_profile = match decoder.icc_profile() {
        Ok(profile) => profile.filter(|p| !p.is_empty()),
        Err(e) => {
            log::debug!("Ignoring unreadable ICC profile: {}", e);
            None
        }
    };
    let image = DynamicImage::from_decoder(decoder).map_err(classify)?;

    let (orientation, exif) = read_exif(bytes);
    let image = orientation.apply(image);
    if orientation != Orientation::Normal {
        log::debug!("Applied EXIF orientation {:?}", orientation);
    }

    Ok(DecodedImage {
        image,
        metadata: ImageMetadata { exif, icc_profile },
    })
}

fn classify(err: ImageError) -> ConversionError {
    // decoding reads from memory, so an IO error here means truncated data
    match err {
        ImageError::Limits(e) => ConversionError::Io(io::Error::new(io::ErrorKind::OutOfMemory, e)),
        other => {
            log::debug!("Input rejected by decoder: {}", other);
            ConversionError::UnreadableImage
        }
    }
}

fn read_exif(bytes: &[u8]) -> (Orientation, Option<Vec<u8>>) {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => exif,
        Err(_) => return (Orientation::Normal, None),
    };
    let orientation = exif
        .get_field(Tag::Orientation, In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .map(Orientation::from)
        .unwrap_or_default();

    let mut raw = exif.buf().to_vec();
    if raw.is_empty() {
        return (orientation, None);
    }
    reset_orientation(&mut raw);
    (orientation, Some(raw))
}

/// Rewrites the orientation entry of IFD0 in a raw TIFF/EXIF block to 1
/// (upright). Malformed blocks are left untouched.
pub(crate) fn reset_orientation(tiff: &mut [u8]) {
    const ORIENTATION: u16 = 0x0112;
    const SHORT: u16 = 3;

    let big_endian = match tiff.get(0..4) {
        Some(b"MM\0*") => true,
        Some(b"II*\0") => false,
        _ => return,
    };
    let read_u16 = |buf: &[u8], at: usize| -> Option<u16> {
        let b: [u8; 2] = buf.get(at..at + 2)?.try_into().ok()?;
        Some(if big_endian { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) })
    };
    let read_u32 = |buf: &[u8], at: usize| -> Option<u32> {
        let b: [u8; 4] = buf.get(at..at + 4)?.try_into().ok()?;
        Some(if big_endian { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) })
    };

    let Some(ifd) = read_u32(tiff, 4).map(|o| o as usize) else {
        return;
    };
    let Some(count) = read_u16(tiff, ifd) else {
        return;
    };
    for i in 0..count as usize {
        let at = ifd + 2 + i * 12;
        if read_u16(tiff, at) != Some(ORIENTATION) {
            continue;
        }
        if read_u16(tiff, at + 2) != Some(SHORT) {
            return;
        }
        let one = if big_endian { 1u16.to_be_bytes() } else { 1u16.to_le_bytes() };
        if let Some(value) = tiff.get_mut(at + 8..at + 10) {
            value.copy_from_slice(&one);
        }
        return;
    }
}
