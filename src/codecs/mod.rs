//! Writers for containers the `image` crate does not encode, ICO/CUR
//! directory handling, and metadata carriers for WebP and TIFF.

pub mod exif_ifd;
pub mod icon;
pub mod raster;
pub mod text;
pub mod webp_container;

use image::{GrayImage, RgbImage};

/// Opaque 8-bit pixel data accepted by the hand-written writers.
#[derive(Debug, Clone, Copy)]
pub enum Raster<'a> {
    Gray(&'a GrayImage),
    Rgb(&'a RgbImage),
}

impl Raster<'_> {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Raster::Gray(img) => img.dimensions(),
            Raster::Rgb(img) => img.dimensions(),
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            Raster::Gray(_) => 1,
            Raster::Rgb(_) => 3,
        }
    }

    pub fn samples(&self) -> &[u8] {
        match self {
            Raster::Gray(img) => img.as_raw(),
            Raster::Rgb(img) => img.as_raw(),
        }
    }

    /// One channel of one row.
    fn plane_row(&self, y: u32, channel: usize) -> impl Iterator<Item = u8> + '_ {
        let (width, _) = self.dimensions();
        let channels = self.channels();
        let start = y as usize * width as usize * channels;
        let row = &self.samples()[start..start + width as usize * channels];
        row.iter().skip(channel).step_by(channels).copied()
    }
}

fn dimension_u16(value: u32, what: &str) -> std::io::Result<u16> {
    u16::try_from(value).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{what} {value} exceeds the format limit of {}", u16::MAX),
        )
    })
}
