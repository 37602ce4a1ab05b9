//! Binary raster containers: PCX, SGI, IM and 1-bit PBM.

use super::{dimension_u16, Raster};
use image::GrayImage;
use std::io::{self, Write};

/// Writes a version 5 run-length encoded PCX: 8-bit grayscale with a gray
/// ramp palette, or 24-bit RGB as three planes.
pub fn write_pcx<W: Write>(out: &mut W, raster: Raster<'_>, dpi: u16) -> io::Result<()> {
    let (width, height) = raster.dimensions();
    let xmax = dimension_u16(width.saturating_sub(1), "PCX width")?;
    let ymax = dimension_u16(height.saturating_sub(1), "PCX height")?;
    let planes = raster.channels() as u8;
    let bytes_per_line = (width as usize + 1) & !1;
    let bytes_per_line_u16 = dimension_u16(bytes_per_line as u32, "PCX line length")?;

    let mut header = Vec::with_capacity(128);
    header.extend_from_slice(&[0x0A, 5, 1, 8]);
    for v in [0u16, 0, xmax, ymax, dpi, dpi] {
        header.extend_from_slice(&v.to_le_bytes());
    }
    header.extend_from_slice(&[0u8; 48]);
    header.push(0);
    header.push(planes);
    header.extend_from_slice(&bytes_per_line_u16.to_le_bytes());
    let palette_info: u16 = if planes == 1 { 2 } else { 1 };
    header.extend_from_slice(&palette_info.to_le_bytes());
    header.extend_from_slice(&[0u8; 58]);
    debug_assert_eq!(header.len(), 128);
    out.write_all(&header)?;

    let mut line = Vec::with_capacity(bytes_per_line);
    let mut encoded = Vec::with_capacity(bytes_per_line * 2);
    for y in 0..height {
        for channel in 0..raster.channels() {
            line.clear();
            line.extend(raster.plane_row(y, channel));
            line.resize(bytes_per_line, 0);
            encoded.clear();
            pcx_rle(&line, &mut encoded);
            out.write_all(&encoded)?;
        }
    }

    if planes == 1 {
        out.write_all(&[0x0C])?;
        let ramp: Vec<u8> = (0..=255u8).flat_map(|i| [i, i, i]).collect();
        out.write_all(&ramp)?;
    }
    Ok(())
}

fn pcx_rle(line: &[u8], out: &mut Vec<u8>) {
    let mut i = 0;
    while i < line.len() {
        let byte = line[i];
        let mut run = 1;
        while run < 63 && i + run < line.len() && line[i + run] == byte {
            run += 1;
        }
        if run > 1 || byte >= 0xC0 {
            out.push(0xC0 | run as u8);
        }
        out.push(byte);
        i += run;
    }
}

/// Writes an uncompressed SGI image, 8 bits per channel, scanlines bottom-up.
pub fn write_sgi<W: Write>(out: &mut W, raster: Raster<'_>, name: &str) -> io::Result<()> {
    let (width, height) = raster.dimensions();
    let xsize = dimension_u16(width, "SGI width")?;
    let ysize = dimension_u16(height, "SGI height")?;
    let zsize = raster.channels() as u16;
    let dimension: u16 = if zsize == 1 { 2 } else { 3 };

    let mut header = Vec::with_capacity(512);
    header.extend_from_slice(&474i16.to_be_bytes());
    header.push(0); // storage: verbatim
    header.push(1); // bytes per channel
    for v in [dimension, xsize, ysize, zsize] {
        header.extend_from_slice(&v.to_be_bytes());
    }
    header.extend_from_slice(&0i32.to_be_bytes());
    header.extend_from_slice(&255i32.to_be_bytes());
    header.extend_from_slice(&[0u8; 4]);
    let mut image_name = [0u8; 80];
    let name = name.as_bytes();
    let len = name.len().min(79);
    image_name[..len].copy_from_slice(&name[..len]);
    header.extend_from_slice(&image_name);
    header.extend_from_slice(&0i32.to_be_bytes()); // colormap: normal
    header.resize(512, 0);
    out.write_all(&header)?;

    let mut row = Vec::with_capacity(width as usize);
    for channel in 0..raster.channels() {
        for y in (0..height).rev() {
            row.clear();
            row.extend(raster.plane_row(y, channel));
            out.write_all(&row)?;
        }
    }
    Ok(())
}

/// Writes an IM container: a 512-byte text header followed by raw
/// line-interleaved samples.
pub fn write_im<W: Write>(out: &mut W, raster: Raster<'_>, name: &str) -> io::Result<()> {
    let (width, height) = raster.dimensions();
    let image_type = match raster {
        Raster::Gray(_) => "Greyscale",
        Raster::Rgb(_) => "RGB",
    };
    let mut header = format!(
        "Image type: {image_type} image\r\nName: {name}\r\nImage size (x*y): {width}*{height}\r\nFile size (no of images): 1\r\n"
    )
    .into_bytes();
    if header.len() > 511 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "IM header too long"));
    }
    header.resize(511, 0);
    header.push(0x1A);
    out.write_all(&header)?;

    let mut row = Vec::with_capacity(width as usize);
    for y in 0..height {
        for channel in 0..raster.channels() {
            row.clear();
            row.extend(raster.plane_row(y, channel));
            out.write_all(&row)?;
        }
    }
    Ok(())
}

/// Writes a binary (P4) PBM. `bilevel` holds 0 for black and 255 for white;
/// PBM stores 1 for black.
pub fn write_pbm<W: Write>(out: &mut W, bilevel: &GrayImage) -> io::Result<()> {
    let (width, height) = bilevel.dimensions();
    write!(out, "P4\n{width} {height}\n")?;
    out.write_all(&pack_bits(bilevel, BitOrder::MsbFirst))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitOrder {
    MsbFirst,
    LsbFirst,
}

/// Packs each row into bytes (rows padded to a byte boundary), setting a bit
/// for every black pixel.
pub(crate) fn pack_bits(bilevel: &GrayImage, order: BitOrder) -> Vec<u8> {
    let (width, height) = bilevel.dimensions();
    let row_bytes = (width as usize + 7) / 8;
    let mut packed = vec![0u8; row_bytes * height as usize];
    for (x, y, pixel) in bilevel.enumerate_pixels() {
        if pixel[0] >= 128 {
            continue;
        }
        let bit = (x % 8) as u8;
        let mask = match order {
            BitOrder::MsbFirst => 0x80 >> bit,
            BitOrder::LsbFirst => 1 << bit,
        };
        packed[y as usize * row_bytes + x as usize / 8] |= mask;
    }
    packed
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    #[test]
    fn pcx_header_describes_rgb_planes() {
        let img = RgbImage::from_pixel(3, 2, Rgb([10, 20, 30]));
        let mut out = Vec::new();
        write_pcx(&mut out, Raster::Rgb(&img), 300).unwrap();
        assert_eq!(&out[..4], &[0x0A, 5, 1, 8]);
        assert_eq!(u16::from_le_bytes([out[8], out[9]]), 2); // xmax
        assert_eq!(u16::from_le_bytes([out[10], out[11]]), 1); // ymax
        assert_eq!(out[65], 3);
        assert_eq!(u16::from_le_bytes([out[66], out[67]]), 4);
        // each plane row is a 3-pixel run plus one padding byte
        assert_eq!(&out[128..131], &[0xC3, 10, 0]);
    }

    #[test]
    fn pcx_gray_appends_palette() {
        let img = GrayImage::from_pixel(2, 2, Luma([0xC5]));
        let mut out = Vec::new();
        write_pcx(&mut out, Raster::Gray(&img), 72).unwrap();
        assert_eq!(out[65], 1);
        assert_eq!(out[out.len() - 769], 0x0C);
        assert_eq!(&out[out.len() - 3..], &[255, 255, 255]);
    }

    #[test]
    fn rle_escapes_high_literal_bytes() {
        let mut out = Vec::new();
        pcx_rle(&[0xC1, 5, 5, 5], &mut out);
        assert_eq!(out, vec![0xC1, 0xC1, 0xC3, 5]);
    }

    #[test]
    fn sgi_writes_planar_bottom_up() {
        let mut img = RgbImage::new(1, 2);
        img.put_pixel(0, 0, Rgb([1, 2, 3]));
        img.put_pixel(0, 1, Rgb([4, 5, 6]));
        let mut out = Vec::new();
        write_sgi(&mut out, Raster::Rgb(&img), "test").unwrap();
        assert_eq!(out.len(), 512 + 6);
        assert_eq!(&out[..2], &474i16.to_be_bytes());
        assert_eq!(&out[512..], &[4, 1, 5, 2, 6, 3]);
    }

    #[test]
    fn im_header_is_padded_to_512_bytes() {
        let img = GrayImage::from_pixel(2, 1, Luma([9]));
        let mut out = Vec::new();
        write_im(&mut out, Raster::Gray(&img), "x").unwrap();
        assert_eq!(out.len(), 514);
        assert_eq!(out[511], 0x1A);
        assert!(out.starts_with(b"Image type: Greyscale image\r\n"));
    }

    #[test]
    fn pbm_sets_bits_for_black() {
        let mut img = GrayImage::from_pixel(9, 1, Luma([255]));
        img.put_pixel(0, 0, Luma([0]));
        img.put_pixel(8, 0, Luma([0]));
        let mut out = Vec::new();
        write_pbm(&mut out, &img).unwrap();
        assert_eq!(out, b"P4\n9 1\n\x80\x80".to_vec());
    }
}
