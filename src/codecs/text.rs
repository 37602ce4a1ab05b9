//! Text-based containers: EPS (raster image in PostScript), XBM and XPM.

use super::raster::{pack_bits, BitOrder};
use super::Raster;
use crate::normalizer::IndexedImage;
use image::GrayImage;
use std::io::{self, Write};

const HEX_LINE_BYTES: usize = 32;

/// Writes an EPSF-3.0 file embedding the raster as hex image data. The
/// bounding box is sized so the image prints at `dpi`.
pub fn write_eps<W: Write>(out: &mut W, raster: Raster<'_>, dpi: u32) -> io::Result<()> {
    let (width, height) = raster.dimensions();
    let points = |px: u32| ((px as u64 * 72 + dpi as u64 - 1) / dpi as u64).max(1);
    let (bw, bh) = (points(width), points(height));
    let channels = raster.channels();

    writeln!(out, "%!PS-Adobe-3.0 EPSF-3.0")?;
    writeln!(out, "%%Creator: image-batch-converter")?;
    writeln!(out, "%%BoundingBox: 0 0 {bw} {bh}")?;
    writeln!(out, "%%Pages: 1")?;
    writeln!(out, "%%EndComments")?;
    writeln!(out, "%%Page: 1 1")?;
    writeln!(
        out,
        "%%ImageData: {width} {height} 8 {channels} 0 1 1 \"{{ currentfile buf readhexstring pop }} bind\""
    )?;
    writeln!(out, "gsave")?;
    writeln!(out, "10 dict begin")?;
    writeln!(out, "/buf {} string def", width as usize * channels)?;
    writeln!(out, "{bw} {bh} scale")?;
    writeln!(out, "{width} {height} 8")?;
    writeln!(out, "[{width} 0 0 -{height} 0 {height}]")?;
    writeln!(out, "{{ currentfile buf readhexstring pop }} bind")?;
    match raster {
        Raster::Gray(_) => writeln!(out, "image")?,
        Raster::Rgb(_) => writeln!(out, "false 3 colorimage")?,
    }

    let mut line = String::with_capacity(HEX_LINE_BYTES * 2);
    for chunk in raster.samples().chunks(HEX_LINE_BYTES) {
        line.clear();
        for byte in chunk {
            line.push_str(&format!("{byte:02x}"));
        }
        writeln!(out, "{line}")?;
    }

    writeln!(out, "%%EndBinary")?;
    writeln!(out, "end")?;
    writeln!(out, "grestore")?;
    writeln!(out, "showpage")?;
    writeln!(out, "%%Trailer")?;
    writeln!(out, "%%EOF")
}

/// Writes an X11 bitmap as C source. Black pixels become set bits.
pub fn write_xbm<W: Write>(out: &mut W, bilevel: &GrayImage, name: &str) -> io::Result<()> {
    let (width, height) = bilevel.dimensions();
    let name = c_identifier(name);
    writeln!(out, "#define {name}_width {width}")?;
    writeln!(out, "#define {name}_height {height}")?;
    writeln!(out, "static char {name}_bits[] = {{")?;

    let packed = pack_bits(bilevel, BitOrder::LsbFirst);
    for (i, row) in packed.chunks(12).enumerate() {
        let last_row = (i + 1) * 12 >= packed.len();
        let cells: Vec<String> = row.iter().map(|b| format!("0x{b:02x}")).collect();
        let sep = if last_row { "" } else { "," };
        writeln!(out, "  {}{sep}", cells.join(", "))?;
    }
    writeln!(out, "}};")
}

/// Printable characters usable as XPM pixel keys (no quote or backslash).
const XPM_KEYS: &[u8] =
    b" .+@#$%&*=-;>,')!~{]^/(_:<[}|1234567890abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ`";

/// Writes an XPM3 pixmap. The transparent palette entry, if any, is
/// written as `None`.
pub fn write_xpm<W: Write>(out: &mut W, image: &IndexedImage, name: &str) -> io::Result<()> {
    let colors = image.palette.len();
    let chars_per_pixel = if colors <= XPM_KEYS.len() { 1 } else { 2 };
    let key = |index: usize| -> String {
        if chars_per_pixel == 1 {
            (XPM_KEYS[index] as char).to_string()
        } else {
            let n = XPM_KEYS.len();
            format!("{}{}", XPM_KEYS[index / n] as char, XPM_KEYS[index % n] as char)
        }
    };

    writeln!(out, "/* XPM */")?;
    writeln!(out, "static char *{}[] = {{", c_identifier(name))?;
    writeln!(
        out,
        "\"{} {} {colors} {chars_per_pixel}\",",
        image.width, image.height
    )?;
    for (i, [r, g, b]) in image.palette.iter().enumerate() {
        if Some(i as u8) == image.transparent_index {
            writeln!(out, "\"{} c None\",", key(i))?;
        } else {
            writeln!(out, "\"{} c #{r:02X}{g:02X}{b:02X}\",", key(i))?;
        }
    }

    let keys: Vec<String> = (0..colors).map(key).collect();
    let width = image.width as usize;
    let rows = image.indices.chunks(width.max(1));
    let total = image.height as usize;
    for (y, row) in rows.enumerate() {
        let line: String = row.iter().map(|&i| keys[i as usize].as_str()).collect();
        let sep = if y + 1 == total { "" } else { "," };
        writeln!(out, "\"{line}\"{sep}")?;
    }
    writeln!(out, "}};")
}

fn c_identifier(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if !ident.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        ident.insert(0, '_');
    }
    ident
}
