//! ICO/CUR helpers: size selection and directory handling.
//!
//! ICO and CUR share one container; a cursor differs only in the resource
//! type of the header and in storing the hotspot where an icon stores
//! planes and bit count.

use std::io;

pub const CANDIDATE_SIZES: [u32; 7] = [16, 24, 32, 48, 64, 128, 256];
pub const MAX_ICON_SIZE: u32 = 256;

const HEADER_LEN: usize = 6;
const ENTRY_LEN: usize = 16;
const TYPE_ICON: u16 = 1;
const TYPE_CURSOR: u16 = 2;

/// Square sizes to embed for a `width` x `height` source: every candidate
/// not larger than the source (capped at 256), or the capped source size
/// itself when no candidate fits.
pub fn icon_sizes(width: u32, height: u32) -> Vec<u32> {
    let max = width.max(height).min(MAX_ICON_SIZE);
    let sizes: Vec<u32> = CANDIDATE_SIZES.iter().copied().filter(|&s| s <= max).collect();
    if sizes.is_empty() {
        vec![max.max(1)]
    } else {
        sizes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IconKind {
    Icon,
    Cursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IconEntry {
    pub width: u32,
    pub height: u32,
    /// Color planes for icons, hotspot x for cursors.
    pub planes_or_hotspot_x: u16,
    /// Bits per pixel for icons, hotspot y for cursors.
    pub bit_count_or_hotspot_y: u16,
    pub size: u32,
    pub offset: u32,
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn u16_at(bytes: &[u8], at: usize) -> io::Result<u16> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| invalid("truncated icon directory"))
}

fn u32_at(bytes: &[u8], at: usize) -> io::Result<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| invalid("truncated icon directory"))
}

/// Parses the resource header and directory of an ICO or CUR file.
pub fn read_directory(bytes: &[u8]) -> io::Result<(IconKind, Vec<IconEntry>)> {
    if u16_at(bytes, 0)? != 0 {
        return Err(invalid("not an icon resource"));
    }
    let kind = match u16_at(bytes, 2)? {
        TYPE_ICON => IconKind::Icon,
        TYPE_CURSOR => IconKind::Cursor,
        _ => return Err(invalid("unknown icon resource type")),
    };
    let count = u16_at(bytes, 4)? as usize;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = HEADER_LEN + i * ENTRY_LEN;
        let dim = |b: u8| if b == 0 { 256 } else { b as u32 };
        let width = *bytes.get(at).ok_or_else(|| invalid("truncated icon directory"))?;
        let height = *bytes.get(at + 1).ok_or_else(|| invalid("truncated icon directory"))?;
        entries.push(IconEntry {
            width: dim(width),
            height: dim(height),
            planes_or_hotspot_x: u16_at(bytes, at + 4)?,
            bit_count_or_hotspot_y: u16_at(bytes, at + 6)?,
            size: u32_at(bytes, at + 8)?,
            offset: u32_at(bytes, at + 12)?,
        });
    }
    Ok((kind, entries))
}

/// Turns an encoded ICO into a CUR in place, giving every image the same
/// hotspot.
pub fn into_cursor(bytes: &mut [u8], hotspot: (u16, u16)) -> io::Result<()> {
    let (_, entries) = read_directory(bytes)?;
    bytes[2..4].copy_from_slice(&TYPE_CURSOR.to_le_bytes());
    for i in 0..entries.len() {
        let at = HEADER_LEN + i * ENTRY_LEN;
        bytes[at + 4..at + 6].copy_from_slice(&hotspot.0.to_le_bytes());
        bytes[at + 6..at + 8].copy_from_slice(&hotspot.1.to_le_bytes());
    }
    Ok(())
}
