//! Carries an EXIF block into a TIFF written by the `tiff` crate.
//!
//! Exif-context fields of the primary image go into a child IFD that IFD0
//! points at through the ExifIFD tag. Descriptive ASCII tags of IFD0 are
//! copied into IFD0 itself. The `tiff` encoder writes in host byte order,
//! so the child IFD does too.

use exif::{Context, Field, In, Value};
use std::io::{Seek, Write};
use tiff::encoder::{DirectoryEncoder, TiffKindStandard};
use tiff::tags::Tag;
use tiff::{TiffError, TiffResult};

pub const EXIF_IFD_POINTER: u16 = 0x8769;

/// ImageDescription, Make, Model, Software, DateTime, Artist, Copyright.
const COPIED_ASCII_TAGS: [u16; 7] = [0x010E, 0x010F, 0x0110, 0x0131, 0x0132, 0x013B, 0x8298];

struct Entry {
    tag: u16,
    field_type: u16,
    count: u32,
    data: Vec<u8>,
}

/// Writes the fields of `exif` (a raw TIFF-structured EXIF block) into
/// `dir`. Returns how many fields were carried; an unparseable block
/// carries none.
pub fn write_exif<W: Write + Seek>(
    dir: &mut DirectoryEncoder<'_, W, TiffKindStandard>,
    exif: &[u8],
) -> TiffResult<usize> {
    let parsed = match exif::Reader::new().read_raw(exif.to_vec()) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::warn!("Dropping unreadable EXIF block from TIFF output: {}", e);
            return Ok(0);
        }
    };

    let mut copied = 0;
    let mut entries = Vec::new();
    for field in parsed.fields().filter(|f| f.ifd_num == In::PRIMARY) {
        match field.tag.context() {
            Context::Exif => entries.extend(entry(field)),
            Context::Tiff if COPIED_ASCII_TAGS.contains(&field.tag.number()) => {
                if let Some(text) = ascii(&field.value) {
                    dir.write_tag(Tag::Unknown(field.tag.number()), text)?;
                    copied += 1;
                }
            }
            _ => {}
        }
    }
    if entries.is_empty() {
        return Ok(copied);
    }
    entries.sort_by_key(|e| e.tag);
    entries.dedup_by_key(|e| e.tag);

    let count = u16::try_from(entries.len()).map_err(|_| TiffError::IntSizeError)?;
    let mut ifd = Vec::with_capacity(6 + entries.len() * 12);
    ifd.extend_from_slice(&count.to_ne_bytes());
    for entry in &entries {
        ifd.extend_from_slice(&entry.tag.to_ne_bytes());
        ifd.extend_from_slice(&entry.field_type.to_ne_bytes());
        ifd.extend_from_slice(&entry.count.to_ne_bytes());
        if entry.data.len() <= 4 {
            let mut inline = [0u8; 4];
            inline[..entry.data.len()].copy_from_slice(&entry.data);
            ifd.extend_from_slice(&inline);
        } else {
            let mut data = entry.data.clone();
            if data.len() % 2 == 1 {
                data.push(0);
            }
            let offset = dir.write_data(data.as_slice())?;
            ifd.extend_from_slice(&offset_u32(offset)?.to_ne_bytes());
        }
    }
    ifd.extend_from_slice(&0u32.to_ne_bytes());

    let offset = offset_u32(dir.write_data(ifd.as_slice())?)?;
    dir.write_tag(Tag::Unknown(EXIF_IFD_POINTER), offset)?;
    Ok(copied + entries.len())
}

fn offset_u32(offset: u64) -> TiffResult<u32> {
    u32::try_from(offset).map_err(|_| TiffError::IntSizeError)
}

fn ascii(value: &Value) -> Option<&str> {
    match value {
        Value::Ascii(parts) => parts
            .first()
            .and_then(|part| std::str::from_utf8(part).ok())
            .map(|text| text.trim_end_matches('\0'))
            .filter(|text| !text.is_empty() && text.is_ascii() && !text.contains('\0')),
        _ => None,
    }
}

/// TIFF field type, value count and host-order bytes of one field.
fn entry(field: &Field) -> Option<Entry> {
    let (field_type, count, data): (u16, usize, Vec<u8>) = match &field.value {
        Value::Byte(v) => (1, v.len(), v.clone()),
        Value::Ascii(parts) => {
            let mut data = Vec::new();
            for part in parts {
                data.extend_from_slice(part);
                data.push(0);
            }
            (2, data.len(), data)
        }
        Value::Short(v) => (3, v.len(), v.iter().flat_map(|x| x.to_ne_bytes()).collect()),
        Value::Long(v) => (4, v.len(), v.iter().flat_map(|x| x.to_ne_bytes()).collect()),
        Value::Rational(v) => (
            5,
            v.len(),
            v.iter()
                .flat_map(|r| r.num.to_ne_bytes().into_iter().chain(r.denom.to_ne_bytes()))
                .collect(),
        ),
        Value::SByte(v) => (6, v.len(), v.iter().map(|&x| x as u8).collect()),
        Value::Undefined(v, _) => (7, v.len(), v.clone()),
        Value::SShort(v) => (8, v.len(), v.iter().flat_map(|x| x.to_ne_bytes()).collect()),
        Value::SLong(v) => (9, v.len(), v.iter().flat_map(|x| x.to_ne_bytes()).collect()),
        Value::SRational(v) => (
            10,
            v.len(),
            v.iter()
                .flat_map(|r| r.num.to_ne_bytes().into_iter().chain(r.denom.to_ne_bytes()))
                .collect(),
        ),
        Value::Float(v) => (11, v.len(), v.iter().flat_map(|x| x.to_ne_bytes()).collect()),
        Value::Double(v) => (12, v.len(), v.iter().flat_map(|x| x.to_ne_bytes()).collect()),
        Value::Unknown(..) => return None,
    };
    Some(Entry {
        tag: field.tag.number(),
        field_type,
        count: u32::try_from(count).ok()?,
        data,
    })
}
