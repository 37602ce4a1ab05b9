//! RIFF chunk handling for WebP output.
//!
//! libwebp's simple encoder emits a bare `VP8 `/`VP8L` file. Carrying an ICC
//! profile needs the extended layout: a `VP8X` header chunk with the ICC
//! flag set, followed by an `ICCP` chunk ahead of the image data.

use std::io;

const RIFF_HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;
const VP8X_PAYLOAD_LEN: usize = 10;
const FLAG_ICC: u8 = 0x20;
const FLAG_ALPHA: u8 = 0x10;
const MAX_CANVAS: u32 = 1 << 24;

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn push_chunk(out: &mut Vec<u8>, fourcc: &[u8; 4], payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| invalid("RIFF chunk too large"))?;
    out.extend_from_slice(fourcc);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    if payload.len() % 2 == 1 {
        out.push(0);
    }
    Ok(())
}

fn push_u24(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes()[..3]);
}

/// Returns `webp` rewritten to carry `icc`. `width`, `height` and
/// `has_alpha` describe the canvas when a `VP8X` header has to be added.
pub fn embed_icc(webp: &[u8], icc: &[u8], width: u32, height: u32, has_alpha: bool) -> io::Result<Vec<u8>> {
    if webp.len() < RIFF_HEADER_LEN + CHUNK_HEADER_LEN || &webp[..4] != b"RIFF" || &webp[8..12] != b"WEBP" {
        return Err(invalid("not a WebP file"));
    }
    if width == 0 || height == 0 || width > MAX_CANVAS || height > MAX_CANVAS {
        return Err(invalid("WebP canvas out of range"));
    }

    let first = &webp[RIFF_HEADER_LEN..RIFF_HEADER_LEN + 4];
    let mut out = Vec::with_capacity(webp.len() + icc.len() + 40);
    out.extend_from_slice(b"RIFF\0\0\0\0WEBP");

    if first == b"VP8X" {
        let vp8x_end = RIFF_HEADER_LEN + CHUNK_HEADER_LEN + VP8X_PAYLOAD_LEN;
        let header = webp.get(RIFF_HEADER_LEN..vp8x_end).ok_or_else(|| invalid("truncated VP8X chunk"))?;
        let flags = header[CHUNK_HEADER_LEN];
        if flags & FLAG_ICC != 0 {
            return Ok(webp.to_vec());
        }
        out.extend_from_slice(header);
        out[RIFF_HEADER_LEN + CHUNK_HEADER_LEN] = flags | FLAG_ICC;
        push_chunk(&mut out, b"ICCP", icc)?;
        out.extend_from_slice(&webp[vp8x_end..]);
    } else if first == b"VP8 " || first == b"VP8L" {
        let mut payload = Vec::with_capacity(VP8X_PAYLOAD_LEN);
        payload.push(FLAG_ICC | if has_alpha { FLAG_ALPHA } else { 0 });
        payload.extend_from_slice(&[0, 0, 0]);
        push_u24(&mut payload, width - 1);
        push_u24(&mut payload, height - 1);
        push_chunk(&mut out, b"VP8X", &payload)?;
        push_chunk(&mut out, b"ICCP", icc)?;
        out.extend_from_slice(&webp[RIFF_HEADER_LEN..]);
    } else {
        return Err(invalid("unexpected first WebP chunk"));
    }

    let riff_len = u32::try_from(out.len() - 8).map_err(|_| invalid("WebP file too large"))?;
    out[4..8].copy_from_slice(&riff_len.to_le_bytes());
    Ok(out)
}
