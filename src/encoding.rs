//! Text decoding for clipboard text formats
//!
//! `CF_UNICODETEXT` is UTF-16LE, but drag sources also hand out UTF-8 (with
//! or without BOM) and the occasional big-endian UTF-16 through custom
//! formats and streams. Everything is decoded up to the first terminator.

/// Decode text of unknown encoding.
/// Handles UTF-8, UTF-16 LE/BE (with or without BOM), and falls back to lossy UTF-8
pub fn decode_text(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }

    if let Some(body) = data.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(body, u16::from_le_bytes);
    }
    if let Some(body) = data.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(body, u16::from_be_bytes);
    }
    if looks_like_utf16_le(data) {
        return decode_utf16(data, u16::from_le_bytes);
    }

    let data = data.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(data);
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Decode `CF_UNICODETEXT` content: UTF-16LE, NUL-terminated, optional BOM
pub fn decode_unicode_text(data: &[u8]) -> String {
    let data = data.strip_prefix(&[0xFF, 0xFE]).unwrap_or(data);
    decode_utf16(data, u16::from_le_bytes)
}

/// Check if data looks like UTF-16 LE (ASCII characters have 0x00 as second byte)
fn looks_like_utf16_le(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    let mut null_count = 0;
    let mut check_count = 0;
    for chunk in data.chunks_exact(2).take(10) {
        check_count += 1;
        if chunk[1] == 0 && chunk[0] != 0 && chunk[0] < 128 {
            null_count += 1;
        }
    }
    check_count > 0 && null_count > check_count / 2
}

fn decode_utf16(data: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|chunk| unit([chunk[0], chunk[1]]))
        .take_while(|&c| c != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// UTF-16LE bytes of `s` followed by a NUL terminator
pub fn encode_utf16le_nul(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}
