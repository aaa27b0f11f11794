//! Content sniffing
//!
//! Maps the first bytes of a payload to a (mime type, extension) pair using
//! fixed magic numbers plus a few structural matchers (MP4 `ftyp` box, WebM
//! EBML DocType, bare MP3 frames, HTML tag openers). The check order matters:
//! cheap exact signatures first, structural matchers in between, and
//! BOM-prefixed text last.
//!
//! Also holds the mime <-> extension lookup tables used when a payload does
//! not sniff to anything and the name or declared type has to decide.

use std::path::Path;

/// Result of sniffing a byte buffer. Both strings are static.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sniffed {
    pub mime: &'static str,
    /// Extension including the leading dot
    pub extension: &'static str,
}

impl Sniffed {
    const fn new(mime: &'static str, extension: &'static str) -> Self {
        Self { mime, extension }
    }

    /// Whether nothing matched
    pub fn is_unknown(&self) -> bool {
        *self == UNKNOWN
    }
}

pub const UNKNOWN: Sniffed = Sniffed::new("application/octet-stream", ".bin");

/// Sniff `data`. Never fails: unknown content is `application/octet-stream`.
pub fn sniff(data: &[u8]) -> Sniffed {
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Sniffed::new("image/gif", ".gif");
    }
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Sniffed::new("image/jpeg", ".jpg");
    }
    if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Sniffed::new("image/png", ".png");
    }
    if riff_form(data, b"WEBP") && data.get(12..14) == Some(b"VP") {
        return Sniffed::new("image/webp", ".webp");
    }
    if data.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
        return Sniffed::new("image/x-icon", ".ico");
    }
    if data.starts_with(&[0x00, 0x00, 0x02, 0x00]) {
        return Sniffed::new("image/x-icon", ".cur");
    }
    if data.starts_with(b"BM") {
        return Sniffed::new("image/bmp", ".bmp");
    }
    if data.starts_with(b"FORM") && data.get(8..12) == Some(b"AIFF") {
        return Sniffed::new("audio/aiff", ".aiff");
    }
    if data.starts_with(b"ID3") {
        return Sniffed::new("audio/mpeg", ".mp3");
    }
    if is_mp4(data) {
        return Sniffed::new("video/mp4", ".mp4");
    }
    if is_webm(data) {
        return Sniffed::new("video/webm", ".webm");
    }
    if is_mp3_without_id3(data) {
        return Sniffed::new("audio/mpeg", ".mp3");
    }
    if data.starts_with(b"OggS\0") {
        return Sniffed::new("application/ogg", ".ogg");
    }
    if data.starts_with(b"MThd\0\0\0\x06") {
        return Sniffed::new("audio/midi", ".mid");
    }
    if riff_form(data, b"AVI ") {
        return Sniffed::new("video/avi", ".avi");
    }
    if riff_form(data, b"WAVE") {
        return Sniffed::new("audio/wave", ".wav");
    }
    if data.starts_with(b"%PDF-") {
        return Sniffed::new("application/pdf", ".pdf");
    }
    if let Some(font) = sniff_font(data) {
        return font;
    }
    if let Some(archive) = sniff_archive(data) {
        return archive;
    }
    if data.starts_with(b"%!PS-Adobe-") {
        return Sniffed::new("application/postscript", ".ps");
    }
    if is_html(data) {
        return Sniffed::new("text/html", ".html");
    }
    if data.starts_with(&[0xFE, 0xFF])
        || data.starts_with(&[0xFF, 0xFE])
        || data.starts_with(&[0xEF, 0xBB, 0xBF])
    {
        return Sniffed::new("text/plain", ".txt");
    }
    UNKNOWN
}

fn riff_form(data: &[u8], form: &[u8; 4]) -> bool {
    data.starts_with(b"RIFF") && data.get(8..12) == Some(&form[..])
}

fn sniff_font(data: &[u8]) -> Option<Sniffed> {
    // Embedded OpenType: "LP" at offset 34, preceded by the header fields
    if data.len() >= 36 && &data[34..36] == b"LP" {
        return Some(Sniffed::new("application/vnd.ms-fontobject", ".eot"));
    }
    if data.starts_with(&[0x00, 0x01, 0x00, 0x00]) {
        return Some(Sniffed::new("font/ttf", ".ttf"));
    }
    if data.starts_with(b"OTTO") {
        return Some(Sniffed::new("font/otf", ".otf"));
    }
    if data.starts_with(b"ttcf") {
        return Some(Sniffed::new("font/collection", ".ttc"));
    }
    if data.starts_with(b"wOFF") {
        return Some(Sniffed::new("font/woff", ".woff"));
    }
    if data.starts_with(b"wOF2") {
        return Some(Sniffed::new("font/woff2", ".woff2"));
    }
    None
}

fn sniff_archive(data: &[u8]) -> Option<Sniffed> {
    if data.starts_with(&[0x1F, 0x8B, 0x08]) {
        return Some(Sniffed::new("application/x-gzip", ".gz"));
    }
    if data.starts_with(b"PK\x03\x04") {
        return Some(Sniffed::new("application/zip", ".zip"));
    }
    if data.starts_with(b"Rar!\x1A\x07\x00") || data.starts_with(b"Rar!\x1A\x07\x01\x00") {
        return Some(Sniffed::new("application/x-rar-compressed", ".rar"));
    }
    if data.starts_with(&[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C]) {
        return Some(Sniffed::new("application/x-7z-compressed", ".7z"));
    }
    None
}

// ---------------------------------------------------------------------------
// MP4
// ---------------------------------------------------------------------------

fn is_mp4(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    let box_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if box_size > data.len() || box_size % 4 != 0 {
        return false;
    }
    if &data[4..8] != b"ftyp" {
        return false;
    }
    // Major brand
    if &data[8..11] == b"mp4" {
        return true;
    }
    // Compatible brands start after the minor version
    let mut offset = 16;
    while offset + 4 <= box_size {
        if &data[offset..offset + 3] == b"mp4" {
            return true;
        }
        offset += 4;
    }
    false
}

// ---------------------------------------------------------------------------
// WebM
// ---------------------------------------------------------------------------

const EBML_HEADER: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
const DOCTYPE_ID: [u8; 2] = [0x42, 0x82];
const WEBM_SCAN_LIMIT: usize = 38;

fn is_webm(data: &[u8]) -> bool {
    if !data.starts_with(&EBML_HEADER) {
        return false;
    }
    let mut pos = EBML_HEADER.len();
    while pos + 1 < data.len() && pos < WEBM_SCAN_LIMIT {
        if data[pos..pos + 2] == DOCTYPE_ID {
            pos += 2;
            let Some((value, size)) = parse_vint(&data[pos..]) else {
                return false;
            };
            pos += size;
            let end = pos.saturating_add(value as usize).min(data.len());
            return matches_padded(&data[pos.min(end)..end], b"webm");
        }
        pos += 1;
    }
    false
}

/// Parse an EBML variable-length integer. The position of the first set bit
/// in the first byte gives the total length (1-8 bytes); that marker bit is
/// not part of the value.
fn parse_vint(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    if first == 0 {
        return None;
    }
    let size = first.leading_zeros() as usize + 1;
    if data.len() < size {
        return None;
    }
    let mut value = u64::from(first) & (0xFFu64 >> size);
    for &b in &data[1..size] {
        value = (value << 8) | u64::from(b);
    }
    Some((value, size))
}

/// `needle` appears in `span` preceded only by zero bytes
fn matches_padded(span: &[u8], needle: &[u8]) -> bool {
    let start = span.iter().position(|&b| b != 0).unwrap_or(span.len());
    span[start..].starts_with(needle)
}

// ---------------------------------------------------------------------------
// MP3 without ID3
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
struct Mp3Frame {
    version: u8,
    layer: u8,
    bitrate_index: usize,
    sample_rate_index: usize,
    padding: bool,
}

const MPEG_VERSION_2_5: u8 = 0;
const MPEG_VERSION_2: u8 = 2;
const MPEG_VERSION_1: u8 = 3;

const LAYER_3: u8 = 1;
const LAYER_2: u8 = 2;
const LAYER_1: u8 = 3;

// kbit/s, index 0 ("free") and 15 (invalid) excluded by the header check
const BITRATES_V1_L1: [u32; 15] = [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
const BITRATES_V1_L2: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const BITRATES_V1_L3: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L1: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
const BITRATES_V2_L23: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

const SAMPLE_RATES_V1: [u32; 3] = [44100, 48000, 32000];
const SAMPLE_RATES_V2: [u32; 3] = [22050, 24000, 16000];
const SAMPLE_RATES_V2_5: [u32; 3] = [11025, 12000, 8000];

fn parse_mp3_header(data: &[u8]) -> Option<Mp3Frame> {
    if data.len() < 4 {
        return None;
    }
    if data[0] != 0xFF || data[1] & 0xE0 != 0xE0 {
        return None;
    }
    let version = (data[1] & 0x18) >> 3;
    if version == 1 {
        return None;
    }
    let layer = (data[1] & 0x06) >> 1;
    if layer == 0 {
        return None;
    }
    let bitrate_index = ((data[2] & 0xF0) >> 4) as usize;
    if bitrate_index == 0x0F || bitrate_index == 0 {
        return None;
    }
    let sample_rate_index = ((data[2] & 0x0C) >> 2) as usize;
    if sample_rate_index == 3 {
        return None;
    }
    // Only Layer III is an "mp3"
    let final_layer = 4 - layer;
    if final_layer != 3 {
        return None;
    }
    Some(Mp3Frame {
        version,
        layer,
        bitrate_index,
        sample_rate_index,
        padding: data[2] & 0x02 != 0,
    })
}

impl Mp3Frame {
    fn bitrate(&self) -> u32 {
        let table = match (self.version, self.layer) {
            (MPEG_VERSION_1, LAYER_1) => &BITRATES_V1_L1,
            (MPEG_VERSION_1, LAYER_2) => &BITRATES_V1_L2,
            (MPEG_VERSION_1, _) => &BITRATES_V1_L3,
            (_, LAYER_1) => &BITRATES_V2_L1,
            _ => &BITRATES_V2_L23,
        };
        table[self.bitrate_index] * 1000
    }

    fn sample_rate(&self) -> u32 {
        match self.version {
            MPEG_VERSION_1 => SAMPLE_RATES_V1[self.sample_rate_index],
            MPEG_VERSION_2 => SAMPLE_RATES_V2[self.sample_rate_index],
            MPEG_VERSION_2_5 => SAMPLE_RATES_V2_5[self.sample_rate_index],
            _ => SAMPLE_RATES_V1[self.sample_rate_index],
        }
    }

    /// Frame length in bytes, header included
    fn frame_len(&self) -> usize {
        let bitrate = self.bitrate() as usize;
        let freq = self.sample_rate() as usize;
        let padding = usize::from(self.padding);
        match self.layer {
            LAYER_1 => (12 * bitrate / freq + padding) * 4,
            LAYER_3 if self.version != MPEG_VERSION_1 => 72 * bitrate / freq + padding,
            _ => 144 * bitrate / freq + padding,
        }
    }
}

fn is_mp3_without_id3(data: &[u8]) -> bool {
    let Some(frame) = parse_mp3_header(data) else {
        return false;
    };
    let next = frame.frame_len();
    if next < 4 || next >= data.len() {
        return false;
    }
    parse_mp3_header(&data[next..]).is_some()
}

// ---------------------------------------------------------------------------
// HTML
// ---------------------------------------------------------------------------

const HTML_OPENERS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

fn is_html(data: &[u8]) -> bool {
    let start = data
        .iter()
        .position(|&b| !matches!(b, 0x09 | 0x0A | 0x0C | 0x0D | 0x20))
        .unwrap_or(data.len());
    let data = &data[start..];
    HTML_OPENERS.iter().any(|opener| {
        data.len() > opener.len()
            && data[..opener.len()].eq_ignore_ascii_case(opener)
            && matches!(data[opener.len()], b' ' | b'>')
    })
}

// ---------------------------------------------------------------------------
// Lookup tables
// ---------------------------------------------------------------------------

/// Mime type for a file extension (with or without the leading dot)
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let ext = ext.trim_start_matches('.').to_ascii_lowercase();
    let mime = match ext.as_str() {
        // Images
        "png" => "image/png",
        "jpg" | "jpeg" | "jfif" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" | "cur" => "image/x-icon",
        "bmp" => "image/bmp",
        "tiff" | "tif" => "image/tiff",
        // Audio
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "ogg" | "oga" => "audio/ogg",
        "opus" => "audio/opus",
        "wav" => "audio/wave",
        "flac" => "audio/flac",
        "aiff" | "aif" => "audio/aiff",
        "mid" | "midi" => "audio/midi",
        // Video
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "ogv" => "video/ogg",
        "avi" => "video/avi",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        // Text
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        // Documents and archives
        "pdf" => "application/pdf",
        "ps" => "application/postscript",
        "zip" => "application/zip",
        "gz" => "application/x-gzip",
        "rar" => "application/x-rar-compressed",
        "7z" => "application/x-7z-compressed",
        // Fonts
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "ttc" => "font/collection",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "eot" => "application/vnd.ms-fontobject",
        _ => return None,
    };
    Some(mime)
}

/// Mime type guessed from a path's extension
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    path.extension()
        .and_then(|e| e.to_str())
        .and_then(mime_for_extension)
}

/// Preferred extension (with dot) for a mime type; parameters are ignored
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    let ext = match essence.as_str() {
        "image/png" => ".png",
        "image/jpeg" | "image/jpg" | "image/pjpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/svg+xml" => ".svg",
        "image/x-icon" | "image/vnd.microsoft.icon" => ".ico",
        "image/bmp" | "image/x-bmp" => ".bmp",
        "image/tiff" => ".tiff",
        "audio/mpeg" | "audio/mp3" => ".mp3",
        "audio/mp4" => ".m4a",
        "audio/aac" => ".aac",
        "audio/ogg" | "application/ogg" => ".ogg",
        "audio/opus" => ".opus",
        "audio/wav" | "audio/wave" | "audio/x-wav" => ".wav",
        "audio/flac" => ".flac",
        "audio/aiff" | "audio/x-aiff" => ".aiff",
        "audio/midi" => ".mid",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "video/ogg" => ".ogv",
        "video/avi" | "video/x-msvideo" => ".avi",
        "video/quicktime" => ".mov",
        "text/plain" => ".txt",
        "text/html" => ".html",
        "text/css" => ".css",
        "text/csv" => ".csv",
        "text/javascript" | "application/javascript" => ".js",
        "application/json" => ".json",
        "application/xml" | "text/xml" => ".xml",
        "application/pdf" => ".pdf",
        "application/zip" => ".zip",
        "application/x-gzip" | "application/gzip" => ".gz",
        _ => return None,
    };
    Some(ext)
}
