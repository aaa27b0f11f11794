//! File name sanitization for extracted content
//!
//! Names come from untrusted places (descriptor entries, `data:` URI
//! parameters, the tail of a base64 payload) and end up as real files in the
//! temp directory, so they must be valid on every filesystem the host might
//! run on.

use regex::Regex;
use std::sync::LazyLock;

/// Longest file name most filesystems accept. Counted in UTF-8 bytes, which
/// is never less than the UTF-16 units NTFS counts.
pub const MAX_FILE_NAME_BYTES: usize = 255;

const FALLBACK_NAME: &str = "noname";

static RESERVED_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // DOS device names, with or without an extension
    Regex::new(r"(?i)^(CON|PRN|AUX|NUL|COM[1-9]|LPT[1-9])(\..*)?$")
        .expect("Failed to compile RESERVED_NAME_REGEX - this is a bug in the regex pattern")
});

/// Characters that are never allowed in a file name
pub fn is_forbidden_char(c: char) -> bool {
    matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control()
}

/// Make `name` usable as a single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let mut result: String = name
        .chars()
        .map(|c| if is_forbidden_char(c) { '-' } else { c })
        .collect();

    // Windows silently drops trailing dots and spaces
    let trimmed_len = result.trim_end_matches(['.', ' ']).len();
    result.truncate(trimmed_len);
    let result = result.trim_start().to_string();

    if result.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    let result = if RESERVED_NAME_REGEX.is_match(&result) {
        format!("_{result}")
    } else {
        result
    };

    fit_file_name(&result, MAX_FILE_NAME_BYTES)
}

/// Cut `name` down to at most `max_bytes` bytes on a character boundary,
/// preserving an extension shorter than half the budget.
pub fn fit_file_name(name: &str, max_bytes: usize) -> String {
    if name.len() <= max_bytes {
        return name.to_string();
    }
    let (stem, ext) = match split_extension(name) {
        (stem, ext) if ext.len() < max_bytes / 2 => (stem, ext),
        _ => (name, ""),
    };
    let budget = max_bytes - ext.len();
    let mut end = 0;
    for (i, c) in stem.char_indices() {
        if i + c.len_utf8() > budget {
            break;
        }
        end = i + c.len_utf8();
    }
    format!("{}{ext}", &stem[..end])
}

/// Split a name hint into base and extension (extension includes the dot).
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}
