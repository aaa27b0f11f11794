//! `data:` URI parsing and decoding
//!
//! Browsers hand out dragged images and snippets as `data:` URIs in the text
//! formats. Parsing only borrows the encoded payload from the input; the
//! bytes are produced by a separate [`DataUri::decode`] step. Operations that
//! need the decoded bytes fail until that step ran.
//!
//! Besides the standard `base64` and `charset=` parameters, a non-standard
//! `filename=` parameter (percent-encoded) is honoured; some drag sources use
//! it to carry the original file name.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{DropError, Result};
use crate::sanitize;
use crate::sniff;

const PREFIX: &str = "data:";
const DEFAULT_MIME: &str = "text/plain";
const DEFAULT_CHARSET: &str = "US-ASCII";
const NAME_TAIL_CHARS: usize = 24;
const NO_NAME: &str = "noname.bin";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadEncoding {
    Percent,
    Base64,
}

/// Payload state: borrowed after parse, owned after decode
#[derive(Debug)]
enum Payload<'a> {
    Parsed(&'a str),
    Decoded { encoded: &'a str, bytes: Vec<u8> },
}

#[derive(Debug)]
pub struct DataUri<'a> {
    mime: String,
    /// Only set when the URI spelled it out
    charset: Option<String>,
    encoding: PayloadEncoding,
    filename: Option<String>,
    payload: Payload<'a>,
}

impl<'a> DataUri<'a> {
    /// Split a `data:` URI into its parameters and the encoded payload.
    pub fn parse(text: &'a str) -> Result<Self> {
        let rest = text.strip_prefix(PREFIX).ok_or(DropError::NotAStructuredURI)?;
        let (header, encoded) = rest.split_once(',').ok_or(DropError::NotAStructuredURI)?;

        let mut mime: Option<String> = None;
        let mut charset = None;
        let mut encoding = PayloadEncoding::Percent;
        let mut filename = None;

        for param in header.split(';') {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            if param.eq_ignore_ascii_case("base64") {
                encoding = PayloadEncoding::Base64;
            } else if let Some(value) = strip_prefix_ignore_case(param, "charset=") {
                charset = Some(value.to_string());
            } else if let Some(value) = strip_prefix_ignore_case(param, "filename=") {
                let decoded = urlencoding::decode(value)
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| value.to_string());
                if !decoded.is_empty() {
                    filename = Some(decoded);
                }
            } else if mime.is_none() {
                mime = Some(param.to_ascii_lowercase());
            }
        }

        Ok(Self {
            mime: mime.unwrap_or_else(|| DEFAULT_MIME.to_string()),
            charset,
            encoding,
            filename,
            payload: Payload::Parsed(encoded),
        })
    }

    /// Decode the payload. Fails closed on any invalid character.
    pub fn decode(&mut self) -> Result<()> {
        let encoded = self.encoded();
        let bytes = match self.encoding {
            PayloadEncoding::Base64 => STANDARD
                .decode(encoded)
                .map_err(|e| DropError::MalformedPayload(format!("base64: {e}")))?,
            PayloadEncoding::Percent => percent_decode(encoded)?,
        };
        self.payload = Payload::Decoded { encoded, bytes };
        Ok(())
    }

    pub fn mime_essence(&self) -> &str {
        &self.mime
    }

    /// Effective charset: the explicit one, or US-ASCII for text types
    pub fn charset(&self) -> Option<&str> {
        match &self.charset {
            Some(c) => Some(c),
            None if self.mime.starts_with("text/") => Some(DEFAULT_CHARSET),
            None => None,
        }
    }

    pub fn encoding(&self) -> PayloadEncoding {
        self.encoding
    }

    pub fn embedded_filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// The still-encoded payload, borrowed from the input
    pub fn encoded(&self) -> &'a str {
        match self.payload {
            Payload::Parsed(encoded) => encoded,
            Payload::Decoded { encoded, .. } => encoded,
        }
    }

    pub fn decoded(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Parsed(_) => None,
            Payload::Decoded { bytes, .. } => Some(bytes),
        }
    }

    /// Consume the URI, keeping only the decoded bytes
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self.payload {
            Payload::Decoded { bytes, .. } => Ok(bytes),
            Payload::Parsed(_) => Err(not_decoded()),
        }
    }

    /// Mime type, with `; charset=...` when the URI recorded one
    pub fn mime(&self) -> String {
        match &self.charset {
            Some(charset) => format!("{}; charset={}", self.mime, charset),
            None => self.mime.clone(),
        }
    }

    /// A file name for the payload: the embedded name if present, otherwise
    /// the tail of the encoded payload plus an extension guessed from the
    /// mime type or the decoded content.
    pub fn suggest_filename(&self) -> Result<String> {
        let bytes = self.decoded().ok_or_else(not_decoded)?;

        if let Some(name) = &self.filename {
            return Ok(sanitize::sanitize_file_name(name));
        }

        let encoded = self.encoded();
        let skip = encoded.chars().count().saturating_sub(NAME_TAIL_CHARS);
        let tail: String = encoded
            .chars()
            .skip(skip)
            .map(|c| if sanitize::is_forbidden_char(c) { '-' } else { c })
            .collect();
        if tail.is_empty() {
            return Ok(NO_NAME.to_string());
        }

        let ext = sniff::extension_for_mime(&self.mime).unwrap_or_else(|| sniff::sniff(bytes).extension);
        Ok(format!("{tail}{ext}"))
    }
}

fn not_decoded() -> DropError {
    DropError::InvalidArgument("data: URI payload has not been decoded".to_string())
}

fn strip_prefix_ignore_case<'s>(s: &'s str, prefix: &str) -> Option<&'s str> {
    if s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Strict percent-decoding: every `%` must start a `%XX` triplet.
pub fn percent_decode(input: &str) -> Result<Vec<u8>> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).copied().and_then(hex_value);
            let lo = bytes.get(i + 2).copied().and_then(hex_value);
            match (hi, lo) {
                (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
                _ => {
                    return Err(DropError::MalformedPayload(format!(
                        "bad percent escape at offset {i}"
                    )))
                }
            }
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_base64_text() {
        let mut uri = DataUri::parse("data:text/plain;base64,SGVsbG8=").unwrap();
        assert_eq!(uri.encoding(), PayloadEncoding::Base64);
        assert_eq!(uri.mime(), "text/plain");
        assert_eq!(uri.charset(), Some("US-ASCII"));
        assert!(uri.decoded().is_none());
        uri.decode().unwrap();
        assert_eq!(uri.decoded(), Some(&b"Hello"[..]));
    }

    #[test]
    fn test_defaults_and_params() {
        let uri = DataUri::parse("data:,A%20B").unwrap();
        assert_eq!(uri.mime(), "text/plain");
        assert_eq!(uri.encoding(), PayloadEncoding::Percent);

        let uri = DataUri::parse("data:image/svg+xml;charset=utf-8;filename=my%20pic.svg,%3Csvg%3E").unwrap();
        assert_eq!(uri.mime(), "image/svg+xml; charset=utf-8");
        assert_eq!(uri.embedded_filename(), Some("my pic.svg"));
        assert_eq!(uri.encoded(), "%3Csvg%3E");

        let uri = DataUri::parse("data:application/octet-stream;base64,AAAA").unwrap();
        assert_eq!(uri.charset(), None);
    }

    #[test]
    fn test_not_a_data_uri() {
        assert!(matches!(DataUri::parse("https://example.com"), Err(DropError::NotAStructuredURI)));
        assert!(matches!(DataUri::parse("data:text/plain"), Err(DropError::NotAStructuredURI)));
    }

    #[test]
    fn test_malformed_payloads() {
        let mut uri = DataUri::parse("data:;base64,SGVs*G8=").unwrap();
        assert!(matches!(uri.decode(), Err(DropError::MalformedPayload(_))));
        let mut uri = DataUri::parse("data:;base64,SGVsbG8===").unwrap();
        assert!(uri.decode().is_err());
        let mut uri = DataUri::parse("data:,100%").unwrap();
        assert!(matches!(uri.decode(), Err(DropError::MalformedPayload(_))));
        let mut uri = DataUri::parse("data:,%zz").unwrap();
        assert!(uri.decode().is_err());
    }

    #[test]
    fn test_round_trip() {
        let payloads: [&[u8]; 4] = [b"", b"Hello", &[0, 255, 37, 10, 13], "日本語 text/with,commas".as_bytes()];
        for payload in payloads {
            let b64 = format!("data:;base64,{}", STANDARD.encode(payload));
            let mut uri = DataUri::parse(&b64).unwrap();
            uri.decode().unwrap();
            assert_eq!(uri.decoded(), Some(payload));

            let pct = format!("data:,{}", urlencoding::encode_binary(payload));
            let mut uri = DataUri::parse(&pct).unwrap();
            uri.decode().unwrap();
            assert_eq!(uri.decoded(), Some(payload));
        }
    }

    #[test]
    fn test_suggest_filename() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];
        let text = format!("data:image/png;base64,{}", STANDARD.encode(png));
        let mut uri = DataUri::parse(&text).unwrap();
        assert!(uri.suggest_filename().is_err());
        uri.decode().unwrap();
        let name = uri.suggest_filename().unwrap();
        assert!(name.ends_with(".png"), "{name}");
        assert!(!name.contains('/'));

        // Unknown mime falls back to sniffing the decoded bytes
        let text = format!("data:application/x-thing;base64,{}", STANDARD.encode(png));
        let mut uri = DataUri::parse(&text).unwrap();
        uri.decode().unwrap();
        assert!(uri.suggest_filename().unwrap().ends_with(".png"));

        let mut uri = DataUri::parse("data:;filename=a%2Fb.txt,hi").unwrap();
        uri.decode().unwrap();
        assert_eq!(uri.suggest_filename().unwrap(), "a-b.txt");

        let mut uri = DataUri::parse("data:application/x-thing,").unwrap();
        uri.decode().unwrap();
        assert_eq!(uri.suggest_filename().unwrap(), "noname.bin");
    }

    #[test]
    fn test_suggest_filename_uses_tail() {
        let mut uri = DataUri::parse("data:text/plain,0123456789abcdefghijklmnopqrstuvwxyz").unwrap();
        uri.decode().unwrap();
        assert_eq!(uri.suggest_filename().unwrap(), "cdefghijklmnopqrstuvwxyz.txt");
    }
}
