//! Extraction pipeline
//!
//! Turns whatever a drag source offers into real files. Strategies run in a
//! fixed order and the first one that produces at least one entry wins:
//!
//! 1. `data:` URI text
//! 2. registered "PNG"
//! 3. registered "JPEG"
//! 4. file group descriptor plus per-item `FileContents`
//! 5. `CF_HDROP` file list
//! 6. `CF_DIB`, converted to a `.bmp`
//! 7. plain text, saved as a `.txt`
//!
//! A `data:` URI can't be a false positive, so it goes first. A DIB header is
//! easy to satisfy by accident, and any text is acceptable to strategy 7, so
//! those come last.
//!
//! A strategy that fails before appending anything is skipped silently. One
//! that fails after appending is rolled back (its temporary files deleted)
//! and the error ends the whole extraction.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::carrier::{parse_drop_files, parse_file_group_descriptor, ClipFormat, DataCarrier};
use crate::config::DropConfig;
use crate::data_uri::DataUri;
use crate::encoding;
use crate::error::{DropError, Result};
use crate::file_list::{FileEntry, FileList};
use crate::sniff;
use crate::temp_files::TempFileManager;
use crate::transfer::TransferSource;

/// Bytes read from the front of a payload for sniffing
const SNIFF_LEN: usize = 512;

#[derive(Clone, Copy, Debug)]
enum Strategy {
    DataUri,
    Png,
    Jpeg,
    FileDescriptor,
    FileDrop,
    Dib,
    Text,
}

const STRATEGIES: [Strategy; 7] = [
    Strategy::DataUri,
    Strategy::Png,
    Strategy::Jpeg,
    Strategy::FileDescriptor,
    Strategy::FileDrop,
    Strategy::Dib,
    Strategy::Text,
];

pub struct ExtractionPipeline<'a> {
    temp: &'a TempFileManager,
    config: &'a DropConfig,
}

impl<'a> ExtractionPipeline<'a> {
    pub fn new(temp: &'a TempFileManager, config: &'a DropConfig) -> Self {
        Self { temp, config }
    }

    /// Run the strategies against `carrier`. `NotFound` when none of them
    /// produced anything.
    pub fn extract(&self, carrier: &dyn DataCarrier) -> Result<FileList> {
        for strategy in STRATEGIES {
            let mut list = FileList::new();
            match self.run(strategy, carrier, &mut list) {
                Ok(()) if !list.is_empty() => {
                    log::debug!("[Extract] {:?} produced {} file(s)", strategy, list.len());
                    return Ok(list);
                }
                Ok(()) => {}
                Err(e) if list.is_empty() => {
                    if e.is_recoverable() {
                        log::debug!("[Extract] {:?} skipped: {}", strategy, e);
                    } else {
                        log::warn!("[Extract] {:?} failed, trying the next strategy: {}", strategy, e);
                    }
                }
                Err(e) => {
                    let removed = list.delete_temporary();
                    log::warn!("[Extract] {:?} failed part way, rolled back {} file(s): {}", strategy, removed, e);
                    return Err(e);
                }
            }
        }
        log::debug!("[Extract] nothing usable on offer");
        Err(DropError::NotFound)
    }

    fn run(&self, strategy: Strategy, carrier: &dyn DataCarrier, list: &mut FileList) -> Result<()> {
        match strategy {
            Strategy::DataUri => self.extract_data_uri(carrier, list),
            Strategy::Png => self.extract_png(carrier, list),
            Strategy::Jpeg => self.extract_jpeg(carrier, list),
            Strategy::FileDescriptor => self.extract_file_descriptors(carrier, list),
            Strategy::FileDrop => self.extract_file_drop(carrier, list),
            Strategy::Dib => self.extract_dib(carrier, list),
            Strategy::Text => self.extract_text(carrier, list),
        }
    }

    fn extract_data_uri(&self, carrier: &dyn DataCarrier, list: &mut FileList) -> Result<()> {
        let text = read_text(carrier).ok_or(DropError::NotFound)?;
        let mut uri = DataUri::parse(text.trim())?;
        uri.decode()?;
        let name = uri.suggest_filename()?;
        let declared = uri.mime_essence().to_string();
        let bytes = uri.into_bytes()?;

        let sniffed = sniff::sniff(&bytes);
        let mime = if sniffed.is_unknown() { declared } else { sniffed.mime.to_string() };
        self.write_bytes(list, &name, &bytes, Some(mime))
    }

    fn extract_png(&self, carrier: &dyn DataCarrier, list: &mut FileList) -> Result<()> {
        self.extract_image(carrier, list, &ClipFormat::Png, "image/png", &self.config.png_file_name)
    }

    fn extract_jpeg(&self, carrier: &dyn DataCarrier, list: &mut FileList) -> Result<()> {
        self.extract_image(carrier, list, &ClipFormat::Jpeg, "image/jpeg", &self.config.jpeg_file_name)
    }

    fn extract_image(
        &self,
        carrier: &dyn DataCarrier,
        list: &mut FileList,
        format: &ClipFormat,
        expected: &str,
        name: &str,
    ) -> Result<()> {
        let mut src = carrier.get(format, None).ok_or(DropError::NotFound)?;
        let bytes = src.read_all()?;
        let sniffed = sniff::sniff(&bytes);
        if sniffed.mime != expected {
            return Err(DropError::MalformedPayload(format!(
                "{format:?} payload sniffs as {}",
                sniffed.mime
            )));
        }
        self.write_bytes(list, name, &bytes, Some(sniffed.mime.to_string()))
    }

    fn extract_file_descriptors(&self, carrier: &dyn DataCarrier, list: &mut FileList) -> Result<()> {
        let mut src = carrier
            .get(&ClipFormat::FileGroupDescriptor, None)
            .ok_or(DropError::NotFound)?;
        let descriptors = parse_file_group_descriptor(&src.read_all()?)?;

        for (index, descriptor) in descriptors.iter().enumerate() {
            if descriptor.is_directory {
                log::debug!("[Extract] skipping directory entry {:?}", descriptor.name);
                continue;
            }
            let mut contents = carrier
                .get(&ClipFormat::FileContents, Some(index as u32))
                .ok_or_else(|| DropError::MalformedPayload(format!("no contents for item {index}")))?;

            // Descriptor names may carry a relative path
            let name = descriptor
                .name
                .rsplit(&['\\', '/'][..])
                .next()
                .unwrap_or(&descriptor.name);
            let head = contents.read(0, SNIFF_LEN)?;
            let mime = mime_for(&head, Path::new(name));
            let written = self.write_with(list, name, mime, |file| contents.copy_to(file))?;
            if let Some(declared) = descriptor.size.filter(|&size| size != written) {
                log::debug!("[Extract] {:?}: declared {} bytes, got {}", name, declared, written);
            }
        }
        Ok(())
    }

    fn extract_file_drop(&self, carrier: &dyn DataCarrier, list: &mut FileList) -> Result<()> {
        let mut src = carrier.get(&ClipFormat::FileDrop, None).ok_or(DropError::NotFound)?;
        for path in parse_drop_files(&src.read_all()?)? {
            // Unreadable files still go through, typed by extension only
            let head = TransferSource::File(path.clone())
                .read(0, SNIFF_LEN)
                .unwrap_or_default();
            let mime = mime_for(&head, &path);
            list.push(FileEntry::external(path, mime));
        }
        Ok(())
    }

    fn extract_dib(&self, carrier: &dyn DataCarrier, list: &mut FileList) -> Result<()> {
        let mut src = carrier.get(&ClipFormat::Dib, None).ok_or(DropError::NotFound)?;
        let bmp = dib_to_bmp(&src.read_all()?)?;
        self.write_bytes(list, &self.config.bitmap_file_name, &bmp, Some("image/bmp".to_string()))
    }

    fn extract_text(&self, carrier: &dyn DataCarrier, list: &mut FileList) -> Result<()> {
        let text = read_text(carrier).ok_or(DropError::NotFound)?;
        if text.is_empty() {
            return Err(DropError::NotFound);
        }
        self.write_bytes(list, &self.config.text_file_name, text.as_bytes(), Some("text/plain".to_string()))
    }

    fn write_bytes(&self, list: &mut FileList, name: &str, bytes: &[u8], mime: Option<String>) -> Result<()> {
        self.write_with(list, name, mime, |file| {
            file.write_all(bytes)?;
            Ok(bytes.len() as u64)
        })
        .map(|_| ())
    }

    /// Create a unique temp file, fill it with `fill`, and append it. A file
    /// that could not be filled is removed again and never appended.
    fn write_with(
        &self,
        list: &mut FileList,
        name: &str,
        mime: Option<String>,
        fill: impl FnOnce(&mut File) -> Result<u64>,
    ) -> Result<u64> {
        let (path, mut file) = self.temp.create_unique_file(name)?;
        let written = fill(&mut file).and_then(|n| {
            file.flush()?;
            Ok(n)
        });
        drop(file);
        match written {
            Ok(n) => {
                list.push(FileEntry::temporary(path, mime));
                Ok(n)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&path) {
                    log::warn!("[Extract] could not delete {}: {}", path.display(), rm);
                }
                Err(e)
            }
        }
    }
}

/// Clipboard text, preferring the Unicode format
fn read_text(carrier: &dyn DataCarrier) -> Option<String> {
    if let Some(mut src) = carrier.get(&ClipFormat::UnicodeText, None) {
        return src.read_all().ok().map(|b| encoding::decode_unicode_text(&b));
    }
    let mut src = carrier.get(&ClipFormat::Text, None)?;
    src.read_all().ok().map(|b| encoding::decode_text(&b))
}

/// Sniffed type of `head`, falling back to the extension of `name`
fn mime_for(head: &[u8], name: &Path) -> Option<String> {
    let sniffed = sniff::sniff(head);
    if !sniffed.is_unknown() {
        return Some(sniffed.mime.to_string());
    }
    sniff::mime_for_path(name).map(str::to_string)
}

// ---------------------------------------------------------------------------
// DIB -> BMP
// ---------------------------------------------------------------------------

const BITMAPFILEHEADER_LEN: usize = 14;
const BITMAPCOREHEADER_LEN: usize = 12;
const BITMAPINFOHEADER_LEN: usize = 40;
const BI_BITFIELDS: u32 = 3;

/// Validate a packed DIB and prepend a `BITMAPFILEHEADER`.
pub fn dib_to_bmp(dib: &[u8]) -> Result<Vec<u8>> {
    let malformed = |what: &str| DropError::MalformedPayload(format!("DIB: {what}"));
    let u16_at = |o: usize| dib.get(o..o + 2).map(|b| u16::from_le_bytes([b[0], b[1]]));
    let u32_at = |o: usize| dib.get(o..o + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));

    let header_len = u32_at(0).ok_or_else(|| malformed("truncated header"))? as usize;
    let (width, height, planes, bit_count, palette_entries, entry_len, masks_len) = if header_len == BITMAPCOREHEADER_LEN {
        let width = i64::from(u16_at(4).ok_or_else(|| malformed("truncated header"))?);
        let height = i64::from(u16_at(6).ok_or_else(|| malformed("truncated header"))?);
        let planes = u16_at(8).ok_or_else(|| malformed("truncated header"))?;
        let bit_count = u16_at(10).ok_or_else(|| malformed("truncated header"))?;
        let palette = if bit_count <= 8 { 1usize << bit_count } else { 0 };
        (width, height, planes, bit_count, palette, 3usize, 0usize)
    } else if header_len >= BITMAPINFOHEADER_LEN && header_len <= dib.len() {
        let i32_at = |o: usize| u32_at(o).map(|v| i64::from(v as i32));
        let width = i32_at(4).ok_or_else(|| malformed("truncated header"))?;
        let height = i32_at(8).ok_or_else(|| malformed("truncated header"))?;
        let planes = u16_at(12).ok_or_else(|| malformed("truncated header"))?;
        let bit_count = u16_at(14).ok_or_else(|| malformed("truncated header"))?;
        let compression = u32_at(16).ok_or_else(|| malformed("truncated header"))?;
        let colors_used = u32_at(32).ok_or_else(|| malformed("truncated header"))? as usize;
        let palette = match (colors_used, bit_count) {
            (0, 1..=8) => 1usize << bit_count,
            (n, _) => n,
        };
        // V4/V5 headers carry their masks inline
        let masks = if compression == BI_BITFIELDS && header_len == BITMAPINFOHEADER_LEN { 12 } else { 0 };
        (width, height, planes, bit_count, palette, 4usize, masks)
    } else {
        return Err(malformed("unknown header size"));
    };

    if width == 0 || height == 0 {
        return Err(malformed("zero dimension"));
    }
    if planes != 1 {
        return Err(malformed("plane count is not 1"));
    }
    if !matches!(bit_count, 1 | 4 | 8 | 16 | 24 | 32) {
        return Err(malformed("unsupported bit count"));
    }
    let pixel_offset = palette_entries
        .checked_mul(entry_len)
        .and_then(|p| p.checked_add(header_len + masks_len))
        .filter(|&end| end <= dib.len())
        .ok_or_else(|| malformed("palette exceeds buffer"))?;

    let file_len = u32::try_from(BITMAPFILEHEADER_LEN + dib.len()).map_err(|_| malformed("too large"))?;
    let mut bmp = Vec::with_capacity(BITMAPFILEHEADER_LEN + dib.len());
    bmp.extend_from_slice(b"BM");
    bmp.extend_from_slice(&file_len.to_le_bytes());
    bmp.extend_from_slice(&[0; 4]);
    bmp.extend_from_slice(&((BITMAPFILEHEADER_LEN + pixel_offset) as u32).to_le_bytes());
    bmp.extend_from_slice(dib);
    Ok(bmp)
}
