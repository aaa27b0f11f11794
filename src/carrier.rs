//! Data carriers
//!
//! A data carrier is the drag source's format-negotiated payload object. The
//! pipeline asks it for a [`ClipFormat`] (optionally one item of a
//! multi-item format such as `FileContents`) and gets a [`TransferSource`]
//! back. On Windows the carrier wraps an `IDataObject`; [`MemoryCarrier`]
//! serves canned payloads for injected drops and tests, and
//! [`ReplacementCarrier`] is what the host receives in place of the
//! original.
//!
//! Also holds the two binary layouts the pipeline reads and writes:
//! `DROPFILES` (file path lists) and `FILEGROUPDESCRIPTORW` (virtual files).

use std::any::Any;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::encoding;
use crate::error::{DropError, Result};
use crate::transfer::TransferSource;

/// Clipboard formats the pipeline understands
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClipFormat {
    /// `CF_UNICODETEXT`
    UnicodeText,
    /// `CF_TEXT`, code-page text of unknown encoding
    Text,
    /// `CF_HDROP`
    FileDrop,
    /// `CF_DIB`
    Dib,
    /// Registered "PNG"
    Png,
    /// Registered "JPEG"
    Jpeg,
    /// `CFSTR_FILEDESCRIPTORW`
    FileGroupDescriptor,
    /// `CFSTR_FILECONTENTS`, one item per descriptor entry
    FileContents,
    Custom(String),
}

impl ClipFormat {
    /// Registered clipboard format name, for formats that have one
    pub fn registered_name(&self) -> Option<&str> {
        match self {
            ClipFormat::Png => Some("PNG"),
            ClipFormat::Jpeg => Some("JPEG"),
            ClipFormat::FileGroupDescriptor => Some("FileGroupDescriptorW"),
            ClipFormat::FileContents => Some("FileContents"),
            ClipFormat::Custom(name) => Some(name),
            _ => None,
        }
    }
}

/// Per-drop flags a carrier can report through the capability query
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DropFlags {
    /// Run the `convert` hook on this drop
    pub convert: bool,
    /// The drop was injected programmatically, not dragged by a user
    pub from_external_api: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapabilityKind {
    DropFlags,
}

/// Secondary interfaces obtainable from a carrier
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Capability {
    DropFlags(DropFlags),
}

pub trait DataCarrier: Send + Sync {
    /// Formats on offer, best first
    fn formats(&self) -> Vec<ClipFormat>;

    /// Fetch one format. `index` selects the item of multi-item formats.
    fn get(&self, format: &ClipFormat, index: Option<u32>) -> Option<TransferSource>;

    fn has_format(&self, format: &ClipFormat) -> bool {
        self.formats().contains(format)
    }

    fn query(&self, _kind: CapabilityKind) -> Option<Capability> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a carrier; the session holds one per prepared drag
pub type Carrier = Arc<dyn DataCarrier>;

/// Drop flags of a carrier, defaulting to none
pub fn drop_flags(carrier: &dyn DataCarrier) -> DropFlags {
    match carrier.query(CapabilityKind::DropFlags) {
        Some(Capability::DropFlags(flags)) => flags,
        None => DropFlags::default(),
    }
}

// ---------------------------------------------------------------------------
// MemoryCarrier
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum Offer {
    Memory(Vec<u8>),
    File(PathBuf),
    Stream(Vec<u8>),
}

/// A carrier with canned content
#[derive(Debug, Default)]
pub struct MemoryCarrier {
    order: Vec<ClipFormat>,
    offers: HashMap<(ClipFormat, Option<u32>), Offer>,
    flags: Option<DropFlags>,
}

impl MemoryCarrier {
    pub fn new() -> Self {
        Self::default()
    }

    fn offer(mut self, format: ClipFormat, index: Option<u32>, offer: Offer) -> Self {
        if !self.order.contains(&format) {
            self.order.push(format.clone());
        }
        self.offers.insert((format, index), offer);
        self
    }

    /// Offer `bytes` as a memory block
    pub fn with_bytes(self, format: ClipFormat, bytes: impl Into<Vec<u8>>) -> Self {
        self.offer(format, None, Offer::Memory(bytes.into()))
    }

    /// Offer `bytes` as item `index` of a multi-item format, via a stream
    pub fn with_item_stream(self, format: ClipFormat, index: u32, bytes: impl Into<Vec<u8>>) -> Self {
        self.offer(format, Some(index), Offer::Stream(bytes.into()))
    }

    /// Offer an existing file as item `index` of a multi-item format
    pub fn with_item_file(self, format: ClipFormat, index: u32, path: impl Into<PathBuf>) -> Self {
        self.offer(format, Some(index), Offer::File(path.into()))
    }

    /// Offer `text` as `CF_UNICODETEXT`
    pub fn with_text(self, text: &str) -> Self {
        self.with_bytes(ClipFormat::UnicodeText, encoding::encode_utf16le_nul(text))
    }

    /// Offer `paths` as `CF_HDROP`
    pub fn with_paths<P: AsRef<Path>>(self, paths: &[P]) -> Self {
        self.with_bytes(ClipFormat::FileDrop, build_drop_files(paths))
    }

    pub fn with_flags(mut self, flags: DropFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn into_carrier(self) -> Carrier {
        Arc::new(self)
    }
}

impl DataCarrier for MemoryCarrier {
    fn formats(&self) -> Vec<ClipFormat> {
        self.order.clone()
    }

    fn get(&self, format: &ClipFormat, index: Option<u32>) -> Option<TransferSource> {
        let offer = self
            .offers
            .get(&(format.clone(), index))
            .or_else(|| self.offers.get(&(format.clone(), None)))?;
        Some(match offer {
            Offer::Memory(bytes) => TransferSource::Memory(bytes.clone()),
            Offer::File(path) => TransferSource::File(path.clone()),
            Offer::Stream(bytes) => TransferSource::Stream {
                size: bytes.len() as u64,
                stream: Box::new(Cursor::new(bytes.clone())),
            },
        })
    }

    fn query(&self, kind: CapabilityKind) -> Option<Capability> {
        match kind {
            CapabilityKind::DropFlags => self.flags.map(Capability::DropFlags),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// ReplacementCarrier
// ---------------------------------------------------------------------------

/// The carrier handed to the host: nothing but a file path list.
///
/// Paths can be swapped while the host holds the carrier (a placeholder is
/// replaced by the real file once it becomes accessible), so they live
/// behind their own lock.
#[derive(Debug)]
pub struct ReplacementCarrier {
    paths: Mutex<Vec<PathBuf>>,
    flags: DropFlags,
}

impl ReplacementCarrier {
    pub fn new(paths: Vec<PathBuf>, flags: DropFlags) -> Self {
        Self {
            paths: Mutex::new(paths),
            flags,
        }
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn set_paths(&self, paths: Vec<PathBuf>) {
        if let Ok(mut current) = self.paths.lock() {
            *current = paths;
        }
    }

    pub fn flags(&self) -> DropFlags {
        self.flags
    }

    /// `DROPFILES` block for the current paths
    pub fn drop_files(&self) -> Vec<u8> {
        build_drop_files(&self.paths())
    }
}

impl DataCarrier for ReplacementCarrier {
    fn formats(&self) -> Vec<ClipFormat> {
        vec![ClipFormat::FileDrop]
    }

    fn get(&self, format: &ClipFormat, _index: Option<u32>) -> Option<TransferSource> {
        (*format == ClipFormat::FileDrop).then(|| TransferSource::Memory(self.drop_files()))
    }

    fn query(&self, kind: CapabilityKind) -> Option<Capability> {
        match kind {
            CapabilityKind::DropFlags => Some(Capability::DropFlags(self.flags)),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// DROPFILES
// ---------------------------------------------------------------------------

const DROPFILES_HEADER_LEN: usize = 20;

/// Parse a `DROPFILES` block (the content of `CF_HDROP`).
pub fn parse_drop_files(data: &[u8]) -> Result<Vec<PathBuf>> {
    if data.len() < DROPFILES_HEADER_LEN {
        return Err(DropError::MalformedPayload("DROPFILES header truncated".into()));
    }
    let offset = read_u32_le(data, 0) as usize;
    let wide = read_u32_le(data, 16) != 0;
    if offset < DROPFILES_HEADER_LEN || offset > data.len() {
        return Err(DropError::MalformedPayload(format!("DROPFILES offset {offset} out of range")));
    }
    let list = &data[offset..];

    let names: Vec<String> = if wide {
        let units: Vec<u16> = list
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        units
            .split(|&u| u == 0)
            .take_while(|name| !name.is_empty())
            .map(String::from_utf16_lossy)
            .collect()
    } else {
        list.split(|&b| b == 0)
            .take_while(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect()
    };
    Ok(names.into_iter().map(PathBuf::from).collect())
}

/// Build a wide `DROPFILES` block listing `paths`.
pub fn build_drop_files<P: AsRef<Path>>(paths: &[P]) -> Vec<u8> {
    let mut data = Vec::with_capacity(DROPFILES_HEADER_LEN + paths.len() * 64);
    data.extend_from_slice(&(DROPFILES_HEADER_LEN as u32).to_le_bytes());
    data.extend_from_slice(&0i32.to_le_bytes()); // pt.x
    data.extend_from_slice(&0i32.to_le_bytes()); // pt.y
    data.extend_from_slice(&0u32.to_le_bytes()); // fNC
    data.extend_from_slice(&1u32.to_le_bytes()); // fWide
    for path in paths {
        let path = path.as_ref().to_string_lossy();
        data.extend(encoding::encode_utf16le_nul(&path));
    }
    data.extend_from_slice(&[0, 0]);
    data
}

// ---------------------------------------------------------------------------
// FILEGROUPDESCRIPTORW
// ---------------------------------------------------------------------------

pub const FILE_DESCRIPTOR_LEN: usize = 592;
const FD_ATTRIBUTES: u32 = 0x0000_0004;
const FD_FILESIZE: u32 = 0x0000_0040;
const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
const MAX_PATH: usize = 260;

// Field offsets inside one FILEDESCRIPTORW
const OFF_FLAGS: usize = 0;
const OFF_ATTRIBUTES: usize = 36;
const OFF_SIZE_HIGH: usize = 64;
const OFF_SIZE_LOW: usize = 68;
const OFF_NAME: usize = 72;

/// One entry of a file-group descriptor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    pub is_directory: bool,
    /// Declared size, when the source filled it in
    pub size: Option<u64>,
}

/// Parse `FILEGROUPDESCRIPTORW`. The declared item count must fit in the
/// data actually transferred.
pub fn parse_file_group_descriptor(data: &[u8]) -> Result<Vec<FileDescriptor>> {
    if data.len() < 4 {
        return Err(DropError::MalformedPayload("file group descriptor truncated".into()));
    }
    let count = read_u32_le(data, 0) as usize;
    let declared = count
        .checked_mul(FILE_DESCRIPTOR_LEN)
        .and_then(|n| n.checked_add(4))
        .ok_or_else(|| DropError::MalformedPayload("descriptor count overflows".into()))?;
    if declared > data.len() {
        return Err(DropError::MalformedPayload(format!(
            "descriptor declares {count} items ({declared} bytes) but only {} bytes were transferred",
            data.len()
        )));
    }

    let descriptors = data[4..declared]
        .chunks_exact(FILE_DESCRIPTOR_LEN)
        .map(|fd| {
            let flags = read_u32_le(fd, OFF_FLAGS);
            let attributes = read_u32_le(fd, OFF_ATTRIBUTES);
            let is_directory = flags & FD_ATTRIBUTES != 0 && attributes & FILE_ATTRIBUTE_DIRECTORY != 0;
            let size = (flags & FD_FILESIZE != 0).then(|| {
                (u64::from(read_u32_le(fd, OFF_SIZE_HIGH)) << 32) | u64::from(read_u32_le(fd, OFF_SIZE_LOW))
            });
            let name = encoding::decode_unicode_text(&fd[OFF_NAME..OFF_NAME + MAX_PATH * 2]);
            FileDescriptor { name, is_directory, size }
        })
        .collect();
    Ok(descriptors)
}

#[cfg(test)]
pub(crate) fn build_file_group_descriptor(items: &[FileDescriptor]) -> Vec<u8> {
    let mut data = (items.len() as u32).to_le_bytes().to_vec();
    for item in items {
        let mut fd = vec![0u8; FILE_DESCRIPTOR_LEN];
        let mut flags = FD_ATTRIBUTES;
        if item.is_directory {
            fd[OFF_ATTRIBUTES..OFF_ATTRIBUTES + 4].copy_from_slice(&FILE_ATTRIBUTE_DIRECTORY.to_le_bytes());
        }
        if let Some(size) = item.size {
            flags |= FD_FILESIZE;
            fd[OFF_SIZE_HIGH..OFF_SIZE_HIGH + 4].copy_from_slice(&((size >> 32) as u32).to_le_bytes());
            fd[OFF_SIZE_LOW..OFF_SIZE_LOW + 4].copy_from_slice(&(size as u32).to_le_bytes());
        }
        fd[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&flags.to_le_bytes());
        let name = encoding::encode_utf16le_nul(&item.name);
        let len = name.len().min(MAX_PATH * 2);
        fd[OFF_NAME..OFF_NAME + len].copy_from_slice(&name[..len]);
        data.extend(fd);
    }
    data
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}
