//! Transfer media
//!
//! A drag source may expose one format's bytes as a shared memory block, as a
//! reference to a file on disk, or as a seekable stream. Extraction code only
//! ever sees [`TransferSource`], which reduces all three to `size()` and
//! `read(offset, len)`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::error::{DropError, Result};

/// Anything readable and seekable that can move between threads
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

pub enum TransferSource {
    /// Shared memory block, already copied out of the carrier
    Memory(Vec<u8>),
    /// Existing file on disk
    File(PathBuf),
    /// Seekable stream with a reported total size
    Stream { stream: Box<dyn ReadSeek>, size: u64 },
}

impl std::fmt::Debug for TransferSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
            Self::File(path) => write!(f, "File({})", path.display()),
            Self::Stream { size, .. } => write!(f, "Stream({size} bytes)"),
        }
    }
}

impl TransferSource {
    /// Wrap a stream, taking its size from the end position.
    pub fn from_stream(mut stream: Box<dyn ReadSeek>) -> Result<Self> {
        let size = stream.seek(SeekFrom::End(0))?;
        stream.seek(SeekFrom::Start(0))?;
        Ok(Self::Stream { stream, size })
    }

    pub fn size(&self) -> Result<u64> {
        match self {
            Self::Memory(bytes) => Ok(bytes.len() as u64),
            Self::File(path) => Ok(std::fs::metadata(path)?.len()),
            Self::Stream { size, .. } => Ok(*size),
        }
    }

    /// Read up to `len` bytes at `offset`. Fewer bytes come back only when
    /// the source ends first.
    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self {
            Self::Memory(bytes) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
                let end = start.saturating_add(len).min(bytes.len());
                Ok(bytes[start..end].to_vec())
            }
            Self::File(path) => {
                let mut file = File::open(&*path)?;
                file.seek(SeekFrom::Start(offset))?;
                read_up_to(&mut file, len)
            }
            Self::Stream { stream, .. } => {
                stream.seek(SeekFrom::Start(offset))?;
                read_up_to(stream, len)
            }
        }
    }

    /// The whole content. A memory source hands over its buffer and is
    /// empty afterwards.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        if let Self::Memory(bytes) = self {
            return Ok(std::mem::take(bytes));
        }
        let size = usize::try_from(self.size()?).map_err(|_| DropError::OutOfMemory)?;
        self.read(0, size)
    }

    /// Stream the whole content into `out` without buffering it all.
    pub fn copy_to(&mut self, out: &mut dyn Write) -> Result<u64> {
        match self {
            Self::Memory(bytes) => {
                out.write_all(bytes)?;
                Ok(bytes.len() as u64)
            }
            Self::File(path) => {
                let mut file = File::open(&*path)?;
                Ok(io::copy(&mut file, out)?)
            }
            Self::Stream { stream, size } => {
                stream.seek(SeekFrom::Start(0))?;
                Ok(io::copy(&mut stream.take(*size), out)?)
            }
        }
    }
}

fn read_up_to(reader: &mut dyn Read, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}
