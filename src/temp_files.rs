//! Process-scoped temporary directory
//!
//! Every extracted file lives in `{temp_root}/{prefix}{pid}`. The directory
//! is held open (locked) for the lifetime of the process so that another
//! instance sweeping stale directories can tell a live one from one left
//! behind by a crash.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use rand::{Rng, SeedableRng};

use crate::error::{DropError, Result};
use crate::sanitize;

const MAX_CREATE_ATTEMPTS: usize = 5;

/// `_` plus 16 hex digits
const UNIQUE_SUFFIX_LEN: usize = 17;

pub struct TempFileManager {
    root: PathBuf,
    prefix: String,
    id: u32,
    dir: PathBuf,
    lock: Mutex<Option<DirLock>>,
    seed: u64,
    started: Instant,
    counter: AtomicU64,
}

impl TempFileManager {
    /// Manager for the current process
    pub fn new(root: impl Into<PathBuf>, prefix: &str) -> Self {
        Self::with_id(root, prefix, std::process::id())
    }

    /// Manager for an explicit owner id (the pid in production)
    pub fn with_id(root: impl Into<PathBuf>, prefix: &str, id: u32) -> Self {
        let root = root.into();
        let dir = root.join(format!("{prefix}{id}"));
        Self {
            root,
            prefix: prefix.to_string(),
            id,
            dir,
            lock: Mutex::new(None),
            seed: rand::random(),
            started: Instant::now(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory (an existing one is reused) and take the lock.
    pub fn create_directory(&self) -> Result<()> {
        match fs::create_dir(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        let mut lock = self.lock.lock().map_err(|_| poisoned())?;
        if lock.is_none() {
            *lock = Some(DirLock::acquire(&self.dir)?);
        }
        log::info!("[TempFiles] using {}", self.dir.display());
        Ok(())
    }

    /// Create a new empty file named after `name_hint` with a random suffix.
    /// Never overwrites: the file is created exclusively, retrying on
    /// collisions.
    pub fn create_unique_file(&self, name_hint: &str) -> Result<(PathBuf, File)> {
        let name = sanitize::fit_file_name(
            &sanitize::sanitize_file_name(name_hint),
            sanitize::MAX_FILE_NAME_BYTES - UNIQUE_SUFFIX_LEN,
        );
        let (base, ext) = sanitize::split_extension(&name);

        let mut last_err = None;
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let path = self.dir.join(format!("{base}_{:016x}{ext}", self.next_random()));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    log::debug!("[TempFiles] name collision on {}", path.display());
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err
            .map(DropError::from)
            .unwrap_or_else(|| DropError::InvalidArgument(name_hint.to_string())))
    }

    /// Release the lock and delete the directory with everything in it.
    pub fn remove_directory(&self) -> Result<()> {
        let held = self.lock.lock().map_err(|_| poisoned())?.take();
        drop(held);
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                log::info!("[TempFiles] removed {}", self.dir.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove sibling `{prefix}{pid}` directories nobody holds open any more.
    /// `on_removed` is called for each directory deleted. Returns the count.
    pub fn cleanup_stale_directories(&self, mut on_removed: impl FnMut(&Path)) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let Ok(entry) = entry else { continue };
            let name = entry.file_name();
            let Some(owner) = name
                .to_str()
                .and_then(|n| n.strip_prefix(self.prefix.as_str()))
                .filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|id| id.parse::<u32>().ok())
            else {
                continue;
            };
            if owner == self.id || !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            let path = entry.path();
            if !DirLock::is_free(&path) {
                log::debug!("[TempFiles] {} is in use, skipping", path.display());
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    log::info!("[TempFiles] removed stale {}", path.display());
                    removed += 1;
                    on_removed(&path);
                }
                Err(e) => log::warn!("[TempFiles] could not remove {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }

    fn next_random(&self) -> u64 {
        let tick = self.started.elapsed().as_nanos() as u64;
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mix = self.seed ^ tick.rotate_left(29) ^ n.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        rand::rngs::StdRng::seed_from_u64(mix).random()
    }
}

fn poisoned() -> DropError {
    DropError::InvalidArgument("temp directory lock poisoned".to_string())
}

// ---------------------------------------------------------------------------
// Advisory directory lock
// ---------------------------------------------------------------------------

#[cfg(unix)]
const LOCK_FILE: &str = ".lock";

/// Open handle marking a directory as "in use"
struct DirLock {
    _handle: File,
}

#[cfg(unix)]
impl DirLock {
    fn acquire(dir: &Path) -> Result<Self> {
        use std::os::unix::io::AsRawFd;

        let handle = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        // SAFETY: fd is owned by `handle` and stays open while locked
        let rc = unsafe { libc::flock(handle.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self { _handle: handle })
    }

    /// Nobody holds the lock (or there is no lock file at all)
    fn is_free(dir: &Path) -> bool {
        use std::os::unix::io::AsRawFd;

        let Ok(probe) = OpenOptions::new().write(true).open(dir.join(LOCK_FILE)) else {
            return true;
        };
        // SAFETY: probe is a valid open file; the lock goes away when it is closed
        unsafe { libc::flock(probe.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
    }
}

#[cfg(windows)]
impl DirLock {
    const FILE_FLAG_BACKUP_SEMANTICS: u32 = 0x0200_0000;
    const FILE_SHARE_READ: u32 = 0x1;
    const FILE_SHARE_WRITE: u32 = 0x2;
    const FILE_SHARE_DELETE: u32 = 0x4;
    const FILE_LIST_DIRECTORY: u32 = 0x1;
    const DELETE: u32 = 0x0001_0000;

    fn acquire(dir: &Path) -> Result<Self> {
        use std::os::windows::fs::OpenOptionsExt;

        // No FILE_SHARE_DELETE: delete-intent opens fail while this is held
        let handle = OpenOptions::new()
            .access_mode(Self::FILE_LIST_DIRECTORY)
            .share_mode(Self::FILE_SHARE_READ | Self::FILE_SHARE_WRITE)
            .custom_flags(Self::FILE_FLAG_BACKUP_SEMANTICS)
            .open(dir)?;
        Ok(Self { _handle: handle })
    }

    fn is_free(dir: &Path) -> bool {
        use std::os::windows::fs::OpenOptionsExt;

        OpenOptions::new()
            .access_mode(Self::DELETE)
            .share_mode(Self::FILE_SHARE_READ | Self::FILE_SHARE_WRITE | Self::FILE_SHARE_DELETE)
            .custom_flags(Self::FILE_FLAG_BACKUP_SEMANTICS)
            .open(dir)
            .is_ok()
    }
}

#[cfg(not(any(unix, windows)))]
impl DirLock {
    fn acquire(dir: &Path) -> Result<Self> {
        Ok(Self { _handle: File::open(dir)? })
    }

    fn is_free(_dir: &Path) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let manager = TempFileManager::with_id(root.path(), "dp", 42);
        manager.create_directory().unwrap();
        // Tolerates an existing directory
        manager.create_directory().unwrap();
        assert_eq!(manager.dir(), root.path().join("dp42"));
        assert!(manager.dir().is_dir());

        let (path, _) = manager.create_unique_file("clip.png").unwrap();
        assert!(path.exists());
        manager.remove_directory().unwrap();
        assert!(!manager.dir().exists());
        // Removing twice is fine
        manager.remove_directory().unwrap();
    }

    #[test]
    fn test_unique_names() {
        let root = tempfile::tempdir().unwrap();
        let manager = TempFileManager::with_id(root.path(), "dp", 1);
        manager.create_directory().unwrap();

        let (a, _) = manager.create_unique_file("photo.jpg").unwrap();
        let (b, _) = manager.create_unique_file("photo.jpg").unwrap();
        assert_ne!(a, b);

        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("photo_"));
        assert!(name.ends_with(".jpg"));
        let suffix = &name["photo_".len()..name.len() - ".jpg".len()];
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));

        let (c, _) = manager.create_unique_file("no extension").unwrap();
        assert!(c.file_name().unwrap().to_str().unwrap().starts_with("no extension_"));
    }

    #[test]
    fn test_long_hints_fit_with_suffix() {
        let root = tempfile::tempdir().unwrap();
        let manager = TempFileManager::with_id(root.path(), "dp", 2);
        manager.create_directory().unwrap();

        for hint in [
            format!("{}.png", "x".repeat(250)),
            format!("{}.png", "x".repeat(300)),
            format!("{}.txt", "あ".repeat(100)),
        ] {
            let (path, _) = manager.create_unique_file(&hint).unwrap();
            let name = path.file_name().unwrap().to_str().unwrap();
            assert!(name.len() <= sanitize::MAX_FILE_NAME_BYTES, "{} bytes", name.len());
            assert_eq!(&name[name.len() - 4..], &hint[hint.len() - 4..]);
        }
    }

    #[test]
    fn test_sweep_skips_live_and_own_directories() {
        let root = tempfile::tempdir().unwrap();
        let me = TempFileManager::with_id(root.path(), "dp", 10);
        me.create_directory().unwrap();
        let live = TempFileManager::with_id(root.path(), "dp", 20);
        live.create_directory().unwrap();

        // Left behind by a crashed instance: no lock held
        let stale = root.path().join("dp30");
        fs::create_dir(&stale).unwrap();
        fs::write(stale.join("left_over.png"), b"x").unwrap();
        // Not ours at all
        fs::create_dir(root.path().join("dpx")).unwrap();
        fs::create_dir(root.path().join("other40")).unwrap();

        let mut seen = Vec::new();
        let removed = me.cleanup_stale_directories(|p| seen.push(p.to_path_buf())).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(seen, vec![stale.clone()]);
        assert!(!stale.exists());
        assert!(me.dir().exists());
        assert!(live.dir().exists());
        assert!(root.path().join("dpx").exists());

        // Once the other instance lets go, its directory is fair game
        live.remove_directory().unwrap();
        fs::create_dir(live.dir()).unwrap();
        assert_eq!(me.cleanup_stale_directories(|_| {}).unwrap(), 1);
    }
}
