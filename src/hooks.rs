//! Scripted hooks and file relocation
//!
//! Both are collaborators supplied by the embedding application. The session
//! never trusts them: a failing list hook leaves the file list exactly as it
//! was, and a failing relocation leaves the entry where it is.

use std::path::{Path, PathBuf};

use crate::error::{HookError, RelocateError};
use crate::file_list::FileList;
use crate::session::{KeyState, Point};

/// Lifecycle hooks exposed by the scripting layer. Every method defaults to
/// doing nothing, so implementors only override what they handle.
pub trait ScriptHooks: Send + Sync {
    fn drag_enter(&self, _files: &mut FileList, _point: Point, _key_state: KeyState) -> Result<(), HookError> {
        Ok(())
    }

    fn drag_over(&self, _point: Point, _key_state: KeyState) -> Result<(), HookError> {
        Ok(())
    }

    fn drag_leave(&self) -> Result<(), HookError> {
        Ok(())
    }

    fn drop_files(&self, _files: &mut FileList, _point: Point, _key_state: KeyState) -> Result<(), HookError> {
        Ok(())
    }

    /// Format-specific conversion of dropped files
    fn convert(&self, _files: &mut FileList) -> Result<(), HookError> {
        Ok(())
    }
}

/// Hooks for sessions without a scripting layer
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl ScriptHooks for NoopHooks {}

/// Moves a dropped file somewhere permanent (a project's asset folder, say).
pub trait FileRelocator: Send + Sync {
    /// Returns the file's new location; the same path means "leave it".
    fn relocate(&self, path: &Path) -> Result<PathBuf, RelocateError>;
}

/// Run a hook that may rewrite `files`.
///
/// The hook works on a copy. On success the copy replaces `files` and any
/// temporary file the hook dropped from the list is deleted. On failure the
/// copy is discarded, along with temporary files the hook added to it.
pub(crate) fn run_list_hook(
    files: &mut FileList,
    hook: impl FnOnce(&mut FileList) -> Result<(), HookError>,
) -> bool {
    let mut edited = files.clone();
    match hook(&mut edited) {
        Ok(()) => {
            let mut orphans: FileList = files
                .iter()
                .filter(|e| e.temporary && !edited.contains_path(&e.path))
                .cloned()
                .collect();
            if !orphans.is_empty() {
                log::debug!("[Hooks] deleting {} file(s) removed by hook", orphans.len());
                orphans.delete_temporary();
            }
            *files = edited;
            true
        }
        Err(e) => {
            log::warn!("[Hooks] {}", e);
            edited.retain(|e| e.temporary && !files.contains_path(&e.path));
            edited.delete_temporary();
            false
        }
    }
}

/// Offer every entry to `relocator`. A moved temporary file is deleted from
/// its old place and the entry no longer owns anything.
pub(crate) fn relocate_all(relocator: &dyn FileRelocator, files: &mut FileList) {
    for entry in files.iter_mut() {
        match relocator.relocate(&entry.path) {
            Ok(new_path) if new_path != entry.path => {
                if entry.temporary {
                    if let Err(e) = std::fs::remove_file(&entry.path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            log::warn!("[Hooks] could not remove {}: {}", entry.path.display(), e);
                        }
                    }
                }
                log::debug!("[Hooks] relocated {} -> {}", entry.path.display(), new_path.display());
                entry.path = new_path;
                entry.temporary = false;
            }
            Ok(_) => {}
            Err(e) => log::warn!("[Hooks] relocation of {} failed: {}", entry.path.display(), e),
        }
    }
}
