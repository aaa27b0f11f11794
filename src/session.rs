//! Per-window drop session
//!
//! A [`DropSession`] sits between the OS drag protocol and the host's own
//! drag-target. On Drag-Enter and Drop it extracts the dragged content into
//! files, lets the hooks rewrite the list, and shows the host a
//! [`ReplacementCarrier`] listing those files instead of the original
//! carrier. With nothing extracted the original passes through untouched.
//!
//! The extracted files, the original carrier and the replacement are held
//! together as one prepared state and torn down together: on Drag-Leave, at
//! the start of the next Drag-Enter or Drop, or when the session goes away.
//!
//! Files that are not readable yet (a source still writing them) are listed
//! under a shared placeholder path until a later Drag-Over finds them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::carrier::{drop_flags, Carrier, DropFlags, ReplacementCarrier};
use crate::context::DropContext;
use crate::error::{DropError, Result};
use crate::extract::ExtractionPipeline;
use crate::file_list::FileList;
use crate::hooks::{self, FileRelocator, NoopHooks, ScriptHooks};

/// Cursor position in screen coordinates
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Mouse button and modifier state (`MK_*` bits)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyState(pub u32);

impl KeyState {
    pub const LBUTTON: KeyState = KeyState(0x0001);
    pub const RBUTTON: KeyState = KeyState(0x0002);
    pub const SHIFT: KeyState = KeyState(0x0004);
    pub const CONTROL: KeyState = KeyState(0x0008);
    pub const MBUTTON: KeyState = KeyState(0x0010);
    pub const ALT: KeyState = KeyState(0x0020);

    pub fn contains(self, other: KeyState) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for KeyState {
    type Output = KeyState;

    fn bitor(self, rhs: KeyState) -> KeyState {
        KeyState(self.0 | rhs.0)
    }
}

/// `DROPEFFECT_*` bits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DropEffect(pub u32);

impl DropEffect {
    pub const NONE: DropEffect = DropEffect(0);
    pub const COPY: DropEffect = DropEffect(1);
    pub const MOVE: DropEffect = DropEffect(2);
    pub const LINK: DropEffect = DropEffect(4);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for DropEffect {
    type Output = DropEffect;

    fn bitor(self, rhs: DropEffect) -> DropEffect {
        DropEffect(self.0 | rhs.0)
    }
}

/// The host's own drag-target. `allowed` is what the drag source permits;
/// the return value is the effect the host picked.
pub trait HostDropTarget: Send + Sync {
    fn drag_enter(&self, carrier: &Carrier, key_state: KeyState, point: Point, allowed: DropEffect) -> Result<DropEffect>;
    fn drag_over(&self, key_state: KeyState, point: Point, allowed: DropEffect) -> Result<DropEffect>;
    fn drag_leave(&self) -> Result<()>;
    fn drop_data(&self, carrier: &Carrier, key_state: KeyState, point: Point, allowed: DropEffect) -> Result<DropEffect>;
}

struct Prepared {
    original: Carrier,
    replacement: Arc<ReplacementCarrier>,
    files: FileList,
}

/// Memoized accessibility of listed paths, plus the shared placeholder.
#[derive(Default)]
struct PlaceholderCache {
    accessible: HashMap<PathBuf, bool>,
    shared_placeholder: Option<PathBuf>,
    /// A full pass found every path accessible
    all_accessible: bool,
}

impl PlaceholderCache {
    fn clear(&mut self) {
        if let Some(path) = self.shared_placeholder.take() {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("[DropSession] could not remove placeholder {}: {}", path.display(), e);
                }
            }
        }
        self.accessible.clear();
        self.all_accessible = false;
    }

    /// Accessible paths are never probed twice. Inaccessible ones are probed
    /// again on every call until they show up.
    fn is_accessible(&mut self, path: &Path) -> bool {
        if self.accessible.get(path) == Some(&true) {
            return true;
        }
        let accessible = fs::File::open(path).is_ok() || path.is_dir();
        self.accessible.insert(path.to_path_buf(), accessible);
        accessible
    }

    /// Paths to show the host, with a placeholder standing in for every file
    /// that can't be opened yet.
    fn resolve(&mut self, files: &FileList, context: &DropContext) -> Result<Vec<PathBuf>> {
        if self.all_accessible {
            return Ok(files.paths().map(Path::to_path_buf).collect());
        }
        let mut all = true;
        let mut paths = Vec::with_capacity(files.len());
        for path in files.paths() {
            if self.is_accessible(path) {
                paths.push(path.to_path_buf());
            } else {
                all = false;
                paths.push(self.placeholder(context)?);
            }
        }
        self.all_accessible = all;
        Ok(paths)
    }

    fn placeholder(&mut self, context: &DropContext) -> Result<PathBuf> {
        if let Some(path) = &self.shared_placeholder {
            return Ok(path.clone());
        }
        let (path, _) = context
            .temp_files()
            .create_unique_file(&context.config().placeholder_name)?;
        log::debug!("[DropSession] placeholder {}", path.display());
        self.shared_placeholder = Some(path.clone());
        Ok(path)
    }
}

#[derive(Default)]
struct SessionState {
    prepared: Option<Prepared>,
    cache: PlaceholderCache,
}

pub struct DropSession {
    context: Arc<DropContext>,
    host: Arc<dyn HostDropTarget>,
    hooks: Arc<dyn ScriptHooks>,
    relocator: Option<Arc<dyn FileRelocator>>,
    state: Mutex<SessionState>,
}

impl DropSession {
    pub fn new(context: Arc<DropContext>, host: Arc<dyn HostDropTarget>) -> Self {
        Self {
            context,
            host,
            hooks: Arc::new(NoopHooks),
            relocator: None,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ScriptHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_relocator(mut self, relocator: Arc<dyn FileRelocator>) -> Self {
        self.relocator = Some(relocator);
        self
    }

    pub fn host(&self) -> &Arc<dyn HostDropTarget> {
        &self.host
    }

    pub fn drag_enter(&self, carrier: Carrier, key_state: KeyState, point: Point, allowed: DropEffect) -> Result<DropEffect> {
        log::debug!("[DropSession] DragEnter at ({}, {})", point.x, point.y);
        let mut state = self.lock()?;
        Self::teardown(&mut state);

        let script = &self.hooks;
        let target = self
            .prepare(&mut state, &carrier, |files| {
                hooks::run_list_hook(files, |f| script.drag_enter(f, point, key_state));
            })
            .unwrap_or(carrier);
        host_result("DragEnter", self.host.drag_enter(&target, key_state, point, allowed))
    }

    pub fn drag_over(&self, key_state: KeyState, point: Point, allowed: DropEffect) -> Result<DropEffect> {
        let mut state = self.lock()?;
        if let Err(e) = self.hooks.drag_over(point, key_state) {
            log::warn!("[DropSession] {}", e);
        }
        let SessionState { prepared, cache } = &mut *state;
        if let Some(prepared) = prepared {
            if !cache.all_accessible {
                match cache.resolve(&prepared.files, &self.context) {
                    Ok(paths) => prepared.replacement.set_paths(paths),
                    Err(e) => log::warn!("[DropSession] could not refresh paths: {}", e),
                }
            }
        }
        host_result("DragOver", self.host.drag_over(key_state, point, allowed))
    }

    pub fn drag_leave(&self) -> Result<()> {
        log::debug!("[DropSession] DragLeave");
        let mut state = self.lock()?;
        if let Err(e) = self.hooks.drag_leave() {
            log::warn!("[DropSession] {}", e);
        }
        Self::teardown(&mut state);
        host_result("DragLeave", self.host.drag_leave())
    }

    /// Extract afresh (content may only have become available now), run the
    /// convert and drop hooks and the relocator, then hand the result to the
    /// host. With replay on, the host is walked through
    /// Leave, Enter and Over with the new carrier before the Drop itself.
    pub fn drop_data(&self, carrier: Carrier, key_state: KeyState, point: Point, allowed: DropEffect) -> Result<DropEffect> {
        log::debug!("[DropSession] Drop at ({}, {})", point.x, point.y);
        let mut state = self.lock()?;
        Self::teardown(&mut state);

        let config = self.context.config();
        let convert = config.convert_on_drop || drop_flags(&*carrier).convert;
        let script = &self.hooks;
        let relocator = self.relocator.as_deref();
        let target = self
            .prepare(&mut state, &carrier, |files| {
                if convert {
                    hooks::run_list_hook(files, |f| script.convert(f));
                }
                hooks::run_list_hook(files, |f| script.drop_files(f, point, key_state));
                if let Some(relocator) = relocator {
                    hooks::relocate_all(relocator, files);
                }
            })
            .unwrap_or(carrier);

        if config.replay_on_drop {
            host_result("DragLeave", self.host.drag_leave())?;
            host_result("DragEnter", self.host.drag_enter(&target, key_state, point, allowed))?;
            host_result("DragOver", self.host.drag_over(key_state, point, allowed))?;
        }
        host_result("Drop", self.host.drop_data(&target, key_state, point, allowed))
    }

    /// Release everything the current drag holds. Safe to call at any time,
    /// any number of times.
    pub fn cleanup_current_entry(&self) {
        match self.state.lock() {
            Ok(mut state) => Self::teardown(&mut state),
            Err(poisoned) => Self::teardown(&mut poisoned.into_inner()),
        }
    }

    /// Whether a replacement is currently prepared
    pub fn is_prepared(&self) -> bool {
        self.state.lock().map(|s| s.prepared.is_some()).unwrap_or(false)
    }

    /// Files of the current drag, if any
    pub fn current_files(&self) -> Option<FileList> {
        self.state.lock().ok()?.prepared.as_ref().map(|p| p.files.clone())
    }

    /// The carrier the current drag started with, if a replacement is prepared
    pub fn original_carrier(&self) -> Option<Carrier> {
        self.state.lock().ok()?.prepared.as_ref().map(|p| p.original.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| DropError::InvalidArgument("drop session state poisoned".to_string()))
    }

    /// Extract from `carrier` and build its replacement. `None` means the
    /// host should get the original: nothing was extracted, or preparing
    /// failed and everything created for it has been deleted again.
    fn prepare(
        &self,
        state: &mut SessionState,
        carrier: &Carrier,
        edit: impl FnOnce(&mut FileList),
    ) -> Option<Carrier> {
        let pipeline = ExtractionPipeline::new(self.context.temp_files(), self.context.config());
        let mut files = match pipeline.extract(&**carrier) {
            Ok(files) => files,
            Err(DropError::NotFound) => return None,
            Err(e) => {
                log::warn!("[DropSession] extraction failed, passing original through: {}", e);
                return None;
            }
        };
        edit(&mut files);
        if files.is_empty() {
            return None;
        }

        let paths = match state.cache.resolve(&files, &self.context) {
            Ok(paths) => paths,
            Err(e) => {
                log::warn!("[DropSession] could not build replacement: {}", e);
                files.delete_temporary();
                state.cache.clear();
                return None;
            }
        };
        let flags = DropFlags {
            convert: false,
            ..drop_flags(&**carrier)
        };
        let replacement = Arc::new(ReplacementCarrier::new(paths, flags));
        log::debug!("[DropSession] prepared {} file(s)", files.len());
        state.prepared = Some(Prepared {
            original: carrier.clone(),
            replacement: replacement.clone(),
            files,
        });
        Some(replacement as Carrier)
    }

    fn teardown(state: &mut SessionState) {
        state.cache.clear();
        if let Some(mut prepared) = state.prepared.take() {
            let deleted = prepared.files.delete_temporary();
            log::debug!("[DropSession] teardown, deleted {} file(s)", deleted);
        }
    }
}

impl Drop for DropSession {
    fn drop(&mut self) {
        self.cleanup_current_entry();
    }
}

fn host_result<T>(call: &str, result: Result<T>) -> Result<T> {
    result.map_err(|e| {
        log::error!("[DropSession] host {} failed: {}", call, e);
        match e {
            DropError::HostProtocolFailure(_) => e,
            other => DropError::HostProtocolFailure(other.to_string()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::{parse_drop_files, ClipFormat, MemoryCarrier};
    use crate::config::DropConfig;
    use crate::error::HookError;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        paths: Mutex<Vec<Vec<PathBuf>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str, carrier: Option<&Carrier>) {
            self.calls.lock().unwrap().push(call.to_string());
            if let Some(mut src) = carrier.and_then(|c| c.get(&ClipFormat::FileDrop, None)) {
                let paths = parse_drop_files(&src.read_all().unwrap()).unwrap();
                self.paths.lock().unwrap().push(paths);
            }
        }
    }

    impl HostDropTarget for Recorder {
        fn drag_enter(&self, carrier: &Carrier, _: KeyState, _: Point, _: DropEffect) -> Result<DropEffect> {
            self.record("enter", Some(carrier));
            Ok(DropEffect::COPY)
        }

        fn drag_over(&self, _: KeyState, _: Point, _: DropEffect) -> Result<DropEffect> {
            self.record("over", None);
            Ok(DropEffect::COPY)
        }

        fn drag_leave(&self) -> Result<()> {
            self.record("leave", None);
            Ok(())
        }

        fn drop_data(&self, carrier: &Carrier, _: KeyState, _: Point, _: DropEffect) -> Result<DropEffect> {
            self.record("drop", Some(carrier));
            Ok(DropEffect::COPY)
        }
    }

    fn context(root: &Path, config: DropConfig) -> Arc<DropContext> {
        let config = DropConfig {
            temp_root: Some(root.to_path_buf()),
            sweep_stale_on_init: false,
            ..config
        };
        DropContext::with_temp_files(config, crate::temp_files::TempFileManager::with_id(root, "s", 1)).unwrap()
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let host = Arc::new(Recorder::default());
        let session = DropSession::new(context(root.path(), DropConfig::default()), host.clone());
        session.cleanup_current_entry();
        session.cleanup_current_entry();
        assert!(!session.is_prepared());
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_enter_then_leave_deletes_files() {
        let root = tempfile::tempdir().unwrap();
        let host = Arc::new(Recorder::default());
        let session = DropSession::new(context(root.path(), DropConfig::default()), host.clone());

        let carrier = MemoryCarrier::new().with_text("data:,hello").into_carrier();
        let effect = session
            .drag_enter(carrier, KeyState::LBUTTON, Point::new(1, 2), DropEffect::COPY)
            .unwrap();
        assert_eq!(effect, DropEffect::COPY);
        let files = session.current_files().unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].path.exists());
        assert_eq!(host.paths.lock().unwrap()[0], vec![files[0].path.clone()]);

        session.drag_leave().unwrap();
        assert!(!files[0].path.exists());
        assert!(!session.is_prepared());
        assert_eq!(host.calls(), ["enter", "leave"]);
    }

    #[test]
    fn test_nothing_extracted_passes_original_through() {
        let root = tempfile::tempdir().unwrap();
        let host = Arc::new(Recorder::default());
        let session = DropSession::new(context(root.path(), DropConfig::default()), host.clone());

        let carrier = MemoryCarrier::new().with_bytes(ClipFormat::Custom("x-private".into()), b"?".to_vec());
        let carrier = carrier.into_carrier();
        session
            .drag_enter(carrier, KeyState::default(), Point::default(), DropEffect::COPY)
            .unwrap();
        assert!(!session.is_prepared());
        assert_eq!(host.calls(), ["enter"]);
        assert!(host.paths.lock().unwrap().is_empty());
    }

    #[test]
    fn test_drop_replays_before_dropping() {
        let root = tempfile::tempdir().unwrap();
        let host = Arc::new(Recorder::default());
        let session = DropSession::new(context(root.path(), DropConfig::default()), host.clone());

        let carrier = MemoryCarrier::new().with_text("data:,first").into_carrier();
        session.drag_enter(carrier.clone(), KeyState::LBUTTON, Point::default(), DropEffect::COPY).unwrap();
        let entered = session.current_files().unwrap();
        session.drop_data(carrier, KeyState::default(), Point::default(), DropEffect::COPY).unwrap();

        assert_eq!(host.calls(), ["enter", "leave", "enter", "over", "drop"]);
        // Drop extracted again: the Drag-Enter file is gone, a new one is shown
        assert!(!entered[0].path.exists());
        let dropped = session.current_files().unwrap();
        assert!(dropped[0].path.exists());
        let paths = host.paths.lock().unwrap();
        assert_eq!(paths[1], vec![dropped[0].path.clone()]);
        assert_eq!(paths[2], vec![dropped[0].path.clone()]);
    }

    #[test]
    fn test_drop_without_replay() {
        let root = tempfile::tempdir().unwrap();
        let host = Arc::new(Recorder::default());
        let config = DropConfig { replay_on_drop: false, ..DropConfig::default() };
        let session = DropSession::new(context(root.path(), config), host.clone());

        let carrier = MemoryCarrier::new().with_text("plain").into_carrier();
        session.drop_data(carrier, KeyState::default(), Point::default(), DropEffect::COPY).unwrap();
        assert_eq!(host.calls(), ["drop"]);
    }

    #[test]
    fn test_missing_file_uses_shared_placeholder_until_it_appears() {
        let root = tempfile::tempdir().unwrap();
        let host = Arc::new(Recorder::default());
        let session = DropSession::new(context(root.path(), DropConfig::default()), host.clone());

        let pending = root.path().join("still-downloading.png");
        let also_pending = root.path().join("also.png");
        let carrier = MemoryCarrier::new().with_paths(&[&pending, &also_pending]).into_carrier();
        session.drag_enter(carrier, KeyState::default(), Point::default(), DropEffect::COPY).unwrap();

        let shown = host.paths.lock().unwrap()[0].clone();
        assert_eq!(shown.len(), 2);
        assert_eq!(shown[0], shown[1]);
        assert_ne!(shown[0], pending);
        assert!(shown[0].exists());

        fs::write(&pending, b"done").unwrap();
        fs::write(&also_pending, b"done").unwrap();
        session.drag_over(KeyState::default(), Point::default(), DropEffect::COPY).unwrap();
        let state = session.state.lock().unwrap();
        let prepared = state.prepared.as_ref().unwrap();
        assert_eq!(prepared.replacement.paths(), vec![pending.clone(), also_pending.clone()]);
        assert!(state.cache.all_accessible);
        drop(state);

        session.drag_leave().unwrap();
        assert!(!shown[0].exists());
        // External files are never deleted
        assert!(pending.exists());
    }

    /// Records whether the session state was locked while each hook ran
    #[derive(Default)]
    struct LockObserver {
        session: std::sync::OnceLock<std::sync::Weak<DropSession>>,
        locked: Mutex<Vec<bool>>,
    }

    impl LockObserver {
        fn observe(&self) {
            let session = self.session.get().and_then(|w| w.upgrade()).unwrap();
            let locked = session.state.try_lock().is_err();
            self.locked.lock().unwrap().push(locked);
        }
    }

    impl ScriptHooks for LockObserver {
        fn drag_enter(&self, _: &mut FileList, _: Point, _: KeyState) -> std::result::Result<(), HookError> {
            self.observe();
            Ok(())
        }

        fn drag_over(&self, _: Point, _: KeyState) -> std::result::Result<(), HookError> {
            self.observe();
            Ok(())
        }

        fn drag_leave(&self) -> std::result::Result<(), HookError> {
            self.observe();
            Ok(())
        }
    }

    #[test]
    fn test_hooks_run_under_the_session_lock() {
        let root = tempfile::tempdir().unwrap();
        let host = Arc::new(Recorder::default());
        let observer = Arc::new(LockObserver::default());
        let session = Arc::new(
            DropSession::new(context(root.path(), DropConfig::default()), host.clone()).with_hooks(observer.clone()),
        );
        observer.session.set(Arc::downgrade(&session)).unwrap();

        let carrier = MemoryCarrier::new().with_text("data:,x").into_carrier();
        session.drag_enter(carrier, KeyState::default(), Point::default(), DropEffect::COPY).unwrap();
        session.drag_over(KeyState::default(), Point::default(), DropEffect::COPY).unwrap();
        session.drag_leave().unwrap();

        assert_eq!(*observer.locked.lock().unwrap(), [true, true, true]);
    }

    struct ConvertingHooks {
        converted: Mutex<usize>,
    }

    impl ScriptHooks for ConvertingHooks {
        fn convert(&self, files: &mut FileList) -> std::result::Result<(), HookError> {
            *self.converted.lock().unwrap() += files.len();
            Ok(())
        }

        fn drop_files(&self, _: &mut FileList, _: Point, _: KeyState) -> std::result::Result<(), HookError> {
            Err(HookError::new("drop", "script error"))
        }
    }

    #[test]
    fn test_convert_flag_and_failing_drop_hook() {
        let root = tempfile::tempdir().unwrap();
        let host = Arc::new(Recorder::default());
        let hooks = Arc::new(ConvertingHooks { converted: Mutex::new(0) });
        let session = DropSession::new(context(root.path(), DropConfig::default()), host.clone())
            .with_hooks(hooks.clone());

        let plain = MemoryCarrier::new().with_text("a").into_carrier();
        session.drop_data(plain, KeyState::default(), Point::default(), DropEffect::COPY).unwrap();
        assert_eq!(*hooks.converted.lock().unwrap(), 0);

        let flagged = MemoryCarrier::new()
            .with_text("b")
            .with_flags(DropFlags { convert: true, from_external_api: false })
            .into_carrier();
        session.drop_data(flagged, KeyState::default(), Point::default(), DropEffect::COPY).unwrap();
        assert_eq!(*hooks.converted.lock().unwrap(), 1);
        // The failing drop hook changed nothing
        assert_eq!(session.current_files().unwrap().len(), 1);
    }

    #[test]
    fn test_dropping_session_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let host = Arc::new(Recorder::default());
        let session = DropSession::new(context(root.path(), DropConfig::default()), host);
        let carrier = MemoryCarrier::new().with_text("bye").into_carrier();
        session.drag_enter(carrier, KeyState::default(), Point::default(), DropEffect::COPY).unwrap();
        let path = session.current_files().unwrap()[0].path.clone();
        drop(session);
        assert!(!path.exists());
    }
}
