//! End-to-end drag sequences through the manager and a recording host.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use droppipe::carrier::parse_drop_files;
use droppipe::{
    Carrier, ClipFormat, DropConfig, DropContext, DropEffect, DropError, DropManager,
    DropSession, FileEntry, FileList, FileRelocator, HookError, HostDropTarget, KeyState, MemoryCarrier,
    Point, RelocateError, ScriptHooks, TaskQueue, TempFileManager, ThreadDispatcher,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Enter(Vec<PathBuf>),
    Over,
    Leave,
    Drop(Vec<PathBuf>),
}

/// Host drag-target that records every call and the paths it was shown
struct RecordingHost {
    calls: Mutex<Vec<Call>>,
    accept: DropEffect,
}

impl RecordingHost {
    fn new(accept: DropEffect) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            accept,
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn paths_of(carrier: &Carrier) -> Vec<PathBuf> {
        carrier
            .get(&ClipFormat::FileDrop, None)
            .map(|mut src| parse_drop_files(&src.read_all().unwrap()).unwrap())
            .unwrap_or_default()
    }
}

impl HostDropTarget for RecordingHost {
    fn drag_enter(&self, carrier: &Carrier, _: KeyState, _: Point, _: DropEffect) -> droppipe::Result<DropEffect> {
        self.calls.lock().unwrap().push(Call::Enter(Self::paths_of(carrier)));
        Ok(self.accept)
    }

    fn drag_over(&self, _: KeyState, _: Point, _: DropEffect) -> droppipe::Result<DropEffect> {
        self.calls.lock().unwrap().push(Call::Over);
        Ok(self.accept)
    }

    fn drag_leave(&self) -> droppipe::Result<()> {
        self.calls.lock().unwrap().push(Call::Leave);
        Ok(())
    }

    fn drop_data(&self, carrier: &Carrier, _: KeyState, _: Point, _: DropEffect) -> droppipe::Result<DropEffect> {
        self.calls.lock().unwrap().push(Call::Drop(Self::paths_of(carrier)));
        Ok(self.accept)
    }
}

struct Env {
    manager: DropManager,
    root: tempfile::TempDir,
}

impl Env {
    fn new() -> Self {
        Self::with_config(DropConfig::default())
    }

    fn with_config(config: DropConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let root = tempfile::tempdir().unwrap();
        let config = DropConfig {
            temp_root: Some(root.path().to_path_buf()),
            ..config
        };
        let temp = TempFileManager::with_id(root.path(), "it", 1);
        let context = DropContext::with_temp_files(config, temp).unwrap();
        Self {
            manager: DropManager::new(context),
            root,
        }
    }

    fn temp_dir(&self) -> &Path {
        self.manager.context().temp_files().dir()
    }

    fn owned_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(self.temp_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap() != ".lock")
            .collect();
        files.sort();
        files
    }

    fn session(&self, window: isize, host: Arc<RecordingHost>) -> Arc<DropSession> {
        let session = DropSession::new(self.manager.context().clone(), host);
        self.manager.register(window, session).unwrap()
    }
}

fn data_uri_carrier(uri: &str) -> Carrier {
    MemoryCarrier::new().with_text(uri).into_carrier()
}

#[test]
fn data_uri_wins_over_file_list() {
    let env = Env::new();
    let host = RecordingHost::new(DropEffect::COPY);
    let session = env.session(1, host.clone());

    let carrier = MemoryCarrier::new()
        .with_paths(&[env.root.path().join("listed.txt")])
        .with_text("data:text/plain;base64,SGVsbG8=")
        .into_carrier();
    session.drag_enter(carrier, KeyState::LBUTTON, Point::new(5, 5), DropEffect::COPY).unwrap();

    let files = session.current_files().unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].temporary);
    assert_eq!(files[0].mime_type.as_deref(), Some("text/plain"));
    assert_eq!(fs::read_to_string(&files[0].path).unwrap(), "Hello");
    assert_eq!(host.calls(), vec![Call::Enter(vec![files[0].path.clone()])]);
}

#[test]
fn leave_after_enter_deletes_everything() {
    let env = Env::new();
    let host = RecordingHost::new(DropEffect::COPY);
    let session = env.session(1, host.clone());

    let carrier = MemoryCarrier::new()
        .with_bytes(ClipFormat::FileGroupDescriptor, two_file_descriptor())
        .with_item_stream(ClipFormat::FileContents, 0, b"alpha".to_vec())
        .with_item_stream(ClipFormat::FileContents, 1, b"beta".to_vec())
        .into_carrier();
    session.drag_enter(carrier, KeyState::LBUTTON, Point::default(), DropEffect::COPY).unwrap();
    assert_eq!(env.owned_files().len(), 2);

    session.drag_over(KeyState::LBUTTON, Point::new(1, 1), DropEffect::COPY).unwrap();
    session.drag_leave().unwrap();
    assert!(env.owned_files().is_empty());
    assert!(!session.is_prepared());
    assert_eq!(host.calls().last(), Some(&Call::Leave));
}

#[test]
fn drop_replays_the_whole_sequence() {
    let env = Env::new();
    let host = RecordingHost::new(DropEffect::COPY);
    let session = env.session(1, host.clone());

    let carrier = data_uri_carrier("data:,dropped");
    session.drag_enter(carrier.clone(), KeyState::LBUTTON, Point::default(), DropEffect::COPY).unwrap();
    session.drag_over(KeyState::LBUTTON, Point::default(), DropEffect::COPY).unwrap();
    session.drop_data(carrier, KeyState::default(), Point::default(), DropEffect::COPY).unwrap();

    let dropped = session.current_files().unwrap();
    let shown = vec![dropped[0].path.clone()];
    let calls = host.calls();
    assert_eq!(
        calls[2..],
        [Call::Leave, Call::Enter(shown.clone()), Call::Over, Call::Drop(shown)]
    );
    // Only the Drop extraction is still on disk
    assert_eq!(env.owned_files(), vec![dropped[0].path.clone()]);
}

#[test]
fn teardown_twice_is_harmless() {
    let env = Env::new();
    let host = RecordingHost::new(DropEffect::COPY);
    let session = env.session(1, host.clone());

    session.cleanup_current_entry();
    session.drag_enter(data_uri_carrier("data:,x"), KeyState::default(), Point::default(), DropEffect::COPY).unwrap();
    session.cleanup_current_entry();
    let after_first = env.owned_files();
    session.cleanup_current_entry();
    assert_eq!(env.owned_files(), after_first);
    assert!(after_first.is_empty());
    assert_eq!(host.calls().len(), 1);
}

struct MoveInto(PathBuf);

impl FileRelocator for MoveInto {
    fn relocate(&self, path: &Path) -> Result<PathBuf, RelocateError> {
        let dest = self.0.join(path.file_name().unwrap());
        fs::copy(path, &dest)?;
        Ok(dest)
    }
}

struct DropHalf;

impl ScriptHooks for DropHalf {
    fn drag_enter(&self, files: &mut FileList, _: Point, _: KeyState) -> Result<(), HookError> {
        let keep: Vec<FileEntry> = files.iter().take(1).cloned().collect();
        *files = keep.into_iter().collect();
        Ok(())
    }
}

#[test]
fn every_owned_file_is_deleted_or_handed_over() {
    let env = Env::new();
    let dest = tempfile::tempdir().unwrap();
    let host = RecordingHost::new(DropEffect::COPY);
    let session = DropSession::new(env.manager.context().clone(), host.clone())
        .with_hooks(Arc::new(DropHalf))
        .with_relocator(Arc::new(MoveInto(dest.path().to_path_buf())));
    let session = env.manager.register(7, session).unwrap();

    let carrier = MemoryCarrier::new()
        .with_bytes(ClipFormat::FileGroupDescriptor, two_file_descriptor())
        .with_item_stream(ClipFormat::FileContents, 0, b"alpha".to_vec())
        .with_item_stream(ClipFormat::FileContents, 1, b"beta".to_vec())
        .into_carrier();

    // The enter hook throws away the second file; it must not linger
    session.drag_enter(carrier.clone(), KeyState::default(), Point::default(), DropEffect::COPY).unwrap();
    assert_eq!(env.owned_files().len(), 1);

    // Drop extracts both again and relocates them
    session.drop_data(carrier, KeyState::default(), Point::default(), DropEffect::COPY).unwrap();
    let files = session.current_files().unwrap();
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| !f.temporary && f.path.starts_with(dest.path())));
    assert!(env.owned_files().is_empty());

    // Relocated files survive teardown
    env.manager.unregister(7);
    assert!(files.iter().all(|f| f.path.exists()));
}

#[test]
fn injection_drives_a_full_drop() {
    let env = Env::new();
    let host = RecordingHost::new(DropEffect::COPY);
    env.session(3, host.clone());

    let file = env.root.path().join("clip.wav");
    fs::write(&file, b"RIFF\0\0\0\0WAVEfmt ").unwrap();
    let files: FileList = vec![FileEntry::external(&file, None)].into_iter().collect();

    let effect = env.manager.inject(3, &files, Point::new(40, 50), KeyState::default(), false).unwrap();
    assert_eq!(effect, DropEffect::COPY);
    let shown = vec![file.clone()];
    assert_eq!(
        host.calls(),
        vec![
            Call::Enter(shown.clone()),
            Call::Over,
            Call::Leave,
            Call::Enter(shown.clone()),
            Call::Over,
            Call::Drop(shown),
        ]
    );
    assert!(file.exists());
}

#[test]
fn rejected_injection_ends_with_leave() {
    let env = Env::new();
    let host = RecordingHost::new(DropEffect::NONE);
    env.session(3, host.clone());

    let files: FileList = vec![FileEntry::external(env.root.path().join("a.txt"), None)].into_iter().collect();
    let effect = env.manager.inject(3, &files, Point::default(), KeyState::default(), false).unwrap();
    assert!(effect.is_none());
    assert_eq!(host.calls().len(), 2);
    assert_eq!(host.calls()[1], Call::Leave);

    assert!(matches!(
        env.manager.inject(99, &files, Point::default(), KeyState::default(), false),
        Err(DropError::NotFound)
    ));
    assert!(matches!(
        env.manager.inject(3, &FileList::new(), Point::default(), KeyState::default(), false),
        Err(DropError::InvalidArgument(_))
    ));
}

#[test]
fn registry_lifecycle() {
    let env = Env::new();
    let host = RecordingHost::new(DropEffect::COPY);
    let session = env.session(10, host.clone());
    assert!(env
        .manager
        .register(10, DropSession::new(env.manager.context().clone(), host.clone()))
        .is_err());
    assert_eq!(env.manager.windows(), vec![10]);

    session.drag_enter(data_uri_carrier("data:,held"), KeyState::default(), Point::default(), DropEffect::COPY).unwrap();
    assert_eq!(env.owned_files().len(), 1);

    env.manager.record_right_click(10, Point::new(3, 4));
    assert_eq!(env.manager.right_click_position(), Some((10, Point::new(3, 4))));

    assert!(env.manager.unregister(10).is_some());
    assert!(env.manager.session(10).is_none());
    assert!(env.owned_files().is_empty());
    assert!(env.manager.right_click_position().is_none());
    assert!(env.manager.unregister(10).is_none());
}

#[test]
fn installation_runs_on_the_owning_thread() {
    let env = Env::new();
    let queue = Arc::new(TaskQueue::new());
    let ran_on = Arc::new(Mutex::new(None));

    let record = ran_on.clone();
    let ran_now = env
        .manager
        .install_interception(
            1,
            queue.as_ref(),
            Box::new(move || *record.lock().unwrap() = Some(std::thread::current().id())),
        )
        .unwrap();
    assert!(ran_now);
    assert_eq!(*ran_on.lock().unwrap(), Some(std::thread::current().id()));

    // From another thread the work is queued for the owner
    let remote_queue = queue.clone();
    let manager_ran_now = std::thread::scope(|scope| {
        scope
            .spawn(|| {
                assert!(!remote_queue.is_current());
                env.manager.install_interception(2, remote_queue.as_ref(), Box::new(|| {})).unwrap()
            })
            .join()
            .unwrap()
    });
    assert!(!manager_ran_now);
    assert_eq!(queue.run_pending(), 1);
}

#[test]
fn context_shutdown_removes_directory() {
    let env = Env::new();
    let dir = env.temp_dir().to_path_buf();
    let host = RecordingHost::new(DropEffect::COPY);
    let session = env.session(1, host);
    session.drag_enter(data_uri_carrier("data:,bye"), KeyState::default(), Point::default(), DropEffect::COPY).unwrap();

    env.manager.context().shutdown().unwrap();
    assert!(!dir.exists());
    // Teardown after the directory is gone still succeeds
    session.cleanup_current_entry();
}

fn two_file_descriptor() -> Vec<u8> {
    const LEN: usize = 592;
    let mut data = 2u32.to_le_bytes().to_vec();
    for name in ["alpha.txt", "beta.txt"] {
        let mut fd = vec![0u8; LEN];
        let wide: Vec<u8> = name.encode_utf16().flat_map(u16::to_le_bytes).collect();
        fd[72..72 + wide.len()].copy_from_slice(&wide);
        data.extend(fd);
    }
    data
}
