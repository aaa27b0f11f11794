//! Session registry
//!
//! [`DropManager`] maps windows to their [`DropSession`]s, remembers where
//! the last right-click happened, and runs per-window installation work on
//! the thread that owns the window.
//!
//! The registry lock only guards the map. Sessions are cloned out of it
//! before anything is called on them.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use crate::carrier::{DropFlags, MemoryCarrier};
use crate::context::DropContext;
use crate::error::{DropError, Result};
use crate::file_list::FileList;
use crate::session::{DropEffect, DropSession, KeyState, Point};

/// Native window handle value
pub type WindowId = isize;

/// Work handed to another thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs closures on the thread that owns a window.
pub trait ThreadDispatcher: Send + Sync {
    /// Whether the caller already is that thread
    fn is_current(&self) -> bool;

    /// Queue `task` to run the next time the thread is idle. There is no
    /// guarantee it ever runs: a thread that exits first drops it.
    fn post(&self, task: Task) -> Result<()>;
}

/// A [`ThreadDispatcher`] for a thread that drains the queue from its own
/// event loop via [`run_pending`](TaskQueue::run_pending).
pub struct TaskQueue {
    owner: ThreadId,
    tasks: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    /// Queue owned by the calling thread
    pub fn new() -> Self {
        Self {
            owner: std::thread::current().id(),
            tasks: Mutex::new(VecDeque::new()),
        }
    }

    /// Run everything queued so far. Only the owning thread runs tasks;
    /// elsewhere this returns 0.
    pub fn run_pending(&self) -> usize {
        if !self.is_current() {
            return 0;
        }
        let pending: Vec<Task> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => return 0,
        };
        let count = pending.len();
        for task in pending {
            task();
        }
        count
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadDispatcher for TaskQueue {
    fn is_current(&self) -> bool {
        std::thread::current().id() == self.owner
    }

    fn post(&self, task: Task) -> Result<()> {
        self.tasks
            .lock()
            .map_err(|_| DropError::InvalidArgument("task queue poisoned".to_string()))?
            .push_back(task);
        Ok(())
    }
}

/// Last right-click seen on any registered window. Advisory only.
#[derive(Default)]
pub struct RightClickTracker {
    last: Mutex<Option<(WindowId, Point)>>,
}

impl RightClickTracker {
    pub fn record(&self, window: WindowId, point: Point) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some((window, point));
        }
    }

    pub fn last(&self) -> Option<(WindowId, Point)> {
        self.last.lock().ok().and_then(|last| *last)
    }

    pub fn forget(&self, window: WindowId) {
        if let Ok(mut last) = self.last.lock() {
            if matches!(*last, Some((w, _)) if w == window) {
                *last = None;
            }
        }
    }
}

pub struct DropManager {
    context: Arc<DropContext>,
    sessions: Mutex<HashMap<WindowId, Arc<DropSession>>>,
    right_click: RightClickTracker,
}

impl DropManager {
    pub fn new(context: Arc<DropContext>) -> Self {
        Self {
            context,
            sessions: Mutex::new(HashMap::new()),
            right_click: RightClickTracker::default(),
        }
    }

    pub fn context(&self) -> &Arc<DropContext> {
        &self.context
    }

    /// Register `session` for `window`. A window has at most one session.
    pub fn register(&self, window: WindowId, session: DropSession) -> Result<Arc<DropSession>> {
        let session = Arc::new(session);
        let mut sessions = self.registry()?;
        if sessions.contains_key(&window) {
            return Err(DropError::InvalidArgument(format!("window {window:#x} already registered")));
        }
        sessions.insert(window, session.clone());
        log::info!("[DropManager] registered window {:#x}", window);
        Ok(session)
    }

    /// Remove the window's session and release whatever its current drag
    /// holds. Returns the session if there was one.
    pub fn unregister(&self, window: WindowId) -> Option<Arc<DropSession>> {
        let session = self.registry().ok()?.remove(&window)?;
        session.cleanup_current_entry();
        self.right_click.forget(window);
        log::info!("[DropManager] unregistered window {:#x}", window);
        Some(session)
    }

    pub fn session(&self, window: WindowId) -> Option<Arc<DropSession>> {
        self.registry().ok()?.get(&window).cloned()
    }

    pub fn windows(&self) -> Vec<WindowId> {
        self.registry().map(|s| s.keys().copied().collect()).unwrap_or_default()
    }

    /// Drop `files` onto `window` as if the user had dragged them there.
    /// A host that refuses the drag (effect NONE) gets a Drag-Leave instead
    /// of the Drop.
    pub fn inject(
        &self,
        window: WindowId,
        files: &FileList,
        point: Point,
        key_state: KeyState,
        convert: bool,
    ) -> Result<DropEffect> {
        if files.is_empty() {
            return Err(DropError::InvalidArgument("nothing to inject".to_string()));
        }
        let session = self.session(window).ok_or(DropError::NotFound)?;
        let paths: Vec<&Path> = files.paths().collect();
        let carrier = MemoryCarrier::new()
            .with_paths(&paths)
            .with_flags(DropFlags {
                convert,
                from_external_api: true,
            })
            .into_carrier();
        let allowed = DropEffect::COPY | DropEffect::MOVE | DropEffect::LINK;
        log::debug!("[DropManager] injecting {} file(s) into {:#x}", files.len(), window);

        let effect = session.drag_enter(carrier.clone(), key_state, point, allowed)?;
        if effect.is_none() {
            session.drag_leave()?;
            return Ok(DropEffect::NONE);
        }
        let effect = session.drag_over(key_state, point, allowed)?;
        if effect.is_none() {
            session.drag_leave()?;
            return Ok(DropEffect::NONE);
        }
        session.drop_data(carrier, key_state, point, effect)
    }

    /// Run `install` on the window's own thread: right away when called
    /// from it, otherwise the next time that thread is idle. Returns whether
    /// it already ran.
    pub fn install_interception(
        &self,
        window: WindowId,
        dispatcher: &dyn ThreadDispatcher,
        install: Task,
    ) -> Result<bool> {
        if dispatcher.is_current() {
            install();
            return Ok(true);
        }
        log::debug!("[DropManager] deferring installation on {:#x} to its thread", window);
        dispatcher.post(install)?;
        Ok(false)
    }

    pub fn record_right_click(&self, window: WindowId, point: Point) {
        self.right_click.record(window, point);
    }

    /// Where the last right-click on a registered window happened
    pub fn right_click_position(&self) -> Option<(WindowId, Point)> {
        self.right_click.last()
    }

    fn registry(&self) -> Result<std::sync::MutexGuard<'_, HashMap<WindowId, Arc<DropSession>>>> {
        self.sessions
            .lock()
            .map_err(|_| DropError::InvalidArgument("session registry poisoned".to_string()))
    }
}

impl Drop for DropManager {
    fn drop(&mut self) {
        let sessions: Vec<_> = match self.sessions.get_mut() {
            Ok(sessions) => sessions.drain().map(|(_, s)| s).collect(),
            Err(_) => return,
        };
        for session in sessions {
            session.cleanup_current_entry();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_task_queue_runs_on_owner_only() {
        let queue = Arc::new(TaskQueue::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        queue.post(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        let remote = queue.clone();
        let ran_elsewhere = std::thread::spawn(move || remote.run_pending()).join().unwrap();
        assert_eq!(ran_elsewhere, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(queue.run_pending(), 0);
    }

    #[test]
    fn test_right_click_tracker() {
        let tracker = RightClickTracker::default();
        assert!(tracker.last().is_none());
        tracker.record(1, Point::new(10, 20));
        tracker.record(2, Point::new(30, 40));
        assert_eq!(tracker.last(), Some((2, Point::new(30, 40))));
        tracker.forget(1);
        assert!(tracker.last().is_some());
        tracker.forget(2);
        assert!(tracker.last().is_none());
    }
}
