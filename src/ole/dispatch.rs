//! Work on another thread's message loop, and right-click tracking
//!
//! Windows has no "run this on thread T" call. A `WH_GETMESSAGE` hook bound
//! to T runs inside T the next time it pulls a message, so posting a task
//! installs such a hook, wakes T with `WM_NULL`, and the hook unhooks itself
//! after running everything queued for T.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, POINT, WPARAM};
use windows::Win32::Graphics::Gdi::ClientToScreen;
use windows::Win32::System::Threading::GetCurrentThreadId;
use windows::Win32::UI::Shell::{DefSubclassProc, RemoveWindowSubclass, SetWindowSubclass};
use windows::Win32::UI::WindowsAndMessaging::{
    CallNextHookEx, GetWindowThreadProcessId, PostThreadMessageW, SetWindowsHookExW, UnhookWindowsHookEx,
    HHOOK, WH_GETMESSAGE, WM_NCDESTROY, WM_NULL, WM_RBUTTONDOWN,
};

use super::{hwnd_from_id, window_id};
use crate::error::{DropError, Result};
use crate::manager::{DropManager, Task, ThreadDispatcher};
use crate::session::Point;

const RIGHT_CLICK_SUBCLASS_ID: usize = 0x6470_7263;

struct PendingHook {
    hook: isize,
    tasks: Vec<Task>,
}

lazy_static::lazy_static! {
    /// Tasks waiting for each thread's one-shot hook, keyed by thread id
    static ref PENDING: Mutex<HashMap<u32, PendingHook>> = Mutex::new(HashMap::new());
}

/// Dispatcher for the thread that owns a window
pub struct MessageHookDispatcher {
    thread_id: u32,
}

impl MessageHookDispatcher {
    pub fn for_window(hwnd: HWND) -> Self {
        let thread_id = unsafe { GetWindowThreadProcessId(hwnd, None) };
        Self { thread_id }
    }
}

impl ThreadDispatcher for MessageHookDispatcher {
    fn is_current(&self) -> bool {
        unsafe { GetCurrentThreadId() == self.thread_id }
    }

    fn post(&self, task: Task) -> Result<()> {
        let mut pending = PENDING
            .lock()
            .map_err(|_| DropError::InvalidArgument("pending hook table poisoned".to_string()))?;
        if let Some(entry) = pending.get_mut(&self.thread_id) {
            entry.tasks.push(task);
            return Ok(());
        }

        let hook = unsafe { SetWindowsHookExW(WH_GETMESSAGE, Some(run_pending_tasks), None, self.thread_id) }
            .map_err(|e| DropError::HostProtocolFailure(format!("SetWindowsHookExW: {e}")))?;
        pending.insert(
            self.thread_id,
            PendingHook {
                hook: hook.0 as isize,
                tasks: vec![task],
            },
        );
        drop(pending);

        // A thread sitting in GetMessage needs something to pull
        if let Err(e) = unsafe { PostThreadMessageW(self.thread_id, WM_NULL, WPARAM(0), LPARAM(0)) } {
            log::debug!("[Windows] could not wake thread {}: {}", self.thread_id, e);
        }
        Ok(())
    }
}

unsafe extern "system" fn run_pending_tasks(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    let entry = PENDING
        .lock()
        .ok()
        .and_then(|mut pending| pending.remove(&GetCurrentThreadId()));
    if let Some(entry) = entry {
        let _ = UnhookWindowsHookEx(HHOOK(entry.hook as *mut std::ffi::c_void));
        for task in entry.tasks {
            task();
        }
    }
    CallNextHookEx(None, code, wparam, lparam)
}

/// Record right-clicks on `hwnd` in `manager`. The subclass is installed on
/// the window's own thread; returns whether that already happened.
pub fn install_right_click_tracking(hwnd: HWND, manager: Arc<DropManager>) -> Result<bool> {
    let id = window_id(hwnd);
    let dispatcher = MessageHookDispatcher::for_window(hwnd);
    let sink = manager.clone();
    manager.install_interception(
        id,
        &dispatcher,
        Box::new(move || {
            let hwnd = hwnd_from_id(id);
            let data = Arc::into_raw(sink) as usize;
            let ok = unsafe { SetWindowSubclass(hwnd, Some(right_click_proc), RIGHT_CLICK_SUBCLASS_ID, data) };
            if ok.as_bool() {
                log::debug!("[Windows] right-click tracking on {:?}", hwnd);
            } else {
                log::warn!("[Windows] SetWindowSubclass failed on {:?}", hwnd);
                // SAFETY: the subclass did not take the reference
                drop(unsafe { Arc::from_raw(data as *const DropManager) });
            }
        }),
    )
}

unsafe extern "system" fn right_click_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
    _id: usize,
    data: usize,
) -> LRESULT {
    let manager = data as *const DropManager;
    match msg {
        WM_RBUTTONDOWN => {
            let mut pt = POINT {
                x: (lparam.0 & 0xFFFF) as i16 as i32,
                y: ((lparam.0 >> 16) & 0xFFFF) as i16 as i32,
            };
            let _ = ClientToScreen(hwnd, &mut pt);
            (*manager).record_right_click(window_id(hwnd), Point::new(pt.x, pt.y));
        }
        WM_NCDESTROY => {
            let _ = RemoveWindowSubclass(hwnd, Some(right_click_proc), RIGHT_CLICK_SUBCLASS_ID);
            drop(Arc::from_raw(manager));
        }
        _ => {}
    }
    DefSubclassProc(hwnd, msg, wparam, lparam)
}
