//! Windows OLE adapter
//!
//! Connects the platform-neutral session to real windows:
//! 1. Captures the `IDropTarget` a window registered and puts a
//!    [`WrappedDropTarget`](drop_target::WrappedDropTarget) in its place
//! 2. Wraps the drag source's `IDataObject` as a [`DataCarrier`](crate::carrier::DataCarrier)
//! 3. Serves replacement carriers back to the host as an `IDataObject`
//! 4. Runs installation work on a window's own thread through a one-shot
//!    `WH_GETMESSAGE` hook, and records right-clicks through a subclass

mod data_object;
mod dispatch;
mod drop_target;

pub use data_object::{CarrierDataObject, OleCarrier};
pub use dispatch::{install_right_click_tracking, MessageHookDispatcher};
pub use drop_target::{install_drop_target, Interception, OleHostTarget, WrappedDropTarget};

use windows::core::HSTRING;
use windows::Win32::Foundation::HWND;
use windows::Win32::System::DataExchange::RegisterClipboardFormatW;

use crate::carrier::ClipFormat;
use crate::manager::WindowId;

const CF_TEXT: u16 = 1;
const CF_DIB: u16 = 8;
const CF_UNICODETEXT: u16 = 13;
const CF_HDROP: u16 = 15;

/// Formats probed when a foreign data object is asked what it offers
const KNOWN_FORMATS: [ClipFormat; 8] = [
    ClipFormat::UnicodeText,
    ClipFormat::Text,
    ClipFormat::FileDrop,
    ClipFormat::Dib,
    ClipFormat::Png,
    ClipFormat::Jpeg,
    ClipFormat::FileGroupDescriptor,
    ClipFormat::FileContents,
];

/// Clipboard format id for `format`, registering named formats on first use
pub(crate) fn format_id(format: &ClipFormat) -> u16 {
    match format {
        ClipFormat::Text => CF_TEXT,
        ClipFormat::Dib => CF_DIB,
        ClipFormat::UnicodeText => CF_UNICODETEXT,
        ClipFormat::FileDrop => CF_HDROP,
        other => {
            let name = HSTRING::from(other.registered_name().unwrap_or_default());
            // SAFETY: name is a valid NUL-terminated wide string for the call
            unsafe { RegisterClipboardFormatW(&name) as u16 }
        }
    }
}

/// Reverse of [`format_id`] over the formats the pipeline knows
pub(crate) fn format_for_id(id: u16) -> Option<ClipFormat> {
    KNOWN_FORMATS.into_iter().find(|f| format_id(f) == id)
}

pub(crate) fn window_id(hwnd: HWND) -> WindowId {
    hwnd.0 as WindowId
}

pub(crate) fn hwnd_from_id(id: WindowId) -> HWND {
    HWND(id as *mut std::ffi::c_void)
}
