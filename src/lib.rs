//! Drag-and-drop interception and file materialization.
//!
//! Drag sources hand out their content in many shapes (`data:` URIs,
//! registered image formats, virtual files, bitmaps, plain text). Hosts
//! that only understand file paths get those materialized as real files
//! in a per-process temporary directory, listed in a replacement carrier.
//!
//! Entry points:
//! - [`DropContext::init`] once at load time
//! - [`DropManager`] to register a [`DropSession`] per window
//! - `ole::install_drop_target` on Windows to hook a real window

pub mod carrier;
pub mod config;
pub mod context;
pub mod data_uri;
pub mod encoding;
pub mod error;
pub mod extract;
pub mod file_list;
pub mod hooks;
pub mod manager;
pub mod sanitize;
pub mod session;
pub mod sniff;
pub mod temp_files;
pub mod transfer;

#[cfg(target_os = "windows")]
pub mod ole;

pub use carrier::{Carrier, ClipFormat, DataCarrier, DropFlags, MemoryCarrier, ReplacementCarrier};
pub use config::DropConfig;
pub use context::DropContext;
pub use data_uri::DataUri;
pub use error::{DropError, HookError, RelocateError, Result};
pub use extract::ExtractionPipeline;
pub use file_list::{FileEntry, FileList};
pub use hooks::{FileRelocator, NoopHooks, ScriptHooks};
pub use manager::{DropManager, TaskQueue, ThreadDispatcher, WindowId};
pub use session::{DropEffect, DropSession, HostDropTarget, KeyState, Point};
pub use sniff::{sniff, Sniffed};
pub use temp_files::TempFileManager;
pub use transfer::TransferSource;
