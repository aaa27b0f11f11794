//! Process-scoped state
//!
//! One [`DropContext`] is created when the plugin loads and handed to every
//! session. It owns the configuration and the temporary directory, and
//! removes that directory when shut down (or dropped).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::DropConfig;
use crate::error::Result;
use crate::temp_files::TempFileManager;

pub struct DropContext {
    config: DropConfig,
    temp_files: TempFileManager,
    shut_down: AtomicBool,
}

impl DropContext {
    /// Create the temporary directory and, if configured, sweep the ones
    /// crashed instances left behind.
    pub fn init(config: DropConfig) -> Result<Arc<Self>> {
        let temp_files = TempFileManager::new(config.temp_root(), &config.temp_prefix);
        Self::with_temp_files(config, temp_files)
    }

    /// Like [`init`](Self::init) with an explicit manager
    pub fn with_temp_files(config: DropConfig, temp_files: TempFileManager) -> Result<Arc<Self>> {
        temp_files.create_directory()?;
        if config.sweep_stale_on_init {
            match temp_files.cleanup_stale_directories(|path| {
                log::debug!("[Context] swept {}", path.display());
            }) {
                Ok(0) => {}
                Ok(n) => log::info!("[Context] removed {} stale temp director(y/ies)", n),
                Err(e) => log::warn!("[Context] stale directory sweep failed: {}", e),
            }
        }
        log::info!("[Context] initialized, temp dir {}", temp_files.dir().display());
        Ok(Arc::new(Self {
            config,
            temp_files,
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &DropConfig {
        &self.config
    }

    pub fn temp_files(&self) -> &TempFileManager {
        &self.temp_files
    }

    /// Remove the temporary directory. Only the first call does anything.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("[Context] shutting down");
        self.temp_files.remove_directory()
    }
}

impl Drop for DropContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("[Context] cleanup on drop failed: {}", e);
        }
    }
}
