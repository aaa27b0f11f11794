//! Pipeline configuration
//!
//! Loaded once at plugin-load time and shared read-only through the
//! [`DropContext`](crate::context::DropContext). Every field has a default, so
//! a partial (or missing) JSON file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DropError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DropConfig {
    /// Directory name prefix; the process id is appended to it
    #[serde(default = "default_temp_prefix")]
    pub temp_prefix: String,
    /// Parent of the per-process directory (system temp dir if unset)
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
    #[serde(default = "default_placeholder_name")]
    pub placeholder_name: String,
    #[serde(default = "default_text_file_name")]
    pub text_file_name: String,
    #[serde(default = "default_bitmap_file_name")]
    pub bitmap_file_name: String,
    #[serde(default = "default_png_file_name")]
    pub png_file_name: String,
    #[serde(default = "default_jpeg_file_name")]
    pub jpeg_file_name: String,
    /// Replay Leave/Enter/Over against the host right before a Drop
    #[serde(default = "default_true")]
    pub replay_on_drop: bool,
    /// Run the `convert` hook on every drop, not only when the carrier asks
    #[serde(default)]
    pub convert_on_drop: bool,
    #[serde(default = "default_true")]
    pub sweep_stale_on_init: bool,
}

fn default_temp_prefix() -> String {
    "droppipe".to_string()
}

fn default_placeholder_name() -> String {
    "placeholder.txt".to_string()
}

fn default_text_file_name() -> String {
    "text.txt".to_string()
}

fn default_bitmap_file_name() -> String {
    "image.bmp".to_string()
}

fn default_png_file_name() -> String {
    "image.png".to_string()
}

fn default_jpeg_file_name() -> String {
    "image.jpg".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for DropConfig {
    fn default() -> Self {
        Self {
            temp_prefix: default_temp_prefix(),
            temp_root: None,
            placeholder_name: default_placeholder_name(),
            text_file_name: default_text_file_name(),
            bitmap_file_name: default_bitmap_file_name(),
            png_file_name: default_png_file_name(),
            jpeg_file_name: default_jpeg_file_name(),
            replay_on_drop: true,
            convert_on_drop: false,
            sweep_stale_on_init: true,
        }
    }
}

impl DropConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("[Config] {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&content)
    }

    pub fn parse(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| DropError::Config(e.to_string()))?;
        if config.temp_prefix.is_empty() || config.temp_prefix.contains(&['/', '\\'][..]) {
            return Err(DropError::Config(format!(
                "temp_prefix must be a plain directory name, got {:?}",
                config.temp_prefix
            )));
        }
        Ok(config)
    }

    /// The directory under which per-process directories are created
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}
