//! Game configuration consulted by the machine and its host systems.
//!
//! Games ship their configuration as a JSON document.  The fields the VM core
//! reads directly are typed; everything else is kept verbatim in `extra` and
//! can be looked up by key.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

fn default_halt_on_exception() -> bool {
    true
}

fn default_save_directory() -> PathBuf {
    PathBuf::from("saves")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Scene the machine starts in; falls back to the first archived scene.
    pub seen_start: Option<i32>,
    #[serde(default = "default_halt_on_exception")]
    pub halt_on_exception: bool,
    #[serde(default = "default_save_directory")]
    pub save_directory: PathBuf,
    pub message_no_wait: bool,
    pub window_subtitle: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            seen_start: None,
            halt_on_exception: default_halt_on_exception(),
            save_directory: default_save_directory(),
            message_no_wait: false,
            window_subtitle: String::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl GameConfig {
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&source)
    }

    /// Integer value of an untyped key.
    pub fn get_int(&self, key: &str) -> Option<i32> {
        self.extra
            .get(key)
            .and_then(Value::as_i64)
            .and_then(|value| i32::try_from(value).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
