//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// How script objects without a dedicated wire tag travel to the host
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectMarshal {
    /// Pin the object and hand out a `WrappedRef`
    #[default]
    Wrapped,
    /// Copy plain objects as an array of `[name, value]` pairs
    Dictionary,
}

impl ObjectMarshal {
    /// Numeric selector used by the C surface (0 = wrapped, 1 = dictionary)
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ObjectMarshal::Wrapped),
            1 => Some(ObjectMarshal::Dictionary),
            _ => None,
        }
    }
}

/// Per-engine settings, fixed at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub object_marshal: ObjectMarshal,
    /// Heap limit in bytes
    pub memory_limit: Option<usize>,
    /// Native stack limit in bytes
    pub max_stack_size: Option<usize>,
    /// Allocation threshold that triggers a collection
    pub gc_threshold: Option<usize>,
    /// Nesting limit for dictionary marshalling
    pub max_marshal_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            object_marshal: ObjectMarshal::Wrapped,
            memory_limit: None,
            max_stack_size: None,
            gc_threshold: None,
            max_marshal_depth: 32,
        }
    }
}

impl EngineConfig {
    pub fn with_object_marshal(mut self, marshal: ObjectMarshal) -> Self {
        self.object_marshal = marshal;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
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

    #[error("invalid engine config: {0}")]
    Parse(#[from] serde_json::Error),
}
