//! Controller configuration loaded from TOML
//!
//! # Example TOML
//! ```toml
//! backend = "injection"
//! request_timeout_ms = 2000
//! worker_queue_capacity = 32
//! functions = ["workload.fib", "workload.checksum"]
//! ```

use crate::backend::BackendPreference;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Settings for a tracing controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracerConfig {
    /// Which backend the control surface may select
    pub backend: BackendPreference,

    /// How long a blocking stop waits for the traced process
    pub request_timeout_ms: u64,

    /// Request queue depth of the threaded transport
    pub worker_queue_capacity: usize,

    /// Functions to watch when none are given on the command line
    pub functions: Vec<String>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            request_timeout_ms: 5_000,
            worker_queue_capacity: 64,
            functions: Vec::new(),
        }
    }
}

impl TracerConfig {
    /// Load from a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is not a valid config.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))
    }

    /// Parse from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML tracer config")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
