//! Plugin runner: one extraction-tool plugin against one dump, as an isolated subprocess.
//! Failures never cross this boundary; they are encoded in [`PluginResult::error`].

mod cancel;
mod subprocess;

pub use cancel::CancelToken;
pub use subprocess::PluginRunner;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Raw outcome of one plugin invocation. Immutable once produced.
#[derive(Debug, Clone)]
pub struct PluginResult {
    pub plugin: String,
    pub dump_id: String,
    pub raw_output: String,
    pub stderr: String,
    /// Process exit code; `None` when the tool never ran or died by signal
    pub exit_status: Option<i32>,
    /// Wall-clock time, diagnostics only
    pub duration: Duration,
    pub error: Option<ToolError>,
}

impl PluginResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Result for a plugin that produced output through some other channel (fixtures, replay).
    pub fn from_output(plugin: impl Into<String>, dump_id: impl Into<String>, raw_output: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            dump_id: dump_id.into(),
            raw_output: raw_output.into(),
            stderr: String::new(),
            exit_status: Some(0),
            duration: Duration::ZERO,
            error: None,
        }
    }

    pub(crate) fn failed(plugin: &str, dump_id: &str, error: ToolError, duration: Duration) -> Self {
        Self {
            plugin: plugin.to_string(),
            dump_id: dump_id.to_string(),
            raw_output: String::new(),
            stderr: String::new(),
            exit_status: None,
            duration,
            error: Some(error),
        }
    }
}

/// Tool invocation failure, recorded per plugin; the run continues with a gap.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolError {
    #[error("tool not found: {program}")]
    NotFound { program: String },

    #[error("failed to start tool: {message}")]
    Spawn { message: String },

    #[error("tool exited with status {code}: {stderr_tail}")]
    NonZeroExit { code: i32, stderr_tail: String },

    #[error("tool terminated by signal")]
    Killed,

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("output is not valid UTF-8")]
    InvalidEncoding,

    #[error("I/O error: {message}")]
    Io { message: String },
}
