//! Parse and normalization anomalies. Every one is attached to the image; none is dropped.

use crate::parser::ArtifactKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Expected plugin contributed nothing (tool failure, timeout, not run).
    MissingPlugin { plugin: String },
    /// No header line within the lookahead; the plugin's output was not parsed.
    HeaderNotFound { plugin: String, scanned_lines: usize },
    /// Row kept with absent cells.
    MalformedRow {
        plugin: String,
        line: usize,
        expected_columns: usize,
        found_columns: usize,
    },
    /// Line skipped: it could not be split into cells.
    UnparseableLine { plugin: String, line: usize },
    /// Output ended mid-row; the partial row is kept with absent cells.
    TruncatedOutput {
        plugin: String,
        line: usize,
        found_columns: usize,
    },
    /// A present cell could not be converted to its type; the row is kept.
    InvalidValue {
        plugin: String,
        line: usize,
        column: String,
        value: String,
    },
    /// Artifact whose owning pid does not resolve; kept on the image.
    OrphanReference {
        plugin: String,
        line: usize,
        artifact: ArtifactKind,
        pid: Option<u32>,
    },
    /// Same pid, different create time, different ppid or name: kept as two processes.
    AmbiguousProcessIdentity {
        plugin: String,
        line: usize,
        pid: u32,
        existing: Option<String>,
        reported: Option<String>,
    },
}

impl Warning {
    pub fn plugin(&self) -> &str {
        match self {
            Warning::MissingPlugin { plugin }
            | Warning::HeaderNotFound { plugin, .. }
            | Warning::MalformedRow { plugin, .. }
            | Warning::UnparseableLine { plugin, .. }
            | Warning::TruncatedOutput { plugin, .. }
            | Warning::InvalidValue { plugin, .. }
            | Warning::OrphanReference { plugin, .. }
            | Warning::AmbiguousProcessIdentity { plugin, .. } => plugin,
        }
    }

    pub fn is_orphan(&self) -> bool {
        matches!(self, Warning::OrphanReference { .. })
    }

    /// Short discriminator, same as the serialized `kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Warning::MissingPlugin { .. } => "missing_plugin",
            Warning::HeaderNotFound { .. } => "header_not_found",
            Warning::MalformedRow { .. } => "malformed_row",
            Warning::UnparseableLine { .. } => "unparseable_line",
            Warning::TruncatedOutput { .. } => "truncated_output",
            Warning::InvalidValue { .. } => "invalid_value",
            Warning::OrphanReference { .. } => "orphan_reference",
            Warning::AmbiguousProcessIdentity { .. } => "ambiguous_process_identity",
        }
    }
}
