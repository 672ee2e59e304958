//! Error types for each seam of the crate.

use crate::output::CellId;

/// Failure converting a single output value.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A message whose content does not match its `msg_type`.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed {msg_type} content: {source}")]
    Content {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure reported by the notebook host for a mutation or edit.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("cell not found: {0}")]
    CellNotFound(CellId),

    #[error("output not found in cell {0}")]
    OutputNotFound(CellId),

    #[error("cell {0} is closed")]
    CellClosed(CellId),

    #[error("host rejected the request: {0}")]
    Rejected(String),
}

/// Failure of the kernel runtime to complete an execute request.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("kernel is not ready: {0}")]
    NotReady(String),

    #[error("kernel did not respond within {0} seconds")]
    Timeout(u64),

    #[error("kernel request failed: {0}")]
    Request(String),

    #[error("replay line {line}: {message}")]
    Replay { line: usize, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Short name used as `ename` when the failure is shown in a cell.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::NotReady(_) => "KernelNotReady",
            RuntimeError::Timeout(_) => "KernelTimeout",
            RuntimeError::Request(_) => "KernelRequestError",
            RuntimeError::Replay { .. } => "ReplayError",
            RuntimeError::Io(_) => "IOError",
        }
    }
}

/// Terminal failure of a cell execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("could not start execution of cell {cell}: {source}")]
    Start {
        cell: CellId,
        #[source]
        source: HostError,
    },

    #[error("execution of cell {cell} failed: {source}")]
    Runtime {
        cell: CellId,
        #[source]
        source: RuntimeError,
    },
}

/// Failure loading execution settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),
}
