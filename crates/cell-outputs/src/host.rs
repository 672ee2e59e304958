//! Collaborator seams of a cell execution.
//!
//! - [`NotebookHost`] / [`ExecutionRecord`]: the document model that owns
//!   cells and their outputs.
//! - [`KernelRuntime`]: whatever actually runs code and emits kernel messages.
//!
//! Output mutations return `Result` so failures stay visible, but callers
//! treat them as best-effort: a failed render step is logged, never fatal.

use chrono::{DateTime, Utc};

use crate::display_ids::DisplayIdTracker;
use crate::error::{HostError, RuntimeError};
use crate::message::{ExecuteReply, KernelMessage};
use crate::output::{CellId, CellOutput, OutputItem, OutputRef};

/// A code cell as handed to an execution: its id and the text to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellRef {
    pub id: CellId,
    pub source: String,
}

impl CellRef {
    pub fn new(id: impl Into<CellId>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
        }
    }
}

/// Text edit requested by a kernel through a `set_next_input` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellEdit {
    /// Replace the whole source of `cell`.
    ReplaceSource { cell: CellId, text: String },
    /// Insert a new code cell holding `text` directly after `cell`.
    InsertCodeCellAfter { cell: CellId, text: String },
}

/// One execution of one cell, as tracked by the host.
pub trait ExecutionRecord {
    fn start(&mut self, at: DateTime<Utc>);

    fn end(&mut self, success: bool, at: DateTime<Utc>);

    fn set_execution_count(&mut self, count: i64);

    fn clear_output(&mut self) -> Result<(), HostError>;

    fn append_output(&mut self, outputs: Vec<CellOutput>) -> Result<(), HostError>;

    /// Replace every output of the cell with `outputs`.
    fn replace_output(&mut self, outputs: Vec<CellOutput>) -> Result<(), HostError>;

    /// Replace the items of one existing output, which may belong to a
    /// different cell than the one being executed.
    fn replace_output_items(
        &mut self,
        items: Vec<OutputItem>,
        target: &OutputRef,
    ) -> Result<(), HostError>;
}

/// The notebook document model.
pub trait NotebookHost {
    type Execution: ExecutionRecord;

    fn create_execution(&self, cell: &CellRef) -> Result<Self::Execution, HostError>;

    fn apply_edit(&self, edit: CellEdit) -> Result<(), HostError>;

    /// Whether `cell` still exists in the open notebook.
    fn is_cell_open(&self, cell: &CellId) -> bool;

    /// The display-id registry scoped to this notebook.
    fn display_ids(&self) -> &DisplayIdTracker;
}

/// A kernel that can run code.
///
/// Messages produced while a request runs are handed to `on_message` in
/// arrival order; the returned future resolves with the `execute_reply`.
#[allow(async_fn_in_trait)]
pub trait KernelRuntime {
    /// Wait until the kernel can accept requests.
    async fn ready(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn execute_request(
        &self,
        code: &str,
        on_message: &mut dyn FnMut(KernelMessage),
    ) -> Result<ExecuteReply, RuntimeError>;
}
