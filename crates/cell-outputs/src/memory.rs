//! In-memory notebook host.
//!
//! Holds cells, their outputs and run history behind a mutex so execution
//! records can write back into the same document. Used by the `runt` CLI
//! and by tests; a real UI host implements [`NotebookHost`] over its own
//! document model.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::debug;
use uuid::Uuid;

use crate::codec::to_protocol_record;
use crate::display_ids::DisplayIdTracker;
use crate::error::HostError;
use crate::host::{CellEdit, CellRef, ExecutionRecord, NotebookHost};
use crate::output::{CellId, CellOutput, OutputItem, OutputRef, ProtocolOutput};

/// How the most recent execution of a cell went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub success: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
}

/// A code cell snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryCell {
    pub id: CellId,
    pub source: String,
    pub outputs: Vec<CellOutput>,
    pub execution_count: Option<i64>,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_run: Option<RunSummary>,
}

impl MemoryCell {
    fn new(source: impl Into<String>) -> Self {
        Self {
            id: CellId::new(Uuid::new_v4().to_string()),
            source: source.into(),
            outputs: Vec::new(),
            execution_count: None,
            running: false,
            started_at: None,
            last_run: None,
        }
    }
}

#[derive(Default)]
struct Document {
    cells: Vec<MemoryCell>,
    /// Cells that existed once and were removed.
    removed: HashSet<CellId>,
    fail_mutations: bool,
}

impl Document {
    fn cell_mut(&mut self, id: &CellId) -> Result<&mut MemoryCell, HostError> {
        if self.removed.contains(id) {
            return Err(HostError::CellClosed(id.clone()));
        }
        self.cells
            .iter_mut()
            .find(|cell| &cell.id == id)
            .ok_or_else(|| HostError::CellNotFound(id.clone()))
    }

    fn position(&self, id: &CellId) -> Result<usize, HostError> {
        if self.removed.contains(id) {
            return Err(HostError::CellClosed(id.clone()));
        }
        self.cells
            .iter()
            .position(|cell| &cell.id == id)
            .ok_or_else(|| HostError::CellNotFound(id.clone()))
    }

    fn check_mutable(&self) -> Result<(), HostError> {
        if self.fail_mutations {
            return Err(HostError::Rejected("output mutations are disabled".into()));
        }
        Ok(())
    }
}

/// An open notebook kept entirely in memory.
///
/// Cloning is cheap and every clone refers to the same document.
#[derive(Clone, Default)]
pub struct MemoryNotebook {
    document: Arc<StdMutex<Document>>,
    display_ids: Arc<DisplayIdTracker>,
}

impl MemoryNotebook {
    pub fn new() -> Self {
        Self::default()
    }

    fn document(&self) -> MutexGuard<'_, Document> {
        self.document
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a code cell and return a handle for executing it.
    pub fn add_cell(&self, source: impl Into<String>) -> CellRef {
        let cell = MemoryCell::new(source);
        let cell_ref = CellRef::new(cell.id.clone(), cell.source.clone());
        self.document().cells.push(cell);
        cell_ref
    }

    /// Insert a code cell directly after `after`.
    pub fn insert_cell_after(
        &self,
        after: &CellId,
        source: impl Into<String>,
    ) -> Result<CellRef, HostError> {
        let mut document = self.document();
        let index = document.position(after)?;
        let cell = MemoryCell::new(source);
        let cell_ref = CellRef::new(cell.id.clone(), cell.source.clone());
        document.cells.insert(index + 1, cell);
        Ok(cell_ref)
    }

    /// Remove a cell. Display ids it registered stop resolving.
    pub fn remove_cell(&self, id: &CellId) -> Result<MemoryCell, HostError> {
        let removed = {
            let mut document = self.document();
            let index = document.position(id)?;
            let cell = document.cells.remove(index);
            document.removed.insert(id.clone());
            cell
        };
        self.display_ids.close_cell(id);
        debug!("[memory-notebook] Removed cell {}", id);
        Ok(removed)
    }

    pub fn cell(&self, id: &CellId) -> Option<MemoryCell> {
        self.document()
            .cells
            .iter()
            .find(|cell| &cell.id == id)
            .cloned()
    }

    pub fn cells(&self) -> Vec<MemoryCell> {
        self.document().cells.clone()
    }

    pub fn outputs(&self, id: &CellId) -> Vec<CellOutput> {
        self.cell(id).map(|cell| cell.outputs).unwrap_or_default()
    }

    /// The cell's outputs converted back to nbformat records, as a notebook
    /// serializer would write them.
    pub fn nbformat_outputs(&self, id: &CellId) -> Vec<ProtocolOutput> {
        self.outputs(id).iter().map(to_protocol_record).collect()
    }

    /// Make every output mutation fail, as a host whose view was disposed
    /// mid-execution would.
    pub fn set_fail_mutations(&self, fail: bool) {
        self.document().fail_mutations = fail;
    }
}

impl NotebookHost for MemoryNotebook {
    type Execution = MemoryExecution;

    fn create_execution(&self, cell: &CellRef) -> Result<MemoryExecution, HostError> {
        let mut document = self.document();
        let target = document.cell_mut(&cell.id)?;
        if target.running {
            return Err(HostError::Rejected(format!(
                "cell {} is already executing",
                cell.id
            )));
        }
        Ok(MemoryExecution {
            notebook: self.clone(),
            cell: cell.id.clone(),
        })
    }

    fn apply_edit(&self, edit: CellEdit) -> Result<(), HostError> {
        match edit {
            CellEdit::ReplaceSource { cell, text } => {
                self.document().cell_mut(&cell)?.source = text;
            }
            CellEdit::InsertCodeCellAfter { cell, text } => {
                self.insert_cell_after(&cell, text)?;
            }
        }
        Ok(())
    }

    fn is_cell_open(&self, cell: &CellId) -> bool {
        self.document().position(cell).is_ok()
    }

    fn display_ids(&self) -> &DisplayIdTracker {
        &self.display_ids
    }
}

/// Execution record writing into a [`MemoryNotebook`].
pub struct MemoryExecution {
    notebook: MemoryNotebook,
    cell: CellId,
}

impl MemoryExecution {
    fn with_cell<T>(
        &self,
        f: impl FnOnce(&mut MemoryCell) -> T,
    ) -> Result<T, HostError> {
        let mut document = self.notebook.document();
        document.cell_mut(&self.cell).map(f)
    }

    fn mutate_outputs(
        &self,
        f: impl FnOnce(&mut Vec<CellOutput>),
    ) -> Result<(), HostError> {
        let mut document = self.notebook.document();
        document.check_mutable()?;
        let cell = document.cell_mut(&self.cell)?;
        f(&mut cell.outputs);
        Ok(())
    }
}

impl ExecutionRecord for MemoryExecution {
    fn start(&mut self, at: DateTime<Utc>) {
        let _ = self.with_cell(|cell| {
            cell.running = true;
            cell.started_at = Some(at);
        });
    }

    fn end(&mut self, success: bool, at: DateTime<Utc>) {
        let _ = self.with_cell(|cell| {
            cell.running = false;
            cell.last_run = Some(RunSummary {
                success,
                started_at: cell.started_at.take(),
                ended_at: at,
            });
        });
    }

    fn set_execution_count(&mut self, count: i64) {
        let _ = self.with_cell(|cell| cell.execution_count = Some(count));
    }

    fn clear_output(&mut self) -> Result<(), HostError> {
        self.mutate_outputs(|outputs| outputs.clear())
    }

    fn append_output(&mut self, new_outputs: Vec<CellOutput>) -> Result<(), HostError> {
        self.mutate_outputs(|outputs| outputs.extend(new_outputs))
    }

    fn replace_output(&mut self, new_outputs: Vec<CellOutput>) -> Result<(), HostError> {
        self.mutate_outputs(|outputs| *outputs = new_outputs)
    }

    fn replace_output_items(
        &mut self,
        items: Vec<OutputItem>,
        target: &OutputRef,
    ) -> Result<(), HostError> {
        let mut document = self.notebook.document();
        document.check_mutable()?;
        let cell = document.cell_mut(&target.cell)?;
        let output = cell
            .outputs
            .iter_mut()
            .find(|output| output.id == target.output)
            .ok_or_else(|| HostError::OutputNotFound(target.cell.clone()))?;
        output.items = items;
        Ok(())
    }
}
