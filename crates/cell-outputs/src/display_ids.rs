//! Display-id tracking for in-place output updates.
//!
//! A kernel can tag a rich output with `transient.display_id` and later send
//! `update_display_data` for that id, possibly while a different cell is
//! running. The tracker maps each display id to the output most recently
//! rendered with it.
//!
//! One tracker belongs to one open notebook and lives exactly as long as it.
//! It is only a cross-reference: the host owns cells and outputs, and closing
//! a cell invalidates its entries here rather than the other way round.

use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, MutexGuard};

use log::debug;

use crate::output::{CellId, OutputRef};

#[derive(Default)]
struct Registry {
    /// display_id -> most recently tracked output
    outputs: HashMap<String, OutputRef>,
    /// cell -> the display id it most recently registered
    cell_display_ids: HashMap<CellId, String>,
}

/// Per-notebook map from display id to rendered output.
///
/// Writers may be any cell's execution. When two cells claim the same id
/// the most recent `track` wins.
#[derive(Default)]
pub struct DisplayIdTracker {
    registry: StdMutex<Registry>,
}

impl DisplayIdTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // The registry holds plain maps, so a panic mid-update cannot leave
        // it half-written in a way later lookups would trip over.
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `output` (owned by `cell`) under `display_id`, replacing any
    /// previous registration of that id.
    pub fn track(&self, cell: &CellId, display_id: &str, output: OutputRef) {
        debug!(
            "[display-ids] Tracking display_id={} -> cell {} output {}",
            display_id, cell, output.output
        );
        let mut registry = self.registry();
        registry.outputs.insert(display_id.to_string(), output);
        registry
            .cell_display_ids
            .insert(cell.clone(), display_id.to_string());
    }

    /// The output currently registered for `display_id`.
    ///
    /// Entries whose cell has been closed are gone, so this never returns a
    /// stale output.
    pub fn resolve(&self, display_id: &str) -> Option<OutputRef> {
        self.registry().outputs.get(display_id).cloned()
    }

    /// The display id `cell` most recently registered.
    pub fn display_id_for_cell(&self, cell: &CellId) -> Option<String> {
        self.registry().cell_display_ids.get(cell).cloned()
    }

    /// Invalidate every entry owned by `cell`. Called by the host when a cell
    /// is closed or removed.
    pub fn close_cell(&self, cell: &CellId) {
        let mut registry = self.registry();
        registry.outputs.retain(|_, output| &output.cell != cell);
        registry.cell_display_ids.remove(cell);
    }

    /// Number of live display ids.
    pub fn len(&self) -> usize {
        self.registry().outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
