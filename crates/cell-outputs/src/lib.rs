//! cell-outputs - Render Jupyter kernel messages as notebook cell outputs.
//!
//! The crate turns the message stream of one cell execution (`stream`,
//! `execute_result`, `display_data`, `update_display_data`, `clear_output`,
//! `error`, `execute_reply`) into an ordered list of rendered outputs on a
//! notebook host, and converts rendered outputs back into nbformat records
//! when the notebook is saved.
//!
//! - [`codec`]: protocol output records <-> rendered `(mime, bytes)` outputs
//! - [`stream_format`]: carriage-return / backspace handling for stream text
//! - [`display_ids`]: per-notebook display-id registry for in-place updates
//! - [`execution`]: the per-cell execution controller
//! - [`host`]: traits for the notebook document model and the kernel runtime
//! - [`memory`], [`replay`]: an in-memory notebook and a recorded kernel

pub mod codec;
pub mod display_ids;
pub mod error;
pub mod execution;
pub mod host;
pub mod memory;
pub mod message;
pub mod mime;
pub mod output;
pub mod replay;
pub mod settings;
pub mod stream_format;

pub use codec::{to_protocol_record, to_renderable};
pub use display_ids::DisplayIdTracker;
pub use error::{ExecutionError, HostError, MessageError, RuntimeError, SettingsError};
pub use execution::{CellExecution, ExecutionOutcome, ExecutionStatus};
pub use host::{CellEdit, CellRef, ExecutionRecord, KernelRuntime, NotebookHost};
pub use memory::MemoryNotebook;
pub use message::KernelMessage;
pub use output::{CellId, CellOutput, OutputItem, OutputMetadata, ProtocolOutput};
pub use replay::RecordedKernel;
pub use settings::ExecutionSettings;
