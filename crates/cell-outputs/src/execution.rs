//! Cell execution controller.
//!
//! A [`CellExecution`] drives one cell through `Idle -> Running ->
//! {Succeeded, Failed}`. It starts a host execution record, sends the cell's
//! code to a [`KernelRuntime`] and turns every kernel message that arrives
//! meanwhile into output mutations on the host.
//!
//! Per-execution state lives on the controller itself:
//! - `pending_clear`: a `clear_output(wait=true)` was received and the clear
//!   happens right before the next output lands
//! - `last_stream`: the open stream accumulator. Consecutive chunks on the
//!   same channel are merged into one output and re-rendered in place. At
//!   most one accumulator is open, and any non-stream output, clear, or
//!   channel change closes it.
//!
//! Host mutations are best-effort. Their failures are logged and dropped;
//! the code ran even if the UI missed a step.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::codec::{stream_output, to_renderable};
use crate::error::{ExecutionError, HostError, RuntimeError};
use crate::host::{CellEdit, CellRef, ExecutionRecord, KernelRuntime, NotebookHost};
use crate::message::{DisplayData, ExecuteReply, KernelMessage, StreamContent};
use crate::output::{CellOutput, ErrorOutput, OutputRef, OutputType, ProtocolOutput, StreamName};
use crate::settings::ExecutionSettings;
use crate::stream_format::{drop_last_line, strip_cursor_up};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// Result of a completed execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub execution_count: Option<i64>,
    pub reply: ExecuteReply,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

/// The currently open stream output.
#[derive(Debug, Clone)]
struct StreamAccumulator {
    name: StreamName,
    /// Unformatted text received so far. Formatting always runs over the
    /// whole of it, so a `\r` or backspace may act across chunk boundaries.
    raw: String,
    /// The formatted text currently shown.
    rendered: String,
    output: OutputRef,
}

#[derive(Debug, Default)]
struct ExecutionState {
    pending_clear: bool,
    last_stream: Option<StreamAccumulator>,
    /// An error output was shown for this execution.
    saw_error: bool,
    /// A message handler failed; the execution cannot succeed.
    faulted: bool,
}

/// Executes cells of one notebook and renders their outputs.
///
/// An instance handles one execution at a time. It may be reused for later
/// executions; all per-execution state is reset at both ends of `execute`.
pub struct CellExecution<H: NotebookHost> {
    host: Arc<H>,
    settings: ExecutionSettings,
    cell: Option<CellRef>,
    record: Option<H::Execution>,
    state: ExecutionState,
    status: ExecutionStatus,
    execution_count: Option<i64>,
    /// The host record was already ended by a handler fault.
    ended: bool,
}

impl<H: NotebookHost> CellExecution<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self::with_settings(host, ExecutionSettings::default())
    }

    pub fn with_settings(host: Arc<H>, settings: ExecutionSettings) -> Self {
        Self {
            host,
            settings,
            cell: None,
            record: None,
            state: ExecutionState::default(),
            status: ExecutionStatus::Idle,
            execution_count: None,
            ended: false,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// The most recent execution count reported by the kernel.
    pub fn execution_count(&self) -> Option<i64> {
        self.execution_count
    }

    /// Run `cell` on `runtime` to completion.
    ///
    /// Kernel messages delivered through the runtime's sink are rendered as
    /// they arrive. A runtime failure (including a timeout) ends the
    /// execution as failed with an error output and is returned as
    /// [`ExecutionError::Runtime`]; output already rendered stays visible.
    pub async fn execute<R: KernelRuntime>(
        &mut self,
        runtime: &R,
        cell: CellRef,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        self.reset();

        let record = self
            .host
            .create_execution(&cell)
            .map_err(|source| ExecutionError::Start {
                cell: cell.id.clone(),
                source,
            })?;
        info!("[cell-execution] Executing cell {}", cell.id);

        let cell_id = cell.id.clone();
        let code = cell.source.clone();
        self.record = Some(record);
        self.cell = Some(cell);
        self.status = ExecutionStatus::Running;

        if let Some(record) = self.record.as_mut() {
            record.start(Utc::now());
            if self.settings.clear_output_on_start {
                log_host_failure("clear output", record.clear_output());
            }
        }

        let result = self.run_request(runtime, &code).await;

        let success = match &result {
            Ok(reply) => {
                if let Some(count) = reply.execution_count {
                    self.set_execution_count(count);
                }
                if !reply.is_ok() && !self.state.saw_error {
                    let error = reply.error().unwrap_or_else(|| {
                        ErrorOutput::from_fault(
                            "ExecutionError",
                            &format!(
                                "Cell execution finished with status '{}'",
                                reply.status.as_str()
                            ),
                        )
                    });
                    self.add_output(to_renderable(&ProtocolOutput::Error(error)), None);
                }
                reply.is_ok() && !self.state.faulted
            }
            Err(err) => {
                error!("[cell-execution] Cell {} failed: {}", cell_id, err);
                let error = ErrorOutput::from_fault(err.kind(), &err.to_string());
                self.add_output(to_renderable(&ProtocolOutput::Error(error)), None);
                false
            }
        };

        self.finish(success);
        info!(
            "[cell-execution] Cell {} finished: {:?}",
            cell_id, self.status
        );

        match result {
            Ok(reply) => Ok(ExecutionOutcome {
                status: self.status,
                execution_count: self.execution_count,
                reply,
            }),
            Err(source) => Err(ExecutionError::Runtime {
                cell: cell_id,
                source,
            }),
        }
    }

    async fn run_request<R: KernelRuntime>(
        &mut self,
        runtime: &R,
        code: &str,
    ) -> Result<ExecuteReply, RuntimeError> {
        match self.settings.ready_timeout() {
            Some(limit) => tokio::time::timeout(limit, runtime.ready())
                .await
                .map_err(|_| RuntimeError::Timeout(limit.as_secs()))??,
            None => runtime.ready().await?,
        }

        let request_timeout = self.settings.request_timeout();
        let mut sink = |message: KernelMessage| self.handle_message(message);
        let request = runtime.execute_request(code, &mut sink);
        match request_timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .map_err(|_| RuntimeError::Timeout(limit.as_secs()))?,
            None => request.await,
        }
    }

    fn reset(&mut self) {
        self.state = ExecutionState::default();
        self.cell = None;
        self.record = None;
        self.status = ExecutionStatus::Idle;
        self.execution_count = None;
        self.ended = false;
    }

    fn finish(&mut self, success: bool) {
        self.status = if success {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::Failed
        };
        if let Some(mut record) = self.record.take() {
            if !self.ended {
                record.end(success, Utc::now());
            }
        }
        self.state = ExecutionState::default();
        self.cell = None;
        self.ended = false;
    }

    /// Handle a message given as wire `msg_type` plus JSON content.
    ///
    /// Content that does not parse for its type is a handler fault.
    pub fn handle_raw_message(&mut self, msg_type: &str, content: Value) {
        if self.cell.is_none() {
            debug!(
                "[cell-execution] No cell attached, ignoring {} message",
                msg_type
            );
            return;
        }
        match KernelMessage::from_type_and_content(msg_type, content) {
            Ok(message) => self.handle_message(message),
            Err(err) => self.fault("MessageError", &err.to_string()),
        }
    }

    /// Handle one kernel message for the attached cell.
    ///
    /// Ignored when no execution is in progress. A handler that panics is
    /// reported as an error output and fails the execution.
    pub fn handle_message(&mut self, message: KernelMessage) {
        if self.cell.is_none() {
            debug!(
                "[cell-execution] No cell attached, ignoring {} message",
                message.msg_type()
            );
            return;
        }

        let execution_count = message.execution_count();
        let handled = catch_unwind(AssertUnwindSafe(|| self.dispatch(message)));
        if let Err(panic) = handled {
            self.fault("HandlerPanic", &panic_message(panic.as_ref()));
        }

        if let Some(count) = execution_count {
            self.set_execution_count(count);
        }
    }

    fn dispatch(&mut self, message: KernelMessage) {
        match message {
            KernelMessage::ExecuteResult(result) => {
                let record = ProtocolOutput::ExecuteResult {
                    data: result.data,
                    metadata: result.metadata,
                    execution_count: result.execution_count,
                    transient: result.transient,
                };
                self.add_record(&record);
            }
            KernelMessage::DisplayData(display) => {
                let record = ProtocolOutput::DisplayData {
                    data: display.data,
                    metadata: display.metadata,
                    transient: display.transient,
                };
                self.add_record(&record);
            }
            KernelMessage::Error(error) => {
                self.add_record(&ProtocolOutput::Error(error));
            }
            KernelMessage::Stream(stream) => self.handle_stream(stream),
            KernelMessage::UpdateDisplayData(update) => self.handle_update_display_data(update),
            KernelMessage::ClearOutput(clear) => {
                if clear.wait {
                    self.state.pending_clear = true;
                } else {
                    self.state.last_stream = None;
                    if let Some(record) = self.record.as_mut() {
                        log_host_failure("clear output", record.clear_output());
                    }
                }
            }
            KernelMessage::ExecuteReply(reply) => self.handle_execute_reply(reply),
            KernelMessage::ExecuteInput(_) => {}
            KernelMessage::Other { msg_type, .. } => {
                debug!("[cell-execution] Unhandled message type: {}", msg_type);
            }
        }
    }

    fn add_record(&mut self, record: &ProtocolOutput) {
        let display_id = record.display_id().map(str::to_string);
        self.add_output(to_renderable(record), display_id.as_deref());
    }

    /// Append `output` after honoring a pending clear, and register it under
    /// `display_id` if given.
    fn add_output(&mut self, output: CellOutput, display_id: Option<&str>) {
        if output.output_type() == Some(OutputType::Error) {
            self.state.saw_error = true;
        }
        let Some(cell) = self.cell.as_ref() else {
            return;
        };
        if !self.host.is_cell_open(&cell.id) {
            debug!("[cell-execution] Cell {} is closed, dropping output", cell.id);
            return;
        }
        let target = OutputRef {
            cell: cell.id.clone(),
            output: output.id,
        };
        let Some(record) = self.record.as_mut() else {
            return;
        };

        if self.state.pending_clear {
            self.state.pending_clear = false;
            log_host_failure("clear output", record.clear_output());
        }
        self.state.last_stream = None;
        log_host_failure("append output", record.append_output(vec![output]));

        if let Some(display_id) = display_id {
            let owner = target.cell.clone();
            self.host.display_ids().track(&owner, display_id, target);
        }
    }

    fn handle_stream(&mut self, stream: StreamContent) {
        let Some(cell) = self.cell.as_ref() else {
            return;
        };
        let cell_id = cell.id.clone();
        let Some(record) = self.record.as_mut() else {
            return;
        };
        let incoming = stream.text.to_text();

        let cleared = self.state.pending_clear;
        if cleared {
            self.state.pending_clear = false;
            self.state.last_stream = None;
            log_host_failure("clear output", record.clear_output());
        }

        let open = self
            .state
            .last_stream
            .as_mut()
            .filter(|last| last.name == stream.name);
        match open {
            Some(last) => {
                match strip_cursor_up(&incoming) {
                    // Only the single-line form is recognized.
                    Some(rest) => {
                        last.raw = format!("{}{}", drop_last_line(&last.rendered), rest);
                    }
                    None => last.raw.push_str(&incoming),
                }
                let rendered = stream_output(stream.name, &last.raw);
                last.rendered = rendered_text(&rendered);
                log_host_failure(
                    "replace stream output",
                    record.replace_output_items(rendered.items, &last.output),
                );
            }
            None => {
                let output = stream_output(stream.name, &incoming);
                let rendered = rendered_text(&output);
                let target = OutputRef {
                    cell: cell_id,
                    output: output.id,
                };
                let result = if cleared {
                    record.replace_output(vec![output])
                } else {
                    record.append_output(vec![output])
                };
                log_host_failure("append stream output", result);
                self.state.last_stream = Some(StreamAccumulator {
                    name: stream.name,
                    raw: incoming,
                    rendered,
                    output: target,
                });
            }
        }
    }

    fn handle_update_display_data(&mut self, update: DisplayData) {
        let Some(display_id) = update.display_id().map(str::to_string) else {
            debug!("[cell-execution] update_display_data without display_id, dropping");
            return;
        };
        let Some(target) = self.host.display_ids().resolve(&display_id) else {
            debug!(
                "[cell-execution] No output for display_id={}, dropping update",
                display_id
            );
            return;
        };
        if !self.host.is_cell_open(&target.cell) {
            debug!(
                "[cell-execution] Cell {} for display_id={} is closed, dropping update",
                target.cell, display_id
            );
            return;
        }

        let rendered = to_renderable(&ProtocolOutput::UpdateDisplayData {
            data: update.data,
            metadata: update.metadata,
            transient: update.transient,
        });
        if let Some(record) = self.record.as_mut() {
            log_host_failure(
                "update display",
                record.replace_output_items(rendered.items, &target),
            );
        }
    }

    fn handle_execute_reply(&mut self, reply: ExecuteReply) {
        for payload in &reply.payload {
            if let Some(next) = payload.set_next_input() {
                self.handle_set_next_input(next.text, next.replace);
            }
            if let Some(text) = payload.plain_text() {
                // Pager content (e.g. `?` help) usually carries ANSI codes,
                // so it is rendered as stdout.
                self.handle_stream(StreamContent {
                    name: StreamName::Stdout,
                    text: text.into(),
                });
            }
        }
    }

    fn handle_set_next_input(&mut self, text: String, replace: bool) {
        let Some(cell) = self.cell.as_ref() else {
            return;
        };
        let edit = if replace {
            CellEdit::ReplaceSource {
                cell: cell.id.clone(),
                text,
            }
        } else {
            CellEdit::InsertCodeCellAfter {
                cell: cell.id.clone(),
                text,
            }
        };
        log_host_failure("apply cell edit", self.host.apply_edit(edit));
    }

    fn set_execution_count(&mut self, count: i64) {
        self.execution_count = Some(count);
        if let Some(record) = self.record.as_mut() {
            record.set_execution_count(count);
        }
    }

    /// Surface a handler failure as an error output and end the execution
    /// as failed right away.
    fn fault(&mut self, kind: &str, message: &str) {
        error!("[cell-execution] Failed to handle kernel message: {}", message);
        self.state.faulted = true;
        self.status = ExecutionStatus::Failed;

        let output = to_renderable(&ProtocolOutput::Error(ErrorOutput::from_fault(kind, message)));
        self.state.saw_error = true;
        self.state.last_stream = None;
        if let Some(record) = self.record.as_mut() {
            log_host_failure("append error output", record.append_output(vec![output]));
            if !self.ended {
                record.end(false, Utc::now());
                self.ended = true;
            }
        }
    }
}

fn rendered_text(output: &CellOutput) -> String {
    output
        .items
        .first()
        .map(|item| item.as_text())
        .unwrap_or_default()
}

fn log_host_failure(action: &str, result: Result<(), HostError>) {
    if let Err(err) = result {
        warn!("[cell-execution] Failed to {}: {}", action, err);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "message handler panicked".to_string()
    }
}
