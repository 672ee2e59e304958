//! A kernel runtime that replays a recorded session.
//!
//! Sessions are JSON lines, one kernel message per line, in the shape the
//! Jupyter wire protocol uses:
//!
//! ```text
//! {"header": {"msg_type": "stream"}, "content": {"name": "stdout", "text": "hi\n"}}
//! {"header": {"msg_type": "execute_reply"}, "content": {"status": "ok", "execution_count": 1}}
//! ```
//!
//! Extra envelope fields (`parent_header`, `metadata`, `buffers`, ...) are
//! ignored, so captures from a real kernel replay as-is.

use std::path::Path;

use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;

use crate::error::RuntimeError;
use crate::host::KernelRuntime;
use crate::message::{ExecuteReply, KernelMessage};

#[derive(Debug, Deserialize)]
struct WireHeader {
    msg_type: String,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    header: WireHeader,
    #[serde(default)]
    content: Value,
}

/// Kernel runtime backed by a recorded message log.
#[derive(Debug, Clone, Default)]
pub struct RecordedKernel {
    messages: Vec<KernelMessage>,
}

impl RecordedKernel {
    pub fn new(messages: Vec<KernelMessage>) -> Self {
        Self { messages }
    }

    /// Parse a JSON-lines session. Blank lines are skipped; line numbers in
    /// errors are 1-based.
    pub fn from_jsonl(input: &str) -> Result<Self, RuntimeError> {
        let mut messages = Vec::new();
        for (index, line) in input.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let replay_error = |message: String| RuntimeError::Replay {
                line: index + 1,
                message,
            };
            let wire: WireMessage =
                serde_json::from_str(line).map_err(|e| replay_error(e.to_string()))?;
            let message = KernelMessage::from_type_and_content(&wire.header.msg_type, wire.content)
                .map_err(|e| replay_error(e.to_string()))?;
            messages.push(message);
        }
        Ok(Self { messages })
    }

    pub fn from_path(path: &Path) -> Result<Self, RuntimeError> {
        let input = std::fs::read_to_string(path)?;
        let kernel = Self::from_jsonl(&input)?;
        info!(
            "[replay] Loaded {} messages from {}",
            kernel.messages.len(),
            path.display()
        );
        Ok(kernel)
    }

    pub fn messages(&self) -> &[KernelMessage] {
        &self.messages
    }

    /// The reply the request resolves with: the last recorded
    /// `execute_reply`, or a bare `ok`.
    fn final_reply(&self) -> ExecuteReply {
        self.messages
            .iter()
            .rev()
            .find_map(|message| match message {
                KernelMessage::ExecuteReply(reply) => Some(reply.clone()),
                _ => None,
            })
            .unwrap_or_else(|| ExecuteReply::ok(None))
    }
}

impl KernelRuntime for RecordedKernel {
    async fn execute_request(
        &self,
        code: &str,
        on_message: &mut dyn FnMut(KernelMessage),
    ) -> Result<ExecuteReply, RuntimeError> {
        debug!(
            "[replay] Replaying {} messages for {} bytes of code",
            self.messages.len(),
            code.len()
        );
        for message in &self.messages {
            on_message(message.clone());
        }
        Ok(self.final_reply())
    }
}
