//! Kernel messages consumed by a cell execution.
//!
//! The wire format is the Jupyter messaging protocol: a `msg_type` plus a JSON
//! `content` object. [`KernelMessage`] is the closed set of kinds the
//! execution controller understands; everything else lands in
//! [`KernelMessage::Other`] so dispatch stays an exhaustive `match`.

use jupyter_protocol::JupyterMessageContent;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::MessageError;
use crate::mime;
use crate::output::{ErrorOutput, MimeBundle, MultilineString, StreamName, Transient};

/// `execute_input`: the kernel echoing the code it is about to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteInput {
    #[serde(default)]
    pub code: String,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub execution_count: Option<i64>,
}

/// `execute_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    #[serde(default)]
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub execution_count: Option<i64>,
    #[serde(default)]
    pub transient: Option<Transient>,
}

/// `display_data` and `update_display_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayData {
    #[serde(default)]
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub transient: Option<Transient>,
}

impl DisplayData {
    pub fn display_id(&self) -> Option<&str> {
        self.transient.as_ref().and_then(|t| t.display_id.as_deref())
    }
}

/// `stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamContent {
    pub name: StreamName,
    #[serde(default)]
    pub text: MultilineString,
}

/// `clear_output`. With `wait`, the clear is deferred until the next output
/// arrives so the cell does not flicker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearOutput {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    #[default]
    Ok,
    Error,
    Aborted,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Error => "error",
            ReplyStatus::Aborted => "aborted",
        }
    }
}

/// One entry of an `execute_reply` payload list.
///
/// Payloads are loosely specified, so this keeps the fields the controller
/// acts on and tolerates anything else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<MimeBundle>,
}

/// Request to put text into the current cell or a new one after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetNextInput {
    pub text: String,
    pub replace: bool,
}

impl ReplyPayload {
    pub fn set_next_input(&self) -> Option<SetNextInput> {
        if self.source != "set_next_input" {
            return None;
        }
        Some(SetNextInput {
            text: self.text.clone()?,
            replace: self.replace?,
        })
    }

    /// The `text/plain` entry of the payload's data, e.g. IPython's `?` help.
    pub fn plain_text(&self) -> Option<String> {
        let value = self.data.as_ref()?.get(mime::TEXT_PLAIN)?;
        Some(match value {
            Value::String(s) => s.clone(),
            Value::Array(_) => serde_json::from_value::<MultilineString>(value.clone())
                .map(|text| text.to_text())
                .unwrap_or_else(|_| value.to_string()),
            other => other.to_string(),
        })
    }
}

/// `execute_reply`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReply {
    #[serde(default)]
    pub status: ReplyStatus,
    #[serde(default, deserialize_with = "deserialize_count")]
    pub execution_count: Option<i64>,
    #[serde(default)]
    pub payload: Vec<ReplyPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evalue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<Vec<String>>,
}

impl ExecuteReply {
    pub fn ok(execution_count: Option<i64>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            execution_count,
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// The error an error reply describes, when it names one.
    pub fn error(&self) -> Option<ErrorOutput> {
        if self.is_ok() || (self.ename.is_none() && self.evalue.is_none()) {
            return None;
        }
        Some(ErrorOutput::new(
            self.ename.clone().unwrap_or_default(),
            self.evalue.clone().unwrap_or_default(),
            self.traceback.clone().unwrap_or_default(),
        ))
    }
}

/// A kernel message relevant to one cell execution.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelMessage {
    ExecuteInput(ExecuteInput),
    ExecuteResult(ExecuteResult),
    Stream(StreamContent),
    DisplayData(DisplayData),
    UpdateDisplayData(DisplayData),
    ClearOutput(ClearOutput),
    Error(ErrorOutput),
    ExecuteReply(ExecuteReply),
    /// A kind the controller does not act on (status, comms, ...).
    Other {
        msg_type: String,
        execution_count: Option<i64>,
    },
}

impl KernelMessage {
    /// Parse wire content according to its `msg_type`.
    pub fn from_type_and_content(msg_type: &str, content: Value) -> Result<Self, MessageError> {
        let message = match msg_type {
            "execute_input" => KernelMessage::ExecuteInput(parse(msg_type, content)?),
            "execute_result" => KernelMessage::ExecuteResult(parse(msg_type, content)?),
            "stream" => KernelMessage::Stream(parse(msg_type, content)?),
            "display_data" => KernelMessage::DisplayData(parse(msg_type, content)?),
            "update_display_data" => KernelMessage::UpdateDisplayData(parse(msg_type, content)?),
            "clear_output" => KernelMessage::ClearOutput(parse(msg_type, content)?),
            "error" => KernelMessage::Error(parse(msg_type, content)?),
            "execute_reply" => KernelMessage::ExecuteReply(parse(msg_type, content)?),
            other => KernelMessage::Other {
                msg_type: other.to_string(),
                execution_count: content.get("execution_count").and_then(Value::as_i64),
            },
        };
        Ok(message)
    }

    /// Convert typed `jupyter_protocol` content.
    ///
    /// The typed structs serialize to the wire JSON, so this goes through
    /// [`KernelMessage::from_type_and_content`] and shares its leniency.
    pub fn from_jupyter(content: &JupyterMessageContent) -> Result<Self, MessageError> {
        let msg_type = content.message_type().to_string();
        let value = match content {
            JupyterMessageContent::ExecuteInput(c) => serde_json::to_value(c),
            JupyterMessageContent::ExecuteResult(c) => serde_json::to_value(c),
            JupyterMessageContent::StreamContent(c) => serde_json::to_value(c),
            JupyterMessageContent::DisplayData(c) => serde_json::to_value(c),
            JupyterMessageContent::UpdateDisplayData(c) => serde_json::to_value(c),
            JupyterMessageContent::ClearOutput(c) => serde_json::to_value(c),
            JupyterMessageContent::ErrorOutput(c) => serde_json::to_value(c),
            JupyterMessageContent::ExecuteReply(c) => serde_json::to_value(c),
            _ => {
                return Ok(KernelMessage::Other {
                    msg_type,
                    execution_count: None,
                })
            }
        }
        .map_err(|source| MessageError::Content {
            msg_type: msg_type.clone(),
            source,
        })?;
        Self::from_type_and_content(&msg_type, value)
    }

    pub fn msg_type(&self) -> &str {
        match self {
            KernelMessage::ExecuteInput(_) => "execute_input",
            KernelMessage::ExecuteResult(_) => "execute_result",
            KernelMessage::Stream(_) => "stream",
            KernelMessage::DisplayData(_) => "display_data",
            KernelMessage::UpdateDisplayData(_) => "update_display_data",
            KernelMessage::ClearOutput(_) => "clear_output",
            KernelMessage::Error(_) => "error",
            KernelMessage::ExecuteReply(_) => "execute_reply",
            KernelMessage::Other { msg_type, .. } => msg_type,
        }
    }

    /// The kernel-assigned execution count, for kinds that carry one.
    pub fn execution_count(&self) -> Option<i64> {
        match self {
            KernelMessage::ExecuteInput(input) => input.execution_count,
            KernelMessage::ExecuteResult(result) => result.execution_count,
            KernelMessage::ExecuteReply(reply) => reply.execution_count,
            KernelMessage::Other {
                execution_count, ..
            } => *execution_count,
            KernelMessage::Stream(_)
            | KernelMessage::DisplayData(_)
            | KernelMessage::UpdateDisplayData(_)
            | KernelMessage::ClearOutput(_)
            | KernelMessage::Error(_) => None,
        }
    }
}

fn parse<T: DeserializeOwned>(msg_type: &str, content: Value) -> Result<T, MessageError> {
    serde_json::from_value(content).map_err(|source| MessageError::Content {
        msg_type: msg_type.to_string(),
        source,
    })
}

/// Execution counts are numbers, but kernels send `null` before the first
/// execution. Anything non-numeric is treated as absent.
fn deserialize_count<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(Value::as_i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_stream() {
        let msg = KernelMessage::from_type_and_content(
            "stream",
            json!({"name": "stdout", "text": "hello\n"}),
        )
        .unwrap();
        assert_eq!(
            msg,
            KernelMessage::Stream(StreamContent {
                name: StreamName::Stdout,
                text: "hello\n".into(),
            })
        );
        assert_eq!(msg.execution_count(), None);
    }

    #[test]
    fn test_malformed_content_is_an_error() {
        let err = KernelMessage::from_type_and_content("stream", json!({"text": 5})).unwrap_err();
        assert!(err.to_string().contains("malformed stream content"));
    }

    #[test]
    fn test_unknown_kind_is_other() {
        let msg = KernelMessage::from_type_and_content(
            "status",
            json!({"execution_state": "busy"}),
        )
        .unwrap();
        assert_eq!(msg.msg_type(), "status");
        assert_eq!(msg.execution_count(), None);
    }

    #[test]
    fn test_execution_count_sources() {
        let input = KernelMessage::from_type_and_content(
            "execute_input",
            json!({"code": "1 + 1", "execution_count": 4}),
        )
        .unwrap();
        assert_eq!(input.execution_count(), Some(4));

        let result = KernelMessage::from_type_and_content(
            "execute_result",
            json!({"data": {"text/plain": "2"}, "metadata": {}, "execution_count": null}),
        )
        .unwrap();
        assert_eq!(result.execution_count(), None);
    }

    #[test]
    fn test_reply_payloads() {
        let msg = KernelMessage::from_type_and_content(
            "execute_reply",
            json!({
                "status": "ok",
                "execution_count": 3,
                "payload": [
                    {"source": "set_next_input", "text": "x = 1", "replace": false},
                    {"source": "page", "data": {"text/plain": "Docstring"}, "start": 0},
                    {"source": "ask_exit", "keepkernel": false}
                ],
                "user_expressions": {}
            }),
        )
        .unwrap();

        let KernelMessage::ExecuteReply(reply) = msg else {
            panic!("expected execute_reply");
        };
        assert!(reply.is_ok());
        assert_eq!(reply.execution_count, Some(3));
        assert_eq!(
            reply.payload[0].set_next_input(),
            Some(SetNextInput {
                text: "x = 1".into(),
                replace: false
            })
        );
        assert_eq!(reply.payload[1].plain_text().as_deref(), Some("Docstring"));
        assert_eq!(reply.payload[2].set_next_input(), None);
        assert_eq!(reply.payload[2].plain_text(), None);
    }

    #[test]
    fn test_error_reply_describes_error() {
        let reply: ExecuteReply = serde_json::from_value(json!({
            "status": "error",
            "execution_count": 2,
            "ename": "NameError",
            "evalue": "name 'x' is not defined",
            "traceback": ["NameError: name 'x' is not defined"]
        }))
        .unwrap();
        let error = reply.error().unwrap();
        assert_eq!(error.ename, "NameError");
        assert_eq!(error.traceback.len(), 1);

        assert!(ExecuteReply::ok(Some(1)).error().is_none());
    }

    #[test]
    fn test_from_jupyter_clear_output() {
        let content = JupyterMessageContent::ClearOutput(jupyter_protocol::ClearOutput { wait: true });
        let msg = KernelMessage::from_jupyter(&content).unwrap();
        assert_eq!(msg, KernelMessage::ClearOutput(ClearOutput { wait: true }));
    }
}
