//! Output data model.
//!
//! Two shapes live here:
//! - [`ProtocolOutput`]: the nbformat / kernel-protocol output record
//!   (`execute_result`, `display_data`, `update_display_data`, `stream`,
//!   `error`), serialized with an `output_type` tag.
//! - [`CellOutput`]: what the host actually renders. An ordered list of
//!   `(mime, bytes)` items plus [`OutputMetadata`] carrying enough of the
//!   original record to rebuild it when the notebook is saved.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::mime;
use crate::stream_format::concat_multiline;

/// MIME type -> value, as found in `data` of rich outputs.
pub type MimeBundle = Map<String, Value>;

/// Identifier of a cell within its notebook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CellId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of one rendered output, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputId(Uuid);

impl OutputId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OutputId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a rendered output lives: the owning cell plus the output itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputRef {
    pub cell: CellId,
    pub output: OutputId,
}

/// The nbformat `output_type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    ExecuteResult,
    DisplayData,
    UpdateDisplayData,
    Stream,
    Error,
}

impl OutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputType::ExecuteResult => "execute_result",
            OutputType::DisplayData => "display_data",
            OutputType::UpdateDisplayData => "update_display_data",
            OutputType::Stream => "stream",
            OutputType::Error => "error",
        }
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    #[default]
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text that nbformat allows as either one string or a list of fragments.
///
/// Equality compares the joined text, so `"a\nb"` equals `["a\n", "b"]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MultilineString {
    Single(String),
    Lines(Vec<String>),
}

impl MultilineString {
    /// The joined text.
    pub fn to_text(&self) -> String {
        match self {
            MultilineString::Single(s) => s.clone(),
            MultilineString::Lines(lines) => concat_multiline(lines),
        }
    }

}

impl Default for MultilineString {
    fn default() -> Self {
        MultilineString::Single(String::new())
    }
}

impl PartialEq for MultilineString {
    fn eq(&self, other: &Self) -> bool {
        self.to_text() == other.to_text()
    }
}

impl From<&str> for MultilineString {
    fn from(s: &str) -> Self {
        MultilineString::Single(s.to_string())
    }
}

impl From<String> for MultilineString {
    fn from(s: String) -> Self {
        MultilineString::Single(s)
    }
}

/// Transient output data. Never persisted by nbformat, but carried on
/// rendered outputs so a later `update_display_data` can find its target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Transient {
    pub fn with_display_id(display_id: impl Into<String>) -> Self {
        Self {
            display_id: Some(display_id.into()),
            extra: Map::new(),
        }
    }
}

/// One kernel-protocol output record.
///
/// Equality treats a text-mime value stored as one string and as a line
/// array as the same value, like [`MultilineString`] does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum ProtocolOutput {
    ExecuteResult {
        #[serde(default)]
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(default)]
        execution_count: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transient: Option<Transient>,
    },
    DisplayData {
        #[serde(default)]
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transient: Option<Transient>,
    },
    UpdateDisplayData {
        #[serde(default)]
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transient: Option<Transient>,
    },
    Stream {
        #[serde(default)]
        name: StreamName,
        #[serde(default)]
        text: MultilineString,
    },
    Error(ErrorOutput),
}

impl ProtocolOutput {
    pub fn output_type(&self) -> OutputType {
        match self {
            ProtocolOutput::ExecuteResult { .. } => OutputType::ExecuteResult,
            ProtocolOutput::DisplayData { .. } => OutputType::DisplayData,
            ProtocolOutput::UpdateDisplayData { .. } => OutputType::UpdateDisplayData,
            ProtocolOutput::Stream { .. } => OutputType::Stream,
            ProtocolOutput::Error(_) => OutputType::Error,
        }
    }

    pub fn transient(&self) -> Option<&Transient> {
        match self {
            ProtocolOutput::ExecuteResult { transient, .. }
            | ProtocolOutput::DisplayData { transient, .. }
            | ProtocolOutput::UpdateDisplayData { transient, .. } => transient.as_ref(),
            ProtocolOutput::Stream { .. } | ProtocolOutput::Error(_) => None,
        }
    }

    /// The `transient.display_id`, if this is a data-bearing output that has one.
    pub fn display_id(&self) -> Option<&str> {
        self.transient().and_then(|t| t.display_id.as_deref())
    }
}

impl PartialEq for ProtocolOutput {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                ProtocolOutput::ExecuteResult {
                    data: a,
                    metadata: am,
                    execution_count: ac,
                    transient: at,
                },
                ProtocolOutput::ExecuteResult {
                    data: b,
                    metadata: bm,
                    execution_count: bc,
                    transient: bt,
                },
            ) => bundles_equal(a, b) && am == bm && ac == bc && at == bt,
            (
                ProtocolOutput::DisplayData {
                    data: a,
                    metadata: am,
                    transient: at,
                },
                ProtocolOutput::DisplayData {
                    data: b,
                    metadata: bm,
                    transient: bt,
                },
            )
            | (
                ProtocolOutput::UpdateDisplayData {
                    data: a,
                    metadata: am,
                    transient: at,
                },
                ProtocolOutput::UpdateDisplayData {
                    data: b,
                    metadata: bm,
                    transient: bt,
                },
            ) => bundles_equal(a, b) && am == bm && at == bt,
            (
                ProtocolOutput::Stream { name: an, text: at },
                ProtocolOutput::Stream { name: bn, text: bt },
            ) => an == bn && at == bt,
            (ProtocolOutput::Error(a), ProtocolOutput::Error(b)) => a == b,
            _ => false,
        }
    }
}

fn bundles_equal(a: &MimeBundle, b: &MimeBundle) -> bool {
    a.len() == b.len()
        && a.iter().all(|(mime_type, value)| {
            b.get(mime_type)
                .is_some_and(|other| bundle_values_equal(mime_type, value, other))
        })
}

fn bundle_values_equal(mime_type: &str, a: &Value, b: &Value) -> bool {
    if !mime::is_text(mime_type) {
        return a == b;
    }
    match (text_value(a), text_value(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

/// A string, or an array of string fragments, as joined text.
fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(fragments) => fragments
            .iter()
            .map(Value::as_str)
            .collect::<Option<Vec<_>>>()
            .map(|fragments| concat_multiline(&fragments)),
        _ => None,
    }
}

/// Payload of an `error` output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorOutput {
    #[serde(default)]
    pub ename: String,
    #[serde(default)]
    pub evalue: String,
    #[serde(default, deserialize_with = "deserialize_traceback")]
    pub traceback: Vec<String>,
}

impl ErrorOutput {
    pub fn new(ename: impl Into<String>, evalue: impl Into<String>, traceback: Vec<String>) -> Self {
        Self {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback,
        }
    }

    /// Build an error output for a fault raised on our side rather than by
    /// the kernel. The message's lines stand in for a traceback.
    pub fn from_fault(kind: &str, message: &str) -> Self {
        let ename = if kind.is_empty() { "Error" } else { kind };
        let evalue = if message.is_empty() { ename } else { message };
        Self {
            ename: ename.to_string(),
            evalue: evalue.to_string(),
            traceback: message.lines().map(str::to_string).collect(),
        }
    }
}

/// Tracebacks are sometimes sent as `null` or a single string.
fn deserialize_traceback<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Array(lines)) => lines
            .into_iter()
            .map(|line| match line {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) => s.lines().map(str::to_string).collect(),
        _ => Vec::new(),
    })
}

/// One `(mime, bytes)` entry of a rendered output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputItem {
    pub mime: String,
    pub data: Bytes,
}

impl OutputItem {
    pub fn new(mime: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            mime: mime.into(),
            data: data.into(),
        }
    }

    pub fn text(mime: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(mime, Bytes::from(text.into()))
    }

    /// The payload decoded as UTF-8, replacing invalid sequences.
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Metadata attached to a rendered output.
///
/// Field names follow the host's camelCase convention since this is the
/// boundary format handed to the notebook serializer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMetadata {
    /// The `output_type` of the record this output was built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<OutputType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<i64>,
    /// The record's own `metadata` map (rich outputs only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient: Option<Transient>,
    /// The error record as received, so its traceback survives a save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_error: Option<ErrorOutput>,
    /// Set when the output holds a plot (SVG or PNG).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub display_open_plot_icon: bool,
}

/// A rendered output: ordered items plus metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CellOutput {
    pub id: OutputId,
    pub items: Vec<OutputItem>,
    pub metadata: OutputMetadata,
}

impl CellOutput {
    pub fn new(items: Vec<OutputItem>, metadata: OutputMetadata) -> Self {
        Self {
            id: OutputId::new(),
            items,
            metadata,
        }
    }

    pub fn output_type(&self) -> Option<OutputType> {
        self.metadata.output_type
    }

    pub fn item(&self, mime: &str) -> Option<&OutputItem> {
        self.items.iter().find(|item| item.mime == mime)
    }

    pub fn mimes(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.mime.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_stream_output() {
        let output: ProtocolOutput = serde_json::from_value(json!({
            "output_type": "stream",
            "name": "stderr",
            "text": ["line 1\n", "line 2\n"]
        }))
        .unwrap();

        match output {
            ProtocolOutput::Stream { name, text } => {
                assert_eq!(name, StreamName::Stderr);
                assert_eq!(text.to_text(), "line 1\nline 2\n");
            }
            other => panic!("expected stream, got {:?}", other),
        }
    }

    #[test]
    fn test_multiline_equality_ignores_shape() {
        let single = MultilineString::from("a\nb");
        let lines = MultilineString::Lines(vec!["a\n".into(), "b".into()]);
        assert_eq!(single, lines);
        assert_ne!(single, MultilineString::from("a\nc"));
    }

    #[test]
    fn test_text_bundle_values_compare_as_joined_text() {
        let lines: ProtocolOutput = serde_json::from_value(json!({
            "output_type": "display_data",
            "data": {"text/plain": ["a\n", "b"]},
            "metadata": {}
        }))
        .unwrap();
        let single: ProtocolOutput = serde_json::from_value(json!({
            "output_type": "display_data",
            "data": {"text/plain": "a\nb"},
            "metadata": {}
        }))
        .unwrap();
        assert_eq!(lines, single);

        let json_lines: ProtocolOutput = serde_json::from_value(json!({
            "output_type": "display_data",
            "data": {"application/json": ["a\n", "b"]},
            "metadata": {}
        }))
        .unwrap();
        let json_single: ProtocolOutput = serde_json::from_value(json!({
            "output_type": "display_data",
            "data": {"application/json": "a\nb"},
            "metadata": {}
        }))
        .unwrap();
        assert_ne!(json_lines, json_single);
    }

    #[test]
    fn test_display_id_only_on_data_outputs() {
        let display: ProtocolOutput = serde_json::from_value(json!({
            "output_type": "display_data",
            "data": {"text/plain": "x"},
            "metadata": {},
            "transient": {"display_id": "d1"}
        }))
        .unwrap();
        assert_eq!(display.display_id(), Some("d1"));

        let stream: ProtocolOutput = serde_json::from_value(json!({
            "output_type": "stream",
            "name": "stdout",
            "text": "x",
            "transient": {"display_id": "d1"}
        }))
        .unwrap();
        assert_eq!(stream.display_id(), None);
    }

    #[test]
    fn test_execute_result_serializes_null_count() {
        let output = ProtocolOutput::ExecuteResult {
            data: MimeBundle::new(),
            metadata: Map::new(),
            execution_count: None,
            transient: None,
        };
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["output_type"], "execute_result");
        assert!(value["execution_count"].is_null());
        assert!(value.get("transient").is_none());
    }

    #[test]
    fn test_error_traceback_tolerates_null() {
        let output: ProtocolOutput = serde_json::from_value(json!({
            "output_type": "error",
            "ename": "ValueError",
            "evalue": "bad",
            "traceback": null
        }))
        .unwrap();
        assert_eq!(
            output,
            ProtocolOutput::Error(ErrorOutput::new("ValueError", "bad", vec![]))
        );
    }

    #[test]
    fn test_metadata_uses_camel_case() {
        let metadata = OutputMetadata {
            output_type: Some(OutputType::ExecuteResult),
            execution_count: Some(3),
            display_open_plot_icon: true,
            ..Default::default()
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["outputType"], "execute_result");
        assert_eq!(value["executionCount"], 3);
        assert_eq!(value["displayOpenPlotIcon"], true);
        assert!(value.get("originalError").is_none());
    }

    #[test]
    fn test_fault_error_output() {
        let error = ErrorOutput::from_fault("RuntimeError", "kernel died\nwhile running");
        assert_eq!(error.ename, "RuntimeError");
        assert_eq!(error.evalue, "kernel died\nwhile running");
        assert_eq!(error.traceback, vec!["kernel died", "while running"]);

        let bare = ErrorOutput::from_fault("", "");
        assert_eq!(bare.ename, "Error");
        assert_eq!(bare.evalue, "Error");
        assert!(bare.traceback.is_empty());
    }
}
