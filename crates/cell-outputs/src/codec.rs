//! Output codec: protocol output records <-> rendered cell outputs.
//!
//! [`to_renderable`] turns one [`ProtocolOutput`] into a [`CellOutput`] whose
//! items are ordered richest-first. [`to_protocol_record`] is the best-effort
//! inverse used when a notebook is saved. It dispatches on the stored
//! `outputType` and falls back to guessing from item MIME types when an
//! output was produced by something other than this codec.
//!
//! Lossy paths:
//! - stream text passes through the stream formatter, so control characters
//!   do not survive
//! - text values given as line arrays come back as single strings
//! - outputs without an `outputType` are reclassified heuristically

use base64::prelude::*;
use bytes::Bytes;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CodecError;
use crate::mime;
use crate::output::{
    CellOutput, ErrorOutput, MimeBundle, MultilineString, OutputItem, OutputMetadata, OutputType,
    ProtocolOutput, StreamName, Transient,
};
use crate::stream_format::{concat_multiline, format_stream_text, split_multiline};

/// JSON carried by an error item. Hosts render errors from a single stack
/// string, so the traceback array is flattened into `stack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    stack: String,
}

/// Convert a protocol output record into a rendered output.
pub fn to_renderable(record: &ProtocolOutput) -> CellOutput {
    match record {
        ProtocolOutput::Stream { name, text } => stream_output(*name, &text.to_text()),
        ProtocolOutput::Error(error) => error_output(error),
        ProtocolOutput::ExecuteResult {
            data,
            metadata,
            execution_count,
            transient,
        } => rich_output(
            OutputType::ExecuteResult,
            data,
            metadata,
            *execution_count,
            transient,
        ),
        ProtocolOutput::DisplayData {
            data,
            metadata,
            transient,
        } => rich_output(OutputType::DisplayData, data, metadata, None, transient),
        ProtocolOutput::UpdateDisplayData {
            data,
            metadata,
            transient,
        } => rich_output(
            OutputType::UpdateDisplayData,
            data,
            metadata,
            None,
            transient,
        ),
    }
}

/// Build a stream output from already-joined text. The text is run through
/// the stream formatter.
pub fn stream_output(name: StreamName, text: &str) -> CellOutput {
    let mime = match name {
        StreamName::Stdout => mime::STDOUT,
        StreamName::Stderr => mime::STDERR,
    };
    let metadata = OutputMetadata {
        output_type: Some(OutputType::Stream),
        ..Default::default()
    };
    CellOutput::new(
        vec![OutputItem::text(mime, format_stream_text(text))],
        metadata,
    )
}

/// Build the single-item output for an error record.
pub fn error_output(error: &ErrorOutput) -> CellOutput {
    let item = error_item(&error.ename, &error.evalue, &error.traceback.join("\n"));
    let metadata = OutputMetadata {
        output_type: Some(OutputType::Error),
        original_error: Some(error.clone()),
        ..Default::default()
    };
    CellOutput::new(vec![item], metadata)
}

/// An error item with the `{name, message, stack}` payload.
pub fn error_item(name: &str, message: &str, stack: &str) -> OutputItem {
    let payload = ErrorPayload {
        name: name.to_string(),
        message: message.to_string(),
        stack: stack.to_string(),
    };
    // A struct of three strings always serializes.
    let json = serde_json::to_string(&payload).unwrap_or_default();
    OutputItem::text(mime::ERROR, json)
}

fn rich_output(
    output_type: OutputType,
    data: &MimeBundle,
    metadata: &Map<String, Value>,
    execution_count: Option<i64>,
    transient: &Option<Transient>,
) -> CellOutput {
    let mut items: Vec<OutputItem> = data
        .iter()
        .map(|(mime_type, value)| value_to_item(mime_type, value))
        .collect();
    mime::sort_by_display_order(&mut items);

    let metadata = OutputMetadata {
        output_type: Some(output_type),
        execution_count,
        metadata: Some(metadata.clone()),
        transient: transient.clone(),
        original_error: None,
        display_open_plot_icon: data.contains_key(mime::IMAGE_SVG)
            || data.contains_key(mime::IMAGE_PNG),
    };
    CellOutput::new(items, metadata)
}

/// Convert one bundle entry. Conversion failures become an error item in
/// place of the entry instead of failing the whole output.
fn value_to_item(mime_type: &str, value: &Value) -> OutputItem {
    match value_to_bytes(mime_type, value) {
        Ok(data) => OutputItem::new(mime_type, data),
        Err(e) => {
            warn!("[codec] Failed to convert {} output: {}", mime_type, e);
            error_item("Error", &format!("Failed to convert {}: {}", mime_type, e), "")
        }
    }
}

fn value_to_bytes(mime_type: &str, value: &Value) -> Result<Bytes, CodecError> {
    let bytes = match value {
        Value::Null => Bytes::new(),
        Value::String(s) if s.is_empty() => Bytes::new(),
        Value::String(s) if mime::is_binary_image(mime_type) => {
            let compact: String = s.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            Bytes::from(BASE64_STANDARD.decode(compact)?)
        }
        Value::String(s) => Bytes::from(s.clone()),
        Value::Array(_) if mime::is_json(mime_type) => Bytes::from(serde_json::to_string(value)?),
        Value::Array(fragments) => match string_fragments(fragments) {
            Some(fragments) => Bytes::from(concat_multiline(&fragments)),
            None => Bytes::from(serde_json::to_string(value)?),
        },
        Value::Object(_) => Bytes::from(serde_json::to_string(value)?),
        Value::Bool(_) | Value::Number(_) => Bytes::from(value.to_string()),
    };
    Ok(bytes)
}

/// `Some` when every element is a string.
fn string_fragments(values: &[Value]) -> Option<Vec<&str>> {
    values.iter().map(Value::as_str).collect()
}

/// Rebuild the protocol output record from a rendered output.
pub fn to_protocol_record(output: &CellOutput) -> ProtocolOutput {
    let custom = &output.metadata;
    let rich_metadata = || custom.metadata.clone().unwrap_or_default();

    match custom.output_type {
        Some(OutputType::Error) => ProtocolOutput::Error(error_from_output(output)),
        Some(OutputType::Stream) => stream_from_items(&output.items),
        Some(OutputType::DisplayData) => ProtocolOutput::DisplayData {
            data: bundle_from_items(&output.items),
            metadata: rich_metadata(),
            transient: custom.transient.clone(),
        },
        Some(OutputType::ExecuteResult) => ProtocolOutput::ExecuteResult {
            data: bundle_from_items(&output.items),
            metadata: rich_metadata(),
            execution_count: custom.execution_count,
            transient: custom.transient.clone(),
        },
        Some(OutputType::UpdateDisplayData) => ProtocolOutput::UpdateDisplayData {
            data: bundle_from_items(&output.items),
            metadata: rich_metadata(),
            transient: custom.transient.clone(),
        },
        None => classify_unknown(output),
    }
}

/// Outputs added by other producers may lack an `outputType`. Guess from the
/// items: one error item is an error, all-stream items are a stream, anything
/// else is saved as `display_data`.
fn classify_unknown(output: &CellOutput) -> ProtocolOutput {
    let items = &output.items;
    if items.len() == 1 && items[0].mime == mime::ERROR {
        return ProtocolOutput::Error(error_from_output(output));
    }
    if items.iter().all(|item| mime::is_stream(&item.mime)) {
        return stream_from_items(items);
    }
    ProtocolOutput::DisplayData {
        data: bundle_from_items(items),
        metadata: output.metadata.metadata.clone().unwrap_or_default(),
        transient: output.metadata.transient.clone(),
    }
}

/// Error outputs sometimes reach us with an empty payload. Those, and
/// payloads that are not the expected JSON, become an empty error record.
fn error_from_output(output: &CellOutput) -> ErrorOutput {
    let Some(item) = output.items.first().filter(|item| !item.data.is_empty()) else {
        return ErrorOutput::default();
    };
    let payload: ErrorPayload = match serde_json::from_slice(&item.data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("[codec] Unreadable error payload: {}", e);
            return ErrorOutput::default();
        }
    };

    let traceback = match &output.metadata.original_error {
        Some(original) => original.traceback.clone(),
        // Some kernels leave the stack empty; keep the message so something
        // is saved.
        None if !payload.stack.is_empty() => split_multiline(&payload.stack),
        None => split_multiline(&payload.message),
    };

    ErrorOutput {
        ename: payload.name,
        evalue: payload.message,
        traceback,
    }
}

/// Concatenate every stdout/stderr item and re-split into nbformat lines.
/// Joining first means a line split across two items comes back whole.
fn stream_from_items(items: &[OutputItem]) -> ProtocolOutput {
    let text: String = items
        .iter()
        .filter(|item| mime::is_stream(&item.mime))
        .map(OutputItem::as_text)
        .collect();

    let name = match items.first() {
        Some(item) if item.mime == mime::STDERR => StreamName::Stderr,
        _ => StreamName::Stdout,
    };

    ProtocolOutput::Stream {
        name,
        text: MultilineString::Lines(split_multiline(&text)),
    }
}

fn bundle_from_items(items: &[OutputItem]) -> MimeBundle {
    items
        .iter()
        .map(|item| (item.mime.clone(), item_to_value(item)))
        .collect()
}

fn item_to_value(item: &OutputItem) -> Value {
    if item.data.is_empty() {
        return Value::String(String::new());
    }
    let mime_type = item.mime.as_str();

    if mime_type == mime::ERROR {
        serde_json::from_slice(&item.data).unwrap_or_else(|_| Value::String(String::new()))
    } else if mime::is_text(mime_type) {
        Value::String(item.as_text())
    } else if mime::is_binary_image(mime_type) {
        Value::String(BASE64_STANDARD.encode(&item.data))
    } else if mime::is_json(mime_type) {
        serde_json::from_slice(&item.data).unwrap_or_else(|_| Value::String(item.as_text()))
    } else {
        Value::String(item.as_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> ProtocolOutput {
        serde_json::from_value(value).unwrap()
    }

    fn round_trip(value: Value) {
        let original = record(value);
        let rendered = to_renderable(&original);
        assert_eq!(to_protocol_record(&rendered), original);
    }

    #[test]
    fn test_items_sorted_by_display_order() {
        let output = to_renderable(&record(json!({
            "output_type": "display_data",
            "data": {"text/plain": "x", "text/html": "<p>x</p>"},
            "metadata": {}
        })));
        assert_eq!(output.mimes(), vec!["text/html", "text/plain"]);
    }

    #[test]
    fn test_stream_uses_channel_mime_and_formats_text() {
        let output = to_renderable(&record(json!({
            "output_type": "stream",
            "name": "stderr",
            "text": ["10%\r", "100%\n"]
        })));
        assert_eq!(output.mimes(), vec![mime::STDERR]);
        // Joining inserts "\n" after "10%\r", which then reads as "\r\n".
        assert_eq!(output.items[0].as_text(), "10%\n100%\n");
        assert_eq!(output.output_type(), Some(OutputType::Stream));
    }

    #[test]
    fn test_error_flattens_traceback() {
        let output = to_renderable(&record(json!({
            "output_type": "error",
            "ename": "ZeroDivisionError",
            "evalue": "division by zero",
            "traceback": ["Traceback:", "  File \"<cell>\"", "ZeroDivisionError"]
        })));
        assert_eq!(output.items.len(), 1);
        let payload: Value = serde_json::from_slice(&output.items[0].data).unwrap();
        assert_eq!(payload["name"], "ZeroDivisionError");
        assert_eq!(payload["message"], "division by zero");
        assert_eq!(
            payload["stack"],
            "Traceback:\n  File \"<cell>\"\nZeroDivisionError"
        );
        assert!(output.metadata.original_error.is_some());
    }

    #[test]
    fn test_rich_value_conversions() {
        let output = to_renderable(&record(json!({
            "output_type": "execute_result",
            "data": {
                "text/plain": ["a", "b"],
                "image/png": "aGVsbG8=",
                "image/svg+xml": "<svg/>",
                "application/json": {"k": [1, 2]},
                "application/x-number": 42
            },
            "metadata": {"isolated": true},
            "execution_count": 7
        })));

        assert_eq!(output.item("text/plain").unwrap().as_text(), "a\nb");
        assert_eq!(&output.item("image/png").unwrap().data[..], b"hello");
        assert_eq!(output.item("image/svg+xml").unwrap().as_text(), "<svg/>");
        assert_eq!(
            output.item("application/json").unwrap().as_text(),
            r#"{"k":[1,2]}"#
        );
        assert_eq!(output.item("application/x-number").unwrap().as_text(), "42");
        assert_eq!(output.metadata.execution_count, Some(7));
        assert!(output.metadata.display_open_plot_icon);
        assert_eq!(
            output.metadata.metadata.as_ref().unwrap()["isolated"],
            json!(true)
        );
    }

    #[test]
    fn test_base64_with_line_breaks_decodes() {
        let output = to_renderable(&record(json!({
            "output_type": "display_data",
            "data": {"image/png": "aGVs\nbG8=\n"},
            "metadata": {}
        })));
        assert_eq!(&output.item("image/png").unwrap().data[..], b"hello");
    }

    #[test]
    fn test_malformed_base64_becomes_error_item() {
        let output = to_renderable(&record(json!({
            "output_type": "display_data",
            "data": {"image/png": "not base64!!", "text/plain": "fallback"},
            "metadata": {}
        })));
        assert_eq!(output.items.len(), 2);
        assert!(output.item(mime::ERROR).is_some());
        assert_eq!(output.item("text/plain").unwrap().as_text(), "fallback");
        assert!(output.item("image/png").is_none());
    }

    #[test]
    fn test_round_trip_exact_outputs() {
        round_trip(json!({
            "output_type": "execute_result",
            "data": {"text/plain": "42", "application/json": {"a": 1}},
            "metadata": {"foo": "bar"},
            "execution_count": 1
        }));
        round_trip(json!({
            "output_type": "execute_result",
            "data": {"text/plain": "42"},
            "metadata": {},
            "execution_count": null
        }));
        round_trip(json!({
            "output_type": "display_data",
            "data": {"image/png": "aGVsbG8=", "text/plain": "<Figure>"},
            "metadata": {"image/png": {"width": 10}},
            "transient": {"display_id": "abc"}
        }));
        round_trip(json!({
            "output_type": "update_display_data",
            "data": {"text/plain": "updated"},
            "metadata": {},
            "transient": {"display_id": "abc"}
        }));
        round_trip(json!({
            "output_type": "execute_result",
            "data": {"text/plain": ["line 1\n", "line 2"], "text/html": ["<p>\n", "</p>"]},
            "metadata": {},
            "execution_count": 2
        }));
        round_trip(json!({
            "output_type": "display_data",
            "data": {"application/json": ["a", "b"]},
            "metadata": {}
        }));
        round_trip(json!({
            "output_type": "stream",
            "name": "stdout",
            "text": "hello\nworld\n"
        }));
        round_trip(json!({
            "output_type": "error",
            "ename": "ValueError",
            "evalue": "bad value",
            "traceback": ["line 1", "line 2"]
        }));
    }

    #[test]
    fn test_stream_inverse_produces_line_array() {
        let output = stream_output(StreamName::Stdout, "a\nb\n");
        let value = serde_json::to_value(to_protocol_record(&output)).unwrap();
        assert_eq!(value["text"], json!(["a\n", "b\n"]));
    }

    #[test]
    fn test_stream_inverse_joins_lines_across_items() {
        let output = CellOutput::new(
            vec![
                OutputItem::text(mime::STDERR, "first li"),
                OutputItem::text(mime::STDERR, "ne\nsecond\n"),
            ],
            OutputMetadata {
                output_type: Some(OutputType::Stream),
                ..Default::default()
            },
        );
        let value = serde_json::to_value(to_protocol_record(&output)).unwrap();
        assert_eq!(value["name"], "stderr");
        assert_eq!(value["text"], json!(["first line\n", "second\n"]));
    }

    #[test]
    fn test_error_with_missing_payload_is_empty_record() {
        let output = CellOutput::new(
            vec![OutputItem::new(mime::ERROR, Bytes::new())],
            OutputMetadata {
                output_type: Some(OutputType::Error),
                ..Default::default()
            },
        );
        assert_eq!(
            to_protocol_record(&output),
            ProtocolOutput::Error(ErrorOutput::default())
        );

        let garbled = CellOutput::new(
            vec![OutputItem::text(mime::ERROR, "{not json")],
            OutputMetadata {
                output_type: Some(OutputType::Error),
                ..Default::default()
            },
        );
        assert_eq!(
            to_protocol_record(&garbled),
            ProtocolOutput::Error(ErrorOutput::default())
        );
    }

    #[test]
    fn test_error_without_original_uses_stack_then_message() {
        let from_stack = CellOutput::new(
            vec![error_item("E", "msg", "a\nb")],
            OutputMetadata::default(),
        );
        assert_eq!(
            to_protocol_record(&from_stack),
            ProtocolOutput::Error(ErrorOutput::new("E", "msg", vec!["a\n".into(), "b".into()]))
        );

        let from_message =
            CellOutput::new(vec![error_item("E", "only message", "")], OutputMetadata::default());
        assert_eq!(
            to_protocol_record(&from_message),
            ProtocolOutput::Error(ErrorOutput::new("E", "only message", vec!["only message".into()]))
        );
    }

    #[test]
    fn test_unknown_output_type_heuristics() {
        let stream = CellOutput::new(
            vec![OutputItem::text(mime::STDOUT, "out\n")],
            OutputMetadata::default(),
        );
        assert_eq!(to_protocol_record(&stream).output_type(), OutputType::Stream);

        let rich = CellOutput::new(
            vec![
                OutputItem::text(mime::STDOUT, "out\n"),
                OutputItem::text("text/html", "<b>x</b>"),
            ],
            OutputMetadata {
                transient: Some(Transient::with_display_id("d9")),
                ..Default::default()
            },
        );
        let rebuilt = to_protocol_record(&rich);
        assert_eq!(rebuilt.output_type(), OutputType::DisplayData);
        assert_eq!(rebuilt.display_id(), Some("d9"));
    }

    #[test]
    fn test_json_item_that_does_not_parse_stays_text() {
        let output = CellOutput::new(
            vec![OutputItem::text("application/json", "{oops")],
            OutputMetadata {
                output_type: Some(OutputType::DisplayData),
                ..Default::default()
            },
        );
        match to_protocol_record(&output) {
            ProtocolOutput::DisplayData { data, metadata, .. } => {
                assert_eq!(data["application/json"], json!("{oops"));
                assert!(metadata.is_empty());
            }
            other => panic!("expected display_data, got {:?}", other),
        }
    }
}
