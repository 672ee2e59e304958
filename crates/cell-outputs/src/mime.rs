//! MIME constants and display ordering for rendered outputs.

use crate::output::OutputItem;

/// Item carrying an error as `{name, message, stack}` JSON.
pub const ERROR: &str = "application/vnd.code.notebook.error";
/// Item carrying stdout text.
pub const STDOUT: &str = "application/vnd.code.notebook.stdout";
/// Item carrying stderr text.
pub const STDERR: &str = "application/vnd.code.notebook.stderr";

pub const TEXT_PLAIN: &str = "text/plain";
pub const TEXT_HTML: &str = "text/html";
pub const TEXT_MARKDOWN: &str = "text/markdown";
pub const IMAGE_SVG: &str = "image/svg+xml";
pub const IMAGE_PNG: &str = "image/png";
pub const APPLICATION_JSON: &str = "application/json";

/// Richest renderer first. A trailing `.*` matches by prefix.
pub const DISPLAY_ORDER: &[&str] = &[
    "application/vnd.*",
    "application/vdom.*",
    "application/geo+json",
    "application/x-nteract-model-debug+json",
    TEXT_HTML,
    "application/javascript",
    "image/gif",
    "text/latex",
    TEXT_MARKDOWN,
    IMAGE_SVG,
    IMAGE_PNG,
    "image/jpeg",
    APPLICATION_JSON,
    TEXT_PLAIN,
];

/// MIME types whose values are text even without a `text/` prefix.
const TEXT_MIMES: &[&str] = &[TEXT_PLAIN, TEXT_MARKDOWN, STDERR, STDOUT];

pub fn is_text(mime: &str) -> bool {
    mime.starts_with("text/") || TEXT_MIMES.contains(&mime)
}

/// Raster images are base64 on the wire and raw bytes when rendered.
/// SVG is markup and stays text.
pub fn is_binary_image(mime: &str) -> bool {
    mime.starts_with("image/") && mime != IMAGE_SVG
}

pub fn is_json(mime: &str) -> bool {
    mime.to_ascii_lowercase().contains("json")
}

pub fn is_stream(mime: &str) -> bool {
    mime == STDOUT || mime == STDERR
}

fn matches_pattern(pattern: &str, mime: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(prefix) => mime.starts_with(prefix),
        None => mime == pattern,
    }
}

/// Position of `mime` in [`DISPLAY_ORDER`]; unknown types rank last.
pub fn display_rank(mime: &str) -> usize {
    DISPLAY_ORDER
        .iter()
        .position(|pattern| matches_pattern(pattern, mime))
        .unwrap_or(DISPLAY_ORDER.len())
}

/// Sort items so the richest renderer comes first. The sort is stable, so
/// unknown types keep their relative order.
pub fn sort_by_display_order(items: &mut [OutputItem]) {
    items.sort_by_key(|item| display_rank(&item.mime));
}
