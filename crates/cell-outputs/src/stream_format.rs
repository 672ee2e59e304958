//! Text transforms for `stream` output (stdout/stderr).
//!
//! Kernels write progress bars and spinners with carriage returns and
//! backspaces. Rather than emulating a terminal we collapse those control
//! characters the way the classic notebook does, so the stored text is the
//! final visible state of each line.

/// ANSI "cursor up one line" sequence (`ESC [ A`).
///
/// Only the single-line form is recognized. `ESC [ 2 A` and friends pass
/// through untouched.
pub const CURSOR_UP: &str = "\x1b[A";

const BACKSPACE: char = '\x08';

/// Apply backspace erasure followed by carriage-return collapsing.
///
/// The order matters: a run of backspaces may erase characters that would
/// otherwise look like the start of a line to the carriage-return pass.
pub fn format_stream_text(text: &str) -> String {
    fix_carriage_return(&fix_backspace(text))
}

/// Remove every character that is immediately followed by a backspace,
/// unless that character is a newline. Repeats until nothing changes, so runs
/// of backspaces erase as many preceding characters.
pub fn fix_backspace(text: &str) -> String {
    if !text.contains(BACKSPACE) {
        return text.to_string();
    }

    let mut kept: Vec<char> = Vec::with_capacity(text.len());
    for c in text.chars() {
        if c == BACKSPACE {
            match kept.last() {
                Some(&prev) if prev != '\n' => {
                    kept.pop();
                }
                _ => kept.push(c),
            }
        } else {
            kept.push(c);
        }
    }
    kept.into_iter().collect()
}

/// Collapse carriage returns.
///
/// A lone `\r` discards everything written since the start of the current
/// line. `\r\n` is a plain line terminator and becomes `\n`.
pub fn fix_carriage_return(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }

    let mut result = String::with_capacity(text.len());
    // Byte offset of the first character of the line still being written.
    let mut line_start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '\r' => {
                if let Some(&(_, '\n')) = chars.peek() {
                    result.push_str(&text[line_start..i]);
                    result.push('\n');
                    chars.next();
                    line_start = i + 2;
                } else {
                    line_start = i + 1;
                }
            }
            '\n' => {
                result.push_str(&text[line_start..=i]);
                line_start = i + 1;
            }
            _ => {}
        }
    }
    result.push_str(&text[line_start..]);
    result
}

/// Join nbformat multiline fragments into one string.
///
/// Every fragment except the last gets a `\n` appended unless it already ends
/// with one.
pub fn concat_multiline<S: AsRef<str>>(fragments: &[S]) -> String {
    let mut result = String::new();
    let last = fragments.len().saturating_sub(1);
    for (i, fragment) in fragments.iter().enumerate() {
        let fragment = fragment.as_ref();
        result.push_str(fragment);
        if i < last && !fragment.ends_with('\n') {
            result.push('\n');
        }
    }
    result
}

/// Split text into nbformat line fragments: each entry keeps its trailing
/// `\n`, and a trailing empty fragment is dropped.
pub fn split_multiline(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(str::to_string).collect()
}

/// If `text` starts with [`CURSOR_UP`], return the remainder.
pub fn strip_cursor_up(text: &str) -> Option<&str> {
    text.strip_prefix(CURSOR_UP)
}

/// Drop the last line of previously rendered text, which a cursor-up
/// sequence is about to overwrite.
pub fn drop_last_line(text: &str) -> String {
    let mut lines: Vec<&str> = text.split('\n').collect();
    lines.pop();
    lines.join("\n")
}
