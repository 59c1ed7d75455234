//! Payload sanitization and chunking.

use std::sync::LazyLock;

use regex::Regex;

/// Smallest chunk that can hold any UTF-8 scalar value.
const MIN_CHUNK_BYTES: usize = 4;

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    // CSI (ESC [ ... final byte), OSC (ESC ] ... BEL or ST), and two-byte escapes.
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]")
        .unwrap()
});

/// Strip ANSI escape sequences.
pub fn strip_ansi(input: &str) -> String {
    ANSI_RE.replace_all(input, "").into_owned()
}

/// Make raw text safe to inject into a pane.
///
/// Escape sequences are stripped, CRLF and lone CR become LF, and every other
/// control character except LF and TAB is dropped. Trailing newlines are
/// removed so the only submit is the one we send.
pub fn sanitize(raw: &str) -> String {
    let text = strip_ansi(raw).replace("\r\n", "\n").replace('\r', "\n");
    let cleaned: String = text
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || !c.is_control())
        .collect();
    cleaned.trim_end_matches('\n').to_string()
}

/// How a sanitized payload reaches the pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Typed with `send-keys -l`.
    Literal,
    /// One or more buffer pastes.
    Paste,
}

/// Short single-line text is typed; anything with a newline or over
/// `literal_limit` bytes is pasted so it arrives as one input.
pub fn choose_mode(text: &str, literal_limit: usize) -> DeliveryMode {
    if text.contains('\n') || text.len() > literal_limit {
        DeliveryMode::Paste
    } else {
        DeliveryMode::Literal
    }
}

/// Split `text` into pieces of at most `max_bytes`, never inside a UTF-8
/// character. Concatenating the pieces gives back `text` exactly.
pub fn chunks(text: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(MIN_CHUNK_BYTES);
    let mut out = Vec::with_capacity(text.len() / max_bytes + 1);
    let mut rest = text;
    while !rest.is_empty() {
        if rest.len() <= max_bytes {
            out.push(rest);
            break;
        }
        let mut cut = max_bytes;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        out.push(head);
        rest = tail;
    }
    out
}
