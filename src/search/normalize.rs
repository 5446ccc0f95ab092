//! Text normalization for hash keys and embedding input.
//!
//! Normalization is **critical for determinism**: the same visual text must
//! always produce the same lookup key. Three layers:
//!
//! 1. [`normalize_newlines_universal`] - canonicalize every line-break
//!    spelling (`\r\n`, lone `\r`, escaped `\n`/`\N`, `<br/>` in any case or
//!    spacing, HTML-entity-escaped `&lt;br/&gt;`) to a single `\n`.
//! 2. [`normalize_for_hash`] - the exclusive key source for the exact-match
//!    tables: lowercase, whitespace runs collapsed per line, line structure
//!    preserved.
//! 3. [`normalize_for_embedding`] - embedding input only: all whitespace
//!    (including newlines) collapsed to single spaces, case preserved.
//!    Never used as a hash key; it loses structure and case.
//!
//! All three are idempotent and pass empty input through unchanged.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static BR_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)&lt;br[ \t]*/?[ \t]*&gt;").expect("valid regex"));
static BR_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<br[ \t]*/?[ \t]*>").expect("valid regex"));

/// Canonicalize every line-break spelling to `\n`.
///
/// Unicode NFC is applied first so composed/decomposed text cannot produce
/// distinct keys downstream.
pub fn normalize_newlines_universal(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let nfc: String = text.nfc().collect();

    // Entity-escaped tags first, so `&lt;br/&gt;` is not left behind once
    // the literal-tag pass has run.
    let step = BR_ENTITY.replace_all(&nfc, "\n");
    let step = BR_TAG.replace_all(&step, "\n");
    let step = step.replace("\r\n", "\n");
    let step = step.replace('\r', "\n");
    // Escaped newline as two characters: backslash + 'n' in either case.
    // Uppercase must be handled here, not left to a later lowercasing pass,
    // or `\N` would take two applications to reach a real newline.
    let step = step.replace("\\n", "\n");
    step.replace("\\N", "\n")
}

/// Deterministic hash-lookup key: newline-normalized, lowercased, whitespace
/// runs collapsed to one space per line. Line count is preserved.
pub fn normalize_for_hash(text: &str) -> String {
    let normalized = normalize_newlines_universal(text);
    normalized
        .to_lowercase()
        .lines()
        .map(collapse_line_whitespace)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Embedding input: newline-normalized, then *all* whitespace (newlines
/// included) collapsed to single spaces. Case preserved.
pub fn normalize_for_embedding(text: &str) -> String {
    normalize_newlines_universal(text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a text contributes nothing to the indexes.
pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

fn collapse_line_whitespace(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}
