//! Streaming-text reconciliation
//!
//! The vendor's delta stream is at-least-once: fragments can be duplicated
//! or retransmitted with overlap. `merge_overlap` fuses a new delta into the
//! accumulated text by locating the greatest suffix/prefix overlap, which
//! makes re-applying any accepted delta sequence a no-op.

/// Merge a new delta into the existing text.
///
/// Rules, in order:
/// - identical delta: no change
/// - delta extends the existing text: replace with the delta
/// - existing text already contains the delta as a prefix: no change
/// - otherwise drop the longest prefix of the delta that the existing text
///   already ends with, and append the rest
pub fn merge_overlap(existing: &str, delta: &str) -> String {
    if delta == existing {
        return existing.to_string();
    }
    if delta.starts_with(existing) {
        return delta.to_string();
    }
    if existing.starts_with(delta) {
        return existing.to_string();
    }

    let max = existing.len().min(delta.len());
    let mut overlap = 0;
    for (k, _) in delta.char_indices().skip(1) {
        if k > max {
            break;
        }
        if existing.ends_with(&delta[..k]) {
            overlap = k;
        }
    }
    if overlap < max && delta.is_char_boundary(max) && existing.ends_with(&delta[..max]) {
        overlap = max;
    }

    let mut merged = String::with_capacity(existing.len() + delta.len() - overlap);
    merged.push_str(existing);
    merged.push_str(&delta[overlap..]);
    merged
}

/// Normalize streamed text on ingest: CRLF becomes LF, and a lone newline
/// that does not open a paragraph, list item, or code fence collapses into a
/// space. Paragraphs (blank lines) and list/code structure are preserved.
pub fn normalize_ingest(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    let mut out = String::with_capacity(text.len());

    for (i, ch) in text.char_indices() {
        if ch != '\n' {
            out.push(ch);
            continue;
        }
        let rest = &text[i + 1..];
        let prev_is_newline = out.ends_with('\n');
        let next_is_newline = rest.starts_with('\n');
        if prev_is_newline || next_is_newline || starts_structural_line(rest) {
            out.push('\n');
        } else {
            out.push(' ');
        }
    }
    out
}

/// Whether the text following a newline opens a list item or code fence.
fn starts_structural_line(rest: &str) -> bool {
    let line = rest.trim_start_matches(' ');
    if line.starts_with("```") {
        return true;
    }
    if line.starts_with("- ") || line.starts_with("* ") || line.starts_with("+ ") {
        return true;
    }
    // Ordered-list marker: digits followed by ". " or ") "
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let after = &line[digits..];
        if after.starts_with(". ") || after.starts_with(") ") {
            return true;
        }
    }
    false
}

/// At most one assistant message per session is being streamed into.
#[derive(Debug, Clone)]
pub struct StreamingCursor {
    /// Stable conversation-item ID the deltas accumulate under
    pub item_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- merge_overlap laws ---

    #[test]
    fn test_merge_identical_is_identity() {
        assert_eq!(merge_overlap("hello", "hello"), "hello");
        assert_eq!(merge_overlap("", ""), "");
    }

    #[test]
    fn test_merge_extension_replaces() {
        assert_eq!(merge_overlap("hel", "hello"), "hello");
        assert_eq!(merge_overlap("", "hello"), "hello");
    }

    #[test]
    fn test_merge_contained_prefix_is_noop() {
        assert_eq!(merge_overlap("hello", "hel"), "hello");
    }

    #[test]
    fn test_merge_suffix_prefix_overlap() {
        // merge(a + b, b + c) = a + b + c
        assert_eq!(merge_overlap("hello wo", "world"), "hello world");
        assert_eq!(merge_overlap("abcdef", "defghi"), "abcdefghi");
    }

    #[test]
    fn test_merge_no_overlap_appends() {
        assert_eq!(merge_overlap("hello ", "world"), "hello world");
    }

    #[test]
    fn test_merge_prefers_greatest_overlap() {
        // "aba" both ends with "a" and with "aba"; the greatest wins
        assert_eq!(merge_overlap("aba", "abac"), "abac");
    }

    #[test]
    fn test_merge_multibyte_boundaries() {
        assert_eq!(merge_overlap("héllo ", "wörld"), "héllo wörld");
        assert_eq!(merge_overlap("héll", "héllo"), "héllo");
        assert_eq!(merge_overlap("日本", "本語"), "日本語");
    }

    #[test]
    fn test_merge_idempotent_over_sequence() {
        let deltas = ["hel", "hello ", "lo wor", "world!"];
        let apply = |start: &str| {
            deltas
                .iter()
                .fold(start.to_string(), |acc, d| merge_overlap(&acc, d))
        };
        let once = apply("");
        let twice = apply(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "hello world!");
    }

    // --- normalization ---

    #[test]
    fn test_normalize_crlf() {
        assert_eq!(normalize_ingest("a\r\n\r\nb"), "a\n\nb");
    }

    #[test]
    fn test_normalize_collapses_single_newline() {
        assert_eq!(normalize_ingest("wrapped\nline"), "wrapped line");
    }

    #[test]
    fn test_normalize_preserves_paragraphs() {
        assert_eq!(normalize_ingest("para one\n\npara two"), "para one\n\npara two");
        assert_eq!(normalize_ingest("a\n\n\nb"), "a\n\n\nb");
    }

    #[test]
    fn test_normalize_preserves_bullets() {
        assert_eq!(
            normalize_ingest("intro:\n- first\n- second"),
            "intro:\n- first\n- second"
        );
        assert_eq!(normalize_ingest("x\n* star"), "x\n* star");
        assert_eq!(normalize_ingest("x\n+ plus"), "x\n+ plus");
    }

    #[test]
    fn test_normalize_preserves_ordered_lists() {
        assert_eq!(normalize_ingest("steps:\n1. one\n2. two"), "steps:\n1. one\n2. two");
        assert_eq!(normalize_ingest("steps:\n1) one"), "steps:\n1) one");
        // A number without a list marker is prose
        assert_eq!(normalize_ingest("about\n1920 things"), "about 1920 things");
    }

    #[test]
    fn test_normalize_preserves_code_fences() {
        // The newline opening a fence line survives; interior wrapping is
        // governed by the same lone-newline rule as prose.
        assert_eq!(normalize_ingest("code:\n```"), "code:\n```");
        assert_eq!(
            normalize_ingest("fn main() {}\n```\ntrailing"),
            "fn main() {}\n``` trailing"
        );
    }

    #[test]
    fn test_normalize_indented_bullet() {
        assert_eq!(normalize_ingest("list:\n  - nested"), "list:\n  - nested");
    }
}
