use regex::{Regex, RegexBuilder};

use crate::query::highlight_terms;

/// Default snippet length in characters, before escaping and markup.
pub const DEFAULT_SNIPPET_LENGTH: usize = 300;

pub const HIGHLIGHT_OPEN: &str = "<mark>";
pub const HIGHLIGHT_CLOSE: &str = "</mark>";
pub const ELLIPSIS: &str = "...";

pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Case-insensitive alternation of the terms, longest first so that a
/// longer term wins over its prefix.
fn term_pattern(terms: &[String]) -> Option<Regex> {
    if terms.is_empty() {
        return None;
    }
    let mut sorted: Vec<&String> = terms.iter().collect();
    sorted.sort_by_key(|t| std::cmp::Reverse(t.chars().count()));
    let alternation = sorted
        .iter()
        .map(|t| regex::escape(t))
        .collect::<Vec<_>>()
        .join("|");
    RegexBuilder::new(&alternation)
        .case_insensitive(true)
        .build()
        .ok()
}

fn byte_offset(text: &str, char_idx: usize) -> usize {
    text.char_indices()
        .nth(char_idx)
        .map_or(text.len(), |(offset, _)| offset)
}

/// Build an HTML-safe excerpt of `text` for `query`.
///
/// The window of at most `max_len` characters is centered on the first
/// occurrence of any query term, or starts at the beginning of the text when
/// no term occurs. Every term occurrence inside the window is wrapped in
/// `<mark>`; a clipped side gets an ellipsis.
pub fn format_snippet(text: &str, query: &str, max_len: usize) -> String {
    if text.is_empty() || max_len == 0 {
        return String::new();
    }

    let pattern = term_pattern(&highlight_terms(query));
    let total = text.chars().count();

    let (start, end) = if total <= max_len {
        (0, total)
    } else {
        let first = pattern
            .as_ref()
            .and_then(|p| p.find(text))
            .map(|m| text[..m.start()].chars().count());
        match first {
            Some(pos) => {
                let start = pos.saturating_sub(max_len / 2);
                let end = (start + max_len).min(total);
                (end.saturating_sub(max_len), end)
            }
            None => (0, max_len),
        }
    };

    let window = &text[byte_offset(text, start)..byte_offset(text, end)];

    let mut out = String::with_capacity(window.len() + 32);
    if start > 0 {
        out.push_str(ELLIPSIS);
    }
    match &pattern {
        Some(pattern) => {
            let mut last = 0;
            for m in pattern.find_iter(window) {
                out.push_str(&escape_html(&window[last..m.start()]));
                out.push_str(HIGHLIGHT_OPEN);
                out.push_str(&escape_html(m.as_str()));
                out.push_str(HIGHLIGHT_CLOSE);
                last = m.end();
            }
            out.push_str(&escape_html(&window[last..]));
        }
        None => out.push_str(&escape_html(window)),
    }
    if end < total {
        out.push_str(ELLIPSIS);
    }
    out
}

/// Cut plain text to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((offset, _)) => text[..offset].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visible(snippet: &str) -> String {
        snippet
            .replace(HIGHLIGHT_OPEN, "")
            .replace(HIGHLIGHT_CLOSE, "")
            .replace(ELLIPSIS, "")
    }

    #[test]
    fn empty_text_gives_empty_snippet() {
        assert_eq!(format_snippet("", "valve", 100), "");
    }

    #[test]
    fn short_text_is_escaped_and_highlighted() {
        let s = format_snippet("Check the Valve & <seat>", "valve", 100);
        assert_eq!(s, "Check the <mark>Valve</mark> &amp; &lt;seat&gt;");
    }

    #[test]
    fn long_text_is_centered_on_first_match() {
        let text = format!("{} valve lash {}", "a".repeat(500), "b".repeat(500));
        let s = format_snippet(&text, "valve", 100);
        assert!(s.starts_with(ELLIPSIS));
        assert!(s.ends_with(ELLIPSIS));
        assert!(s.contains("<mark>valve</mark>"));
        assert_eq!(visible(&s).chars().count(), 100);
    }

    #[test]
    fn match_near_start_is_not_prefixed() {
        let text = format!("valve {}", "x".repeat(400));
        let s = format_snippet(&text, "valve", 50);
        assert!(s.starts_with("<mark>valve</mark>"));
        assert!(s.ends_with(ELLIPSIS));
    }

    #[test]
    fn match_near_end_is_not_suffixed() {
        let text = format!("{} valve", "x".repeat(400));
        let s = format_snippet(&text, "valve", 50);
        assert!(s.starts_with(ELLIPSIS));
        assert!(s.ends_with("<mark>valve</mark>"));
        assert_eq!(visible(&s).chars().count(), 50);
    }

    #[test]
    fn no_match_takes_text_from_start() {
        let text = "z".repeat(200);
        let s = format_snippet(&text, "valve", 20);
        assert_eq!(s, format!("{}{ELLIPSIS}", "z".repeat(20)));
    }

    #[test]
    fn operators_are_not_highlighted() {
        let s = format_snippet(
            "Remove AND inspect the seat and the valve",
            "valve AND seat",
            200,
        );
        assert_eq!(
            s,
            "Remove AND inspect the <mark>seat</mark> and the <mark>valve</mark>"
        );
    }

    #[test]
    fn every_occurrence_is_highlighted() {
        let s = format_snippet("lash, LASH and Lash", "lash", 100);
        assert_eq!(s.matches(HIGHLIGHT_OPEN).count(), 3);
    }

    #[test]
    fn multibyte_text_is_cut_on_char_boundaries() {
        let text = format!("{}valve{}", "é".repeat(100), "ü".repeat(100));
        let s = format_snippet(&text, "valve", 21);
        assert!(s.contains("<mark>valve</mark>"));
        assert_eq!(visible(&s).chars().count(), 21);
    }

    #[test]
    fn truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
