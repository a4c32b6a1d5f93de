//! Query normalization: turning free text into the index query dialect.
//!
//! Three variants are produced from the same tokenization:
//!
//! - [`QueryNormalizer::prepare_search_query`] expands acronyms, spelling
//!   fixes and synonyms of the whole query.
//! - [`QueryNormalizer::prepare_smart_query`] drops stop words, groups known
//!   phrases and AND-s what is left. Used by the precise pass.
//! - [`QueryNormalizer::prepare_broad_query`] does the same grouping but
//!   OR-s every unit. The troubleshooting-card lookup uses it as is; the
//!   fallback pass adds the table expansions to it.
//!
//! Queries already written in the index dialect (quotes, uppercase boolean
//! operators, wildcards, parentheses, `field:` prefixes) are returned as
//! given by all three.

use std::{borrow::Cow, sync::LazyLock};

use regex::Regex;

use crate::config::ExpansionTables;

/// Letters and digits, optionally joined by single `-` or `.` so that
/// document ids ("kenr5403-00") and model numbers ("4.4") stay whole.
static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{L}\p{N}]+(?:[-.][\p{L}\p{N}]+)*")
        .expect("token pattern is valid")
});

/// Boolean operators of the index dialect. Case-sensitive on purpose.
static OPERATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:AND|OR|NOT|NEAR)\b").expect("operator pattern is valid")
});

/// `field:value` with nothing between the colon and the value.
static FIELD_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)[A-Za-z_][A-Za-z0-9_]*:\S")
        .expect("field prefix pattern is valid")
});

const OPERATOR_WORDS: [&str; 4] = ["AND", "OR", "NOT", "NEAR"];

/// Word distance of a `NEAR` without an explicit `/n`.
pub const DEFAULT_NEAR_DISTANCE: u32 = 10;

/// `left NEAR right` or `left NEAR/n right`, where each side is a bare word
/// or a quoted phrase with an optional slop.
static PROXIMITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"("[^"]*"(?:~\d+)?|[^\s()"]+)\s+NEAR(?:/(\d+))?\s+("[^"]*"(?:~\d+)?|[^\s()"]+)"#,
    )
    .expect("proximity pattern is valid")
});

/// Words and slop of one `NEAR` operand.
fn proximity_operand(operand: &str) -> (&str, u32) {
    let Some(rest) = operand.strip_prefix('"') else {
        return (operand, 0);
    };
    match rest.rsplit_once('"') {
        Some((words, tail)) => {
            let slop = tail
                .strip_prefix('~')
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            (words.trim(), slop)
        }
        None => (rest, 0),
    }
}

/// Rewrite `a NEAR b` and `a NEAR/n b` into the sloppy phrase `"a b"~n`,
/// which is how the index expresses proximity. Chained operands merge into
/// one phrase whose slop is the sum of the distances.
pub fn rewrite_proximity(query: &str) -> Cow<'_, str> {
    let rounds = query.matches("NEAR").count();
    if rounds == 0 {
        return Cow::Borrowed(query);
    }

    let mut rewritten = query.to_string();
    for _ in 0..rounds {
        let (range, phrase) = {
            let Some(caps) = PROXIMITY.captures(&rewritten) else {
                break;
            };
            let Some(whole) = caps.get(0) else {
                break;
            };
            let (left, left_slop) = proximity_operand(&caps[1]);
            let (right, right_slop) = proximity_operand(&caps[3]);
            let distance = caps
                .get(2)
                .and_then(|n| n.as_str().parse().ok())
                .unwrap_or(DEFAULT_NEAR_DISTANCE);
            let slop = left_slop + distance + right_slop;
            (whole.range(), format!("\"{left} {right}\"~{slop}"))
        };
        rewritten.replace_range(range, &phrase);
    }
    Cow::Owned(rewritten)
}

/// Whether the query is written in the index dialect and must reach the
/// index untouched.
pub fn has_advanced_syntax(query: &str) -> bool {
    query.contains('"')
        || query.contains('*')
        || query.contains('(')
        || query.contains(')')
        || OPERATOR.is_match(query)
        || FIELD_PREFIX.is_match(query)
}

/// Split text into tokens, keeping the original case.
pub fn tokenize_preserving_case(text: &str) -> Vec<String> {
    let text = text.replace('&', " and ");
    TOKEN
        .find_iter(&text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Whether the query has at least one word or number to look up. Stop
/// words count; bare punctuation does not.
pub fn has_searchable_terms(query: &str) -> bool {
    TOKEN.is_match(query)
}

/// Split text into lowercase tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    tokenize_preserving_case(text)
        .into_iter()
        .map(|t| t.to_lowercase())
        .collect()
}

/// Lowercase query tokens worth highlighting: operators, `field:` names and
/// single characters are skipped.
pub fn highlight_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in query.split_whitespace() {
        let word = match word.split_once(':') {
            Some((field, value))
                if !field.is_empty()
                    && field
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_') =>
            {
                value
            }
            _ => word,
        };
        for token in tokenize_preserving_case(word) {
            if OPERATOR_WORDS.contains(&token.as_str())
                || token.chars().count() < 2
            {
                continue;
            }
            let token = token.to_lowercase();
            if !terms.contains(&token) {
                terms.push(token);
            }
        }
    }
    terms
}

/// One element of a normalized query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryUnit {
    Term(String),
    Phrase(Vec<String>),
}

impl QueryUnit {
    /// Render in the index dialect. Phrases are quoted, and so are terms
    /// holding `-` or `.`, which the index tokenizer would otherwise split.
    pub fn render(&self) -> String {
        match self {
            Self::Term(term) => render_term(term),
            Self::Phrase(words) => format!("\"{}\"", words.join(" ")),
        }
    }
}

fn render_term(term: &str) -> String {
    if term.chars().all(char::is_alphanumeric) {
        term.to_string()
    } else {
        format!("\"{term}\"")
    }
}

fn render_terms(words: &[String]) -> String {
    words
        .iter()
        .map(|w| render_term(w))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_expansion(expansion: &str) -> String {
    if expansion.contains(' ') {
        format!("\"{expansion}\"")
    } else {
        render_term(expansion)
    }
}

/// Rewrites user queries using a set of expansion tables.
#[derive(Debug, Clone, Copy)]
pub struct QueryNormalizer<'a> {
    tables: &'a ExpansionTables,
}

impl<'a> QueryNormalizer<'a> {
    pub fn new(tables: &'a ExpansionTables) -> Self {
        Self { tables }
    }

    /// Expand the whole query through the acronym, misspelling and synonym
    /// tables.
    ///
    /// On a table hit the result is `(<original>) OR (<e1> OR <e2> ...)`.
    /// A multi-word query without a hit gets its exact phrase OR-ed in. A
    /// single unmatched word is returned unchanged.
    pub fn prepare_search_query(&self, query: &str) -> String {
        if has_advanced_syntax(query) {
            return query.to_string();
        }
        let words = tokenize_preserving_case(query);
        if words.is_empty() {
            return query.to_string();
        }
        let lower: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();

        if let Some(expanded) = self.expand(&words, &lower) {
            return expanded;
        }
        if words.len() > 1 {
            return format!("({}) OR \"{}\"", render_terms(&words), lower.join(" "));
        }
        query.to_string()
    }

    /// The precise-pass query: stop words removed, known phrases quoted,
    /// remaining units AND-ed. When the content words as a whole have a
    /// table expansion, that expansion is used instead.
    ///
    /// A query made only of stop words is returned unchanged.
    pub fn prepare_smart_query(&self, query: &str) -> String {
        if has_advanced_syntax(query) {
            return query.to_string();
        }
        let content = self.content_tokens(query);
        if content.is_empty() {
            return query.to_string();
        }
        if let Some(expanded) = self.expand(&content, &content) {
            return expanded;
        }
        join_units(&self.group_phrases(content), " ")
    }

    /// The broad variant: the same units as the precise pass, OR-ed.
    pub fn prepare_broad_query(&self, query: &str) -> String {
        if has_advanced_syntax(query) {
            return query.to_string();
        }
        let content = self.content_tokens(query);
        if content.is_empty() {
            return query.to_string();
        }
        join_units(&self.group_phrases(content), " OR ")
    }

    /// The fallback-pass query: the broad variant, with any table expansion
    /// of the content words OR-ed on, so that the fallback never loses a
    /// page the precise pass matched through an expansion.
    pub fn prepare_fallback_query(&self, query: &str) -> String {
        let broad = self.prepare_broad_query(query);
        if has_advanced_syntax(query) {
            return broad;
        }
        let content = self.content_tokens(query);
        let expansions = self.tables.expansions_for(&content.join(" "));
        if content.is_empty() || expansions.is_empty() {
            return broad;
        }
        let mut parts = vec![broad];
        for expansion in expansions {
            let rendered = render_expansion(expansion);
            if !parts.contains(&rendered) {
                parts.push(rendered);
            }
        }
        parts.join(" OR ")
    }

    /// Units the precise and broad variants are built from.
    pub fn units(&self, query: &str) -> Vec<QueryUnit> {
        self.group_phrases(self.content_tokens(query))
    }

    fn content_tokens(&self, query: &str) -> Vec<String> {
        tokenize(query)
            .into_iter()
            .filter(|t| !self.tables.is_stop_word(t))
            .collect()
    }

    /// Greedily group adjacent tokens into the longest known phrase.
    fn group_phrases(&self, tokens: Vec<String>) -> Vec<QueryUnit> {
        let longest = self.tables.longest_phrase();
        let mut units = Vec::with_capacity(tokens.len());
        let mut i = 0;
        while i < tokens.len() {
            let max_len = longest.min(tokens.len() - i);
            let phrase_len = (2..=max_len)
                .rev()
                .find(|&len| self.tables.is_phrase(&tokens[i..i + len]));
            match phrase_len {
                Some(len) => {
                    units.push(QueryUnit::Phrase(tokens[i..i + len].to_vec()));
                    i += len;
                }
                None => {
                    units.push(QueryUnit::Term(tokens[i].clone()));
                    i += 1;
                }
            }
        }
        units
    }

    /// `(<original>) OR (<expansions>)` when `key_tokens` has table entries.
    fn expand(&self, original: &[String], key_tokens: &[String]) -> Option<String> {
        let expansions = self.tables.expansions_for(&key_tokens.join(" "));
        if expansions.is_empty() {
            return None;
        }
        let alternatives = expansions
            .iter()
            .map(|e| render_expansion(e))
            .collect::<Vec<_>>()
            .join(" OR ");
        Some(format!("({}) OR ({alternatives})", render_terms(original)))
    }
}

fn join_units(units: &[QueryUnit], separator: &str) -> String {
    units
        .iter()
        .map(QueryUnit::render)
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> ExpansionTables {
        ExpansionTables::builtin()
    }

    fn balanced(query: &str) -> bool {
        let quotes = query.matches('"').count();
        let mut depth = 0i32;
        for c in query.chars() {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
            if depth < 0 {
                return false;
            }
        }
        quotes % 2 == 0 && depth == 0
    }

    #[test]
    fn advanced_syntax_passes_through_every_variant() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        for query in [
            "valve AND lash",
            "fuel OR coolant",
            "NOT turbo",
            "valve NEAR lash",
            "\"valve lash\" adjustment",
            "inject*",
            "(fuel pump) pressure",
            "content:valve",
            "the AND",
        ] {
            assert!(has_advanced_syntax(query), "{query}");
            assert_eq!(n.prepare_search_query(query), query);
            assert_eq!(n.prepare_smart_query(query), query);
            assert_eq!(n.prepare_broad_query(query), query);
        }
    }

    #[test]
    fn near_becomes_a_sloppy_phrase() {
        assert_eq!(rewrite_proximity("valve NEAR lash"), "\"valve lash\"~10");
        assert_eq!(rewrite_proximity("valve NEAR/3 lash"), "\"valve lash\"~3");
        assert_eq!(
            rewrite_proximity("\"valve lash\" NEAR adjustment AND c18"),
            "\"valve lash adjustment\"~10 AND c18"
        );
        assert_eq!(
            rewrite_proximity("fuel NEAR pump NEAR/2 pressure"),
            "\"fuel pump pressure\"~12"
        );
        assert!(matches!(
            rewrite_proximity("fuel AND pump"),
            Cow::Borrowed("fuel AND pump")
        ));
        assert_eq!(rewrite_proximity("NEARBY parts"), "NEARBY parts");
    }

    #[test]
    fn searchable_terms_need_a_token() {
        assert!(has_searchable_terms("the"));
        assert!(has_searchable_terms("valve*"));
        assert!(!has_searchable_terms("--"));
        assert!(!has_searchable_terms(" ?! "));
    }

    #[test]
    fn prose_is_not_mistaken_for_syntax() {
        for query in [
            "operation and maintenance",
            "to be or not to be",
            "Note: check the oil",
            "4.4 engine",
        ] {
            assert!(!has_advanced_syntax(query), "{query}");
        }
    }

    #[test]
    fn tokenize_keeps_ids_and_model_numbers() {
        assert_eq!(
            tokenize("See KENR5403-00 for the C4.4 / 4.4 engine."),
            vec!["see", "kenr5403-00", "for", "the", "c4.4", "4.4", "engine"]
        );
    }

    #[test]
    fn tokenize_expands_ampersand() {
        assert_eq!(tokenize("nuts&bolts"), vec!["nuts", "and", "bolts"]);
        assert_eq!(
            tokenize("Testing & Adjusting"),
            vec!["testing", "and", "adjusting"]
        );
    }

    #[test]
    fn acronym_expands_to_two_branches() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        let q = n.prepare_search_query("TDC");
        assert_eq!(q, "(TDC) OR (\"top dead center\")");
        let (first, second) = q.split_once(" OR ").unwrap();
        assert_eq!(first, "(TDC)");
        assert!(second.contains("\"top dead center\""));
    }

    #[test]
    fn synonym_phrase_joins_original() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        let q = n.prepare_search_query("valve lash");
        assert!(q.contains("\"valve clearance\""), "{q}");
        assert!(q.starts_with("(valve lash) OR "), "{q}");
    }

    #[test]
    fn misspelling_adds_correct_form() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        assert_eq!(n.prepare_search_query("guage"), "(guage) OR (gauge)");
        assert_eq!(
            n.prepare_search_query("turbo charger"),
            "(turbo charger) OR (turbocharger)"
        );
    }

    #[test]
    fn multi_word_without_match_adds_exact_phrase() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        assert_eq!(
            n.prepare_search_query("cylinder liner"),
            "(cylinder liner) OR \"cylinder liner\""
        );
    }

    #[test]
    fn single_word_without_match_is_unchanged() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        assert_eq!(n.prepare_search_query("Crankshaft"), "Crankshaft");
        assert_eq!(n.prepare_search_query("?!"), "?!");
    }

    #[test]
    fn smart_query_of_stop_words_is_unchanged() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        assert_eq!(n.prepare_smart_query("what is the"), "what is the");
        assert_eq!(n.prepare_broad_query("what is the"), "what is the");
        assert_eq!(n.prepare_smart_query(""), "");
    }

    #[test]
    fn smart_query_groups_phrases() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        assert_eq!(
            n.prepare_smart_query("How to adjust the valve lash"),
            "adjust \"valve lash\""
        );
        assert_eq!(
            n.prepare_smart_query("find top dead center on cylinder 1"),
            "find \"top dead center\" cylinder 1"
        );
    }

    #[test]
    fn smart_query_expands_content_words() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        assert_eq!(
            n.prepare_smart_query("what is TDC"),
            "(tdc) OR (\"top dead center\")"
        );
    }

    #[test]
    fn smart_query_quotes_ids() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        assert_eq!(
            n.prepare_smart_query("KENR5403-00 torque"),
            "\"kenr5403-00\" torque"
        );
    }

    #[test]
    fn broad_query_or_joins_units() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        let q = n.prepare_broad_query("check the fuel pressure and oil filter");
        assert_eq!(q, "check OR \"fuel pressure\" OR \"oil filter\"");
        assert_eq!(q.matches(" OR ").count(), 2);

        let units = n.units("check the fuel pressure and oil filter");
        assert_eq!(units.len(), 3);
        assert_eq!(
            units[1],
            QueryUnit::Phrase(vec!["fuel".into(), "pressure".into()])
        );
    }

    #[test]
    fn broad_query_single_unit_has_no_or() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        assert_eq!(n.prepare_broad_query("valve"), "valve");
        assert_eq!(n.prepare_broad_query("the valve lash"), "\"valve lash\"");
    }

    #[test]
    fn fallback_query_adds_expansions_to_broad() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        assert_eq!(n.prepare_broad_query("what is TDC"), "tdc");
        assert_eq!(
            n.prepare_fallback_query("what is TDC"),
            "tdc OR \"top dead center\""
        );
        assert_eq!(
            n.prepare_fallback_query("the valve lash"),
            "\"valve lash\" OR \"valve clearance\" OR \"valve adjustment\""
        );
        assert_eq!(
            n.prepare_fallback_query("check the oil filter"),
            n.prepare_broad_query("check the oil filter")
        );
        assert_eq!(n.prepare_fallback_query("fuel OR oil"), "fuel OR oil");
    }

    #[test]
    fn empty_tables_disable_expansion() {
        let tables = ExpansionTables::empty();
        let n = QueryNormalizer::new(&tables);
        assert_eq!(n.prepare_search_query("TDC"), "TDC");
        assert_eq!(n.prepare_smart_query("the valve lash"), "the valve lash");
        assert_eq!(
            n.prepare_broad_query("the valve lash"),
            "the OR valve OR lash"
        );
    }

    #[test]
    fn generated_queries_are_balanced() {
        let tables = tables();
        let n = QueryNormalizer::new(&tables);
        for query in [
            "TDC",
            "valve lash",
            "what's the torque for KENR5403-00 bolts?",
            "oil & filter change",
            "how do I bleed the fuel system on a C4.4",
            "coolant",
            "   ",
        ] {
            for out in [
                n.prepare_search_query(query),
                n.prepare_smart_query(query),
                n.prepare_broad_query(query),
                n.prepare_fallback_query(query),
            ] {
                assert!(balanced(&out), "{query:?} -> {out:?}");
            }
        }
    }

    #[test]
    fn highlight_terms_skip_operators_and_fields() {
        assert_eq!(
            highlight_terms("content:valve AND \"lash\" OR a NEAR or"),
            vec!["valve", "lash", "or"]
        );
        assert_eq!(highlight_terms("Valve valve"), vec!["valve"]);
    }
}
