//! Composite ranking on top of the index's text relevance.
//!
//! Each signal is a pure function of the hit and the query context that
//! returns a factor. They compose in a fixed order: the tag boost is added to
//! 1.0 first, then multiplied with the phrase, procedural and (when asked
//! for) authority factors. Reordering that composition changes rankings.

use std::collections::HashSet;

use crate::{
    config::ExpansionTables,
    model::Authority,
    query::tokenize,
};

pub const PHRASE_BOOST: f32 = 1.5;
pub const TAG_BOOST_PER_MATCH: f32 = 0.2;
pub const TAG_BOOST_CAP: f32 = 0.6;

/// The parts of a candidate page the ranking signals look at.
#[derive(Debug, Clone, Copy)]
pub struct RankInput<'a> {
    pub doc_class: &'a str,
    pub tags: &'a [String],
    pub content: &'a str,
    pub authority: Option<Authority>,
}

/// Everything about the query the ranking signals need, computed once per
/// search.
#[derive(Debug, Clone)]
pub struct QueryContext<'a> {
    tables: &'a ExpansionTables,
    phrase: Option<String>,
    procedural: bool,
    matching_tags: HashSet<String>,
    boost_authority: bool,
}

impl<'a> QueryContext<'a> {
    /// Classify `query` against the tables and the tag names known to the
    /// store.
    pub fn new<'t>(
        query: &str,
        tables: &'a ExpansionTables,
        known_tags: impl IntoIterator<Item = &'t str>,
        boost_authority: bool,
    ) -> Self {
        let tokens = tokenize(query);
        Self {
            tables,
            phrase: exact_phrase(query),
            procedural: is_procedural(&tokens, tables),
            matching_tags: matching_tags(&tokens, tables, known_tags),
            boost_authority,
        }
    }

    pub fn is_procedural(&self) -> bool {
        self.procedural
    }

    /// Lowercased names of the tags the query points at.
    pub fn matching_tags(&self) -> &HashSet<String> {
        &self.matching_tags
    }
}

/// The query as a lowercase phrase, if it has at least two words.
fn exact_phrase(query: &str) -> Option<String> {
    let cleaned = query.replace('"', " ");
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    (words.len() >= 2).then(|| words.join(" ").to_lowercase())
}

fn contains_sequence(tokens: &[String], needle: &[String]) -> bool {
    !needle.is_empty() && tokens.windows(needle.len()).any(|w| w == needle)
}

/// A query is procedural when it names an action: a single-word keyword
/// matches any token it prefixes ("adjust" matches "adjusting"), a
/// multi-word keyword must appear as consecutive tokens.
pub fn is_procedural(tokens: &[String], tables: &ExpansionTables) -> bool {
    tables.procedural_keywords().iter().any(|keyword| {
        let keyword_tokens = tokenize(keyword);
        match keyword_tokens.as_slice() {
            [single] => tokens.iter().any(|t| t.starts_with(single.as_str())),
            _ => contains_sequence(tokens, &keyword_tokens),
        }
    })
}

/// Tags whose name, or one of whose configured keywords, occurs in the
/// query on word boundaries.
pub fn matching_tags<'t>(
    tokens: &[String],
    tables: &ExpansionTables,
    known_tags: impl IntoIterator<Item = &'t str>,
) -> HashSet<String> {
    known_tags
        .into_iter()
        .filter(|tag| {
            contains_sequence(tokens, &tokenize(tag))
                || tables
                    .tag_keywords(tag)
                    .iter()
                    .any(|kw| contains_sequence(tokens, &tokenize(kw)))
        })
        .map(str::to_lowercase)
        .collect()
}

/// ×1.5 when the multi-word query appears verbatim in the content.
pub fn phrase_factor(hit: &RankInput<'_>, ctx: &QueryContext<'_>) -> f32 {
    let Some(phrase) = &ctx.phrase else {
        return 1.0;
    };
    let content = hit
        .content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if content.contains(phrase.as_str()) {
        PHRASE_BOOST
    } else {
        1.0
    }
}

/// The class weight of a procedural document class for a procedural query.
pub fn procedural_factor(hit: &RankInput<'_>, ctx: &QueryContext<'_>) -> f32 {
    if !ctx.procedural || hit.doc_class.is_empty() {
        return 1.0;
    }
    ctx.tables
        .procedural_class_weight(hit.doc_class)
        .unwrap_or(1.0)
}

/// `1.0 + 0.2 × overlapping tags`, capped at `1.6`.
pub fn tag_factor(hit: &RankInput<'_>, ctx: &QueryContext<'_>) -> f32 {
    let overlap = hit
        .tags
        .iter()
        .map(|t| t.to_lowercase())
        .collect::<HashSet<_>>()
        .intersection(&ctx.matching_tags)
        .count();
    1.0 + (overlap as f32 * TAG_BOOST_PER_MATCH).min(TAG_BOOST_CAP)
}

/// Source authority; neutral unless the caller asked for it.
pub fn authority_factor(hit: &RankInput<'_>, ctx: &QueryContext<'_>) -> f32 {
    if !ctx.boost_authority {
        return 1.0;
    }
    match hit.authority {
        Some(Authority::Primary) => 1.5,
        Some(Authority::Secondary) | None => 1.0,
        Some(Authority::Mention) => 0.7,
    }
}

/// Product of every signal, in composition order.
pub fn multiplier(hit: &RankInput<'_>, ctx: &QueryContext<'_>) -> f32 {
    tag_factor(hit, ctx)
        * phrase_factor(hit, ctx)
        * procedural_factor(hit, ctx)
        * authority_factor(hit, ctx)
}

/// Final score of a hit: text relevance times the composite multiplier.
pub fn final_score(
    base_score: f32,
    hit: &RankInput<'_>,
    ctx: &QueryContext<'_>,
) -> f32 {
    base_score * multiplier(hit, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAGS: [&str; 5] = [
        "fuel system",
        "cooling system",
        "lubrication system",
        "safety",
        "electrical system",
    ];

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    fn input<'a>(doc_class: &'a str, tags: &'a [String], content: &'a str) -> RankInput<'a> {
        RankInput {
            doc_class,
            tags,
            content,
            authority: None,
        }
    }

    #[test]
    fn neutral_hit_keeps_base_score() {
        let tables = ExpansionTables::builtin();
        let ctx = QueryContext::new("valve lash", &tables, TAGS, true);
        let hit = input("", &[], "nothing relevant here");
        assert!(approx(final_score(2.0, &hit, &ctx), 2.0));
    }

    #[test]
    fn phrase_boost_needs_two_words_and_verbatim_match() {
        let tables = ExpansionTables::builtin();
        let ctx = QueryContext::new("Valve Lash", &tables, TAGS, false);
        let tags = vec![];
        let with = input("", &tags, "Measure the valve\n  lash with a gauge");
        let without = input("", &tags, "Lash the valve cover down");
        assert!(approx(phrase_factor(&with, &ctx), PHRASE_BOOST));
        assert!(approx(phrase_factor(&without, &ctx), 1.0));

        let single = QueryContext::new("valve", &tables, TAGS, false);
        assert!(approx(phrase_factor(&with, &single), 1.0));
    }

    #[test]
    fn phrase_hit_never_ranks_below_identical_hit_without_it() {
        let tables = ExpansionTables::builtin();
        for query in ["valve lash", "how to adjust valve lash", "torque sequence"] {
            let ctx = QueryContext::new(query, &tables, TAGS, true);
            let tags = vec!["fuel system".to_string()];
            let content_with = format!("Intro. {query} details.");
            let with = input("testing", &tags, &content_with);
            let without = input("testing", &tags, "Intro. unrelated details.");
            assert!(
                final_score(1.0, &with, &ctx)
                    >= final_score(1.0, &without, &ctx),
                "{query}"
            );
        }
    }

    #[test]
    fn procedural_classification() {
        let tables = ExpansionTables::builtin();
        let procedural = |q: &str| is_procedural(&tokenize(q), &tables);
        assert!(procedural("How to adjust valve lash"));
        assert!(procedural("Replace the fuel filter"));
        assert!(procedural("adjusting the rack"));
        assert!(procedural("head bolt TORQUE"));
        assert!(!procedural("valve lash specification"));
        assert!(!procedural("what is top dead center"));
    }

    #[test]
    fn procedural_boost_is_weighted_per_class() {
        let tables = ExpansionTables::builtin();
        let ctx = QueryContext::new("adjust valve lash", &tables, TAGS, false);
        let tags = vec![];
        let factor =
            |class: &str| procedural_factor(&input(class, &tags, ""), &ctx);
        assert!(approx(factor("testing"), 1.4));
        assert!(approx(factor("disassembly"), 1.3));
        assert!(factor("testing") >= factor("maintenance"));
        assert!(approx(factor("parts"), 1.0));
        assert!(approx(factor(""), 1.0));

        let plain = QueryContext::new("valve lash", &tables, TAGS, false);
        let hit = input("testing", &tags, "");
        assert!(approx(procedural_factor(&hit, &plain), 1.0));
    }

    #[test]
    fn matching_tags_from_names_and_keywords() {
        let tables = ExpansionTables::builtin();
        let ctx = QueryContext::new(
            "fuel injector warning on the cooling system",
            &tables,
            TAGS,
            false,
        );
        let expected: HashSet<String> = ["fuel system", "cooling system", "safety"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(ctx.matching_tags(), &expected);

        let none = QueryContext::new("fueling", &tables, TAGS, false);
        assert!(none.matching_tags().is_empty());
    }

    #[test]
    fn tag_boost_grows_then_caps() {
        let tables = ExpansionTables::builtin();
        let ctx = QueryContext::new(
            "fuel coolant oil battery warning",
            &tables,
            TAGS,
            false,
        );
        assert_eq!(ctx.matching_tags().len(), 5);

        let mut previous = 0.0;
        let mut factors = Vec::new();
        for n in 0..=5 {
            let tags: Vec<String> =
                TAGS[..n].iter().map(|t| t.to_uppercase()).collect();
            let factor = tag_factor(&input("", &tags, ""), &ctx);
            assert!(factor >= previous);
            previous = factor;
            factors.push(factor);
        }
        assert!(approx(factors[0], 1.0));
        assert!(approx(factors[1], 1.2));
        assert!(approx(factors[3], 1.6));
        assert!(approx(factors[4], factors[3]));
        assert!(approx(factors[5], factors[3]));
    }

    #[test]
    fn authority_only_when_requested() {
        let tables = ExpansionTables::builtin();
        let on = QueryContext::new("valve", &tables, TAGS, true);
        let off = QueryContext::new("valve", &tables, TAGS, false);
        let mut hit = input("", &[], "");
        for (authority, expected) in [
            (Some(Authority::Primary), 1.5),
            (Some(Authority::Secondary), 1.0),
            (Some(Authority::Mention), 0.7),
            (None, 1.0),
        ] {
            hit.authority = authority;
            assert!(approx(authority_factor(&hit, &on), expected));
            assert!(approx(authority_factor(&hit, &off), 1.0));
        }
    }

    #[test]
    fn factors_compose_multiplicatively() {
        let tables = ExpansionTables::builtin();
        let ctx = QueryContext::new("adjust valve lash", &tables, TAGS, false);
        let no_tags = vec![];
        let hit = input("testing", &no_tags, "Adjust valve lash as follows");
        assert!(approx(multiplier(&hit, &ctx), 2.1));

        let ctx = QueryContext::new("adjust fuel", &tables, TAGS, false);
        let tags = vec!["fuel system".to_string()];
        let hit = input("testing", &tags, "adjust fuel rack");
        // (1.0 + 0.2) × 1.5 × 1.4
        assert!(approx(multiplier(&hit, &ctx), 2.52));
    }
}
