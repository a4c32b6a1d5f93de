//! Load-once configuration: the query-expansion tables and the retrieval
//! limits.
//!
//! The tables are read from a versioned JSON resource. A copy is compiled
//! into the binary; operators can point at their own file instead. Tables
//! are immutable once built and meant to be shared behind an `Arc`.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
};

use serde::Deserialize;
use tracing::warn;

use crate::{
    error::{Error, Result},
    query::tokenize,
};

/// Built-in expansion tables.
pub const BUILTIN_EXPANSIONS: &str =
    include_str!("../resources/expansions.json");

/// The only resource layout this build understands.
pub const EXPANSIONS_VERSION: u32 = 1;

/// On-disk shape of the expansion resource.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExpansionFile {
    version: u32,
    #[serde(default)]
    stop_words: Vec<String>,
    #[serde(default)]
    phrases: Vec<String>,
    #[serde(default)]
    acronyms: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    misspellings: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    synonyms: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    procedural_keywords: Vec<String>,
    #[serde(default)]
    procedural_classes: BTreeMap<String, f32>,
    #[serde(default)]
    tag_keywords: BTreeMap<String, Vec<String>>,
}

/// Normalized lookup tables used by the query normalizer and the ranking
/// model. Every key is stored in token form: lowercased and re-joined with
/// single spaces, so lookups match regardless of the spacing or case the
/// resource author used.
#[derive(Debug, Clone, Default)]
pub struct ExpansionTables {
    stop_words: HashSet<String>,
    phrases: HashSet<String>,
    longest_phrase: usize,
    acronyms: HashMap<String, Vec<String>>,
    misspellings: HashMap<String, Vec<String>>,
    synonyms: HashMap<String, Vec<String>>,
    procedural_keywords: Vec<String>,
    procedural_classes: HashMap<String, f32>,
    tag_keywords: HashMap<String, Vec<String>>,
}

fn normalize(text: &str) -> String {
    tokenize(text).join(" ")
}

fn normalize_map(
    map: BTreeMap<String, Vec<String>>,
) -> HashMap<String, Vec<String>> {
    map.into_iter()
        .filter_map(|(key, values)| {
            let key = normalize(&key);
            let values: Vec<String> = values
                .iter()
                .map(|v| normalize(v))
                .filter(|v| !v.is_empty() && *v != key)
                .collect();
            (!key.is_empty() && !values.is_empty()).then_some((key, values))
        })
        .collect()
}

impl ExpansionTables {
    /// Tables with no entries: no stop words, no phrases, no expansion.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The tables compiled into this build.
    pub fn builtin() -> Self {
        Self::from_json(BUILTIN_EXPANSIONS).unwrap_or_else(|e| {
            warn!(error = %e, "built-in expansion tables are invalid");
            Self::empty()
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: ExpansionFile = serde_json::from_str(json)?;
        if file.version != EXPANSIONS_VERSION {
            return Err(Error::Config(format!(
                "unsupported expansion table version {} (expected {})",
                file.version, EXPANSIONS_VERSION
            )));
        }

        let phrases: HashSet<String> = file
            .phrases
            .iter()
            .map(|p| normalize(p))
            .filter(|p| p.contains(' '))
            .collect();
        let longest_phrase = phrases
            .iter()
            .map(|p| p.split(' ').count())
            .max()
            .unwrap_or(0);

        Ok(Self {
            stop_words: file.stop_words.iter().map(|w| normalize(w)).collect(),
            phrases,
            longest_phrase,
            acronyms: normalize_map(file.acronyms),
            misspellings: normalize_map(file.misspellings),
            synonyms: normalize_map(file.synonyms),
            procedural_keywords: file
                .procedural_keywords
                .iter()
                .map(|k| normalize(k))
                .filter(|k| !k.is_empty())
                .collect(),
            procedural_classes: file
                .procedural_classes
                .into_iter()
                .filter(|(_, w)| *w > 0.0)
                .map(|(class, w)| (class.to_lowercase(), w))
                .collect(),
            tag_keywords: file
                .tag_keywords
                .into_iter()
                .map(|(tag, words)| {
                    let words = words.iter().map(|w| normalize(w)).collect();
                    (tag.to_lowercase(), words)
                })
                .collect(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Resolve the tables for a run: the file at `path` when given, the
    /// built-in tables otherwise. An unreadable or invalid file degrades to
    /// empty tables rather than failing.
    pub fn load_or_empty(path: Option<&Path>) -> Self {
        match path {
            None => Self::builtin(),
            Some(path) => Self::load(path).unwrap_or_else(|e| {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "expansion tables unavailable, query expansion disabled"
                );
                Self::empty()
            }),
        }
    }

    pub fn is_stop_word(&self, token: &str) -> bool {
        self.stop_words.contains(token)
    }

    /// Whether `words` (already lowercased tokens) form a known phrase.
    pub fn is_phrase(&self, words: &[String]) -> bool {
        words.len() > 1 && self.phrases.contains(&words.join(" "))
    }

    /// Word count of the longest known phrase.
    pub fn longest_phrase(&self) -> usize {
        self.longest_phrase
    }

    /// Every expansion for a normalized query, in table order (acronyms,
    /// misspellings, synonyms), without duplicates.
    pub fn expansions_for(&self, key: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        [&self.acronyms, &self.misspellings, &self.synonyms]
            .into_iter()
            .filter_map(|table| table.get(key))
            .flatten()
            .map(String::as_str)
            .filter(|v| seen.insert(*v))
            .collect()
    }

    pub fn procedural_keywords(&self) -> &[String] {
        &self.procedural_keywords
    }

    /// Boost weight of a procedural document class, if it is one.
    pub fn procedural_class_weight(&self, doc_class: &str) -> Option<f32> {
        self.procedural_classes
            .get(&doc_class.to_lowercase())
            .copied()
    }

    pub fn tag_keywords(&self, tag: &str) -> &[String] {
        self.tag_keywords
            .get(&tag.to_lowercase())
            .map_or(&[], Vec::as_slice)
    }
}

/// Limits applied by the retrieval orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalSettings {
    /// Pages pulled from the index per pass before filtering and ranking.
    pub candidate_limit: usize,
    /// Precise-pass hit count below which the broad pass runs.
    pub fallback_threshold: usize,
    /// Cap on troubleshooting cards per lookup.
    pub card_limit: usize,
    /// Maximum snippet length, in characters, before escaping.
    pub snippet_length: usize,
    /// Maximum page content length handed to the LLM collaborator.
    pub context_length: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            candidate_limit: 200,
            fallback_threshold: 3,
            card_limit: 20,
            snippet_length: 300,
            context_length: 2000,
        }
    }
}
