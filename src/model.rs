//! Value types shared by the index store, the ranking model and the
//! retrieval surfaces.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One page of an indexed manual. Created by ingestion, read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub filename: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub equipment: String,
    #[serde(default)]
    pub doc_class: String,
    pub page: u32,
    pub text: String,
}

impl Page {
    /// Unique key of the page inside the index: `<filename>#<page>`.
    pub fn key(&self) -> String {
        page_key(&self.filename, self.page)
    }
}

pub fn page_key(filename: &str, page: u32) -> String {
    format!("{filename}#{page}")
}

/// How strongly a document speaks for the equipment it covers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Authority {
    Primary,
    Secondary,
    Mention,
}

impl Authority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Mention => "mention",
        }
    }
}

/// Label for an optional authority; documents without one are `"unset"`.
pub fn authority_label(authority: Option<Authority>) -> &'static str {
    authority.map_or("unset", Authority::as_str)
}

/// A manual, derived by grouping its pages by filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub filename: String,
    pub equipment: String,
    pub doc_class: String,
    pub page_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<Authority>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TagNamespace {
    /// Equipment systems, e.g. "fuel system".
    System,
    /// Cross-cutting topics, e.g. "safety".
    Topic,
}

impl TagNamespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Topic => "topic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "topic" => Some(Self::Topic),
            _ => None,
        }
    }
}

impl fmt::Display for TagNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub namespace: TagNamespace,
}

/// A document's membership in a tag, with a confidence in (0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTag {
    pub filename: String,
    pub tag: String,
    pub weight: f64,
}

/// A ranked page returned to the search UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub filename: String,
    pub equipment: String,
    pub doc_class: String,
    pub page: u32,
    /// Text relevance reported by the index, before boosts.
    pub base_score: f32,
    pub tags: Vec<String>,
    /// `base_score` multiplied by every applicable ranking factor.
    pub score: f32,
    /// HTML-escaped excerpt with `<mark>` highlights.
    pub snippet: String,
    #[serde(serialize_with = "serialize_authority")]
    pub authority: Option<Authority>,
}

impl SearchHit {
    pub fn authority_label(&self) -> &'static str {
        authority_label(self.authority)
    }
}

fn serialize_authority<S: serde::Serializer>(
    authority: &Option<Authority>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(authority_label(*authority))
}

/// A ranked match from the troubleshooting-card index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardHit {
    pub card_id: String,
    pub equipment: String,
    pub title: String,
    pub snippet: String,
    pub filename: String,
    pub page: u32,
    pub score: f32,
}

/// A page returned by document lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageContent {
    pub filename: String,
    pub equipment: String,
    pub doc_class: String,
    pub page: u32,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagFacet {
    pub name: String,
    pub namespace: TagNamespace,
    pub document_count: usize,
}

/// Population counts for operational displays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub pages: u64,
    pub tags: usize,
    pub cards: u64,
    pub logged_queries: u64,
    pub equipment: Vec<(String, usize)>,
    pub doc_classes: Vec<(String, usize)>,
}

/// One row of the query log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryLogEntry {
    pub query: String,
    pub result_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_class: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}
