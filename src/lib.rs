//! manualdex - keyword retrieval over indexed technical manuals.
//!
//! Pages of service manuals live in a [Tantivy](https://github.com/quickwit-oss/tantivy)
//! index next to a small [redb](https://github.com/cberner/redb) catalog of
//! documents, tags and logged queries. A [`Retriever`] turns free-text
//! questions into index queries (stop words, known phrases, acronym, synonym
//! and misspelling expansion), ranks the hits with phrase, procedural, tag and
//! authority signals, and falls back to a broader query when a precise one
//! finds too little.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use manualdex::{DataDir, ExpansionTables, RetrievalSettings, Retriever, SearchRequest};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let retriever = Retriever::open(
//!     &data_dir,
//!     Arc::new(ExpansionTables::builtin()),
//!     RetrievalSettings::default(),
//! );
//!
//! let request = SearchRequest::new("how to adjust valve lash").equipment("c18");
//! for hit in retriever.search(&request).unwrap() {
//!     println!("{} p.{} (score: {:.3})", hit.filename, hit.page, hit.score);
//! }
//! ```

pub mod card_index;
pub mod catalog;
pub mod config;
pub mod context;
pub mod data_dir;
pub mod error;
pub mod manifest;
pub mod model;
pub mod page_index;
pub mod query;
pub mod ranking;
pub mod retrieval;
pub mod snippet;

pub use card_index::CardIndex;
pub use catalog::Catalog;
pub use config::{ExpansionTables, RetrievalSettings};
pub use context::ContextPassage;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use manifest::Manifest;
pub use model::SearchHit;
pub use page_index::PageIndex;
pub use query::QueryNormalizer;
pub use retrieval::{Retriever, SearchRequest};
pub use snippet::format_snippet;
