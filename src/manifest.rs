//! Seeding a store from a JSON manifest.
//!
//! Production stores are written by the external ingestion job. A manifest
//! carries the same records in one file, which is how operators seed a
//! store by hand and how the tests build one.

use std::{collections::BTreeMap, path::Path};

use serde::Deserialize;
use tracing::info;

use crate::{
    card_index::{CardIndex, TroubleshootingCard},
    catalog::Catalog,
    data_dir::DataDir,
    error::{Error, Result},
    model::{Authority, Document, DocumentTag, Page, Tag},
    page_index::PageIndex,
};

const WRITER_MEMORY_BUDGET: usize = 50_000_000;

/// Per-document metadata that cannot be derived from the pages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DocumentInfo {
    pub filename: String,
    #[serde(default)]
    pub authority: Option<Authority>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub pages: Vec<Page>,
    #[serde(default)]
    pub documents: Vec<DocumentInfo>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub document_tags: Vec<DocumentTag>,
    #[serde(default)]
    pub cards: Vec<TroubleshootingCard>,
}

/// What a load wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub documents: usize,
    pub pages: usize,
    pub tags: usize,
    pub document_tags: usize,
    pub cards: usize,
}

impl Manifest {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Documents derived by grouping pages by filename, ordered by filename.
    ///
    /// All pages of a document must agree on equipment and doc-class, and
    /// every `documents` entry must name a document that has pages.
    pub fn documents(&self) -> Result<Vec<Document>> {
        let mut grouped: BTreeMap<&str, Document> = BTreeMap::new();
        for page in &self.pages {
            if page.filename.is_empty() {
                return Err(Error::Validation(format!(
                    "page {} has no filename",
                    page.page
                )));
            }
            match grouped.get_mut(page.filename.as_str()) {
                Some(doc) => {
                    if doc.equipment != page.equipment
                        || doc.doc_class != page.doc_class
                    {
                        return Err(Error::Validation(format!(
                            "page {} of '{}' disagrees on equipment or doc_class",
                            page.page, page.filename
                        )));
                    }
                    doc.page_count += 1;
                }
                None => {
                    grouped.insert(
                        &page.filename,
                        Document {
                            filename: page.filename.clone(),
                            equipment: page.equipment.clone(),
                            doc_class: page.doc_class.clone(),
                            page_count: 1,
                            authority: None,
                        },
                    );
                }
            }
        }

        for info in &self.documents {
            let doc = grouped.get_mut(info.filename.as_str()).ok_or_else(|| {
                Error::Validation(format!(
                    "document '{}' has no pages",
                    info.filename
                ))
            })?;
            doc.authority = info.authority;
        }

        Ok(grouped.into_values().collect())
    }

    /// Write the manifest into open store handles.
    ///
    /// Every document named by the manifest is replaced as a whole: its old
    /// pages and tag rows are dropped before the new ones are written. The
    /// card index is optional; cards are skipped without one.
    pub fn apply(
        &self,
        pages: &PageIndex,
        catalog: &Catalog,
        cards: Option<&CardIndex>,
    ) -> Result<LoadReport> {
        let documents = self.documents()?;
        let mut report = LoadReport::default();

        let mut writer = pages.writer(WRITER_MEMORY_BUDGET)?;
        for doc in &documents {
            pages.delete_document(&writer, &doc.filename);
        }
        for page in &self.pages {
            pages.add_page(&writer, page)?;
            report.pages += 1;
        }
        writer.commit()?;

        for doc in &documents {
            catalog.remove_document(&doc.filename)?;
            catalog.put_document(doc)?;
            report.documents += 1;
        }
        for tag in &self.tags {
            catalog.put_tag(tag)?;
            report.tags += 1;
        }
        for dt in &self.document_tags {
            catalog.tag_document(&dt.filename, &dt.tag, dt.weight)?;
            report.document_tags += 1;
        }

        if let Some(index) = cards
            && !self.cards.is_empty()
        {
            let mut writer = index.writer(WRITER_MEMORY_BUDGET)?;
            for card in &self.cards {
                index.add_card(&writer, card)?;
                report.cards += 1;
            }
            writer.commit()?;
        }

        Ok(report)
    }

    /// Open (or create) the store under `data_dir` and apply the manifest.
    pub fn load_into(&self, data_dir: &DataDir) -> Result<LoadReport> {
        std::fs::create_dir_all(data_dir.root())?;
        let pages = PageIndex::open(&data_dir.pages_dir())?;
        let catalog = Catalog::open(&data_dir.catalog_db())?;
        let cards = if self.cards.is_empty() {
            None
        } else {
            Some(CardIndex::open(&data_dir.cards_dir())?)
        };

        let report = self.apply(&pages, &catalog, cards.as_ref())?;
        info!(
            documents = report.documents,
            pages = report.pages,
            cards = report.cards,
            "loaded manifest"
        );
        Ok(report)
    }
}
