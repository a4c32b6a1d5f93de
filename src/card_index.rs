use std::path::Path;

use serde::{Deserialize, Serialize};
use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    Term,
    collector::TopDocs,
    doc,
    query::{BooleanQuery, Occur, Query, QueryParser, TermQuery},
    schema::*,
};

use crate::{
    error::Result,
    page_index::{
        EN_STEM,
        extract_page,
        extract_text,
        open_mmap_dir,
        register_tokenizers,
    },
    query::rewrite_proximity,
};

pub mod fields {
    pub const CARD_ID: &str = "card_id";
    pub const EQUIPMENT: &str = "equipment";
    pub const TITLE: &str = "title";
    pub const BODY: &str = "body";
    pub const FILENAME: &str = "filename";
    pub const PAGE: &str = "page";
}

/// A structured troubleshooting card: a symptom title, the diagnostic
/// steps, and the manual page it was lifted from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TroubleshootingCard {
    pub card_id: String,
    #[serde(default)]
    pub equipment: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub page: u32,
}

#[derive(Debug, Clone)]
pub struct CardMatch {
    pub score: f32,
    pub card: TroubleshootingCard,
}

#[derive(Clone, Copy)]
struct CardFields {
    card_id: Field,
    equipment: Field,
    title: Field,
    body: Field,
    filename: Field,
    page: Field,
}

/// Optional secondary index of troubleshooting cards.
pub struct CardIndex {
    index: Index,
    reader: IndexReader,
    fields: CardFields,
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();

    builder.add_text_field(fields::CARD_ID, STRING | STORED);
    builder.add_text_field(fields::EQUIPMENT, STRING | STORED);

    let text_opts = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(EN_STEM)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    builder.add_text_field(fields::TITLE, text_opts.clone());
    builder.add_text_field(fields::BODY, text_opts);

    builder.add_text_field(fields::FILENAME, STORED);
    builder.add_u64_field(fields::PAGE, STORED);

    builder.build()
}

impl CardIndex {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mmap_dir = open_mmap_dir(dir)?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(
                mmap_dir,
                build_schema(),
                tantivy::IndexSettings::default(),
            )?
        };
        Self::from_index(index)
    }

    /// Open the card index if ingestion produced one.
    pub fn open_existing(dir: &Path) -> Result<Option<Self>> {
        if !dir.is_dir() {
            return Ok(None);
        }
        let mmap_dir = open_mmap_dir(dir)?;
        if !Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            return Ok(None);
        }
        Self::from_index(Index::open(mmap_dir)?).map(Some)
    }

    pub fn open_in_ram() -> Result<Self> {
        Self::from_index(Index::create_in_ram(build_schema()))
    }

    fn from_index(index: Index) -> Result<Self> {
        let schema = index.schema();
        let field = |name: &str| {
            schema.get_field(name).map_err(|_| {
                crate::error::Error::Retrieval(format!(
                    "card index is missing field '{name}'"
                ))
            })
        };
        let fields = CardFields {
            card_id: field(fields::CARD_ID)?,
            equipment: field(fields::EQUIPMENT)?,
            title: field(fields::TITLE)?,
            body: field(fields::BODY)?,
            filename: field(fields::FILENAME)?,
            page: field(fields::PAGE)?,
        };

        register_tokenizers(&index);
        let reader = index.reader()?;

        Ok(Self {
            index,
            reader,
            fields,
        })
    }

    pub fn writer(&self, memory_budget: usize) -> Result<IndexWriter> {
        Ok(self.index.writer(memory_budget)?)
    }

    /// Add a card, replacing any card with the same id.
    pub fn add_card(
        &self,
        writer: &IndexWriter,
        card: &TroubleshootingCard,
    ) -> Result<()> {
        let f = self.fields;
        writer.delete_term(Term::from_field_text(f.card_id, &card.card_id));
        writer.add_document(doc!(
            f.card_id => card.card_id.as_str(),
            f.equipment => card.equipment.as_str(),
            f.title => card.title.as_str(),
            f.body => card.body.as_str(),
            f.filename => card.filename.as_str(),
            f.page => u64::from(card.page),
        ))?;
        Ok(())
    }

    /// Search titles (boosted 2x) and bodies, optionally restricted to one
    /// equipment code.
    pub fn search(
        &self,
        query_str: &str,
        equipment: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CardMatch>> {
        let f = self.fields;
        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let mut parser =
            QueryParser::for_index(&self.index, vec![f.title, f.body]);
        parser.set_field_boost(f.title, 2.0);
        parser.set_conjunction_by_default();
        let (user_query, _errors) =
            parser.parse_query_lenient(&rewrite_proximity(query_str));

        let query: Box<dyn Query> = match equipment {
            Some(code) => Box::new(BooleanQuery::new(vec![
                (Occur::Must, user_query),
                (
                    Occur::Must,
                    Box::new(TermQuery::new(
                        Term::from_field_text(f.equipment, code),
                        IndexRecordOption::Basic,
                    )),
                ),
            ])),
            None => user_query,
        };

        let top_docs =
            searcher.search(&*query, &TopDocs::with_limit(limit.max(1)))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            results.push(CardMatch {
                score,
                card: TroubleshootingCard {
                    card_id: extract_text(&doc, f.card_id),
                    equipment: extract_text(&doc, f.equipment),
                    title: extract_text(&doc, f.title),
                    body: extract_text(&doc, f.body),
                    filename: extract_text(&doc, f.filename),
                    page: extract_page(&doc, f.page),
                },
            });
        }

        Ok(results)
    }

    pub fn num_cards(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }
}

impl std::fmt::Debug for CardIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardIndex").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(id: &str, equipment: &str, title: &str, body: &str) -> TroubleshootingCard {
        TroubleshootingCard {
            card_id: id.to_string(),
            equipment: equipment.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            filename: "troubleshooting.pdf".to_string(),
            page: 3,
        }
    }

    fn seeded() -> CardIndex {
        let idx = CardIndex::open_in_ram().unwrap();
        let mut writer = idx.writer(15_000_000).unwrap();
        idx.add_card(
            &writer,
            &card("t1", "c18", "Low oil pressure", "Check the oil level and the oil filter."),
        )
        .unwrap();
        idx.add_card(
            &writer,
            &card("t2", "3516", "Engine overheating", "Inspect the coolant level and the oil cooler."),
        )
        .unwrap();
        writer.commit().unwrap();
        idx
    }

    #[test]
    fn title_match_outranks_body_match() {
        let idx = seeded();
        let results = idx.search("oil", None, 20).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].card.card_id, "t1");
        assert_eq!(results[0].card.page, 3);
    }

    #[test]
    fn equipment_filter_restricts_cards() {
        let idx = seeded();
        let results = idx.search("oil", Some("3516"), 20).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].card.card_id, "t2");
    }

    #[test]
    fn re_adding_card_replaces_it() {
        let idx = seeded();
        let mut writer = idx.writer(15_000_000).unwrap();
        idx.add_card(&writer, &card("t1", "c18", "Low fuel pressure", "Prime the fuel system."))
            .unwrap();
        writer.commit().unwrap();

        assert_eq!(idx.num_cards().unwrap(), 2);
        assert!(idx.search("prime", None, 20).unwrap().len() == 1);
    }
}
