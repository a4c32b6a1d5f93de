use std::path::Path;

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
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
    },
};

use crate::{
    error::Result,
    model::{Page, PageContent},
    query::rewrite_proximity,
};

/// Field names used in the page schema.
pub mod fields {
    pub const PAGE_KEY: &str = "page_key";
    pub const FILENAME: &str = "filename";
    pub const PATH: &str = "path";
    pub const EQUIPMENT: &str = "equipment";
    pub const DOC_CLASS: &str = "doc_class";
    pub const PAGE: &str = "page";
    pub const CONTENT: &str = "content";
}

/// Tokenizer registered on every index this crate opens.
pub(crate) const EN_STEM: &str = "en_stem";

/// Full-text index over manual pages.
pub struct PageIndex {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
}

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
pub struct SchemaFields {
    pub page_key: Field,
    pub filename: Field,
    pub path: Field,
    pub equipment: Field,
    pub doc_class: Field,
    pub page: Field,
    pub content: Field,
}

/// Exact-match restrictions applied alongside the text query.
#[derive(Debug, Clone, Default)]
pub struct PageFilter<'a> {
    pub equipment: Option<&'a str>,
    pub doc_class: Option<&'a str>,
}

/// A page matched by the text query, in index score order.
#[derive(Debug, Clone)]
pub struct PageMatch {
    pub score: f32,
    pub filename: String,
    pub path: String,
    pub equipment: String,
    pub doc_class: String,
    pub page: u32,
    pub content: String,
}

fn build_schema() -> (Schema, SchemaFields) {
    let mut builder = Schema::builder();

    let page_key = builder.add_text_field(fields::PAGE_KEY, STRING);
    let filename = builder.add_text_field(fields::FILENAME, STRING | STORED);
    let path = builder.add_text_field(fields::PATH, STORED);
    let equipment =
        builder.add_text_field(fields::EQUIPMENT, STRING | STORED | FAST);
    let doc_class =
        builder.add_text_field(fields::DOC_CLASS, STRING | STORED | FAST);
    let page = builder.add_u64_field(fields::PAGE, INDEXED | STORED | FAST);

    let content_opts = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(EN_STEM)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();
    let content = builder.add_text_field(fields::CONTENT, content_opts);

    let schema = builder.build();
    let fields = SchemaFields {
        page_key,
        filename,
        path,
        equipment,
        doc_class,
        page,
        content,
    };

    (schema, fields)
}

pub(crate) fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register(EN_STEM, en_stem);
}

pub(crate) fn open_mmap_dir(
    dir: &Path,
) -> Result<tantivy::directory::MmapDirectory> {
    Ok(tantivy::directory::MmapDirectory::open(dir)
        .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?)
}

impl PageIndex {
    /// Open or create a page index at the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let (schema, _) = build_schema();

        let mmap_dir = open_mmap_dir(dir)?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(
                mmap_dir,
                schema,
                tantivy::IndexSettings::default(),
            )?
        };

        Self::from_index(index)
    }

    /// Open an index that ingestion already built. Returns `None` when the
    /// directory or the index inside it does not exist.
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

    /// Create an in-memory page index (for testing).
    pub fn open_in_ram() -> Result<Self> {
        let (schema, _) = build_schema();
        Self::from_index(Index::create_in_ram(schema))
    }

    fn from_index(index: Index) -> Result<Self> {
        let schema = index.schema();
        let field = |name: &str| {
            schema.get_field(name).map_err(|_| {
                crate::error::Error::Retrieval(format!(
                    "page index is missing field '{name}'"
                ))
            })
        };
        let fields = SchemaFields {
            page_key: field(fields::PAGE_KEY)?,
            filename: field(fields::FILENAME)?,
            path: field(fields::PATH)?,
            equipment: field(fields::EQUIPMENT)?,
            doc_class: field(fields::DOC_CLASS)?,
            page: field(fields::PAGE)?,
            content: field(fields::CONTENT)?,
        };

        register_tokenizers(&index);
        let reader = index.reader()?;

        Ok(Self {
            index,
            reader,
            fields,
        })
    }

    /// Get the resolved field handles.
    pub fn fields(&self) -> SchemaFields {
        self.fields
    }

    /// Create a writer with the given memory budget (in bytes).
    pub fn writer(&self, memory_budget: usize) -> Result<IndexWriter> {
        Ok(self.index.writer(memory_budget)?)
    }

    /// Add a page via the given writer, replacing any earlier copy of the
    /// same (filename, page).
    pub fn add_page(&self, writer: &IndexWriter, page: &Page) -> Result<()> {
        let f = self.fields;

        writer.delete_term(Term::from_field_text(f.page_key, &page.key()));

        writer.add_document(doc!(
            f.page_key => page.key(),
            f.filename => page.filename.as_str(),
            f.path => page.path.as_str(),
            f.equipment => page.equipment.as_str(),
            f.doc_class => page.doc_class.as_str(),
            f.page => u64::from(page.page),
            f.content => page.text.as_str(),
        ))?;

        Ok(())
    }

    /// Delete every page belonging to a document.
    pub fn delete_document(&self, writer: &IndexWriter, filename: &str) {
        let term = Term::from_field_text(self.fields.filename, filename);
        writer.delete_term(term);
    }

    /// Run a query in the index dialect, restricted by `filter`.
    ///
    /// Bare terms are AND-ed. Syntax errors are tolerated: the parser keeps
    /// whatever part of the query it understood.
    pub fn search(
        &self,
        query_str: &str,
        filter: &PageFilter<'_>,
        limit: usize,
    ) -> Result<Vec<PageMatch>> {
        let f = self.fields;
        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let mut parser = QueryParser::for_index(&self.index, vec![f.content]);
        parser.set_conjunction_by_default();
        let (user_query, _errors) =
            parser.parse_query_lenient(&rewrite_proximity(query_str));

        let mut clauses: Vec<(Occur, Box<dyn Query>)> =
            vec![(Occur::Must, user_query)];
        if let Some(equipment) = filter.equipment {
            clauses.push((Occur::Must, exact(f.equipment, equipment)));
        }
        if let Some(doc_class) = filter.doc_class {
            clauses.push((Occur::Must, exact(f.doc_class, doc_class)));
        }
        let query = BooleanQuery::new(clauses);

        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            results.push(PageMatch {
                score,
                filename: extract_text(&doc, f.filename),
                path: extract_text(&doc, f.path),
                equipment: extract_text(&doc, f.equipment),
                doc_class: extract_text(&doc, f.doc_class),
                page: extract_page(&doc, f.page),
                content: extract_text(&doc, f.content),
            });
        }

        Ok(results)
    }

    /// Fetch pages of one document in ascending page order. An empty
    /// `pages` slice selects every page.
    pub fn pages_for(
        &self,
        filename: &str,
        pages: &[u32],
    ) -> Result<Vec<PageContent>> {
        let f = self.fields;
        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let mut clauses: Vec<(Occur, Box<dyn Query>)> =
            vec![(Occur::Must, exact(f.filename, filename))];
        if !pages.is_empty() {
            let wanted: Vec<(Occur, Box<dyn Query>)> = pages
                .iter()
                .map(|&page| {
                    let term = Term::from_field_u64(f.page, u64::from(page));
                    let query: Box<dyn Query> = Box::new(TermQuery::new(
                        term,
                        IndexRecordOption::Basic,
                    ));
                    (Occur::Should, query)
                })
                .collect();
            clauses.push((Occur::Must, Box::new(BooleanQuery::new(wanted))));
        }
        let query = BooleanQuery::new(clauses);

        let limit = (searcher.num_docs() as usize).max(1);
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut results = Vec::with_capacity(top_docs.len());
        for (_score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            results.push(PageContent {
                filename: extract_text(&doc, f.filename),
                equipment: extract_text(&doc, f.equipment),
                doc_class: extract_text(&doc, f.doc_class),
                page: extract_page(&doc, f.page),
                content: extract_text(&doc, f.content),
            });
        }
        results.sort_by_key(|p| p.page);

        Ok(results)
    }

    /// Number of searchable pages.
    pub fn num_pages(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }
}

impl std::fmt::Debug for PageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageIndex").finish_non_exhaustive()
    }
}

fn exact(field: Field, value: &str) -> Box<dyn Query> {
    Box::new(TermQuery::new(
        Term::from_field_text(field, value),
        IndexRecordOption::Basic,
    ))
}

pub(crate) fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

pub(crate) fn extract_page(doc: &TantivyDocument, field: Field) -> u32 {
    doc.get_first(field)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(filename: &str, equipment: &str, class: &str, n: u32, text: &str) -> Page {
        Page {
            filename: filename.to_string(),
            path: format!("/manuals/{filename}"),
            equipment: equipment.to_string(),
            doc_class: class.to_string(),
            page: n,
            text: text.to_string(),
        }
    }

    fn seeded() -> PageIndex {
        let idx = PageIndex::open_in_ram().unwrap();
        let mut writer = idx.writer(15_000_000).unwrap();
        for p in [
            page("a.pdf", "c18", "testing", 1, "Valve lash adjustment procedure"),
            page("a.pdf", "c18", "testing", 2, "Check the valve bridge"),
            page("b.pdf", "3516", "disassembly", 7, "Torque sequence for cylinder head bolts"),
        ] {
            idx.add_page(&writer, &p).unwrap();
        }
        writer.commit().unwrap();
        idx
    }

    #[test]
    fn search_finds_stemmed_terms() {
        let idx = seeded();
        let results = idx
            .search("adjusting", &PageFilter::default(), 10)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].filename, "a.pdf");
        assert_eq!(results[0].page, 1);
        assert_eq!(results[0].path, "/manuals/a.pdf");
    }

    #[test]
    fn bare_terms_are_conjunctive() {
        let idx = seeded();
        let results =
            idx.search("valve torque", &PageFilter::default(), 10).unwrap();
        assert!(results.is_empty());

        let results = idx
            .search("valve OR torque", &PageFilter::default(), 10)
            .unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn near_matches_terms_within_distance() {
        let idx = seeded();
        let results = idx
            .search("valve NEAR lash", &PageFilter::default(), 10)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].page, 1);

        assert_eq!(
            idx.search("valve NEAR procedure", &PageFilter::default(), 10)
                .unwrap()
                .len(),
            1
        );
        assert!(
            idx.search("valve NEAR/0 procedure", &PageFilter::default(), 10)
                .unwrap()
                .is_empty()
        );
        assert!(
            idx.search("torque NEAR valve", &PageFilter::default(), 10)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn equipment_and_class_filters() {
        let idx = seeded();
        let filter = PageFilter {
            equipment: Some("3516"),
            doc_class: None,
        };
        let results = idx.search("torque OR valve", &filter, 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].equipment, "3516");

        let filter = PageFilter {
            equipment: None,
            doc_class: Some("testing"),
        };
        let results = idx.search("torque", &filter, 10).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn re_adding_a_page_replaces_it() {
        let idx = seeded();
        let mut writer = idx.writer(15_000_000).unwrap();
        idx.add_page(
            &writer,
            &page("a.pdf", "c18", "testing", 1, "Revised lash procedure"),
        )
        .unwrap();
        writer.commit().unwrap();

        assert_eq!(idx.num_pages().unwrap(), 3);
        let results =
            idx.search("lash", &PageFilter::default(), 10).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].content.starts_with("Revised"));
    }

    #[test]
    fn deleted_document_is_not_searchable() {
        let idx = seeded();
        let mut writer = idx.writer(15_000_000).unwrap();
        idx.delete_document(&writer, "a.pdf");
        writer.commit().unwrap();

        assert_eq!(idx.num_pages().unwrap(), 1);
        assert!(
            idx.search("valve", &PageFilter::default(), 10)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn pages_for_selects_and_orders() {
        let idx = seeded();
        let all = idx.pages_for("a.pdf", &[]).unwrap();
        assert_eq!(all.iter().map(|p| p.page).collect::<Vec<_>>(), vec![1, 2]);

        let second = idx.pages_for("a.pdf", &[2]).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].content, "Check the valve bridge");

        assert!(idx.pages_for("missing.pdf", &[]).unwrap().is_empty());
    }

    #[test]
    fn open_existing_returns_none_for_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(
            PageIndex::open_existing(&tmp.path().join("pages"))
                .unwrap()
                .is_none()
        );

        let empty = tmp.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();
        assert!(PageIndex::open_existing(&empty).unwrap().is_none());
    }

    #[test]
    fn disk_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("pages");

        {
            let idx = PageIndex::open(&dir).unwrap();
            let mut writer = idx.writer(15_000_000).unwrap();
            idx.add_page(
                &writer,
                &page("a.pdf", "c18", "testing", 1, "persistent data"),
            )
            .unwrap();
            writer.commit().unwrap();
        }

        let idx = PageIndex::open_existing(&dir).unwrap().unwrap();
        let results =
            idx.search("persistent", &PageFilter::default(), 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].filename, "a.pdf");
    }
}
