use std::{
    cmp::Ordering,
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::{debug, warn};

use crate::{
    card_index::CardIndex,
    catalog::Catalog,
    config::{ExpansionTables, RetrievalSettings},
    context::{ContextPassage, to_context},
    data_dir::DataDir,
    error::{Error, Result},
    model::{
        Authority,
        CardHit,
        IndexStats,
        PageContent,
        QueryLogEntry,
        SearchHit,
        TagFacet,
    },
    page_index::{PageFilter, PageIndex},
    query::{QueryNormalizer, has_searchable_terms},
    ranking::{self, QueryContext, RankInput},
    snippet::format_snippet,
};

pub const DEFAULT_LIMIT: usize = 10;

/// Parameters of one search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub equipment: Option<String>,
    pub doc_class: Option<String>,
    /// A hit's document must carry every one of these tags.
    pub tags: Vec<String>,
    pub limit: usize,
    pub offset: usize,
    pub boost_authority: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            equipment: None,
            doc_class: None,
            tags: Vec::new(),
            limit: DEFAULT_LIMIT,
            offset: 0,
            boost_authority: false,
        }
    }

    pub fn equipment(mut self, equipment: impl Into<String>) -> Self {
        self.equipment = Some(equipment.into());
        self
    }

    pub fn doc_class(mut self, doc_class: impl Into<String>) -> Self {
        self.doc_class = Some(doc_class.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn boost_authority(mut self, boost: bool) -> Self {
        self.boost_authority = boost;
        self
    }
}

/// The retrieval passes a search goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Stop words dropped, phrases grouped, units AND-ed.
    Precise,
    /// Same units OR-ed, for recall.
    Fallback,
    Done,
}

impl Pass {
    /// The pass after this one. Only a first page whose precise pass found
    /// fewer than `threshold` hits falls back, and only once.
    pub fn next(self, offset: usize, hits: usize, threshold: usize) -> Self {
        match self {
            Self::Precise if offset == 0 && hits < threshold => Self::Fallback,
            Self::Precise | Self::Fallback | Self::Done => Self::Done,
        }
    }
}

/// A hit together with the page text it was ranked on.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedPage {
    pub hit: SearchHit,
    pub content: String,
}

/// Ranked results of one search plus the troubleshooting-card lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub cards: Vec<CardHit>,
    /// Hits across all pages, before pagination.
    pub total: usize,
    pub fallback_used: bool,
}

/// Metadata of a hit's document, looked up once per search.
#[derive(Debug, Clone, Default)]
struct DocumentProfile {
    tags: Vec<String>,
    authority: Option<Authority>,
    equipment: String,
    doc_class: String,
}

impl DocumentProfile {
    fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// Where a retriever gets its catalog from.
#[derive(Debug, Clone)]
enum CatalogSource {
    Attached(Catalog),
    /// Opened per operation, so no handle outlives the call.
    Path(PathBuf),
}

/// Read side of the manual index: search, grounding context, page lookup
/// and operational statistics.
///
/// Every part of the store is optional. A missing page index makes every
/// read return empty results; a missing catalog leaves hits without tags or
/// authority; a missing card index yields no cards.
pub struct Retriever {
    tables: Arc<ExpansionTables>,
    settings: RetrievalSettings,
    pages: Option<PageIndex>,
    catalog: Option<CatalogSource>,
    cards: Option<CardIndex>,
}

fn open_soft<T>(result: Result<Option<T>>, what: &str) -> Option<T> {
    match result {
        Ok(Some(store)) => Some(store),
        Ok(None) => {
            debug!(store = what, "not present");
            None
        }
        Err(e) => {
            warn!(store = what, error = %e, "failed to open, treating as unavailable");
            None
        }
    }
}

fn generic(e: Error) -> Error {
    match e {
        Error::Retrieval(_) => e,
        other => Error::Retrieval(other.to_string()),
    }
}

impl Retriever {
    /// A retriever with no store attached.
    pub fn new(tables: Arc<ExpansionTables>, settings: RetrievalSettings) -> Self {
        Self {
            tables,
            settings,
            pages: None,
            catalog: None,
            cards: None,
        }
    }

    /// Attach whatever parts of the store exist under `data_dir`. Never
    /// fails: absent or unreadable indexes are left unattached. The catalog
    /// is opened per operation; a catalog that exists but cannot be opened
    /// then fails that operation.
    pub fn open(
        data_dir: &DataDir,
        tables: Arc<ExpansionTables>,
        settings: RetrievalSettings,
    ) -> Self {
        let mut retriever = Self::new(tables, settings);
        retriever.pages =
            open_soft(PageIndex::open_existing(&data_dir.pages_dir()), "pages");
        let catalog_db = data_dir.catalog_db();
        if catalog_db.is_file() {
            retriever.catalog = Some(CatalogSource::Path(catalog_db));
        } else {
            debug!(store = "catalog", "not present");
        }
        retriever.cards =
            open_soft(CardIndex::open_existing(&data_dir.cards_dir()), "cards");
        retriever
    }

    pub fn with_pages(mut self, pages: PageIndex) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(CatalogSource::Attached(catalog));
        self
    }

    pub fn with_cards(mut self, cards: CardIndex) -> Self {
        self.cards = Some(cards);
        self
    }

    pub fn is_available(&self) -> bool {
        self.pages.is_some()
    }

    pub fn tables(&self) -> &ExpansionTables {
        &self.tables
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    /// A handle for the duration of one operation.
    fn catalog(&self) -> Result<Option<Catalog>> {
        match &self.catalog {
            None => Ok(None),
            Some(CatalogSource::Attached(catalog)) => Ok(Some(catalog.clone())),
            Some(CatalogSource::Path(path)) => {
                Catalog::open_existing(path).map_err(generic)
            }
        }
    }

    /// Ranked, filtered and paginated hits for the search UI.
    pub fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        Ok(self
            .search_ranked(request)?
            .into_iter()
            .map(|r| r.hit)
            .collect())
    }

    /// Page hits plus the troubleshooting-card lookup for the same query.
    pub fn search_with_cards(
        &self,
        request: &SearchRequest,
    ) -> Result<SearchOutcome> {
        let run = self.run_passes(request).map_err(generic)?;
        let cards = cards_or_empty(
            self.troubleshooting_cards(&request.query, request.equipment.as_deref()),
        );
        Ok(SearchOutcome {
            hits: run.page.into_iter().map(|r| r.hit).collect(),
            cards,
            total: run.total,
            fallback_used: run.fallback_used,
        })
    }

    /// Like [`Retriever::search`], keeping the page text of every hit.
    pub fn search_ranked(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<RankedPage>> {
        Ok(self.run_passes(request).map_err(generic)?.page)
    }

    /// Grounding passages for the LLM assistant. Always authority-boosted.
    pub fn get_context_for_llm(
        &self,
        query: &str,
        equipment: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ContextPassage>> {
        let mut request = SearchRequest::new(query)
            .limit(limit)
            .boost_authority(true);
        request.equipment = equipment.map(str::to_string);
        let ranked = self.search_ranked(&request)?;
        Ok(to_context(&ranked, self.settings.context_length))
    }

    /// Troubleshooting cards for a query: broad variant, capped, never
    /// paginated.
    pub fn troubleshooting_cards(
        &self,
        query: &str,
        equipment: Option<&str>,
    ) -> Result<Vec<CardHit>> {
        let Some(cards) = &self.cards else {
            return Ok(Vec::new());
        };
        if !has_searchable_terms(query) {
            return Ok(Vec::new());
        }
        let broad = QueryNormalizer::new(&self.tables).prepare_broad_query(query);
        let matches = cards
            .search(&broad, equipment, self.settings.card_limit)
            .map_err(generic)?;
        Ok(matches
            .into_iter()
            .map(|m| CardHit {
                snippet: format_snippet(
                    &m.card.body,
                    query,
                    self.settings.snippet_length,
                ),
                card_id: m.card.card_id,
                equipment: m.card.equipment,
                title: m.card.title,
                filename: m.card.filename,
                page: m.card.page,
                score: m.score,
            })
            .collect())
    }

    /// Pages of a document in page order; all pages when `pages` is empty.
    ///
    /// When no document has exactly `document_id` as filename, the first
    /// document whose filename starts with its leading identifier is used,
    /// so truncated citations ("KENR5403-00") still resolve.
    pub fn get_pages_content(
        &self,
        document_id: &str,
        pages: &[u32],
    ) -> Result<Vec<PageContent>> {
        let Some(index) = &self.pages else {
            return Ok(Vec::new());
        };
        if self.document_exists(index, document_id)? {
            return index.pages_for(document_id, pages).map_err(generic);
        }
        match self.resolve_by_prefix(document_id).map_err(generic)? {
            Some(filename) => {
                debug!(document_id, %filename, "resolved document by prefix");
                index.pages_for(&filename, pages).map_err(generic)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Tag counts for facet displays.
    pub fn tag_facets(&self, equipment: Option<&str>) -> Result<Vec<TagFacet>> {
        match self.catalog()? {
            Some(catalog) => catalog.tag_facets(equipment).map_err(generic),
            None => Ok(Vec::new()),
        }
    }

    /// Index population counts; zeros for absent parts of the store.
    pub fn stats(&self) -> Result<IndexStats> {
        let mut stats = IndexStats::default();
        if let Some(pages) = &self.pages {
            stats.pages = pages.num_pages().map_err(generic)?;
        }
        if let Some(cards) = &self.cards {
            stats.cards = cards.num_cards().map_err(generic)?;
        }
        if let Some(catalog) = self.catalog()? {
            let documents = catalog.list_documents().map_err(generic)?;
            stats.documents = documents.len();
            stats.equipment =
                count_by(documents.iter().map(|d| d.equipment.as_str()));
            stats.doc_classes =
                count_by(documents.iter().map(|d| d.doc_class.as_str()));
            stats.tags = catalog.list_tags().map_err(generic)?.len();
            stats.logged_queries = catalog.query_count().map_err(generic)?;
        }
        Ok(stats)
    }

    /// Most recent logged queries, newest first.
    pub fn recent_queries(&self, limit: usize) -> Result<Vec<QueryLogEntry>> {
        match self.catalog()? {
            Some(catalog) => catalog.recent_queries(limit).map_err(generic),
            None => Ok(Vec::new()),
        }
    }

    /// Whether a document is stored under exactly this filename, in the
    /// catalog or as pages.
    fn document_exists(&self, index: &PageIndex, filename: &str) -> Result<bool> {
        if let Some(catalog) = self.catalog()?
            && catalog.get_document(filename).map_err(generic)?.is_some()
        {
            return Ok(true);
        }
        Ok(!index.pages_for(filename, &[]).map_err(generic)?.is_empty())
    }

    fn resolve_by_prefix(&self, document_id: &str) -> Result<Option<String>> {
        let Some(catalog) = self.catalog()? else {
            return Ok(None);
        };
        let Some(leading) = leading_identifier(document_id) else {
            return Ok(None);
        };
        let leading = leading.to_lowercase();
        Ok(catalog
            .list_documents()?
            .into_iter()
            .map(|d| d.filename)
            .find(|f| f != document_id && f.to_lowercase().starts_with(&leading)))
    }

    fn run_passes(&self, request: &SearchRequest) -> Result<PassRun> {
        let Some(pages) = &self.pages else {
            return Ok(PassRun::default());
        };
        if !has_searchable_terms(&request.query) || request.limit == 0 {
            return Ok(PassRun::default());
        }

        let catalog = self.catalog()?;
        let known_tags = known_tags(catalog.as_ref());
        let ctx = QueryContext::new(
            &request.query,
            &self.tables,
            known_tags.iter().map(String::as_str),
            request.boost_authority,
        );
        let normalizer = QueryNormalizer::new(&self.tables);
        let mut profiles: HashMap<String, DocumentProfile> = HashMap::new();

        let mut pass = Pass::Precise;
        let mut ranked = Vec::new();
        let mut fallback_used = false;
        loop {
            let query = match pass {
                Pass::Precise => normalizer.prepare_smart_query(&request.query),
                Pass::Fallback => {
                    fallback_used = true;
                    normalizer.prepare_fallback_query(&request.query)
                }
                Pass::Done => break,
            };
            debug!(?pass, %query, "running retrieval pass");
            ranked = self.rank_pass(
                pages,
                catalog.as_ref(),
                &query,
                request,
                &ctx,
                &mut profiles,
            )?;
            pass = pass.next(
                request.offset,
                ranked.len(),
                self.settings.fallback_threshold,
            );
        }

        let total = ranked.len();
        if total > 0
            && let Some(catalog) = &catalog
        {
            log_query(catalog, request, total);
        }

        let page = ranked
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .map(|mut r| {
                r.hit.snippet = format_snippet(
                    &r.content,
                    &request.query,
                    self.settings.snippet_length,
                );
                r
            })
            .collect();

        Ok(PassRun {
            page,
            total,
            fallback_used,
        })
    }

    /// Query the index once, drop hits failing the tag filter and rank the
    /// rest. Snippets are filled in after pagination.
    fn rank_pass(
        &self,
        pages: &PageIndex,
        catalog: Option<&Catalog>,
        query: &str,
        request: &SearchRequest,
        ctx: &QueryContext<'_>,
        profiles: &mut HashMap<String, DocumentProfile>,
    ) -> Result<Vec<RankedPage>> {
        let filter = PageFilter {
            equipment: request.equipment.as_deref(),
            doc_class: request.doc_class.as_deref(),
        };
        let matches = pages.search(query, &filter, self.settings.candidate_limit)?;

        let mut ranked = Vec::with_capacity(matches.len());
        for m in matches {
            if !profiles.contains_key(&m.filename) {
                let profile = profile(catalog, &m.filename)?;
                profiles.insert(m.filename.clone(), profile);
            }
            let profile = &profiles[&m.filename];
            if !request.tags.iter().all(|t| profile.has_tag(t)) {
                continue;
            }

            let equipment = if m.equipment.is_empty() {
                profile.equipment.clone()
            } else {
                m.equipment
            };
            let doc_class = if m.doc_class.is_empty() {
                profile.doc_class.clone()
            } else {
                m.doc_class
            };
            let input = RankInput {
                doc_class: &doc_class,
                tags: &profile.tags,
                content: &m.content,
                authority: profile.authority,
            };
            let score = ranking::final_score(m.score, &input, ctx);

            ranked.push(RankedPage {
                hit: SearchHit {
                    filename: m.filename,
                    equipment,
                    doc_class,
                    page: m.page,
                    base_score: m.score,
                    tags: profile.tags.clone(),
                    score,
                    snippet: String::new(),
                    authority: profile.authority,
                },
                content: m.content,
            });
        }

        // Stable: equal scores keep the index's order.
        ranked.sort_by(|a, b| {
            b.hit
                .score
                .partial_cmp(&a.hit.score)
                .unwrap_or(Ordering::Equal)
        });
        Ok(ranked)
    }
}

fn profile(catalog: Option<&Catalog>, filename: &str) -> Result<DocumentProfile> {
    let Some(catalog) = catalog else {
        return Ok(DocumentProfile::default());
    };
    let document = catalog.get_document(filename)?;
    let tags = catalog
        .document_tags(filename)?
        .into_iter()
        .map(|t| t.tag)
        .collect();
    Ok(match document {
        Some(d) => DocumentProfile {
            tags,
            authority: d.authority,
            equipment: d.equipment,
            doc_class: d.doc_class,
        },
        None => DocumentProfile {
            tags,
            ..DocumentProfile::default()
        },
    })
}

fn known_tags(catalog: Option<&Catalog>) -> Vec<String> {
    let Some(catalog) = catalog else {
        return Vec::new();
    };
    match catalog.list_tags() {
        Ok(tags) => tags.into_iter().map(|t| t.name).collect(),
        Err(e) => {
            warn!(error = %e, "could not read tags, tag boost disabled");
            Vec::new()
        }
    }
}

/// Best effort: a failed write is logged and otherwise ignored.
fn log_query(catalog: &Catalog, request: &SearchRequest, result_count: usize) {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let entry = QueryLogEntry {
        query: request.query.clone(),
        result_count,
        equipment: request.equipment.clone(),
        doc_class: request.doc_class.clone(),
        tags: request.tags.clone(),
        timestamp,
    };
    if let Err(e) = catalog.log_query(&entry) {
        warn!(error = %e, "failed to log query");
    }
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("pages", &self.pages.is_some())
            .field("catalog", &self.catalog.is_some())
            .field("cards", &self.cards.is_some())
            .finish_non_exhaustive()
    }
}

/// Cards are looked up independently of the page passes, so a failed
/// lookup costs the cards only.
fn cards_or_empty(cards: Result<Vec<CardHit>>) -> Vec<CardHit> {
    cards.unwrap_or_else(|e| {
        warn!(error = %e, "card lookup failed, returning pages only");
        Vec::new()
    })
}

#[derive(Debug, Default)]
struct PassRun {
    page: Vec<RankedPage>,
    total: usize,
    fallback_used: bool,
}

/// First whitespace- or underscore-separated chunk of a document id, with a
/// trailing file extension removed.
fn leading_identifier(document_id: &str) -> Option<&str> {
    let chunk = document_id
        .split(|c: char| c.is_whitespace() || c == '_')
        .find(|s| !s.is_empty())?;
    let chunk = match chunk.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.chars().all(|c| c.is_ascii_alphabetic()) =>
        {
            stem
        }
        _ => chunk,
    };
    (!chunk.is_empty()).then_some(chunk)
}

/// Occurrences per value, most frequent first, then by value.
fn count_by<'a>(values: impl Iterator<Item = &'a str>) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for value in values.filter(|v| !v.is_empty()) {
        *counts.entry(value).or_default() += 1;
    }
    let mut counts: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts
}
