use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock, Mutex, Weak},
};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};

use crate::{
    error::{Error, Result},
    model::{Document, DocumentTag, QueryLogEntry, Tag, TagFacet, TagNamespace},
};

const DOCUMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("documents");
const TAGS: TableDefinition<&str, &str> = TableDefinition::new("tags");
const DOCUMENT_TAGS: TableDefinition<&str, f64> =
    TableDefinition::new("document_tags");
const QUERY_LOG: TableDefinition<u64, &[u8]> =
    TableDefinition::new("query_log");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// Current catalog layout, recorded under the `format_version` setting.
pub const FORMAT_VERSION: &str = "1";

/// Key of a document-tag row. The NUL separator keeps every row of one
/// document in a contiguous key range.
fn document_tag_key(filename: &str, tag: &str) -> String {
    format!("{filename}\0{tag}")
}

/// Live handles by canonical path. redb locks the file for as long as a
/// `Database` is open, so every handle in this process shares one.
static OPEN_DATABASES: LazyLock<Mutex<HashMap<PathBuf, Weak<Database>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn shared_database(path: &Path) -> Result<Arc<Database>> {
    let mut open = OPEN_DATABASES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Ok(key) = std::fs::canonicalize(path)
        && let Some(db) = open.get(&key).and_then(Weak::upgrade)
    {
        return Ok(db);
    }

    let db = Arc::new(Database::create(path)?);
    open.retain(|_, weak| weak.strong_count() > 0);
    open.insert(std::fs::canonicalize(path)?, Arc::downgrade(&db));
    Ok(db)
}

/// Document, tag and query-log metadata stored next to the page index.
///
/// Cloning is cheap; clones and every other `Catalog` opened on the same
/// file in this process share one database handle.
#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self> {
        let db = shared_database(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(DOCUMENTS)?;
        txn.open_table(TAGS)?;
        txn.open_table(DOCUMENT_TAGS)?;
        txn.open_table(QUERY_LOG)?;
        {
            let mut settings = txn.open_table(SETTINGS)?;
            if settings.get("format_version")?.is_none() {
                settings.insert("format_version", FORMAT_VERSION)?;
            }
        }
        txn.commit()?;

        Ok(Self { db })
    }

    /// Open a catalog that ingestion already wrote; `None` if absent.
    /// Nothing is written: the tables are expected to exist.
    pub fn open_existing(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(Self {
            db: shared_database(path)?,
        }))
    }

    // -- Documents --

    pub fn put_document(&self, document: &Document) -> Result<()> {
        let bytes = serde_json::to_vec(document)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.insert(document.filename.as_str(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_document(&self, filename: &str) -> Result<Option<Document>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        match table.get(filename)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// All documents, ordered by filename.
    pub fn list_documents(&self) -> Result<Vec<Document>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    /// Remove a document and its tag rows.
    pub fn remove_document(&self, filename: &str) -> Result<bool> {
        let start = document_tag_key(filename, "");
        let end = format!("{filename}\u{1}");
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.remove(filename)?.is_some()
        };
        {
            let mut table = txn.open_table(DOCUMENT_TAGS)?;
            let keys: Vec<String> = table
                .range::<&str>(start.as_str()..end.as_str())?
                .map(|entry| entry.map(|(k, _v)| k.value().to_string()))
                .collect::<std::result::Result<_, _>>()?;
            for key in &keys {
                table.remove(key.as_str())?;
            }
        }
        txn.commit()?;
        Ok(removed)
    }

    // -- Tags --

    pub fn put_tag(&self, tag: &Tag) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TAGS)?;
            table.insert(tag.name.as_str(), tag.namespace.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TAGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let namespace = TagNamespace::parse(v.value()).ok_or_else(|| {
                Error::Validation(format!(
                    "tag '{}' has unknown namespace '{}'",
                    k.value(),
                    v.value()
                ))
            })?;
            result.push(Tag {
                name: k.value().to_string(),
                namespace,
            });
        }
        Ok(result)
    }

    /// Attach a tag to a document. Re-tagging the same pair overwrites the
    /// weight, so there is at most one row per pair.
    pub fn tag_document(
        &self,
        filename: &str,
        tag: &str,
        weight: f64,
    ) -> Result<()> {
        if !(weight > 0.0 && weight <= 1.0) {
            return Err(Error::Validation(format!(
                "tag weight for '{filename}'/'{tag}' must be in (0, 1], got {weight}"
            )));
        }

        let key = document_tag_key(filename, tag);
        let txn = self.db.begin_write()?;
        {
            if txn.open_table(TAGS)?.get(tag)?.is_none() {
                return Err(Error::NotFound {
                    kind: "tag",
                    name: tag.to_string(),
                });
            }
            if txn.open_table(DOCUMENTS)?.get(filename)?.is_none() {
                return Err(Error::NotFound {
                    kind: "document",
                    name: filename.to_string(),
                });
            }
            let mut table = txn.open_table(DOCUMENT_TAGS)?;
            table.insert(key.as_str(), weight)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Tags attached to one document, ordered by tag name.
    pub fn document_tags(&self, filename: &str) -> Result<Vec<DocumentTag>> {
        let start = document_tag_key(filename, "");
        let end = format!("{filename}\u{1}");
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENT_TAGS)?;
        let mut result = Vec::new();
        for entry in table.range::<&str>(start.as_str()..end.as_str())? {
            let (k, v) = entry?;
            if let Some((file, tag)) = k.value().split_once('\0') {
                result.push(DocumentTag {
                    filename: file.to_string(),
                    tag: tag.to_string(),
                    weight: v.value(),
                });
            }
        }
        Ok(result)
    }

    /// Count tagged documents per tag, optionally restricted to one
    /// equipment code. Ordered by count descending, then name.
    pub fn tag_facets(&self, equipment: Option<&str>) -> Result<Vec<TagFacet>> {
        let documents = self.list_documents()?;
        let allowed: HashMap<&str, &Document> = documents
            .iter()
            .filter(|d| equipment.is_none_or(|e| d.equipment == e))
            .map(|d| (d.filename.as_str(), d))
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(DOCUMENT_TAGS)?;
            for entry in table.iter()? {
                let (k, _v) = entry?;
                if let Some((file, tag)) = k.value().split_once('\0')
                    && allowed.contains_key(file)
                {
                    *counts.entry(tag.to_string()).or_default() += 1;
                }
            }
        }

        let mut facets: Vec<TagFacet> = self
            .list_tags()?
            .into_iter()
            .filter_map(|tag| {
                let count = counts.get(&tag.name).copied()?;
                Some(TagFacet {
                    name: tag.name,
                    namespace: tag.namespace,
                    document_count: count,
                })
            })
            .collect();
        facets.sort_by(|a, b| {
            b.document_count
                .cmp(&a.document_count)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(facets)
    }

    // -- Query log --

    pub fn log_query(&self, entry: &QueryLogEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(QUERY_LOG)?;
            let next = match table.last()? {
                Some((k, _v)) => k.value() + 1,
                None => 1,
            };
            table.insert(next, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// The most recent `limit` entries, newest first.
    pub fn recent_queries(&self, limit: usize) -> Result<Vec<QueryLogEntry>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(QUERY_LOG)?;
        let mut result = Vec::new();
        for entry in table.iter()?.rev().take(limit) {
            let (_k, v) = entry?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    pub fn query_count(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(QUERY_LOG)?;
        Ok(table.last()?.map_or(0, |(k, _v)| k.value()))
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").finish_non_exhaustive()
    }
}
