//! Tantivy-backed search index and its rebuild from the cache.
//!
//! The index schema comes from the [`Registry`]. An index created with a
//! different schema is refused rather than migrated. Every rebuild replaces
//! all documents and records, in the commit payload, the cache version and
//! the cache modification time it reflects.

use std::{collections::BTreeMap, path::Path};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tantivy::{Index, IndexReader, IndexWriter, Searcher, directory::MmapDirectory};
use tracing::{debug, info, warn};

use crate::{
    cache::Cache,
    error::{Error, Result},
    extract::ItemView,
    record::{CacheRecord, is_child_type},
    schema::Registry,
    tag_gate::TagGate,
};

/// Tantivy refuses smaller writer budgets.
const MIN_WRITER_MEMORY: usize = 15_000_000;

const STORE: &str = "index";

/// Watermarks stored with each index commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Cache version the documents were built from.
    pub version: u64,
    /// Cache modification time at the moment of the rebuild.
    pub last_update: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexStatus {
    /// No index on disk yet.
    Missing,
    /// The index exists but holds no documents.
    Empty,
    Ready {
        version: u64,
        last_update: Option<String>,
        documents: u64,
    },
}

impl IndexStatus {
    /// Whether the cache has moved past what the index reflects.
    pub fn is_stale(&self, cache_version: u64) -> bool {
        match self {
            Self::Missing | Self::Empty => cache_version > 0,
            Self::Ready { version, .. } => *version < cache_version,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
}

impl SearchIndex {
    /// Open the index at `dir`, creating it when absent.
    pub fn open(dir: &Path, registry: &Registry) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mmap_dir = MmapDirectory::open(dir)?;
        let index = if Index::exists(&mmap_dir).map_err(tantivy::TantivyError::from)? {
            Index::open(mmap_dir)?
        } else {
            Index::create(mmap_dir, registry.schema().clone(), tantivy::IndexSettings::default())?
        };
        Self::from_index(index, registry)
    }

    /// Open an existing index; `None` when there is none at `dir`.
    pub fn open_existing(dir: &Path, registry: &Registry) -> Result<Option<Self>> {
        if !dir.is_dir() {
            return Ok(None);
        }
        let mmap_dir = MmapDirectory::open(dir)?;
        if !Index::exists(&mmap_dir).map_err(tantivy::TantivyError::from)? {
            return Ok(None);
        }
        Ok(Some(Self::from_index(Index::open(mmap_dir)?, registry)?))
    }

    /// Create an in-memory index (for testing).
    pub fn open_in_ram(registry: &Registry) -> Result<Self> {
        Self::from_index(Index::create_in_ram(registry.schema().clone()), registry)
    }

    fn from_index(index: Index, registry: &Registry) -> Result<Self> {
        check_schema(&index, registry)?;
        registry.register_tokenizers(&index);
        let reader = index.reader()?;
        Ok(Self { index, reader })
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// A fresh read session reflecting the last commit.
    pub fn searcher(&self) -> Result<Searcher> {
        self.reader.reload()?;
        Ok(self.reader.searcher())
    }

    pub fn doc_count(&self) -> Result<u64> {
        Ok(self.searcher()?.num_docs())
    }

    pub fn writer(&self, memory_budget: usize) -> Result<IndexWriter> {
        Ok(self.index.writer(memory_budget.max(MIN_WRITER_MEMORY))?)
    }

    /// Watermarks of the last rebuild, if any.
    pub fn watermarks(&self) -> Result<Option<Watermarks>> {
        let metas = self.index.load_metas()?;
        match metas.payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    pub fn status(&self) -> Result<IndexStatus> {
        let documents = self.doc_count()?;
        if documents == 0 {
            return Ok(IndexStatus::Empty);
        }
        let marks = self.watermarks()?.unwrap_or_default();
        Ok(IndexStatus::Ready {
            version: marks.version,
            last_update: marks.last_update,
            documents,
        })
    }
}

/// Status of the index at `dir` without creating it.
pub fn status_at(dir: &Path, registry: &Registry) -> Result<IndexStatus> {
    match SearchIndex::open_existing(dir, registry)? {
        Some(index) => index.status(),
        None => Ok(IndexStatus::Missing),
    }
}

fn check_schema(index: &Index, registry: &Registry) -> Result<()> {
    let found = index.schema();
    let expected = registry.schema();
    if serde_json::to_value(&found)? == serde_json::to_value(expected)? {
        return Ok(());
    }
    let names = |s: &tantivy::schema::Schema| -> Vec<String> {
        s.fields().map(|(_, entry)| entry.name().to_string()).collect()
    };
    let (found, expected) = (names(&found), names(expected));
    let added: Vec<&String> = expected.iter().filter(|n| !found.contains(n)).collect();
    let removed: Vec<&String> = found.iter().filter(|n| !expected.contains(n)).collect();
    let detail = if added.is_empty() && removed.is_empty() {
        "field options changed".to_string()
    } else {
        format!("new fields {added:?}, dropped fields {removed:?}")
    };
    Err(Error::SchemaMismatch {
        store: STORE,
        detail,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSyncReport {
    pub version: u64,
    pub documents: usize,
    /// Top-level items rejected by the item gate.
    pub skipped: usize,
    /// Top-level records of child types (standalone notes and attachments).
    pub orphans: usize,
}

/// Rebuild the whole index from the cache.
///
/// Top-level items passing `item_gate` become one document each, built from
/// the item and its cached children. On failure the writer is rolled back
/// and the previous documents stay visible.
pub fn sync_index(
    index: &SearchIndex,
    cache: &Cache,
    registry: &Registry,
    item_gate: &TagGate,
    writer_memory: usize,
) -> Result<IndexSyncReport> {
    let version = cache.version()?;
    let last_update = cache.last_modified()?;
    let library = cache.library_context()?.unwrap_or_default();
    info!(version, "index sync started");

    let mut top_level: Vec<CacheRecord> = Vec::new();
    let mut children: BTreeMap<String, Vec<CacheRecord>> = BTreeMap::new();
    for record in cache.records()? {
        match record.parent_item.clone() {
            Some(parent) => children.entry(parent).or_default().push(record),
            None => top_level.push(record),
        }
    }

    let mut report = IndexSyncReport {
        version,
        ..IndexSyncReport::default()
    };
    let selected: Vec<&CacheRecord> = top_level
        .iter()
        .filter(|item| {
            if is_child_type(&item.item_type) {
                debug!(key = %item.key, item_type = %item.item_type, "standalone child, skipped");
                report.orphans += 1;
                return false;
            }
            if !item_gate.check(&item.tags()) {
                report.skipped += 1;
                return false;
            }
            true
        })
        .collect();

    // Extract in parallel, then write sequentially.
    let documents: Vec<_> = selected
        .par_iter()
        .map(|item| {
            let kids = children.get(&item.key).map(Vec::as_slice).unwrap_or(&[]);
            registry.document(&ItemView::new(item, kids), &library)
        })
        .collect::<Result<_>>()?;

    let mut writer = index.writer(writer_memory)?;
    let written = write_all(&mut writer, documents, &Watermarks {
        version,
        last_update,
    });
    match written {
        Ok(count) => report.documents = count,
        Err(err) => {
            warn!(error = %err, "index sync failed, rolling back");
            writer.rollback()?;
            return Err(err);
        }
    }

    info!(
        version,
        documents = report.documents,
        skipped = report.skipped,
        orphans = report.orphans,
        "index sync finished"
    );
    Ok(report)
}

fn write_all(
    writer: &mut IndexWriter,
    documents: Vec<tantivy::TantivyDocument>,
    marks: &Watermarks,
) -> Result<usize> {
    writer.delete_all_documents()?;
    let count = documents.len();
    for document in documents {
        writer.add_document(document)?;
    }
    let mut prepared = writer.prepare_commit()?;
    prepared.set_payload(&serde_json::to_string(marks)?);
    prepared.commit()?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        cache::{CacheSyncOptions, sync_cache},
        config::Config,
        record::RawRecord,
        remote::fixture::FixtureRemote,
        retry::RetryPolicy,
        schema::{Composer, FieldSpec, FieldType},
    };

    fn registry() -> Registry {
        Registry::default_for(&Config::default()).unwrap()
    }

    fn cache_with(items: Vec<serde_json::Value>) -> (tempfile::TempDir, Cache) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::open(&tmp.path().join("cache.redb")).unwrap();
        let mut remote = FixtureRemote::new("1");
        for item in items {
            remote.put_item(RawRecord::from_value(item).unwrap());
        }
        sync_cache(&cache, &remote, &RetryPolicy::none(), &CacheSyncOptions::default()).unwrap();
        (tmp, cache)
    }

    #[test]
    fn status_moves_from_missing_to_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("index");
        let registry = registry();
        assert_eq!(status_at(&dir, &registry).unwrap(), IndexStatus::Missing);

        let index = SearchIndex::open(&dir, &registry).unwrap();
        assert_eq!(index.status().unwrap(), IndexStatus::Empty);
        assert!(IndexStatus::Empty.is_stale(1));

        let (_c, cache) = cache_with(vec![json!({"key": "A", "data": {"itemType": "book"}})]);
        sync_index(&index, &cache, &registry, &TagGate::open(), 0).unwrap();
        let status = status_at(&dir, &registry).unwrap();
        let IndexStatus::Ready { version, documents, last_update } = status.clone() else {
            panic!("expected ready, got {status:?}");
        };
        assert_eq!(version, cache.version().unwrap());
        assert_eq!(documents, 1);
        assert_eq!(last_update, cache.last_modified().unwrap());
        assert!(!status.is_stale(version));
        assert!(status.is_stale(version + 1));
    }

    #[test]
    fn gate_and_child_types_are_skipped() {
        let (_c, cache) = cache_with(vec![
            json!({"key": "PUB", "data": {"itemType": "book", "tags": [{"tag": "_publish"}]}}),
            json!({"key": "PRIV", "data": {"itemType": "book"}}),
            json!({"key": "LONE", "data": {"itemType": "attachment"}}),
        ]);
        let registry = registry();
        let index = SearchIndex::open_in_ram(&registry).unwrap();
        let gate = TagGate::new(&["^_publish$"], &[]).unwrap();
        let report = sync_index(&index, &cache, &registry, &gate, 0).unwrap();
        assert_eq!(report.documents, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.orphans, 1);
        assert_eq!(index.doc_count().unwrap(), 1);
    }

    #[test]
    fn rebuild_replaces_documents() {
        let (_c, cache) = cache_with(vec![
            json!({"key": "A", "data": {"itemType": "book"}}),
            json!({"key": "B", "data": {"itemType": "book"}}),
        ]);
        let registry = registry();
        let index = SearchIndex::open_in_ram(&registry).unwrap();
        sync_index(&index, &cache, &registry, &TagGate::open(), 0).unwrap();
        sync_index(&index, &cache, &registry, &TagGate::open(), 0).unwrap();
        assert_eq!(index.doc_count().unwrap(), 2);
    }

    #[test]
    fn changed_schema_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("index");
        SearchIndex::open(&dir, &registry()).unwrap();

        let mut composer = Composer::default_for(&Config::default()).unwrap();
        composer.register_field(FieldSpec::new(
            "extra_field",
            FieldType::Keyword,
            crate::extract::DataField::new("extra"),
        ));
        let changed = composer.finish().unwrap();
        let err = SearchIndex::open(&dir, &changed).err().unwrap();
        match err {
            Error::SchemaMismatch { store, detail } => {
                assert_eq!(store, "index");
                assert!(detail.contains("extra_field"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
