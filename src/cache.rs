//! Versioned local copy of the remote library, stored in redb.
//!
//! Raw records are kept as JSON under their key, with a parent → children
//! multimap for child lookups. The `meta` table holds the version
//! watermark, the library context snapshot and the time of the last
//! successful sync; all three change in the same transaction as the
//! records.

use std::{collections::BTreeSet, path::Path};

use redb::{
    Database,
    MultimapTableDefinition,
    ReadableDatabase,
    ReadableMultimapTable,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
    WriteTransaction,
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    library::LibraryContext,
    record::{CacheRecord, Format},
    remote::{Pager, RemoteClient},
    retry::RetryPolicy,
    schema::Registry,
};

const ITEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("items");
const CHILDREN: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("children");
const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

const META_SCHEMA: &str = "schema";
const META_VERSION: &str = "version";
const META_LIBRARY: &str = "library_context";
const META_LAST_MODIFIED: &str = "last_modified";

/// Layout of the stored records. Bump when [`CacheRecord`] changes shape.
const SCHEMA_FINGERPRINT: &str = "cache-record-v1";

const STORE: &str = "cache";

pub struct Cache {
    db: Database,
}

/// Watermarks and size of the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    pub version: u64,
    pub records: usize,
    pub last_modified: Option<String>,
}

impl Cache {
    /// Open or create the cache. A cache written with another record
    /// layout is refused.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(ITEMS)?;
        txn.open_multimap_table(CHILDREN)?;
        {
            let mut meta = txn.open_table(META)?;
            let found = meta.get(META_SCHEMA)?.map(|v| v.value().to_string());
            match found {
                None => {
                    meta.insert(META_SCHEMA, SCHEMA_FINGERPRINT)?;
                }
                Some(f) if f == SCHEMA_FINGERPRINT => {}
                Some(f) => {
                    return Err(Error::SchemaMismatch {
                        store: STORE,
                        detail: format!("found layout {f}, expected {SCHEMA_FINGERPRINT}"),
                    });
                }
            }
        }
        txn.commit()?;

        Ok(Self { db })
    }

    /// Last remote version applied; 0 when never synced.
    pub fn version(&self) -> Result<u64> {
        Ok(self
            .meta(META_VERSION)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// When the cache was last changed by a sync, RFC 3339.
    pub fn last_modified(&self) -> Result<Option<String>> {
        self.meta(META_LAST_MODIFIED)
    }

    pub fn library_context(&self) -> Result<Option<LibraryContext>> {
        match self.meta(META_LIBRARY)? {
            Some(json) => Ok(Some(serde_json::from_str(&json).map_err(|e| {
                Error::SchemaMismatch {
                    store: STORE,
                    detail: format!("unreadable library context: {e}"),
                }
            })?)),
            None => Ok(None),
        }
    }

    fn meta(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    pub fn status(&self) -> Result<CacheStatus> {
        Ok(CacheStatus {
            version: self.version()?,
            records: self.len()?,
            last_modified: self.last_modified()?,
        })
    }

    pub fn len(&self) -> Result<usize> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ITEMS)?;
        Ok(table.len()? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ITEMS)?;
        table.get(key)?.map(|v| decode(key, v.value())).transpose()
    }

    /// All records, in key order.
    pub fn records(&self) -> Result<Vec<CacheRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ITEMS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push(decode(k.value(), v.value())?);
        }
        Ok(result)
    }

    /// Records without a parent, in key order.
    pub fn top_level(&self) -> Result<Vec<CacheRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| !r.is_child())
            .collect())
    }

    /// Children of `parent`, in key order.
    pub fn children(&self, parent: &str) -> Result<Vec<CacheRecord>> {
        let txn = self.db.begin_read()?;
        let links = txn.open_multimap_table(CHILDREN)?;
        let items = txn.open_table(ITEMS)?;
        let mut result = Vec::new();
        for child in links.get(parent)? {
            let child = child?;
            let key = child.value();
            if let Some(v) = items.get(key)? {
                result.push(decode(key, v.value())?);
            }
        }
        Ok(result)
    }

    /// Start a write transaction. Nothing is visible to readers until
    /// [`CacheWriter::commit`]; dropping the writer discards its changes.
    pub fn writer(&self) -> Result<CacheWriter> {
        Ok(CacheWriter {
            txn: self.db.begin_write()?,
        })
    }
}

fn decode(key: &str, bytes: &[u8]) -> Result<CacheRecord> {
    serde_json::from_slice(bytes).map_err(|e| Error::SchemaMismatch {
        store: STORE,
        detail: format!("record {key} is unreadable: {e}"),
    })
}

pub struct CacheWriter {
    txn: WriteTransaction,
}

impl CacheWriter {
    pub fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        let table = self.txn.open_table(ITEMS)?;
        table.get(key)?.map(|v| decode(key, v.value())).transpose()
    }

    /// Insert or replace a record, keeping the parent links in step.
    /// Returns whether the record is new.
    pub fn upsert(&self, record: &CacheRecord) -> Result<bool> {
        let previous = self.get(&record.key)?;
        let bytes = serde_json::to_vec(record)?;
        {
            let mut table = self.txn.open_table(ITEMS)?;
            table.insert(record.key.as_str(), bytes.as_slice())?;
        }
        let mut links = self.txn.open_multimap_table(CHILDREN)?;
        if let Some(old_parent) = previous.as_ref().and_then(|p| p.parent_item.as_deref())
            && Some(old_parent) != record.parent_item.as_deref()
        {
            links.remove(old_parent, record.key.as_str())?;
        }
        if let Some(parent) = record.parent_item.as_deref() {
            links.insert(parent, record.key.as_str())?;
        }
        Ok(previous.is_none())
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let removed = {
            let mut table = self.txn.open_table(ITEMS)?;
            table.remove(key)?.map(|v| v.value().to_vec())
        };
        let Some(bytes) = removed else {
            return Ok(false);
        };
        let record = decode(key, &bytes)?;
        if let Some(parent) = record.parent_item.as_deref() {
            let mut links = self.txn.open_multimap_table(CHILDREN)?;
            links.remove(parent, key)?;
        }
        Ok(true)
    }

    /// Replace the full text of a cached record. Returns `false` when the
    /// record is not in the cache.
    pub fn patch_fulltext(&self, key: &str, fulltext: Option<String>) -> Result<bool> {
        let Some(mut record) = self.get(key)? else {
            return Ok(false);
        };
        record.fulltext = fulltext;
        let bytes = serde_json::to_vec(&record)?;
        let mut table = self.txn.open_table(ITEMS)?;
        table.insert(key, bytes.as_slice())?;
        Ok(true)
    }

    /// Make the changes visible, together with the new watermark and
    /// library snapshot.
    pub fn commit(self, version: u64, library: &LibraryContext) -> Result<()> {
        let library = serde_json::to_string(library)?;
        let version = version.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        {
            let mut meta = self.txn.open_table(META)?;
            meta.insert(META_VERSION, version.as_str())?;
            meta.insert(META_LIBRARY, library.as_str())?;
            meta.insert(META_LAST_MODIFIED, now.as_str())?;
        }
        self.txn.commit()?;
        Ok(())
    }

    /// Discard all changes.
    pub fn abort(self) -> Result<()> {
        self.txn.abort()?;
        Ok(())
    }
}

/// What the cache sync needs beyond the remote and the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSyncOptions {
    pub batch_size: usize,
    /// Formats requested with each item listing.
    pub formats: Vec<Format>,
    pub fulltext: bool,
}

impl CacheSyncOptions {
    pub fn new(config: &Config, registry: &Registry) -> Self {
        Self {
            batch_size: config.zotero.batch_size,
            formats: registry
                .required_formats()
                .into_iter()
                .filter(Format::is_listed)
                .collect(),
            fulltext: config.sync.fulltext && registry.needs_fulltext(),
        }
    }
}

impl Default for CacheSyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            formats: vec![Format::Data],
            fulltext: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSyncReport {
    pub since: u64,
    pub version: u64,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Records whose full text was fetched.
    pub fulltext: usize,
    /// Records skipped for data-quality problems.
    pub skipped: usize,
}

/// Bring the cache up to date with the remote library.
///
/// Everything since the cache's watermark is applied in one transaction;
/// on failure the transaction is aborted and the cache keeps its previous
/// version.
pub fn sync_cache(
    cache: &Cache,
    remote: &dyn RemoteClient,
    retry: &RetryPolicy,
    options: &CacheSyncOptions,
) -> Result<CacheSyncReport> {
    let since = cache.version()?;
    info!(since, "cache sync started");

    let library = LibraryContext::fetch(remote, retry, options.batch_size)?;
    let writer = cache.writer()?;
    match apply_changes(&writer, remote, retry, options, since) {
        Ok(report) => {
            writer.commit(report.version, &library)?;
            info!(
                version = report.version,
                created = report.created,
                updated = report.updated,
                deleted = report.deleted,
                fulltext = report.fulltext,
                skipped = report.skipped,
                "cache sync finished"
            );
            Ok(report)
        }
        Err(err) => {
            warn!(error = %err, "cache sync failed, discarding changes");
            writer.abort()?;
            Err(err)
        }
    }
}

fn apply_changes(
    writer: &CacheWriter,
    remote: &dyn RemoteClient,
    retry: &RetryPolicy,
    options: &CacheSyncOptions,
    since: u64,
) -> Result<CacheSyncReport> {
    let mut report = CacheSyncReport {
        since,
        ..CacheSyncReport::default()
    };

    let mut fulltext_changes: BTreeSet<String> = if options.fulltext {
        retry
            .run("list_changed_fulltext", || remote.list_changed_fulltext(since))?
            .into_keys()
            .collect()
    } else {
        BTreeSet::new()
    };

    let mut pager = Pager::new(options.batch_size, |start, limit| {
        retry.run("list_items", || {
            remote.list_items(since, start, limit, &options.formats)
        })
    });
    while let Some(page) = pager.next_page()? {
        debug!(count = page.items.len(), fetched = pager.fetched(), "items page");
        for raw in page.items {
            let Some(mut record) = CacheRecord::from_raw(raw) else {
                warn!("remote item without a key, skipped");
                report.skipped += 1;
                continue;
            };
            if record.item_type.is_empty() {
                warn!(key = %record.key, "item without an item type");
            }
            let previous = writer.get(&record.key)?;
            if fulltext_changes.remove(&record.key) {
                record.fulltext =
                    retry.run("get_fulltext", || remote.get_fulltext(&record.key))?;
                report.fulltext += 1;
            } else {
                record.fulltext = previous.as_ref().and_then(|p| p.fulltext.clone());
            }
            if writer.upsert(&record)? {
                report.created += 1;
            } else {
                report.updated += 1;
            }
        }
    }
    let mut version = pager.library_version();

    for key in fulltext_changes {
        let text = retry.run("get_fulltext", || remote.get_fulltext(&key))?;
        if writer.patch_fulltext(&key, text)? {
            report.fulltext += 1;
        } else {
            debug!(key = %key, "full text for an item not in the cache, ignored");
        }
    }

    for key in retry.run("list_deleted", || remote.list_deleted(since))? {
        if writer.delete(&key)? {
            report.deleted += 1;
        }
    }

    if version == 0 {
        version = retry.run("last_modified_version", || remote.last_modified_version())?;
    }
    report.version = version.max(since);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{record::RawRecord, remote::fixture::FixtureRemote};

    fn raw(value: serde_json::Value) -> RawRecord {
        RawRecord::from_value(value).unwrap()
    }

    fn open() -> (tempfile::TempDir, Cache) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::open(&tmp.path().join("cache.redb")).unwrap();
        (tmp, cache)
    }

    fn library() -> FixtureRemote {
        let mut remote = FixtureRemote::new("1");
        remote.put_item(raw(json!({
            "key": "ITEM0001",
            "data": {"itemType": "book", "title": "One"},
        })));
        remote.put_item(raw(json!({
            "key": "NOTE0001",
            "data": {"itemType": "note", "parentItem": "ITEM0001", "note": "n"},
        })));
        remote.put_item(raw(json!({
            "key": "ATT00001",
            "data": {"itemType": "attachment", "parentItem": "ITEM0001"},
        })));
        remote.set_fulltext("ATT00001", "extracted words");
        remote
    }

    #[test]
    fn first_sync_fetches_everything() {
        let (_tmp, cache) = open();
        let remote = library();
        let report =
            sync_cache(&cache, &remote, &RetryPolicy::none(), &CacheSyncOptions::default())
                .unwrap();
        assert_eq!(report.created, 3);
        assert_eq!(report.fulltext, 1);
        assert_eq!(report.version, remote.version());
        assert_eq!(cache.version().unwrap(), remote.version());
        assert_eq!(cache.len().unwrap(), 3);
        assert!(cache.last_modified().unwrap().is_some());
        assert!(cache.library_context().unwrap().is_some());

        let top: Vec<String> = cache.top_level().unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(top, vec!["ITEM0001"]);
        let children = cache.children("ITEM0001").unwrap();
        assert_eq!(children.len(), 2);
        let att = cache.get("ATT00001").unwrap().unwrap();
        assert_eq!(att.fulltext.as_deref(), Some("extracted words"));
    }

    #[test]
    fn metadata_change_keeps_cached_fulltext() {
        let (_tmp, cache) = open();
        let mut remote = library();
        let opts = CacheSyncOptions::default();
        sync_cache(&cache, &remote, &RetryPolicy::none(), &opts).unwrap();

        remote.put_item(raw(json!({
            "key": "ATT00001",
            "data": {"itemType": "attachment", "parentItem": "ITEM0001", "title": "PDF"},
        })));
        let report = sync_cache(&cache, &remote, &RetryPolicy::none(), &opts).unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.fulltext, 0);
        let att = cache.get("ATT00001").unwrap().unwrap();
        assert_eq!(att.fulltext.as_deref(), Some("extracted words"));
        assert_eq!(att.item.data_str("title"), Some("PDF"));
    }

    #[test]
    fn reparenting_moves_child_link() {
        let (_tmp, cache) = open();
        let writer = cache.writer().unwrap();
        let child = |parent: &str| {
            CacheRecord::from_raw(raw(json!({
                "key": "N",
                "data": {"itemType": "note", "parentItem": parent},
            })))
            .unwrap()
        };
        assert!(writer.upsert(&child("A")).unwrap());
        assert!(!writer.upsert(&child("B")).unwrap());
        writer.commit(1, &LibraryContext::default()).unwrap();
        assert!(cache.children("A").unwrap().is_empty());
        assert_eq!(cache.children("B").unwrap().len(), 1);
    }

    #[test]
    fn aborted_writer_leaves_cache_untouched() {
        let (_tmp, cache) = open();
        let writer = cache.writer().unwrap();
        writer
            .upsert(&CacheRecord::from_raw(raw(json!({"key": "X", "data": {}}))).unwrap())
            .unwrap();
        writer.abort().unwrap();
        assert!(cache.is_empty().unwrap());
        assert_eq!(cache.version().unwrap(), 0);
    }

    #[test]
    fn failed_sync_keeps_previous_version() {
        let (_tmp, cache) = open();
        let mut remote = library();
        let opts = CacheSyncOptions::default();
        sync_cache(&cache, &remote, &RetryPolicy::none(), &opts).unwrap();
        let before = cache.version().unwrap();

        remote.put_item(raw(json!({"key": "ITEM0002", "data": {"itemType": "book"}})));
        remote.fail_next(100);
        assert!(sync_cache(&cache, &remote, &RetryPolicy::none(), &opts).is_err());
        assert_eq!(cache.version().unwrap(), before);
        assert!(cache.get("ITEM0002").unwrap().is_none());
    }

    #[test]
    fn unreadable_record_is_a_schema_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache.redb");
        {
            let db = Database::create(&path).unwrap();
            let txn = db.begin_write().unwrap();
            {
                let mut table = txn.open_table(ITEMS).unwrap();
                table.insert("BAD", b"{\"nope\": 1}".as_slice()).unwrap();
            }
            txn.commit().unwrap();
        }
        let cache = Cache::open(&path).unwrap();
        assert!(matches!(
            cache.get("BAD"),
            Err(Error::SchemaMismatch { store: "cache", .. })
        ));
    }

    #[test]
    fn foreign_layout_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache.redb");
        {
            let db = Database::create(&path).unwrap();
            let txn = db.begin_write().unwrap();
            {
                let mut meta = txn.open_table(META).unwrap();
                meta.insert(META_SCHEMA, "cache-record-v0").unwrap();
            }
            txn.commit().unwrap();
        }
        assert!(matches!(
            Cache::open(&path),
            Err(Error::SchemaMismatch { .. })
        ));
    }
}
