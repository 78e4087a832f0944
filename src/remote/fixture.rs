//! A library held entirely in memory.
//!
//! Serves the same listings as the Web API from a snapshot, which makes it
//! usable both for offline syncs from an exported JSON file and in tests.
//! Every mutation bumps the library version like the real service does.

use std::{cell::Cell, collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    library::{CreatorType, ItemField},
    record::{Format, RawRecord},
    remote::{CollectionInfo, ItemTypeInfo, Page, RemoteClient},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ItemTypeEntry {
    item_type: String,
    localized: String,
    #[serde(default)]
    fields: Vec<ItemField>,
    #[serde(default)]
    creator_types: Vec<CreatorType>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FulltextEntry {
    version: u64,
    content: String,
}

/// On-disk layout of an exported library snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    library_id: String,
    #[serde(default)]
    library_type: String,
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    collections: Vec<CollectionInfo>,
    #[serde(default)]
    item_types: Vec<ItemTypeEntry>,
    #[serde(default)]
    fulltext: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct FixtureRemote {
    library_id: String,
    library_type: String,
    version: u64,
    items: BTreeMap<String, RawRecord>,
    /// Key to the library version at which the item was deleted or trashed.
    deleted: BTreeMap<String, u64>,
    fulltext: BTreeMap<String, FulltextEntry>,
    files: BTreeMap<String, Vec<u8>>,
    collections: BTreeMap<String, CollectionInfo>,
    item_types: Vec<ItemTypeEntry>,
    fail_next: Cell<usize>,
    calls: Cell<usize>,
}

impl FixtureRemote {
    pub fn new(library_id: &str) -> Self {
        Self {
            library_id: library_id.to_string(),
            library_type: "group".into(),
            ..Self::default()
        }
    }

    /// Load an exported snapshot (see [`Snapshot`]).
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&text)?;
        let mut remote = Self::new(&snapshot.library_id);
        if !snapshot.library_type.is_empty() {
            remote.library_type = snapshot.library_type;
        }
        for entry in snapshot.item_types {
            remote.item_types.push(entry);
        }
        for c in snapshot.collections {
            remote.put_collection(&c.key, c.parent.as_deref(), &c.name);
        }
        for item in snapshot.items {
            let record = RawRecord::from_value(item).ok_or_else(|| {
                Error::Config("snapshot items must be JSON objects".into())
            })?;
            remote.put_item(record);
        }
        for (key, content) in snapshot.fulltext {
            remote.set_fulltext(&key, &content);
        }
        Ok(remote)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of remote calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.set(n);
    }

    pub fn add_item_type(
        &mut self,
        item_type: &str,
        localized: &str,
        fields: &[(&str, &str)],
        creator_types: &[(&str, &str)],
    ) {
        self.item_types.push(ItemTypeEntry {
            item_type: item_type.into(),
            localized: localized.into(),
            fields: fields
                .iter()
                .map(|(f, l)| ItemField {
                    field: (*f).into(),
                    localized: (*l).into(),
                })
                .collect(),
            creator_types: creator_types
                .iter()
                .map(|(c, l)| CreatorType {
                    creator_type: (*c).into(),
                    localized: (*l).into(),
                })
                .collect(),
        });
    }

    pub fn put_collection(&mut self, key: &str, parent: Option<&str>, name: &str) {
        self.version += 1;
        self.collections.insert(
            key.to_string(),
            CollectionInfo {
                key: key.to_string(),
                version: self.version,
                parent: parent.map(str::to_string),
                name: name.to_string(),
            },
        );
    }

    /// Insert or replace an item; it gets the new library version.
    /// Records without a key are ignored.
    pub fn put_item(&mut self, mut record: RawRecord) {
        let Some(key) = record.key().map(str::to_string) else {
            return;
        };
        self.version += 1;
        record
            .0
            .insert("key".into(), Value::String(key.clone()));
        record
            .0
            .insert("version".into(), Value::from(self.version));
        self.deleted.remove(&key);
        self.items.insert(key, record);
    }

    pub fn delete_item(&mut self, key: &str) {
        self.version += 1;
        self.items.remove(key);
        self.fulltext.remove(key);
        self.deleted.insert(key.to_string(), self.version);
    }

    pub fn set_fulltext(&mut self, key: &str, content: &str) {
        self.version += 1;
        self.fulltext.insert(
            key.to_string(),
            FulltextEntry {
                version: self.version,
                content: content.to_string(),
            },
        );
    }

    pub fn put_file(&mut self, key: &str, bytes: &[u8]) {
        self.files.insert(key.to_string(), bytes.to_vec());
    }

    fn enter(&self) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        let pending = self.fail_next.get();
        if pending > 0 {
            self.fail_next.set(pending - 1);
            return Err(Error::remote("simulated connection reset", true));
        }
        Ok(())
    }

    fn render(&self, record: &RawRecord, formats: &[Format]) -> RawRecord {
        let mut rendered = RawRecord::default();
        for name in ["key", "version", "library", "links", "meta", "data"] {
            if let Some(v) = record.get(name) {
                rendered.0.insert(name.into(), v.clone());
            }
        }
        for format in formats {
            if *format == Format::Data || !format.is_listed() {
                continue;
            }
            if let Some(v) = record.get(format.name()) {
                rendered.0.insert(format.name().into(), v.clone());
            }
        }
        rendered
    }
}

impl RemoteClient for FixtureRemote {
    fn library_id(&self) -> &str {
        &self.library_id
    }

    fn library_type(&self) -> &str {
        &self.library_type
    }

    fn list_items(
        &self,
        since: u64,
        start: usize,
        limit: usize,
        formats: &[Format],
    ) -> Result<Page<RawRecord>> {
        self.enter()?;
        let mut modified: Vec<&RawRecord> = self
            .items
            .values()
            .filter(|r| r.version() > since && !r.is_trashed())
            .collect();
        modified.sort_by_key(|r| r.version());
        let total = modified.len();
        Ok(Page {
            items: modified
                .into_iter()
                .skip(start)
                .take(limit)
                .map(|r| self.render(r, formats))
                .collect(),
            total,
            library_version: self.version,
        })
    }

    fn list_deleted(&self, since: u64) -> Result<Vec<String>> {
        self.enter()?;
        let mut keys: Vec<String> = self
            .deleted
            .iter()
            .filter(|(_, v)| **v > since)
            .map(|(k, _)| k.clone())
            .collect();
        keys.extend(
            self.items
                .values()
                .filter(|r| r.version() > since && r.is_trashed())
                .filter_map(|r| r.key().map(str::to_string)),
        );
        Ok(keys)
    }

    fn list_changed_fulltext(&self, since: u64) -> Result<BTreeMap<String, u64>> {
        self.enter()?;
        Ok(self
            .fulltext
            .iter()
            .filter(|(_, e)| e.version > since)
            .map(|(k, e)| (k.clone(), e.version))
            .collect())
    }

    fn get_fulltext(&self, key: &str) -> Result<Option<String>> {
        self.enter()?;
        Ok(self.fulltext.get(key).map(|e| e.content.clone()))
    }

    fn get_file(&self, key: &str) -> Result<Vec<u8>> {
        self.enter()?;
        self.files
            .get(key)
            .cloned()
            .ok_or_else(|| Error::remote(format!("no file for {key} (status 404)"), false))
    }

    fn list_collections(
        &self,
        top_level: bool,
        start: usize,
        limit: usize,
    ) -> Result<Page<CollectionInfo>> {
        self.enter()?;
        let matching: Vec<&CollectionInfo> = self
            .collections
            .values()
            .filter(|c| !top_level || c.parent.is_none())
            .collect();
        Ok(Page {
            total: matching.len(),
            items: matching.into_iter().skip(start).take(limit).cloned().collect(),
            library_version: self.version,
        })
    }

    fn item_types(&self) -> Result<Vec<ItemTypeInfo>> {
        self.enter()?;
        Ok(self
            .item_types
            .iter()
            .map(|t| ItemTypeInfo {
                item_type: t.item_type.clone(),
                localized: t.localized.clone(),
            })
            .collect())
    }

    fn item_type_fields(&self, item_type: &str) -> Result<Vec<ItemField>> {
        self.enter()?;
        Ok(self
            .item_types
            .iter()
            .find(|t| t.item_type == item_type)
            .map(|t| t.fields.clone())
            .unwrap_or_default())
    }

    fn item_type_creator_types(&self, item_type: &str) -> Result<Vec<CreatorType>> {
        self.enter()?;
        Ok(self
            .item_types
            .iter()
            .find(|t| t.item_type == item_type)
            .map(|t| t.creator_types.clone())
            .unwrap_or_default())
    }

    fn last_modified_version(&self) -> Result<u64> {
        self.enter()?;
        Ok(self.version)
    }
}
