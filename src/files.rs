//! Attachment file store and its synchronization from the remote.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{
    cache::Cache,
    error::{Error, Result},
    record::{ATTACHMENT, is_child_type},
    remote::RemoteClient,
    retry::RetryPolicy,
    tag_gate::TagGate,
};

/// Link modes of attachments whose file lives in the remote storage.
const STORED_LINK_MODES: &[&str] = &["imported_file", "imported_url"];

/// Directory of attachment files named by attachment key.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|_| Error::DataDir(root.to_path_buf()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.path(key).is_file()
    }

    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.path(key))?)
    }

    /// Hex md5 of a stored file; `None` when absent.
    pub fn md5(&self, key: &str) -> Result<Option<String>> {
        if !self.contains(key) {
            return Ok(None);
        }
        Ok(Some(md5_hex(&self.read(key)?)))
    }

    /// Write through a temporary file, so readers never see a partial file.
    pub fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let tmp = self.root.join(format!(".{key}.tmp"));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, self.path(key))?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Keys of all stored files, sorted.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

fn verify(key: &str, expected: &str, bytes: &[u8]) -> Result<()> {
    let actual = md5_hex(bytes);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Error::Checksum {
            key: key.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSyncReport {
    pub downloaded: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Attachments without a checksum, or whose download did not match it.
    pub skipped: usize,
}

/// Bring the file store in line with the cached attachments.
///
/// Only stored-file attachments of items passing `item_gate`, whose own
/// tags pass `child_gate`, are kept. A file is downloaded when missing or
/// when its md5 differs from the cached one. Files no longer referenced
/// are deleted.
pub fn sync_files(
    store: &FileStore,
    cache: &Cache,
    remote: &dyn RemoteClient,
    retry: &RetryPolicy,
    item_gate: &TagGate,
    child_gate: &TagGate,
) -> Result<FileSyncReport> {
    info!("file sync started");
    let mut report = FileSyncReport::default();
    let mut referenced = BTreeSet::new();

    for item in cache.top_level()? {
        if is_child_type(&item.item_type) || !item_gate.check(&item.tags()) {
            continue;
        }
        for child in cache.children(&item.key)? {
            let link_mode = child.item.data_str("linkMode").unwrap_or_default();
            if child.item_type != ATTACHMENT
                || !STORED_LINK_MODES.contains(&link_mode)
                || !child_gate.check(&child.tags())
            {
                continue;
            }
            let Some(expected) = child.item.data_str("md5") else {
                warn!(key = %child.key, "attachment without checksum, skipped");
                report.skipped += 1;
                continue;
            };
            referenced.insert(child.key.clone());
            if store.md5(&child.key)?.as_deref() == Some(expected) {
                report.unchanged += 1;
                continue;
            }

            let bytes = retry.run("get_file", || remote.get_file(&child.key))?;
            match verify(&child.key, expected, &bytes) {
                Ok(()) => {}
                Err(err @ Error::Checksum { .. }) => {
                    warn!(key = %child.key, error = %err, "attachment download skipped");
                    report.skipped += 1;
                    continue;
                }
                Err(err) => return Err(err),
            }
            store.write(&child.key, &bytes)?;
            debug!(key = %child.key, bytes = bytes.len(), "attachment stored");
            report.downloaded += 1;
        }
    }

    for key in store.keys()? {
        if !referenced.contains(&key) && store.remove(&key)? {
            report.deleted += 1;
        }
    }

    info!(
        downloaded = report.downloaded,
        unchanged = report.unchanged,
        deleted = report.deleted,
        skipped = report.skipped,
        "file sync finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        cache::{CacheSyncOptions, sync_cache},
        record::RawRecord,
        remote::fixture::FixtureRemote,
    };

    fn attachment(key: &str, parent: &str, md5: Option<&str>) -> RawRecord {
        let mut data = json!({
            "itemType": "attachment",
            "parentItem": parent,
            "linkMode": "imported_file",
            "filename": format!("{key}.pdf"),
        });
        if let Some(md5) = md5 {
            data["md5"] = json!(md5);
        }
        RawRecord::from_value(json!({"key": key, "data": data})).unwrap()
    }

    fn setup() -> (tempfile::TempDir, Cache, FileStore, FixtureRemote) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::open(&tmp.path().join("cache.redb")).unwrap();
        let store = FileStore::open(&tmp.path().join("files")).unwrap();
        let mut remote = FixtureRemote::new("1");
        remote.put_item(
            RawRecord::from_value(json!({"key": "ITEM", "data": {"itemType": "book"}})).unwrap(),
        );
        (tmp, cache, store, remote)
    }

    fn sync(cache: &Cache, store: &FileStore, remote: &FixtureRemote) -> FileSyncReport {
        sync_cache(cache, remote, &RetryPolicy::none(), &CacheSyncOptions::default()).unwrap();
        sync_files(
            store,
            cache,
            remote,
            &RetryPolicy::none(),
            &TagGate::open(),
            &TagGate::open(),
        )
        .unwrap()
    }

    #[test]
    fn downloads_verifies_and_prunes() {
        let (_tmp, cache, store, mut remote) = setup();
        let pdf = b"%PDF-1.7 fake";
        remote.put_item(attachment("FILE", "ITEM", Some(&md5_hex(pdf))));
        remote.put_item(attachment("NOSUM", "ITEM", None));
        remote.put_file("FILE", pdf);

        let report = sync(&cache, &store, &remote);
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.read("FILE").unwrap(), pdf);

        let again = sync(&cache, &store, &remote);
        assert_eq!(again.downloaded, 0);
        assert_eq!(again.unchanged, 1);

        remote.delete_item("FILE");
        let pruned = sync(&cache, &store, &remote);
        assert_eq!(pruned.deleted, 1);
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn checksum_mismatch_is_skipped() {
        let (_tmp, cache, store, mut remote) = setup();
        remote.put_item(attachment("FILE", "ITEM", Some("0123456789abcdef0123456789abcdef")));
        remote.put_file("FILE", b"other bytes");
        let report = sync(&cache, &store, &remote);
        assert_eq!(report.downloaded, 0);
        assert_eq!(report.skipped, 1);
        assert!(!store.contains("FILE"));
    }

    #[test]
    fn writes_replace_atomically() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        store.write("K", b"one").unwrap();
        store.write("K", b"two").unwrap();
        assert_eq!(store.read("K").unwrap(), b"two");
        assert_eq!(store.keys().unwrap(), ["K"]);
        assert!(store.remove("K").unwrap());
        assert!(!store.remove("K").unwrap());
    }
}
