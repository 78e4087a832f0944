//! A full sync run: remote → cache → files → index.

use tracing::info;

use crate::{
    cache::{Cache, CacheSyncOptions, CacheSyncReport, sync_cache},
    config::Config,
    data_dir::DataDir,
    error::Result,
    files::{FileStore, FileSyncReport, sync_files},
    index::{IndexSyncReport, SearchIndex, sync_index},
    remote::RemoteClient,
    schema::Registry,
};

/// Which stores a sync run updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    Cache,
    Files,
    Index,
    All,
}

impl SyncTarget {
    fn includes(self, other: Self) -> bool {
        self == Self::All || self == other
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub cache: Option<CacheSyncReport>,
    pub files: Option<FileSyncReport>,
    pub index: Option<IndexSyncReport>,
}

/// Run the sync phases selected by `target`, in order. A failing phase
/// stops the run; phases already committed stay committed.
pub fn run_sync(
    target: SyncTarget,
    config: &Config,
    registry: &Registry,
    data_dir: &DataDir,
    remote: &dyn RemoteClient,
) -> Result<SyncReport> {
    let retry = config.retry_policy();
    let item_gate = config.item_gate()?;
    let cache = Cache::open(&data_dir.cache_db())?;
    let mut report = SyncReport::default();

    if target.includes(SyncTarget::Cache) {
        let options = CacheSyncOptions::new(config, registry);
        report.cache = Some(sync_cache(&cache, remote, &retry, &options)?);
    }

    if target.includes(SyncTarget::Files) && config.sync.files {
        let store = FileStore::open(&data_dir.files_dir()?)?;
        report.files = Some(sync_files(
            &store,
            &cache,
            remote,
            &retry,
            &item_gate,
            &config.child_gate()?,
        )?);
    }

    if target.includes(SyncTarget::Index) {
        let index = SearchIndex::open(&data_dir.index_dir(), registry)?;
        report.index = Some(sync_index(
            &index,
            &cache,
            registry,
            &item_gate,
            config.sync.writer_memory,
        )?);
    }

    info!(?target, "sync finished");
    Ok(report)
}
