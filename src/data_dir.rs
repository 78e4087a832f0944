//! On-disk layout of a bibdex installation.
//!
//! Everything lives under one root: the config file, the record cache, the
//! attachment file store and the search index. Only the root and the file
//! store are created eagerly; the cache and the index are created by their
//! first sync, which keeps "never synced" observable.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV: &str = "BIBDEX_DATA_DIR";

const XDG_PREFIX: &str = "bibdex";
const CONFIG_FILE: &str = "config.toml";

/// A local store that `clean` can remove and `sync` rebuilds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    Cache,
    Files,
    Index,
}

impl Store {
    pub const ALL: [Store; 3] = [Store::Cache, Store::Files, Store::Index];

    /// Entry name under the data root.
    fn entry(self) -> &'static str {
        match self {
            Store::Cache => "cache.redb",
            Store::Files => "files",
            Store::Index => "index",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve and create the data root. An explicit path (`--data-dir`)
    /// wins over `BIBDEX_DATA_DIR`, which wins over the XDG data home.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = choose_root(explicit, std::env::var_os(DATA_DIR_ENV))?;
        std::fs::create_dir_all(&root).map_err(|_| Error::DataDir(root.clone()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Where `store` lives, whether or not it exists yet.
    pub fn store_path(&self, store: Store) -> PathBuf {
        self.root.join(store.entry())
    }

    pub fn cache_db(&self) -> PathBuf {
        self.store_path(Store::Cache)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.store_path(Store::Index)
    }

    /// The attachment file store, created on demand.
    pub fn files_dir(&self) -> Result<PathBuf> {
        let path = self.store_path(Store::Files);
        std::fs::create_dir_all(&path).map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }
}

/// An empty environment value counts as unset.
fn choose_root(explicit: Option<&Path>, env: Option<OsString>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(value) = env.filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(value));
    }
    xdg::BaseDirectories::with_prefix(XDG_PREFIX)
        .get_data_home()
        .ok_or_else(|| Error::Config("could not determine the XDG data home".into()))
}
