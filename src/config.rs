//! Configuration, loaded once from `config.toml` and passed explicitly.
//!
//! Every key has a default so a missing file, or a file containing only the
//! Zotero credentials, is enough to run.

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    retry::RetryPolicy,
    tag_gate::TagGate,
};

/// Environment variable that overrides `zotero.api_key`.
pub const API_KEY_ENV: &str = "BIBDEX_ZOTERO_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub zotero: ZoteroConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoteroConfig {
    #[serde(default)]
    pub library_id: String,
    #[serde(default = "default_library_type")]
    pub library_type: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_wait_seconds")]
    pub wait_seconds: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub item_include_re: Vec<String>,
    #[serde(default)]
    pub item_exclude_re: Vec<String>,
    #[serde(default)]
    pub child_include_re: Vec<String>,
    #[serde(default = "default_child_exclude_re")]
    pub child_exclude_re: Vec<String>,
    #[serde(default = "default_true")]
    pub fulltext: bool,
    #[serde(default = "default_true")]
    pub files: bool,
    #[serde(default = "default_writer_memory")]
    pub writer_memory: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_page_len")]
    pub page_len: usize,
    #[serde(default = "default_stem_language")]
    pub stem_language: String,
    /// Localized operator words mapped to `AND`, `OR` or `NOT`.
    #[serde(default)]
    pub boolean_operators: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub year_facet: bool,
    #[serde(default = "default_true")]
    pub tag_facet: bool,
    #[serde(default = "default_true")]
    pub item_type_facet: bool,
    #[serde(default = "default_true")]
    pub link_facet: bool,
    #[serde(default = "default_true")]
    pub attachment_facet: bool,
    #[serde(default)]
    pub collection_facets: Vec<CollectionFacetConfig>,
}

/// A facet rooted at one collection of the library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionFacetConfig {
    /// Facet key; the index field is `facet_<key>`.
    pub key: String,
    /// Key of the top collection in the remote library.
    pub collection: String,
    pub title: String,
    #[serde(default)]
    pub weight: i32,
}

fn default_library_type() -> String {
    "group".into()
}
fn default_base_url() -> String {
    "https://api.zotero.org".into()
}
fn default_locale() -> String {
    "en-US".into()
}
fn default_batch_size() -> usize {
    100
}
fn default_max_attempts() -> usize {
    10
}
fn default_wait_seconds() -> u64 {
    120
}
fn default_timeout_seconds() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_child_exclude_re() -> Vec<String> {
    vec!["^_exclude$".into()]
}
fn default_writer_memory() -> usize {
    50_000_000
}
fn default_page_len() -> usize {
    20
}
fn default_stem_language() -> String {
    "en".into()
}

impl Default for ZoteroConfig {
    fn default() -> Self {
        Self {
            library_id: String::new(),
            library_type: default_library_type(),
            api_key: String::new(),
            base_url: default_base_url(),
            locale: default_locale(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            wait_seconds: default_wait_seconds(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            item_include_re: Vec::new(),
            item_exclude_re: Vec::new(),
            child_include_re: Vec::new(),
            child_exclude_re: default_child_exclude_re(),
            fulltext: true,
            files: true,
            writer_memory: default_writer_memory(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            page_len: default_page_len(),
            stem_language: default_stem_language(),
            boolean_operators: BTreeMap::new(),
            year_facet: true,
            tag_facet: true,
            item_type_facet: true,
            link_facet: true,
            attachment_facet: true,
            collection_facets: Vec::new(),
        }
    }
}

impl Config {
    /// Load the configuration file, falling back to defaults when it does
    /// not exist. The API key environment variable wins over the file.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            Self::parse(&text)?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        if let Ok(key) = std::env::var(API_KEY_ENV)
            && !key.is_empty()
        {
            config.zotero.api_key = key;
        }
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.zotero.library_type.as_str(), "user" | "group") {
            return Err(Error::Config(format!(
                "zotero.library_type must be 'user' or 'group', not '{}'",
                self.zotero.library_type
            )));
        }
        if self.zotero.batch_size == 0 || self.zotero.batch_size > 100 {
            return Err(Error::Config(
                "zotero.batch_size must be between 1 and 100".into(),
            ));
        }
        if self.zotero.max_attempts == 0 {
            return Err(Error::Config(
                "zotero.max_attempts must be at least 1".into(),
            ));
        }
        if self.search.page_len == 0 {
            return Err(Error::Config(
                "search.page_len must be at least 1".into(),
            ));
        }
        for op in self.search.boolean_operators.values() {
            if !matches!(op.as_str(), "AND" | "OR" | "NOT") {
                return Err(Error::Config(format!(
                    "search.boolean_operators values must be AND, OR or NOT, not '{op}'"
                )));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.zotero.max_attempts,
            Duration::from_secs(self.zotero.wait_seconds),
        )
    }

    /// Gate applied to top-level items during index sync.
    pub fn item_gate(&self) -> Result<TagGate> {
        TagGate::new(&self.sync.item_include_re, &self.sync.item_exclude_re)
    }

    /// Gate applied to notes and attachments during extraction.
    pub fn child_gate(&self) -> Result<TagGate> {
        TagGate::new(&self.sync.child_include_re, &self.sync.child_exclude_re)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.zotero.batch_size, 100);
        assert_eq!(config.zotero.max_attempts, 10);
        assert_eq!(config.zotero.wait_seconds, 120);
        assert_eq!(config.search.page_len, 20);
        assert!(config.sync.fulltext);
        assert_eq!(config.sync.child_exclude_re, vec!["^_exclude$"]);
    }

    #[test]
    fn parses_sections() {
        let config = Config::parse(
            r#"
            [zotero]
            library_id = "12345"
            library_type = "user"
            batch_size = 50

            [sync]
            item_include_re = ["^_publish$"]

            [search]
            page_len = 10
            boolean_operators = { ET = "AND", OU = "OR" }

            [[search.collection_facets]]
            key = "topic"
            collection = "ABCD1234"
            title = "Topic"
            weight = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.zotero.library_id, "12345");
        assert_eq!(config.zotero.library_type, "user");
        assert_eq!(config.zotero.batch_size, 50);
        assert_eq!(config.sync.item_include_re, vec!["^_publish$"]);
        assert_eq!(config.search.page_len, 10);
        assert_eq!(config.search.boolean_operators["ET"], "AND");
        assert_eq!(config.search.collection_facets.len(), 1);
        assert_eq!(config.search.collection_facets[0].weight, 5);
    }

    #[test]
    fn rejects_bad_library_type() {
        let err = Config::parse("[zotero]\nlibrary_type = \"team\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_bad_operator_mapping() {
        let err = Config::parse("[search]\nboolean_operators = { ET = \"XOR\" }")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_missing_file_is_default() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(&tmp.path().join("config.toml")).unwrap();
        assert_eq!(config.zotero.base_url, "https://api.zotero.org");
    }
}
