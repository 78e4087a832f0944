//! bibdex - faceted full-text search over a Zotero library.
//!
//! bibdex mirrors a remote library into a local [redb](https://github.com/cberner/redb)
//! cache, rebuilds a [Tantivy](https://github.com/quickwit-oss/tantivy) index
//! from it through a declarative registry of fields and facets, and answers
//! faceted, ranked, multi-scope searches.
//!
//! # Quick start
//!
//! ```no_run
//! use bibdex::{Config, Criteria, DataDir, Registry, Searcher};
//! use bibdex::remote::http::ZoteroClient;
//! use bibdex::sync::{SyncTarget, run_sync};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config = Config::load(&data_dir.config_file()).unwrap();
//! let registry = Registry::default_for(&config).unwrap();
//!
//! let remote = ZoteroClient::new(&config.zotero).unwrap();
//! run_sync(SyncTarget::All, &config, &registry, &data_dir, &remote).unwrap();
//!
//! let searcher = Searcher::open(&data_dir.index_dir(), &registry).unwrap();
//! let criteria = Criteria::from_pairs([("all", "rust programming")], &registry);
//! let results = searcher.search_criteria(&criteria, config.search.page_len).unwrap();
//! for hit in results.hits() {
//!     println!("{:?}", hit.fields(&["id", "data"]).unwrap());
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod criteria;
pub mod data_dir;
pub mod error;
pub mod extract;
pub mod facets;
pub mod files;
pub mod index;
pub mod library;
pub mod record;
pub mod remote;
pub mod retry;
pub mod schema;
pub mod searcher;
pub mod sync;
pub mod tag_gate;

pub use cache::Cache;
pub use config::Config;
pub use criteria::Criteria;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use files::FileStore;
pub use index::SearchIndex;
pub use library::LibraryContext;
pub use schema::{Composer, Registry};
pub use searcher::Searcher;
pub use tag_gate::TagGate;
