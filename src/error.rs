use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("search index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("search index directory error: {0}")]
    IndexDirectory(#[from] tantivy::directory::error::OpenDirectoryError),

    #[error("query error: {0}")]
    QueryParser(#[from] tantivy::query::QueryParserError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    /// A failed call to the remote library service. `transient` failures
    /// are eligible for retry; `status` is the HTTP status when the service
    /// answered.
    #[error("remote error: {message}")]
    Remote {
        message: String,
        transient: bool,
        status: Option<u16>,
    },

    /// The on-disk structure of a store no longer matches what this build
    /// expects. The store has to be wiped and rebuilt.
    #[error(
        "{store} schema mismatch ({detail}); run `bibdex clean {store}` and sync again"
    )]
    SchemaMismatch { store: &'static str, detail: String },

    /// The store has not been created yet or holds no documents.
    #[error("{store} is not available yet; try again later")]
    StoreUnavailable { store: &'static str },

    #[error("unknown search scope: {scope}")]
    UnknownScope { scope: String },

    #[error("search scope '{scope}' has no searchable fields")]
    EmptyScope { scope: String },

    #[error("checksum mismatch for {key}: expected {expected}, got {actual}")]
    Checksum {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    pub fn remote(message: impl Into<String>, transient: bool) -> Self {
        Self::Remote {
            message: message.into(),
            transient,
            status: None,
        }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote { transient: true, .. })
    }
}
