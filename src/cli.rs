use std::path::PathBuf;

use bibdex::{data_dir::Store, sync::SyncTarget};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(
    name = "bibdex",
    about = "Faceted search over a Zotero library"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Configuration file (default: config.toml in the data directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Pull changes from the remote library and rebuild the index
    Sync(SyncArgs),
    /// Search the index
    Search(SearchArgs),
    /// Show store watermarks and document counts
    Status(StatusArgs),
    /// Delete local stores so the next sync rebuilds them
    Clean(CleanArgs),
}

/// A local store, or all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Target {
    Cache,
    Files,
    Index,
    All,
}

impl Target {
    /// Stores covered by this target.
    pub fn stores(self) -> &'static [Store] {
        match self {
            Target::Cache => &[Store::Cache],
            Target::Files => &[Store::Files],
            Target::Index => &[Store::Index],
            Target::All => &Store::ALL,
        }
    }
}

impl From<Target> for SyncTarget {
    fn from(target: Target) -> Self {
        match target {
            Target::Cache => Self::Cache,
            Target::Files => Self::Files,
            Target::Index => Self::Index,
            Target::All => Self::All,
        }
    }
}

// -- Sync --

#[derive(Debug, Parser)]
pub struct SyncArgs {
    /// Which stores to update
    #[arg(value_enum, default_value = "all")]
    pub target: Target,

    /// Read the library from a JSON fixture instead of the Zotero API
    #[arg(long)]
    pub fixture: Option<PathBuf>,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// Keywords; omit to list everything
    pub query: Option<String>,

    /// Scope the keywords apply to
    #[arg(short, long, default_value = "all")]
    pub scope: String,

    /// Facet filter as FILTER=VALUE (repeatable)
    #[arg(short, long = "filter")]
    pub filters: Vec<String>,

    /// Sort key
    #[arg(long)]
    pub sort: Option<String>,

    /// Page number, starting at 1
    #[arg(short, long)]
    pub page: Option<usize>,

    /// Results per page
    #[arg(short = 'n', long)]
    pub page_len: Option<usize>,

    /// Show the item with this key and its relations
    #[arg(long)]
    pub id: Option<String>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    /// Do not print facets
    #[arg(long)]
    pub no_facets: bool,
}

impl SearchArgs {
    /// The arguments as criteria pairs.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(query) = &self.query {
            pairs.push((self.scope.clone(), query.clone()));
        }
        for filter in &self.filters {
            let (key, value) = filter.split_once('=').unwrap_or((filter.as_str(), ""));
            pairs.push((key.to_string(), value.to_string()));
        }
        let options = [
            ("sort", self.sort.clone()),
            ("page", self.page.map(|p| p.to_string())),
            ("page-len", self.page_len.map(|p| p.to_string())),
            ("id", self.id.clone()),
        ];
        for (key, value) in options {
            if let Some(value) = value {
                pairs.push((key.to_string(), value));
            }
        }
        pairs
    }
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Clean --

#[derive(Debug, Parser)]
pub struct CleanArgs {
    /// Which stores to delete
    #[arg(value_enum, default_value = "all")]
    pub target: Target,
}
