use std::path::Path;

use bibdex::{
    Cache,
    Config,
    Criteria,
    DataDir,
    Error,
    Registry,
    Result,
    Searcher,
    facets::{self, FacetItem},
    index::{self, IndexStatus},
    remote::{RemoteClient, fixture::FixtureRemote, http::ZoteroClient},
    searcher::{Hit, SearchRequest},
    sync::run_sync,
};
use clap::Parser;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, Target};

/// Fields printed for each hit.
const HIT_FIELDS: &[&str] = &["id", "item_type_label", "data", "date", "bib"];

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("BIBDEX_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_path = cli.config.clone().unwrap_or_else(|| data_dir.config_file());
    let config = Config::load(&config_path)?;
    let registry = Registry::default_for(&config)?;

    let outcome = match cli.command {
        Command::Sync(args) => cmd_sync(&config, &registry, &data_dir, args.target, args.fixture.as_deref()),
        Command::Search(args) => cmd_search(&config, &registry, &data_dir, &args),
        Command::Status(args) => cmd_status(&registry, &data_dir, args.json),
        Command::Clean(args) => cmd_clean(&data_dir, args.target),
    };

    match outcome {
        Err(Error::StoreUnavailable { store }) => {
            eprintln!("The {store} is not available yet; run `bibdex sync` first.");
            std::process::exit(2);
        }
        Err(err @ Error::SchemaMismatch { .. }) => {
            eprintln!("{err}");
            std::process::exit(3);
        }
        other => other,
    }
}

fn cmd_sync(
    config: &Config,
    registry: &Registry,
    data_dir: &DataDir,
    target: Target,
    fixture: Option<&Path>,
) -> Result<()> {
    let remote: Box<dyn RemoteClient> = match fixture {
        Some(path) => Box::new(FixtureRemote::load(path)?),
        None => Box::new(ZoteroClient::new(&config.zotero)?),
    };
    let report = run_sync(target.into(), config, registry, data_dir, remote.as_ref())?;

    if let Some(cache) = &report.cache {
        eprintln!(
            "Cache: version {} -> {} ({} created, {} updated, {} deleted, {} full texts)",
            cache.since, cache.version, cache.created, cache.updated, cache.deleted, cache.fulltext
        );
    }
    if let Some(files) = &report.files {
        eprintln!(
            "Files: {} downloaded, {} unchanged, {} deleted, {} skipped",
            files.downloaded, files.unchanged, files.deleted, files.skipped
        );
    }
    if let Some(index) = &report.index {
        eprintln!(
            "Index: {} documents at version {} ({} skipped)",
            index.documents, index.version, index.skipped
        );
    }
    Ok(())
}

fn cmd_search(
    config: &Config,
    registry: &Registry,
    data_dir: &DataDir,
    args: &cli::SearchArgs,
) -> Result<()> {
    let searcher = Searcher::open(&data_dir.index_dir(), registry)?;
    let pairs = args.pairs();
    let criteria = Criteria::from_pairs(
        pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        registry,
    );

    if let Some(id) = &criteria.options.id {
        return show_item(&searcher, id, args.json);
    }

    let results = searcher.search(&SearchRequest::from_criteria(&criteria, config.search.page_len))?;
    let active_only = results.is_empty();
    let facets = if args.no_facets {
        Vec::new()
    } else {
        facets::build_all(registry, &results, &criteria, active_only)
    };

    if args.json {
        let hits = results
            .hits()
            .iter()
            .map(|hit| hit.fields(HIT_FIELDS).map(Value::Object))
            .collect::<Result<Vec<_>>>()?;
        let out = json!({
            "total": results.item_count(),
            "page": results.page(),
            "page_count": results.page_count(),
            "sort": results.sort(),
            "hits": hits,
            "facets": facets,
        });
        println!("{out}");
        return Ok(());
    }

    if results.is_empty() {
        println!("No results.");
    }
    let first = (results.page().saturating_sub(1))
        .saturating_mul(criteria.options.page_len.unwrap_or(config.search.page_len));
    for (i, hit) in results.hits().iter().enumerate() {
        println!("{:>4}. {}", first.saturating_add(i + 1), summary(hit)?);
    }
    if !results.is_empty() {
        println!(
            "\n{} result(s), page {} of {}",
            results.item_count(),
            results.page(),
            results.page_count()
        );
    }
    for facet in &facets {
        println!("\n{} [{}]", facet.title, facet.filter_key);
        print_facet_items(&facet.items, facet.missing_label.as_deref(), 1);
    }
    Ok(())
}

fn summary(hit: &Hit<'_>) -> Result<String> {
    let data = hit.get("data")?.unwrap_or(Value::Null);
    let title = data.get("title").and_then(Value::as_str).unwrap_or("(untitled)");
    let kind = hit
        .get("item_type_label")?
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let date = hit
        .get("date")?
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    Ok(format!(
        "{title} [{kind}{}{date}] ({})",
        if date.is_empty() { "" } else { ", " },
        hit.id().unwrap_or_default()
    ))
}

fn print_facet_items(items: &[FacetItem], missing_label: Option<&str>, depth: usize) {
    for item in items {
        let label = if item.is_missing_bucket() {
            missing_label.unwrap_or("(none)")
        } else {
            item.label.as_str()
        };
        let marker = if item.active { "*" } else { " " };
        println!(
            "{}{marker} {label} ({}) = {}",
            "  ".repeat(depth),
            item.count,
            item.value
        );
        print_facet_items(&item.children, missing_label, depth + 1);
    }
}

fn show_item(searcher: &Searcher<'_>, id: &str, json: bool) -> Result<()> {
    let Some(hit) = searcher.get(id)? else {
        return Err(Error::NotFound {
            kind: "item",
            name: id.to_string(),
        });
    };
    let relations = searcher.relations(id)?;

    if json {
        let related: serde_json::Map<String, Value> = relations
            .iter()
            .map(|r| {
                let ids: Vec<Value> = r.items.iter().filter_map(|h| h.id()).map(Value::from).collect();
                (r.key.clone(), Value::Array(ids))
            })
            .collect();
        let mut out = hit.fields(HIT_FIELDS)?;
        out.insert("relations".into(), Value::Object(related));
        println!("{}", Value::Object(out));
        return Ok(());
    }

    println!("{}", summary(&hit)?);
    if let Some(bib) = hit.get("bib")?.and_then(|v| v.as_str().map(str::to_string)) {
        println!("\n{bib}");
    }
    for relation in &relations {
        println!("\n{}:", relation.label);
        for item in &relation.items {
            println!("  {}", summary(item)?);
        }
    }
    Ok(())
}

fn cmd_status(registry: &Registry, data_dir: &DataDir, json: bool) -> Result<()> {
    let cache = Cache::open(&data_dir.cache_db())?.status()?;
    let index = index::status_at(&data_dir.index_dir(), registry)?;
    let stale = index.is_stale(cache.version);

    if json {
        let index_json = match &index {
            IndexStatus::Missing => json!({"state": "missing"}),
            IndexStatus::Empty => json!({"state": "empty"}),
            IndexStatus::Ready {
                version,
                last_update,
                documents,
            } => json!({
                "state": "ready",
                "version": version,
                "last_update": last_update,
                "documents": documents,
            }),
        };
        let out = json!({
            "data_dir": data_dir.root().display().to_string(),
            "cache": {
                "version": cache.version,
                "records": cache.records,
                "last_modified": cache.last_modified,
            },
            "index": index_json,
            "stale": stale,
        });
        println!("{out}");
        return Ok(());
    }

    println!("Data directory: {}", data_dir.root().display());
    println!(
        "Cache: version {}, {} records, last modified {}",
        cache.version,
        cache.records,
        cache.last_modified.as_deref().unwrap_or("never")
    );
    match index {
        IndexStatus::Missing => println!("Index: not yet created"),
        IndexStatus::Empty => println!("Index: empty"),
        IndexStatus::Ready {
            version,
            last_update,
            documents,
        } => println!(
            "Index: version {version}, {documents} documents, as of {}",
            last_update.as_deref().unwrap_or("unknown")
        ),
    }
    if stale {
        println!("The index is stale; run `bibdex sync index`.");
    }
    Ok(())
}

fn cmd_clean(data_dir: &DataDir, target: Target) -> Result<()> {
    for store in target.stores() {
        remove_path(&data_dir.store_path(*store))?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else if path.exists() {
        std::fs::remove_file(path)?;
    } else {
        return Ok(());
    }
    eprintln!("Removed {}", path.display());
    Ok(())
}
