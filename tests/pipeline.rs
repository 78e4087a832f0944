use std::collections::BTreeMap;

use bibdex::{
    Config,
    Criteria,
    DataDir,
    Registry,
    SearchIndex,
    Searcher,
    TagGate,
    cache::{Cache, CacheSyncOptions, sync_cache},
    facets,
    files::md5_hex,
    index::{IndexStatus, sync_index},
    record::RawRecord,
    remote::fixture::FixtureRemote,
    retry::RetryPolicy,
    searcher::SearchRequest,
    sync::{SyncTarget, run_sync},
};
use serde_json::{Value, json};

const PDF: &[u8] = b"%PDF-1.4 lifetimes explained";

fn record(value: Value) -> RawRecord {
    RawRecord::from_value(value).unwrap()
}

/// One book with a note and a stored attachment, plus an attachment
/// without a parent.
fn library() -> FixtureRemote {
    let mut remote = FixtureRemote::new("4711");
    remote.add_item_type("book", "Book", &[("title", "Title")], &[("author", "Author")]);
    remote.put_item(record(json!({
        "key": "BOOK0001",
        "data": {
            "itemType": "book",
            "title": "The Rust Programming Language",
            "date": "2019",
            "creators": [{"creatorType": "author", "lastName": "Klabnik", "firstName": "Steve"}],
            "tags": [{"tag": "Rust"}],
        },
        "meta": {"parsedDate": "2019"},
    })));
    remote.put_item(record(json!({
        "key": "NOTE0001",
        "data": {
            "itemType": "note",
            "parentItem": "BOOK0001",
            "note": "<p>Chapter ten covers <b>lifetimes</b>.</p>",
            "tags": [],
        },
    })));
    remote.put_item(record(json!({
        "key": "ATTA0001",
        "data": {
            "itemType": "attachment",
            "parentItem": "BOOK0001",
            "linkMode": "imported_file",
            "title": "Full Text PDF",
            "filename": "book.pdf",
            "contentType": "application/pdf",
            "md5": md5_hex(PDF),
            "tags": [],
        },
    })));
    remote.put_file("ATTA0001", PDF);
    remote.put_item(record(json!({
        "key": "LONE0001",
        "data": {
            "itemType": "attachment",
            "linkMode": "imported_file",
            "title": "Loose scan",
            "md5": md5_hex(b"scan"),
            "tags": [],
        },
    })));
    remote.put_file("LONE0001", b"scan");
    remote
}

#[test]
fn end_to_end_scenario() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
    let config = Config::default();
    let registry = Registry::default_for(&config).unwrap();
    let remote = library();

    let report = run_sync(SyncTarget::All, &config, &registry, &data_dir, &remote).unwrap();
    assert_eq!(report.cache.unwrap().version, remote.version());
    assert_eq!(report.files.unwrap().downloaded, 1);
    let index_report = report.index.unwrap();
    assert_eq!(index_report.documents, 1);
    assert_eq!(index_report.orphans, 1);

    let searcher = Searcher::open(&data_dir.index_dir(), &registry).unwrap();
    let all = searcher.search(&SearchRequest::default()).unwrap();
    assert_eq!(all.item_count(), 1);
    let hit = &all.hits()[0];
    assert_eq!(hit.id().as_deref(), Some("BOOK0001"));

    let attachments = hit.get("attachments").unwrap().unwrap();
    let attachments = attachments.as_array().unwrap();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0]["key"], "ATTA0001");
    assert_eq!(attachments[0]["md5"], json!(md5_hex(PDF)));

    // Note text is searchable through the item.
    let criteria = Criteria::from_pairs([("all", "lifetimes")], &registry);
    let found = searcher.search_criteria(&criteria, 20).unwrap();
    assert_eq!(found.item_count(), 1);

    for child in ["NOTE0001", "ATTA0001", "LONE0001"] {
        assert!(searcher.get(child).unwrap().is_none(), "{child} was indexed");
    }
}

#[test]
fn index_rebuild_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = Cache::open(&tmp.path().join("cache.redb")).unwrap();
    let remote = library();
    sync_cache(&cache, &remote, &RetryPolicy::none(), &CacheSyncOptions::default()).unwrap();

    let registry = Registry::default_for(&Config::default()).unwrap();
    let dir = tmp.path().join("index");
    let keys: Vec<&str> = registry.fields().map(|f| f.key.as_str()).collect();

    let snapshot = || -> (u64, Vec<serde_json::Map<String, Value>>) {
        let index = SearchIndex::open(&dir, &registry).unwrap();
        sync_index(&index, &cache, &registry, &TagGate::open(), 0).unwrap();
        let count = index.doc_count().unwrap();
        let searcher = Searcher::new(index, &registry).unwrap();
        let request = SearchRequest {
            sort: Some("title_asc".into()),
            ..SearchRequest::default()
        };
        let docs = searcher
            .search(&request)
            .unwrap()
            .hits()
            .iter()
            .map(|h| h.fields(&keys).unwrap())
            .collect();
        (count, docs)
    };

    let first = snapshot();
    let second = snapshot();
    assert_eq!(first.0, 1);
    assert_eq!(first, second);
}

#[test]
fn status_reports_staleness() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = DataDir::resolve(Some(tmp.path())).unwrap();
    let config = Config::default();
    let registry = Registry::default_for(&config).unwrap();
    let mut remote = library();

    run_sync(SyncTarget::All, &config, &registry, &data_dir, &remote).unwrap();
    remote.put_item(record(json!({"key": "BOOK0002", "data": {"itemType": "book"}})));
    run_sync(SyncTarget::Cache, &config, &registry, &data_dir, &remote).unwrap();

    let cache_version = Cache::open(&data_dir.cache_db()).unwrap().version().unwrap();
    let status = bibdex::index::status_at(&data_dir.index_dir(), &registry).unwrap();
    assert!(matches!(status, IndexStatus::Ready { documents: 1, .. }));
    assert!(status.is_stale(cache_version));

    run_sync(SyncTarget::Index, &config, &registry, &data_dir, &remote).unwrap();
    let status = bibdex::index::status_at(&data_dir.index_dir(), &registry).unwrap();
    assert!(!status.is_stale(cache_version));
}

#[test]
fn year_facet_groups_into_a_tree() {
    let mut remote = FixtureRemote::new("1");
    for (key, year) in [("A", "2020"), ("B", "2020"), ("C", "2020"), ("D", "2021"), ("E", "2021")] {
        remote.put_item(record(json!({
            "key": key,
            "data": {"itemType": "book", "date": year},
            "meta": {"parsedDate": year},
        })));
    }
    remote.put_item(record(json!({
        "key": "F",
        "data": {"itemType": "book", "date": "2021"},
        "meta": {"parsedDate": "2021"},
    })));
    remote.put_item(record(json!({
        "key": "G",
        "data": {"itemType": "book", "date": "2021"},
        "meta": {"parsedDate": "2021"},
    })));

    let tmp = tempfile::tempdir().unwrap();
    let cache = Cache::open(&tmp.path().join("cache.redb")).unwrap();
    sync_cache(&cache, &remote, &RetryPolicy::none(), &CacheSyncOptions::default()).unwrap();
    let registry = Registry::default_for(&Config::default()).unwrap();
    let index = SearchIndex::open_in_ram(&registry).unwrap();
    sync_index(&index, &cache, &registry, &TagGate::open(), 0).unwrap();
    let searcher = Searcher::new(index, &registry).unwrap();

    let criteria = Criteria::default();
    let results = searcher.search_criteria(&criteria, 20).unwrap();
    let built = facets::build_all(&registry, &results, &criteria, false);
    let years = built.iter().find(|f| f.key == "facet_year").unwrap();

    let century = &years.items[0];
    assert_eq!((century.value.as_str(), century.count), ("2000", 7));
    let decade = &century.children[0];
    assert_eq!((decade.value.as_str(), decade.count), ("2000.2020", 7));
    let leaves: BTreeMap<&str, u64> = decade
        .children
        .iter()
        .map(|c| (c.label.as_str(), c.count))
        .collect();
    assert_eq!(leaves, BTreeMap::from([("2020", 3), ("2021", 4)]));
    assert!(decade.children.iter().all(|c| c.add.is_some()));
}
