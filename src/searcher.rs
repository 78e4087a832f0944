//! Query engine over the search index.
//!
//! A [`Searcher`] turns a [`SearchRequest`] into a tantivy boolean query,
//! runs it against a fresh reader and returns [`Results`]: the requested
//! page of hits, the total count and, when faceting, per-facet value counts
//! for the whole result set. Hits keep the raw index document and decode
//! fields only when asked.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    ops::Bound,
    path::Path,
};

use serde_json::{Map, Value};
use tantivy::{
    DocAddress,
    TantivyDocument,
    Term,
    collector::{Count, DocSetCollector, TopDocs},
    query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, RangeQuery, RegexQuery, TermQuery},
    schema::IndexRecordOption,
};
use tracing::debug;

use crate::{
    codec::{QueryOperator, Stored, expand_paths},
    criteria::{Criteria, FilterState},
    error::{Error, Result},
    index::{IndexStatus, SearchIndex},
    record::CHILD_TYPES,
    schema::{FacetSpec, FieldType, ID_FIELD, Registry, SortSpec},
};

const STORE: &str = "index";

/// Keyword field holding the item type, used to keep child types out of
/// relation results.
const ITEM_TYPE_FIELD: &str = "item_type";

/// An inclusive range over a keyword field. Either end may be open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    pub field: String,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    /// 1-based.
    pub page: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    /// Scope key → search strings; all scopes must match.
    pub keywords: BTreeMap<String, Vec<String>>,
    /// Facet filter key → selected values; all values must match.
    pub filters: FilterState,
    /// Field key and accepted values; every entry must match one value.
    pub require_all: Vec<(String, Vec<String>)>,
    /// Field key and value pairs; at least one must match.
    pub require_any: Vec<(String, String)>,
    pub date_ranges: Vec<DateRange>,
    /// Field key and value pairs; none may match.
    pub reject_any: Vec<(String, String)>,
    /// Sort key; the registry default when unset or not allowed.
    pub sort: Option<String>,
    pub faceting: bool,
    /// `None` returns every hit.
    pub paging: Option<Paging>,
}

impl SearchRequest {
    /// A faceted, paged request for `criteria`.
    pub fn from_criteria(criteria: &Criteria, default_page_len: usize) -> Self {
        Self {
            keywords: criteria.keywords.clone(),
            filters: criteria.filters.clone(),
            sort: criteria.options.sort.clone(),
            faceting: true,
            paging: Some(Paging {
                page: criteria.options.page.unwrap_or(1),
                len: criteria.options.page_len.unwrap_or(default_page_len).max(1),
            }),
            ..Self::default()
        }
    }

    pub fn has_keywords(&self) -> bool {
        self.keywords.values().flatten().any(|k| !k.trim().is_empty())
    }
}

/// One matching item. Fields are decoded on access.
#[derive(Debug)]
pub struct Hit<'r> {
    pub score: f32,
    document: TantivyDocument,
    registry: &'r Registry,
}

impl<'r> Hit<'r> {
    pub fn id(&self) -> Option<String> {
        self.stored(ID_FIELD).into_iter().flatten().find_map(|s| s.as_str().map(str::to_string))
    }

    fn stored(&self, key: &str) -> Option<Vec<Stored>> {
        self.registry.stored(&self.document, key).ok()
    }

    /// Decoded value of a field; `None` when the item has no value.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let Some(spec) = self.registry.field(key) else {
            return Err(Error::NotFound {
                kind: "field",
                name: key.to_string(),
            });
        };
        let stored = self.registry.stored(&self.document, key)?;
        if stored.is_empty() {
            return Ok(None);
        }
        Ok(Some(spec.decode(&stored)))
    }

    /// Decoded values of the requested fields. Unknown keys and absent
    /// values are left out.
    pub fn fields(&self, keys: &[&str]) -> Result<Map<String, Value>> {
        let mut fields = Map::new();
        for spec in self.registry.select_fields(keys) {
            if let Some(value) = self.get(&spec.key)? {
                fields.insert(spec.key.clone(), value);
            }
        }
        Ok(fields)
    }

    /// `(value, label)` pairs of a facet.
    pub fn facet(&self, key: &str) -> Result<Vec<(String, String)>> {
        let Some(spec) = self.registry.facet(key) else {
            return Err(Error::NotFound {
                kind: "facet",
                name: key.to_string(),
            });
        };
        Ok(self
            .registry
            .stored(&self.document, key)?
            .iter()
            .filter_map(|s| s.as_str().map(|s| spec.decode(s)))
            .collect())
    }
}

#[derive(Debug)]
pub struct Results<'r> {
    hits: Vec<Hit<'r>>,
    total: usize,
    paging: Option<Paging>,
    sort: Option<String>,
    groups: BTreeMap<String, Vec<(String, u64)>>,
}

impl<'r> Results<'r> {
    pub fn hits(&self) -> &[Hit<'r>] {
        &self.hits
    }

    pub fn into_hits(self) -> Vec<Hit<'r>> {
        self.hits
    }

    /// Hits on this page.
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Matches across all pages.
    pub fn item_count(&self) -> usize {
        self.total
    }

    pub fn page(&self) -> usize {
        self.paging.map_or(1, |p| p.page)
    }

    pub fn page_count(&self) -> usize {
        match self.paging {
            Some(p) => self.total.div_ceil(p.len),
            None => usize::from(self.total > 0),
        }
    }

    pub fn is_paged(&self) -> bool {
        self.paging.is_some()
    }

    /// Key of the sort that was applied; `None` for relevance order
    /// without a registered score sort.
    pub fn sort(&self) -> Option<&str> {
        self.sort.as_deref()
    }

    /// Facet key → `(stored value, count)`, ordered by stored value. The
    /// empty value counts items missing the facet.
    pub fn groups(&self) -> &BTreeMap<String, Vec<(String, u64)>> {
        &self.groups
    }

    pub fn group(&self, facet_key: &str) -> &[(String, u64)] {
        self.groups.get(facet_key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Items related to one item through one side of a relation.
#[derive(Debug)]
pub struct RelatedItems<'r> {
    pub key: String,
    pub label: String,
    pub items: Vec<Hit<'r>>,
}

pub struct Searcher<'r> {
    index: SearchIndex,
    registry: &'r Registry,
}

impl<'r> Searcher<'r> {
    /// Open the index at `dir` for searching.
    ///
    /// A missing or empty index is [`Error::StoreUnavailable`].
    pub fn open(dir: &Path, registry: &'r Registry) -> Result<Self> {
        match SearchIndex::open_existing(dir, registry)? {
            Some(index) => Self::new(index, registry),
            None => Err(Error::StoreUnavailable { store: STORE }),
        }
    }

    pub fn new(index: SearchIndex, registry: &'r Registry) -> Result<Self> {
        match index.status()? {
            IndexStatus::Ready { .. } => Ok(Self { index, registry }),
            IndexStatus::Missing | IndexStatus::Empty => Err(Error::StoreUnavailable { store: STORE }),
        }
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }

    pub fn search(&self, request: &SearchRequest) -> Result<Results<'r>> {
        let query = self.build_query(request)?;
        let has_keywords = request.has_keywords();
        let sort = request
            .sort
            .as_deref()
            .and_then(|key| self.registry.sort(key))
            .filter(|s| s.is_allowed(has_keywords))
            .or_else(|| self.registry.default_sort(has_keywords));
        debug!(query = ?query, sort = sort.map(|s| s.key.as_str()), "search");
        self.execute(query.as_ref(), sort, request.paging, request.faceting)
    }

    /// Search with a paged, faceted request built from `criteria`.
    pub fn search_criteria(&self, criteria: &Criteria, default_page_len: usize) -> Result<Results<'r>> {
        self.search(&SearchRequest::from_criteria(criteria, default_page_len))
    }

    /// The item with key `id`.
    pub fn get(&self, id: &str) -> Result<Option<Hit<'r>>> {
        let query = TermQuery::new(self.term(ID_FIELD, id)?, IndexRecordOption::Basic);
        let searcher = self.index.searcher()?;
        let top = searcher.search(&query, &TopDocs::with_limit(1))?;
        match top.into_iter().next() {
            Some((score, address)) => Ok(Some(Hit {
                score,
                document: searcher.doc(address)?,
                registry: self.registry,
            })),
            None => Ok(None),
        }
    }

    /// Resolve every registered relation of the item `id`.
    ///
    /// Directed relations yield their forward side and, when declared, the
    /// reverse side under its own key. Undirected relations combine both
    /// sides. Empty sides are omitted. Child types and the item itself are
    /// never part of the result.
    pub fn relations(&self, id: &str) -> Result<Vec<RelatedItems<'r>>> {
        let Some(item) = self.get(id)? else {
            return Err(Error::NotFound {
                kind: "item",
                name: id.to_string(),
            });
        };
        let sort = self.registry.default_sort(false);
        let mut related = Vec::new();
        for relation in self.registry.relations() {
            let mut forward: Vec<Box<dyn Query>> = Vec::new();
            for value in texts(self.registry.stored(&item.document, &relation.field)?) {
                for id_field in &relation.id_fields {
                    forward.push(self.term_query(id_field, &value)?);
                }
            }
            let mut reverse: Vec<Box<dyn Query>> = Vec::new();
            for id_field in &relation.id_fields {
                for value in texts(self.registry.stored(&item.document, id_field)?) {
                    reverse.push(self.term_query(&relation.field, &value)?);
                }
            }

            let mut sides: Vec<(String, String, Vec<Box<dyn Query>>)> = Vec::new();
            if relation.directed {
                sides.push((relation.key.clone(), relation.label.clone(), forward));
                if let Some(back) = &relation.reverse {
                    sides.push((back.key.clone(), back.label.clone(), reverse));
                }
            } else {
                forward.extend(reverse);
                sides.push((relation.key.clone(), relation.label.clone(), forward));
            }

            for (key, label, clauses) in sides {
                if clauses.is_empty() {
                    continue;
                }
                let query = self.related_query(id, clauses)?;
                let items = self.execute(&query, sort, None, false)?.into_hits();
                if !items.is_empty() {
                    related.push(RelatedItems { key, label, items });
                }
            }
        }
        Ok(related)
    }

    fn related_query(&self, id: &str, any_of: Vec<Box<dyn Query>>) -> Result<BooleanQuery> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(
            Occur::Must,
            Box::new(BooleanQuery::new(
                any_of.into_iter().map(|q| (Occur::Should, q)).collect(),
            )),
        )];
        clauses.push((Occur::MustNot, self.term_query(ID_FIELD, id)?));
        for child_type in CHILD_TYPES {
            clauses.push((Occur::MustNot, self.term_query(ITEM_TYPE_FIELD, child_type)?));
        }
        Ok(BooleanQuery::new(clauses))
    }

    fn build_query(&self, request: &SearchRequest) -> Result<Box<dyn Query>> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

        for (scope, values) in &request.keywords {
            for value in values.iter().filter(|v| !v.trim().is_empty()) {
                clauses.push((Occur::Must, self.keyword_query(scope, value)?));
            }
        }

        for (filter_key, values) in &request.filters {
            let Some(facet) = self.registry.facet_by_filter(filter_key) else {
                debug!(filter_key, "ignoring filter without facet");
                continue;
            };
            for value in values {
                if value.is_empty() {
                    clauses.push((Occur::MustNot, self.exists_query(&facet.key)?));
                } else {
                    clauses.push((Occur::Must, self.facet_query(facet, value)?));
                }
            }
        }

        for (key, values) in &request.require_all {
            let any = values
                .iter()
                .map(|v| Ok((Occur::Should, self.term_query(key, v)?)))
                .collect::<Result<Vec<_>>>()?;
            clauses.push((Occur::Must, Box::new(BooleanQuery::new(any))));
        }

        if !request.require_any.is_empty() {
            let any = request
                .require_any
                .iter()
                .map(|(k, v)| Ok((Occur::Should, self.term_query(k, v)?)))
                .collect::<Result<Vec<_>>>()?;
            clauses.push((Occur::Must, Box::new(BooleanQuery::new(any))));
        }

        for range in &request.date_ranges {
            if range.start.is_none() && range.end.is_none() {
                continue;
            }
            let bound = |value: &Option<String>| -> Result<Bound<Term>> {
                Ok(match value {
                    Some(v) => Bound::Included(self.term(&range.field, v)?),
                    None => Bound::Unbounded,
                })
            };
            let query = RangeQuery::new(bound(&range.start)?, bound(&range.end)?);
            clauses.push((Occur::Must, Box::new(query)));
        }

        for (key, value) in &request.reject_any {
            clauses.push((Occur::MustNot, self.term_query(key, value)?));
        }

        if !clauses.iter().any(|(occur, _)| *occur == Occur::Must) {
            clauses.push((Occur::Must, Box::new(AllQuery)));
        }
        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    fn keyword_query(&self, scope: &str, value: &str) -> Result<Box<dyn Query>> {
        let specs = self.registry.scope_fields(scope)?;
        let mut handles = Vec::with_capacity(specs.len());
        for spec in &specs {
            handles.push(self.registry.handle(&spec.key)?);
        }
        let mut parser = QueryParser::for_index(self.index.index(), handles.clone());
        parser.set_conjunction_by_default();
        for (spec, handle) in specs.iter().zip(handles) {
            if let Some(boost) = spec.boost {
                parser.set_field_boost(handle, boost);
            }
        }
        let text = normalize_operators(value, self.registry.boolean_operators());
        let (query, errors) = parser.parse_query_lenient(&text);
        if !errors.is_empty() {
            debug!(scope, query = %text, ?errors, "lenient query parse");
        }
        Ok(query)
    }

    fn facet_query(&self, facet: &FacetSpec, value: &str) -> Result<Box<dyn Query>> {
        let term = facet.codec.query_term(value);
        let field = self.registry.handle(&facet.key)?;
        Ok(match facet.operator {
            QueryOperator::Equals => Box::new(TermQuery::new(
                Term::from_field_text(field, &term),
                IndexRecordOption::Basic,
            )),
            QueryOperator::Prefix => Box::new(RegexQuery::from_pattern(
                &format!("{}.*", regex::escape(&term)),
                field,
            )?),
        })
    }

    fn exists_query(&self, key: &str) -> Result<Box<dyn Query>> {
        Ok(Box::new(RegexQuery::from_pattern(".*", self.registry.handle(key)?)?))
    }

    fn term(&self, key: &str, value: &str) -> Result<Term> {
        let field = self.registry.handle(key)?;
        Ok(match self.registry.field(key).map(|f| f.field_type) {
            Some(FieldType::Boolean) => {
                Term::from_field_bool(field, matches!(value, "true" | "1" | "yes"))
            }
            Some(FieldType::Integer) => {
                let n = value
                    .parse()
                    .map_err(|_| Error::Config(format!("field {key} expects a number, got {value:?}")))?;
                Term::from_field_u64(field, n)
            }
            _ => Term::from_field_text(field, value),
        })
    }

    fn term_query(&self, key: &str, value: &str) -> Result<Box<dyn Query>> {
        Ok(Box::new(TermQuery::new(self.term(key, value)?, IndexRecordOption::Basic)))
    }

    fn execute(
        &self,
        query: &dyn Query,
        sort: Option<&SortSpec>,
        paging: Option<Paging>,
        faceting: bool,
    ) -> Result<Results<'r>> {
        let searcher = self.index.searcher()?;
        let total = searcher.search(query, &Count)?;
        // An offset that overflows lies past the last hit.
        let (offset, limit) = match paging {
            Some(p) => {
                let offset = p.page.saturating_sub(1).checked_mul(p.len).unwrap_or(usize::MAX);
                (offset, p.len.min(total.saturating_sub(offset)))
            }
            None => (0, total),
        };
        let by_score = sort.is_none_or(SortSpec::is_score);

        // Every match is loaded when sorting by fields or counting facets.
        let mut all: Vec<(DocAddress, TantivyDocument)> = Vec::new();
        if !by_score || faceting {
            let mut addresses: Vec<DocAddress> =
                searcher.search(query, &DocSetCollector)?.into_iter().collect();
            addresses.sort();
            for address in addresses {
                all.push((address, searcher.doc(address)?));
            }
        }

        let mut hits = Vec::new();
        if by_score {
            if offset < total && limit > 0 {
                let top = TopDocs::with_limit(limit).and_offset(offset);
                for (score, address) in searcher.search(query, &top)? {
                    hits.push(Hit {
                        score,
                        document: searcher.doc(address)?,
                        registry: self.registry,
                    });
                }
            }
        } else if let Some(sort) = sort {
            let mut keyed: Vec<(Vec<String>, TantivyDocument)> = all
                .iter()
                .map(|(_, doc)| (self.sort_keys(doc, sort), doc.clone()))
                .collect();
            keyed.sort_by(|(a, _), (b, _)| compare_keys(sort, a, b));
            hits = keyed
                .into_iter()
                .skip(offset)
                .take(limit)
                .map(|(_, document)| Hit {
                    score: 1.0,
                    document,
                    registry: self.registry,
                })
                .collect();
        }

        let groups = if faceting {
            self.count_facets(all.iter().map(|(_, doc)| doc))?
        } else {
            BTreeMap::new()
        };

        Ok(Results {
            hits,
            total,
            paging,
            sort: sort.map(|s| s.key.clone()),
            groups,
        })
    }

    /// Sort keys of a document, one per sort field, with the item id last
    /// for a stable order.
    fn sort_keys(&self, doc: &TantivyDocument, sort: &SortSpec) -> Vec<String> {
        sort.fields
            .iter()
            .map(String::as_str)
            .chain([ID_FIELD])
            .map(|key| {
                self.registry
                    .stored(doc, key)
                    .ok()
                    .and_then(|s| s.first().map(Stored::to_term))
                    .unwrap_or_default()
            })
            .collect()
    }

    fn count_facets<'d>(
        &self,
        documents: impl Iterator<Item = &'d TantivyDocument>,
    ) -> Result<BTreeMap<String, Vec<(String, u64)>>> {
        let mut counts: HashMap<&str, BTreeMap<String, u64>> = HashMap::new();
        for document in documents {
            for facet in self.registry.facets() {
                let values = texts(self.registry.stored(document, &facet.key)?);
                let bucket = counts.entry(facet.key.as_str()).or_default();
                if values.is_empty() {
                    if facet.missing_label.is_some() {
                        *bucket.entry(String::new()).or_default() += 1;
                    }
                    continue;
                }
                for value in counted_values(facet, &values) {
                    *bucket.entry(value.to_string()).or_default() += 1;
                }
            }
        }
        Ok(counts
            .into_iter()
            .map(|(key, values)| (key.to_string(), values.into_iter().collect()))
            .collect())
    }
}

fn texts(stored: Vec<Stored>) -> Vec<String> {
    stored.into_iter().map(|s| s.to_term()).filter(|s| !s.is_empty()).collect()
}

fn compare_keys(sort: &SortSpec, a: &[String], b: &[String]) -> Ordering {
    for (position, (x, y)) in a.iter().zip(b).enumerate() {
        let ordering = x.cmp(y);
        let ordering = if position < sort.fields.len() && sort.is_reversed(position) {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Values a document counts towards in `facet`.
///
/// Without overlap a document counts once: for flat facets its first
/// value, for trees its first leaf along with that leaf's ancestors.
fn counted_values<'v>(facet: &FacetSpec, values: &'v [String]) -> Vec<&'v str> {
    if facet.allow_overlap || values.len() < 2 {
        return values.iter().map(String::as_str).collect();
    }
    let Some(separator) = facet.kind.separator() else {
        return vec![values[0].as_str()];
    };
    let paths: Vec<String> = values.iter().map(|v| facet.decode(v).0).collect();
    let leaf = paths.iter().find(|path| {
        let prefix = format!("{path}{separator}");
        !paths.iter().any(|other| other.starts_with(&prefix))
    });
    let Some(leaf) = leaf else {
        return Vec::new();
    };
    let ancestors = expand_paths(leaf, separator);
    values
        .iter()
        .zip(&paths)
        .filter(|(_, path)| ancestors.contains(path))
        .map(|(value, _)| value.as_str())
        .collect()
}

/// Rewrite localized boolean operators into the query syntax.
///
/// `operators` maps words to `AND`, `OR` or `NOT`; the English words are
/// always understood. `NOT x` becomes `-x`. Words inside quoted phrases
/// are left alone.
pub fn normalize_operators(query: &str, operators: &BTreeMap<String, String>) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut negate_next = false;
    let mut in_phrase = false;
    for word in query.split_whitespace() {
        if !in_phrase {
            let operator = match operators.get(word) {
                Some(op) => Some(op.as_str()),
                None => ["AND", "OR", "NOT"].into_iter().find(|op| *op == word),
            };
            match operator {
                Some("NOT") => {
                    negate_next = true;
                    continue;
                }
                Some(op @ ("AND" | "OR")) => {
                    words.push(op.to_string());
                    continue;
                }
                _ => {}
            }
        }
        let token = if negate_next && !in_phrase {
            format!("-{word}")
        } else {
            word.to_string()
        };
        negate_next = false;
        if word.matches('"').count() % 2 == 1 {
            in_phrase = !in_phrase;
        }
        words.push(token);
    }
    words.join(" ")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        cache::{Cache, CacheSyncOptions, sync_cache},
        config::Config,
        index::sync_index,
        record::RawRecord,
        remote::fixture::FixtureRemote,
        retry::RetryPolicy,
        tag_gate::TagGate,
    };

    fn book(key: &str, title: &str, date: &str, tags: &[&str]) -> serde_json::Value {
        let tags: Vec<_> = tags.iter().map(|t| json!({"tag": t})).collect();
        json!({
            "key": key,
            "data": {
                "itemType": "book",
                "title": title,
                "date": date,
                "tags": tags,
                "creators": [{"creatorType": "author", "lastName": key, "firstName": "A"}],
            },
            "meta": {"parsedDate": date},
        })
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        index: Option<SearchIndex>,
        registry: Registry,
    }

    fn indexed(items: Vec<serde_json::Value>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::open(&tmp.path().join("cache.redb")).unwrap();
        let mut remote = FixtureRemote::new("1");
        for item in items {
            remote.put_item(RawRecord::from_value(item).unwrap());
        }
        sync_cache(&cache, &remote, &RetryPolicy::none(), &CacheSyncOptions::default()).unwrap();
        let registry = Registry::default_for(&Config::default()).unwrap();
        let index = SearchIndex::open_in_ram(&registry).unwrap();
        sync_index(&index, &cache, &registry, &TagGate::open(), 0).unwrap();
        Fixture {
            _tmp: tmp,
            index: Some(index),
            registry,
        }
    }

    impl Fixture {
        fn searcher(&mut self) -> Searcher<'_> {
            Searcher::new(self.index.take().unwrap(), &self.registry).unwrap()
        }
    }

    fn ids(results: &Results<'_>) -> Vec<String> {
        results.hits().iter().map(|h| h.id().unwrap()).collect()
    }

    fn library() -> Vec<serde_json::Value> {
        vec![
            book("AAAAAAAA", "Ownership and borrowing", "2019-05-01", &["Memory"]),
            book("BBBBBBBB", "Fearless concurrency", "2021-01-01", &["Threads", "Memory"]),
            book("CCCCCCCC", "Pattern matching", "1998", &[]),
        ]
    }

    #[test]
    fn empty_index_is_unavailable() {
        let registry = Registry::default_for(&Config::default()).unwrap();
        let index = SearchIndex::open_in_ram(&registry).unwrap();
        assert!(matches!(
            Searcher::new(index, &registry),
            Err(Error::StoreUnavailable { store: "index" })
        ));
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            Searcher::open(&tmp.path().join("nope"), &registry),
            Err(Error::StoreUnavailable { .. })
        ));
    }

    #[test]
    fn no_keywords_matches_everything() {
        let mut fx = indexed(library());
        let searcher = fx.searcher();
        let results = searcher.search(&SearchRequest::default()).unwrap();
        assert_eq!(results.item_count(), 3);
        assert_eq!(results.len(), 3);
        assert_eq!(results.page_count(), 1);
        // The score sort needs keywords, so the first field sort applies.
        assert_eq!(results.sort(), Some("date_desc"));
        assert_eq!(ids(&results), ["BBBBBBBB", "AAAAAAAA", "CCCCCCCC"]);
    }

    #[test]
    fn keywords_are_stemmed_and_scoped() {
        let mut fx = indexed(library());
        let searcher = fx.searcher();
        let mut request = SearchRequest::default();
        request.keywords.insert("title".into(), vec!["borrowed".into()]);
        let results = searcher.search(&request).unwrap();
        assert_eq!(ids(&results), ["AAAAAAAA"]);
        assert_eq!(results.sort(), Some("score"));

        request.keywords.insert("title".into(), vec!["pattern NOT matching".into()]);
        assert!(searcher.search(&request).unwrap().is_empty());
    }

    #[test]
    fn unknown_scope_fails_fast() {
        let mut fx = indexed(library());
        let searcher = fx.searcher();
        let mut request = SearchRequest::default();
        request.keywords.insert("nowhere".into(), vec!["x".into()]);
        assert!(matches!(
            searcher.search(&request),
            Err(Error::UnknownScope { .. })
        ));
    }

    #[test]
    fn filters_and_missing_values() {
        let mut fx = indexed(library());
        let searcher = fx.searcher();
        let mut request = SearchRequest::default();
        request.filters.insert("topic".into(), vec!["Memory".into()]);
        assert_eq!(searcher.search(&request).unwrap().item_count(), 2);

        request.filters.insert("topic".into(), vec!["Memory".into(), "Threads".into()]);
        assert_eq!(ids(&searcher.search(&request).unwrap()), ["BBBBBBBB"]);

        request.filters.insert("topic".into(), vec![String::new()]);
        assert_eq!(ids(&searcher.search(&request).unwrap()), ["CCCCCCCC"]);

        let mut request = SearchRequest::default();
        request.filters.insert("type".into(), vec!["book".into()]);
        assert_eq!(searcher.search(&request).unwrap().item_count(), 3);

        let mut request = SearchRequest::default();
        request.filters.insert("year".into(), vec!["2000.2010".into()]);
        assert_eq!(ids(&searcher.search(&request).unwrap()), ["AAAAAAAA"]);
    }

    #[test]
    fn term_clauses_and_ranges() {
        let mut fx = indexed(library());
        let searcher = fx.searcher();

        let request = SearchRequest {
            require_any: vec![
                ("id".into(), "AAAAAAAA".into()),
                ("id".into(), "CCCCCCCC".into()),
            ],
            reject_any: vec![("id".into(), "CCCCCCCC".into())],
            ..SearchRequest::default()
        };
        assert_eq!(ids(&searcher.search(&request).unwrap()), ["AAAAAAAA"]);

        let request = SearchRequest {
            date_ranges: vec![DateRange {
                field: "sort_date".into(),
                start: Some("2000-01-01".into()),
                end: None,
            }],
            ..SearchRequest::default()
        };
        assert_eq!(searcher.search(&request).unwrap().item_count(), 2);

        let request = SearchRequest {
            require_all: vec![("year".into(), vec!["1998".into(), "2019".into()])],
            ..SearchRequest::default()
        };
        assert_eq!(searcher.search(&request).unwrap().item_count(), 2);
    }

    #[test]
    fn paging_and_sorting() {
        let mut fx = indexed(library());
        let searcher = fx.searcher();
        let request = SearchRequest {
            sort: Some("title_asc".into()),
            paging: Some(Paging { page: 2, len: 2 }),
            ..SearchRequest::default()
        };
        let results = searcher.search(&request).unwrap();
        assert_eq!(results.item_count(), 3);
        assert_eq!(results.page_count(), 2);
        assert_eq!(ids(&results), ["CCCCCCCC"]);

        let request = SearchRequest {
            paging: Some(Paging { page: 9, len: 2 }),
            ..SearchRequest::default()
        };
        assert!(searcher.search(&request).unwrap().is_empty());
    }

    #[test]
    fn huge_page_numbers_are_past_the_end() {
        let mut fx = indexed(library());
        let searcher = fx.searcher();
        let max = u64::MAX.to_string();
        for sort in ["date_desc", "score"] {
            let criteria = Criteria::from_pairs(
                [("all", "ownership"), ("page", max.as_str()), ("page-len", "10"), ("sort", sort)],
                searcher.registry,
            );
            let results = searcher.search_criteria(&criteria, 20).unwrap();
            assert!(results.is_empty());
            assert_eq!(results.item_count(), 1);
            assert_eq!(results.page_count(), 1);
        }
    }

    #[test]
    fn huge_page_lengths_return_every_hit() {
        let mut fx = indexed(library());
        let searcher = fx.searcher();
        let criteria = Criteria::from_pairs(
            [("all", "ownership"), ("page-len", "1000000000000000")],
            searcher.registry,
        );
        let results = searcher.search_criteria(&criteria, 20).unwrap();
        assert_eq!(results.sort(), Some("score"));
        assert_eq!(ids(&results), ["AAAAAAAA"]);
        assert_eq!(results.page_count(), 1);

        let max = usize::MAX.to_string();
        let criteria = Criteria::from_pairs(
            [("page", "2"), ("page-len", max.as_str())],
            searcher.registry,
        );
        let results = searcher.search_criteria(&criteria, 20).unwrap();
        assert!(results.is_empty());
        assert_eq!(results.item_count(), 3);
    }

    #[test]
    fn items_without_a_value_form_the_missing_bucket() {
        let mut fx = indexed(library());
        let searcher = fx.searcher();
        let registry = searcher.registry;
        let topic = registry.facet("facet_tag").unwrap();
        assert_eq!(topic.missing_label.as_deref(), Some("No topic"));

        let criteria = Criteria::default();
        let results = searcher.search_criteria(&criteria, 20).unwrap();
        let items = crate::facets::build(topic, results.group("facet_tag"), &criteria, false);
        let summary: Vec<(&str, u64)> =
            items.iter().map(|i| (i.value.as_str(), i.count)).collect();
        assert_eq!(summary, [("Memory", 2), ("Threads", 1), ("", 1)]);

        let missing = items.last().unwrap();
        assert!(missing.is_missing_bucket());
        assert!(missing.label.is_empty());
        let add = missing.add.clone().unwrap();
        assert_eq!(add["topic"], [String::new()]);

        // Selecting the bucket keeps only items without a topic.
        let selected = criteria.with_filters(add);
        let results = searcher.search_criteria(&selected, 20).unwrap();
        assert_eq!(ids(&results), ["CCCCCCCC"]);
        let items = crate::facets::build(topic, results.group("facet_tag"), &selected, false);
        assert_eq!(items.len(), 1);
        assert!(items[0].active);
        assert!(items[0].add.is_none());
        assert!(items[0].remove.as_ref().unwrap().is_empty());

        let built = crate::facets::build_all(registry, &results, &selected, false);
        let facet = built.iter().find(|f| f.key == "facet_tag").unwrap();
        assert_eq!(facet.missing_label.as_deref(), Some("No topic"));
    }

    #[test]
    fn facets_are_counted_over_all_matches() {
        let mut fx = indexed(library());
        let searcher = fx.searcher();
        let request = SearchRequest {
            faceting: true,
            paging: Some(Paging { page: 1, len: 1 }),
            ..SearchRequest::default()
        };
        let results = searcher.search(&request).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results.group("facet_tag"),
            [
                (String::new(), 1),
                ("Memory".to_string(), 2),
                ("Threads".to_string(), 1)
            ]
        );
        let years: BTreeMap<_, _> = results.group("facet_year").iter().cloned().collect();
        assert_eq!(years["2000"], 2);
        assert_eq!(years["1900.1990.1998"], 1);
    }

    #[test]
    fn hits_decode_requested_fields_only() {
        let mut fx = indexed(library());
        let searcher = fx.searcher();
        let hit = searcher.get("AAAAAAAA").unwrap().unwrap();
        let fields = hit.fields(&["id", "url", "no_such_field"]).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["id"], json!("AAAAAAAA"));
        assert_eq!(hit.facet("facet_tag").unwrap(), [("Memory".into(), "Memory".into())]);
        assert!(searcher.get("ZZZZZZZZ").unwrap().is_none());
    }

    #[test]
    fn relations_resolve_both_ways() {
        let mut citing = book("AAAAAAAA", "Citing", "2020", &[]);
        citing["data"]["relations"] = json!({
            "dc:relation": ["http://zotero.org/users/1/items/CCCCCCCC"]
        });
        let note = json!({
            "key": "NOTE0001",
            "data": {
                "itemType": "note",
                "parentItem": "AAAAAAAA",
                "note": "<p><a href=\"zotero://select/library/items/BBBBBBBB\">B</a></p>",
                "tags": [{"tag": "_cites"}],
            },
        });
        let mut fx = indexed(vec![
            citing,
            note,
            book("BBBBBBBB", "Cited", "2010", &[]),
            book("CCCCCCCC", "Related", "2000", &[]),
        ]);
        let searcher = fx.searcher();

        let forward = searcher.relations("AAAAAAAA").unwrap();
        let by_key: BTreeMap<_, _> = forward
            .iter()
            .map(|r| (r.key.as_str(), r.items.iter().map(|h| h.id().unwrap()).collect::<Vec<_>>()))
            .collect();
        assert_eq!(by_key["cites"], ["BBBBBBBB"]);
        assert_eq!(by_key["related"], ["CCCCCCCC"]);

        let backward = searcher.relations("BBBBBBBB").unwrap();
        assert_eq!(backward.len(), 1);
        assert_eq!(backward[0].key, "cited_by");
        assert_eq!(backward[0].items[0].id().unwrap(), "AAAAAAAA");

        let undirected = searcher.relations("CCCCCCCC").unwrap();
        assert_eq!(undirected[0].key, "related");
        assert_eq!(undirected[0].items[0].id().unwrap(), "AAAAAAAA");
    }

    #[test]
    fn localized_operators_are_rewritten() {
        let ops: BTreeMap<String, String> = [("ET", "AND"), ("SAUF", "NOT")]
            .into_iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect();
        assert_eq!(normalize_operators("rust ET go SAUF java", &ops), "rust AND go -java");
        assert_eq!(normalize_operators("\"a NOT b\" NOT c", &ops), "\"a NOT b\" -c");
    }
}
