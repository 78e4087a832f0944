//! Search criteria: keywords per scope, selected facet filters and display
//! options.
//!
//! Criteria only ever hold what the caller supplied. Defaults (page 1, the
//! configured page length, the default sort) are resolved when a search is
//! run, so the filter-state deltas handed to the presentation layer stay as
//! small as the input that produced them.

use std::collections::BTreeMap;

use tracing::debug;

use crate::{codec::expand_paths, schema::{FacetSpec, Registry}};

/// Facet filter key → selected values.
pub type FilterState = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub page: Option<usize>,
    pub page_len: Option<usize>,
    pub sort: Option<String>,
    /// Key of a single item to show.
    pub id: Option<String>,
    pub abstracts: Option<bool>,
    pub print: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Criteria {
    /// Scope key → search strings.
    pub keywords: BTreeMap<String, Vec<String>>,
    pub filters: FilterState,
    pub options: SearchOptions,
}

impl Criteria {
    /// Build criteria from query-string style pairs.
    ///
    /// Scope keys become keywords, facet filter keys become filters and the
    /// option names `page`, `page-len`, `sort`, `id`, `abstracts` and
    /// `print` become options. Blank keywords, unparsable numbers and
    /// unknown keys are dropped.
    pub fn from_pairs<'a, I>(pairs: I, registry: &Registry) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut criteria = Self::default();
        for (key, value) in pairs {
            if registry.scopes().iter().any(|s| s.key == key) {
                let value = value.trim();
                if !value.is_empty() {
                    criteria
                        .keywords
                        .entry(key.to_string())
                        .or_default()
                        .push(value.to_string());
                }
            } else if registry.facet_by_filter(key).is_some() {
                let values = criteria.filters.entry(key.to_string()).or_default();
                if !values.iter().any(|v| v == value) {
                    values.push(value.to_string());
                }
            } else {
                let options = &mut criteria.options;
                match key {
                    "page" => options.page = value.parse().ok().filter(|p| *p > 0),
                    "page-len" => options.page_len = value.parse().ok().filter(|p| *p > 0),
                    "sort" if registry.sort(value).is_some() => {
                        options.sort = Some(value.to_string());
                    }
                    "id" if !value.is_empty() => options.id = Some(value.to_string()),
                    "abstracts" => options.abstracts = parse_flag(value),
                    "print" => options.print = parse_flag(value),
                    _ => debug!(key, "ignoring unknown criteria key"),
                }
            }
        }
        criteria
    }

    /// The inverse of [`Criteria::from_pairs`], in a stable order.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (scope, values) in &self.keywords {
            pairs.extend(values.iter().map(|v| (scope.clone(), v.clone())));
        }
        for (key, values) in &self.filters {
            pairs.extend(values.iter().map(|v| (key.clone(), v.clone())));
        }
        let o = &self.options;
        let mut option = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                pairs.push((key.to_string(), value));
            }
        };
        option("sort", o.sort.clone());
        option("page", o.page.map(|p| p.to_string()));
        option("page-len", o.page_len.map(|p| p.to_string()));
        option("id", o.id.clone());
        option("abstracts", o.abstracts.map(flag));
        option("print", o.print.map(flag));
        pairs
    }

    pub fn has_keywords(&self) -> bool {
        self.keywords.values().any(|v| !v.is_empty())
    }

    pub fn has_filters(&self) -> bool {
        self.filters.values().any(|v| !v.is_empty())
    }

    pub fn filter_values(&self, filter_key: &str) -> &[String] {
        self.filters.get(filter_key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_active(&self, filter_key: &str, value: &str) -> bool {
        self.filter_values(filter_key).iter().any(|v| v == value)
    }

    /// Filter state after selecting `value` in `facet`.
    ///
    /// Tree facets drop the ancestors of the new value, which it refines.
    /// Facets without overlap replace any current selection.
    pub fn add_filter(&self, facet: &FacetSpec, value: &str) -> FilterState {
        let mut filters = self.filters.clone();
        let values = filters.entry(facet.filter_key.clone()).or_default();
        if !facet.allow_overlap && !facet.is_tree() {
            values.clear();
        }
        if let Some(separator) = facet.kind.separator() {
            let ancestors = expand_paths(value, separator);
            values.retain(|v| v == value || !ancestors.contains(v));
        }
        if !values.iter().any(|v| v == value) {
            values.push(value.to_string());
        }
        filters
    }

    /// Filter state after deselecting `value` in `facet`. Tree facets also
    /// drop the descendants of `value`.
    pub fn remove_filter(&self, facet: &FacetSpec, value: &str) -> FilterState {
        let mut filters = self.filters.clone();
        if let Some(values) = filters.get_mut(&facet.filter_key) {
            match facet.kind.separator() {
                Some(separator) => {
                    let prefix = format!("{value}{separator}");
                    values.retain(|v| v != value && !v.starts_with(&prefix));
                }
                None => values.retain(|v| v != value),
            }
            if values.is_empty() {
                filters.remove(&facet.filter_key);
            }
        }
        filters
    }

    /// The same criteria with other filters, back on the first page.
    pub fn with_filters(&self, filters: FilterState) -> Self {
        Self {
            keywords: self.keywords.clone(),
            filters,
            options: SearchOptions {
                page: None,
                ..self.options.clone()
            },
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "true" | "y" | "yes" => Some(true),
        "0" | "f" | "false" | "n" | "no" => Some(false),
        _ => None,
    }
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn registry() -> Registry {
        Registry::default_for(&Config::default()).unwrap()
    }

    #[test]
    fn absent_input_stays_absent() {
        let criteria = Criteria::from_pairs([("all", "rust")], &registry());
        assert_eq!(criteria.options, SearchOptions::default());
        assert!(criteria.filters.is_empty());
        assert_eq!(
            criteria.to_pairs(),
            vec![("all".to_string(), "rust".to_string())]
        );
    }

    #[test]
    fn pairs_are_routed_by_key() {
        let criteria = Criteria::from_pairs(
            [
                ("title", "ownership"),
                ("title", "  "),
                ("topic", "Memory"),
                ("topic", "Memory"),
                ("page", "3"),
                ("page-len", "zero"),
                ("sort", "no_such_sort"),
                ("print", "1"),
                ("bogus", "x"),
            ],
            &registry(),
        );
        assert_eq!(criteria.keywords["title"], vec!["ownership"]);
        assert_eq!(criteria.filter_values("topic"), ["Memory"]);
        assert_eq!(criteria.options.page, Some(3));
        assert_eq!(criteria.options.page_len, None);
        assert_eq!(criteria.options.sort, None);
        assert_eq!(criteria.options.print, Some(true));
        assert!(criteria.has_keywords());
    }

    #[test]
    fn tree_filters_refine_and_prune() {
        let registry = registry();
        let year = registry.facet("facet_year").unwrap();
        let criteria = Criteria::from_pairs([("year", "2000")], &registry);

        let added = criteria.add_filter(year, "2000.2020");
        assert_eq!(added["year"], vec!["2000.2020"]);

        let criteria = criteria.with_filters(added);
        let added = criteria.add_filter(year, "2000.2020.2024");
        assert_eq!(added["year"], vec!["2000.2020.2024"]);

        let criteria = criteria.with_filters(added);
        assert!(criteria.remove_filter(year, "2000").is_empty());
    }

    #[test]
    fn exclusive_facets_replace_selection() {
        let registry = registry();
        let item_type = registry.facet("facet_item_type").unwrap();
        let topic = registry.facet("facet_tag").unwrap();
        let criteria = Criteria::from_pairs([("type", "book"), ("topic", "a")], &registry);

        assert_eq!(criteria.add_filter(item_type, "thesis")["type"], vec!["thesis"]);
        assert_eq!(criteria.add_filter(topic, "b")["topic"], vec!["a", "b"]);
        let removed = criteria.remove_filter(topic, "a");
        assert!(!removed.contains_key("topic"));
        assert_eq!(removed["type"], vec!["book"]);
    }

    #[test]
    fn new_filters_reset_the_page() {
        let registry = registry();
        let criteria = Criteria::from_pairs([("page", "4"), ("sort", "title_asc")], &registry);
        let moved = criteria.with_filters(FilterState::new());
        assert_eq!(moved.options.page, None);
        assert_eq!(moved.options.sort.as_deref(), Some("title_asc"));
    }
}
