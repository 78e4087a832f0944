//! Facet builder: turns grouped counts into lists or trees of selectable
//! values, each carrying the filter state that toggles it.

use std::{cmp::Ordering, collections::BTreeMap};

use serde::Serialize;

use crate::{
    codec::expand_paths,
    criteria::{Criteria, FilterState},
    schema::{FacetSortKey, FacetSpec, Registry},
    searcher::Results,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetItem {
    pub value: String,
    /// Empty for the bucket of items without a value.
    pub label: String,
    pub count: u64,
    pub active: bool,
    /// Filter state selecting this value; unset when active.
    pub add: Option<FilterState>,
    /// Filter state deselecting this value; set only when active.
    pub remove: Option<FilterState>,
    pub children: Vec<FacetItem>,
}

impl FacetItem {
    pub fn is_missing_bucket(&self) -> bool {
        self.value.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetResult {
    pub key: String,
    pub title: String,
    pub filter_key: String,
    /// Display label of the missing bucket.
    pub missing_label: Option<String>,
    pub items: Vec<FacetItem>,
}

impl FacetResult {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Build every registered facet from `results`, in display order. Facets
/// without items are left out.
pub fn build_all(
    registry: &Registry,
    results: &Results<'_>,
    criteria: &Criteria,
    active_only: bool,
) -> Vec<FacetResult> {
    registry
        .facets()
        .iter()
        .map(|facet| FacetResult {
            key: facet.key.clone(),
            title: facet.title.clone(),
            filter_key: facet.filter_key.clone(),
            missing_label: facet.missing_label.clone(),
            items: build(facet, results.group(&facet.key), criteria, active_only),
        })
        .filter(|f| !f.is_empty())
        .collect()
}

/// Build one facet from its `(stored value, count)` groups.
///
/// With `active_only`, only the currently selected values are kept (with
/// their ancestors, for trees), and selected values absent from `groups`
/// are listed with a zero count. This renders the active filters when a
/// search has no results.
pub fn build(
    facet: &FacetSpec,
    groups: &[(String, u64)],
    criteria: &Criteria,
    active_only: bool,
) -> Vec<FacetItem> {
    let mut entries: Vec<(String, String, u64)> = groups
        .iter()
        .map(|(stored, count)| {
            let (value, label) = facet.codec.decode(stored, "", "");
            (value, label, *count)
        })
        .collect();
    if active_only {
        for selected in criteria.filter_values(&facet.filter_key) {
            if !entries.iter().any(|(v, _, _)| v == selected) {
                let (value, label) = facet.codec.decode(selected, "", "");
                entries.push((value, label, 0));
            }
        }
    }

    let item = |value: String, label: String, count: u64| {
        let active = criteria.is_active(&facet.filter_key, &value);
        FacetItem {
            add: (!active && !active_only).then(|| criteria.add_filter(facet, &value)),
            remove: active.then(|| criteria.remove_filter(facet, &value)),
            value,
            label,
            count,
            active,
            children: Vec::new(),
        }
    };

    let mut items = match facet.kind.separator() {
        None => entries
            .into_iter()
            .map(|(value, label, count)| item(value, label, count))
            .filter(|i| !active_only || i.active)
            .collect(),
        Some(separator) => {
            let mut nodes: BTreeMap<String, FacetItem> = BTreeMap::new();
            for (value, label, count) in entries {
                nodes.insert(value.clone(), item(value, label, count));
            }
            // Ancestors without their own group still need a node.
            let paths: Vec<String> = nodes.keys().filter(|k| !k.is_empty()).cloned().collect();
            for path in paths {
                for ancestor in expand_paths(&path, separator) {
                    if !nodes.contains_key(&ancestor) {
                        let (value, label) = facet.codec.decode(&ancestor, "", "");
                        nodes.insert(ancestor, item(value, label, 0));
                    }
                }
            }
            let mut roots = nest(nodes, separator);
            if active_only {
                prune_inactive(&mut roots);
            }
            roots
        }
    };
    sort_tree(&mut items, &facet.sort_by, facet.sort_reverse);
    items
}

/// Attach every node to its closest ancestor present in `nodes`.
fn nest(mut nodes: BTreeMap<String, FacetItem>, separator: char) -> Vec<FacetItem> {
    let parent_of = |path: &str| -> Option<String> {
        path.rsplit_once(separator).map(|(parent, _)| parent.to_string())
    };
    // Deepest paths first, so children are complete before being moved.
    let mut paths: Vec<String> = nodes.keys().cloned().collect();
    paths.sort_by_key(|p| std::cmp::Reverse(p.matches(separator).count()));
    let mut roots = Vec::new();
    for path in paths {
        let Some(node) = nodes.remove(&path) else {
            continue;
        };
        let mut parent = parent_of(&path);
        while let Some(candidate) = parent.as_deref() {
            if nodes.contains_key(candidate) {
                break;
            }
            parent = parent_of(candidate);
        }
        match parent.and_then(|p| nodes.get_mut(&p)) {
            Some(parent) => parent.children.push(node),
            None => roots.push(node),
        }
    }
    roots
}

/// Keep active nodes and the ancestors leading to them.
fn prune_inactive(items: &mut Vec<FacetItem>) {
    items.retain_mut(|item| {
        prune_inactive(&mut item.children);
        item.active || !item.children.is_empty()
    });
}

fn sort_tree(items: &mut [FacetItem], keys: &[FacetSortKey], reverse: bool) {
    sort_items(items, keys, reverse);
    for item in items {
        sort_tree(&mut item.children, keys, reverse);
    }
}

/// Order facet items.
///
/// Items with a label always precede the unlabelled missing bucket. The
/// remaining keys follow: counts descend and labels ascend, and `reverse`
/// flips both.
pub fn sort_items(items: &mut [FacetItem], keys: &[FacetSortKey], reverse: bool) {
    items.sort_by(|a, b| {
        a.label
            .is_empty()
            .cmp(&b.label.is_empty())
            .then_with(|| {
                let ordering = compare(a, b, keys);
                if reverse { ordering.reverse() } else { ordering }
            })
    });
}

fn compare(a: &FacetItem, b: &FacetItem, keys: &[FacetSortKey]) -> Ordering {
    keys.iter()
        .map(|key| match key {
            FacetSortKey::Count => b.count.cmp(&a.count),
            FacetSortKey::Label => a
                .label
                .to_lowercase()
                .cmp(&b.label.to_lowercase())
                .then_with(|| a.label.cmp(&b.label)),
        })
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}
