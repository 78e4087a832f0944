//! Extractors pull values out of a cached item, its children and the
//! library context.
//!
//! Every extractor declares the remote [`Format`]s it reads so the cache
//! sync can request exactly what the registered specs need. Composition is
//! plain data: [`Multi`], [`Chain`] and [`Transformer`] own their inner
//! extractors.

use std::{fmt, sync::LazyLock};

use regex::Regex;
use serde_json::{Map, Value, json};

use crate::{
    error::Result,
    library::LibraryContext,
    record::{ATTACHMENT, CacheRecord, Format, NOTE},
    tag_gate::TagGate,
};

static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static RE_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// A top-level item together with all of its cached children.
#[derive(Debug, Clone, Copy)]
pub struct ItemView<'a> {
    pub item: &'a CacheRecord,
    pub children: &'a [CacheRecord],
}

impl<'a> ItemView<'a> {
    pub fn new(item: &'a CacheRecord, children: &'a [CacheRecord]) -> Self {
        Self { item, children }
    }
}

pub trait Extractor: fmt::Debug + Send + Sync {
    /// Remote formats this extractor reads.
    fn formats(&self) -> Vec<Format> {
        vec![Format::Data]
    }

    /// `None` means the value is absent for this item, which is not an error.
    fn extract(&self, view: &ItemView<'_>, library: &LibraryContext) -> Option<Value>;
}

pub type BoxedExtractor = Box<dyn Extractor>;

/// Treat empty strings, lists and objects as missing.
fn non_empty(value: Value) -> Option<Value> {
    match &value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::Array(a) if a.is_empty() => None,
        Value::Object(o) if o.is_empty() => None,
        _ => Some(value),
    }
}

// -- Direct extractors --

#[derive(Debug, Clone, Copy)]
pub struct Key;

impl Extractor for Key {
    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        Some(Value::String(view.item.key.clone()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Version;

impl Extractor for Version {
    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        Some(Value::from(view.item.version))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ItemType;

impl Extractor for ItemType {
    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        non_empty(Value::String(view.item.item_type.clone()))
    }
}

/// The localized name of the item type. With `labeled`, a
/// `{"value", "label"}` pair suitable for a label-suffixed facet.
#[derive(Debug, Clone, Copy)]
pub struct ItemTypeLabel {
    pub labeled: bool,
}

impl Extractor for ItemTypeLabel {
    fn extract(&self, view: &ItemView<'_>, library: &LibraryContext) -> Option<Value> {
        let item_type = view.item.item_type.as_str();
        if item_type.is_empty() {
            return None;
        }
        let label = library.item_type_label(item_type);
        if self.labeled {
            Some(json!({"value": item_type, "label": label}))
        } else {
            Some(Value::String(label.to_string()))
        }
    }
}

/// One key of the structured `data` object.
#[derive(Debug, Clone)]
pub struct DataField(pub String);

impl DataField {
    pub fn new(field: &str) -> Self {
        Self(field.to_string())
    }
}

impl Extractor for DataField {
    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        view.item.item.data_value(&self.0).cloned().and_then(non_empty)
    }
}

/// One key of the server-computed `meta` object.
#[derive(Debug, Clone)]
pub struct MetaField(pub String);

impl MetaField {
    pub fn new(field: &str) -> Self {
        Self(field.to_string())
    }
}

impl Extractor for MetaField {
    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        view.item
            .item
            .meta()
            .and_then(|m| m.get(&self.0))
            .cloned()
            .and_then(non_empty)
    }
}

/// The payload of a rendered format (`bib`, `ris`, the `data` object...).
#[derive(Debug, Clone)]
pub struct Rendered(pub Format);

impl Extractor for Rendered {
    fn formats(&self) -> Vec<Format> {
        vec![self.0.clone()]
    }

    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        view.item.item.format(&self.0).cloned().and_then(non_empty)
    }
}

/// Tag names, minus those matching `skip`.
#[derive(Debug, Clone, Default)]
pub struct Tags {
    pub skip: Option<Regex>,
}

impl Tags {
    pub fn skipping(pattern: &str) -> Result<Self> {
        Ok(Self {
            skip: Some(Regex::new(pattern)?),
        })
    }
}

impl Extractor for Tags {
    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        let tags: Vec<Value> = view
            .item
            .tags()
            .into_iter()
            .filter(|t| !t.is_empty())
            .filter(|t| self.skip.as_ref().is_none_or(|re| !re.is_match(t)))
            .map(|t| Value::String(t.to_string()))
            .collect();
        non_empty(Value::Array(tags))
    }
}

/// Names of the collections the item belongs to.
#[derive(Debug, Clone, Copy)]
pub struct CollectionNames;

impl Extractor for CollectionNames {
    fn extract(&self, view: &ItemView<'_>, library: &LibraryContext) -> Option<Value> {
        let names: Vec<Value> = view
            .item
            .item
            .collections()
            .into_iter()
            .filter_map(|key| library.collections.get(key))
            .map(|c| Value::String(c.name.clone()))
            .collect();
        non_empty(Value::Array(names))
    }
}

/// Facet entries for the collections below `root` that contain the item.
///
/// Each containing collection contributes itself and all its ancestors
/// under `root` as `{"path": "A.B", "label": "B's name"}` objects, so the
/// facet tree can be rebuilt from the stored terms alone.
#[derive(Debug, Clone)]
pub struct CollectionTree {
    pub root: String,
}

impl Extractor for CollectionTree {
    fn extract(&self, view: &ItemView<'_>, library: &LibraryContext) -> Option<Value> {
        let mut entries: Vec<Value> = Vec::new();
        for key in view.item.item.collections() {
            let ancestors = library.collections.ancestors(key);
            let Some(pos) = ancestors.iter().position(|k| *k == self.root) else {
                continue;
            };
            let below = &ancestors[pos + 1..];
            for depth in 1..=below.len() {
                let path = below[..depth].join(".");
                let label = library
                    .collections
                    .get(&below[depth - 1])
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                let entry = json!({"path": path, "label": label});
                if !entries.contains(&entry) {
                    entries.push(entry);
                }
            }
        }
        non_empty(Value::Array(entries))
    }
}

fn creator_name(creator: &Map<String, Value>, last_first: bool) -> Option<String> {
    let get = |k: &str| {
        creator
            .get(k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };
    if let Some(name) = get("name") {
        return Some(name.to_string());
    }
    match (get("firstName"), get("lastName")) {
        (Some(first), Some(last)) if last_first => Some(format!("{last}, {first}")),
        (Some(first), Some(last)) => Some(format!("{first} {last}")),
        (None, Some(only)) | (Some(only), None) => Some(only.to_string()),
        (None, None) => None,
    }
}

/// Creator names in display order, `First Last` (or `Last, First` when
/// `last_first` is set).
#[derive(Debug, Clone, Copy, Default)]
pub struct Creators {
    pub last_first: bool,
}

impl Extractor for Creators {
    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        let names: Vec<Value> = view
            .item
            .item
            .data_value("creators")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_object)
            .filter_map(|c| creator_name(c, self.last_first))
            .map(Value::String)
            .collect();
        non_empty(Value::Array(names))
    }
}

/// Lowercased `last first` names joined by `;`, for sorting.
#[derive(Debug, Clone, Copy)]
pub struct CreatorsSortKey;

impl Extractor for CreatorsSortKey {
    fn extract(&self, view: &ItemView<'_>, library: &LibraryContext) -> Option<Value> {
        let names = Creators { last_first: true }.extract(view, library)?;
        let joined = names
            .as_array()?
            .iter()
            .filter_map(Value::as_str)
            .map(|n| n.replace(',', "").to_lowercase())
            .collect::<Vec<_>>()
            .join(";");
        non_empty(Value::String(joined))
    }
}

/// Every string value of the `data` object except the listed keys.
#[derive(Debug, Clone)]
pub struct AllDataText {
    pub skip: Vec<String>,
}

impl AllDataText {
    pub fn skipping(keys: &[&str]) -> Self {
        Self {
            skip: keys.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl Extractor for AllDataText {
    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        let data = view.item.item.data()?;
        let texts: Vec<Value> = data
            .iter()
            .filter(|(k, _)| !self.skip.contains(k))
            .filter_map(|(_, v)| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect();
        non_empty(Value::Array(texts))
    }
}

/// The four-digit year of `meta.parsedDate`.
#[derive(Debug, Clone, Copy)]
pub struct Year;

impl Extractor for Year {
    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        let date = view.item.item.meta_str("parsedDate")?;
        let year: String = date.chars().take(4).collect();
        (year.len() == 4 && year.chars().all(|c| c.is_ascii_digit()))
            .then(|| Value::String(year))
    }
}

/// `meta.parsedDate` padded to `YYYY-MM-DD`; items without a date sort as
/// year zero.
#[derive(Debug, Clone, Copy)]
pub struct SortDate;

impl Extractor for SortDate {
    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        let date = view.item.item.meta_str("parsedDate").unwrap_or("0000");
        let mut parts = date.splitn(3, '-');
        let year = parts.next().unwrap_or("0000");
        let month = parts.next().unwrap_or("00");
        let day = parts.next().unwrap_or("00");
        Some(Value::String(format!("{year:0>4}-{month:0>2}-{day:0>2}")))
    }
}

/// Lowercased title with leading punctuation removed.
#[derive(Debug, Clone, Copy)]
pub struct SortTitle;

impl Extractor for SortTitle {
    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        let title = view
            .item
            .item
            .data_str("title")
            .or_else(|| view.item.item.data_str("caseName"))
            .or_else(|| view.item.item.data_str("nameOfAct"))?;
        let key = title
            .trim_start_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        non_empty(Value::String(key))
    }
}

/// Keys of items linked through a relation predicate of `data.relations`,
/// such as `dc:relation`. Values are item URIs; only the last path segment
/// is kept.
#[derive(Debug, Clone)]
pub struct Relations {
    pub predicate: String,
}

impl Extractor for Relations {
    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        let relation = view
            .item
            .item
            .data_value("relations")?
            .get(&self.predicate)?;
        let uris: Vec<&str> = match relation {
            Value::String(s) => vec![s.as_str()],
            Value::Array(a) => a.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        let keys: Vec<Value> = uris
            .into_iter()
            .filter_map(|uri| uri.trim_end_matches('/').rsplit('/').next())
            .filter(|k| !k.is_empty())
            .map(|k| Value::String(k.to_string()))
            .collect();
        non_empty(Value::Array(keys))
    }
}

/// `true` when the inner extractor produces a value, `false` otherwise.
#[derive(Debug)]
pub struct Exists(pub BoxedExtractor);

impl Extractor for Exists {
    fn formats(&self) -> Vec<Format> {
        self.0.formats()
    }

    fn extract(&self, view: &ItemView<'_>, library: &LibraryContext) -> Option<Value> {
        Some(Value::Bool(self.0.extract(view, library).is_some()))
    }
}

// -- Children --

/// What a [`Children`] extractor derives from the selected children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutput {
    /// Note text with markup stripped, or the title of other children.
    Text,
    /// Raw note HTML.
    NoteHtml,
    /// The cached full text of each child.
    Fulltext,
    /// The children's `data` objects.
    Raw,
    /// Summaries of attachments: key, title, filename, content type, md5,
    /// link mode, url.
    Attachments,
    /// Whether any child was selected.
    Exists,
}

/// Selects children by item type, link mode and tag gate, then derives one
/// value from them.
#[derive(Debug, Clone)]
pub struct Children {
    pub item_types: Vec<String>,
    pub link_modes: Vec<String>,
    pub gate: TagGate,
    pub output: ChildOutput,
}

impl Children {
    pub fn new(item_types: &[&str], gate: TagGate, output: ChildOutput) -> Self {
        Self {
            item_types: item_types.iter().map(|t| t.to_string()).collect(),
            link_modes: Vec::new(),
            gate,
            output,
        }
    }

    pub fn notes(gate: TagGate, output: ChildOutput) -> Self {
        Self::new(&[NOTE], gate, output)
    }

    pub fn attachments(gate: TagGate, output: ChildOutput) -> Self {
        Self::new(&[ATTACHMENT], gate, output)
    }

    /// Restrict attachments to the given link modes.
    pub fn with_link_modes(mut self, modes: &[&str]) -> Self {
        self.link_modes = modes.iter().map(|m| m.to_string()).collect();
        self
    }

    fn selected<'a>(&'a self, view: &ItemView<'a>) -> impl Iterator<Item = &'a CacheRecord> {
        view.children.iter().filter(move |child| {
            let type_ok = self.item_types.is_empty() || self.item_types.contains(&child.item_type);
            let mode_ok = self.link_modes.is_empty()
                || child
                    .item
                    .data_str("linkMode")
                    .is_some_and(|m| self.link_modes.iter().any(|l| l == m));
            type_ok && mode_ok && self.gate.check(&child.tags())
        })
    }
}

impl Extractor for Children {
    fn formats(&self) -> Vec<Format> {
        match self.output {
            ChildOutput::Fulltext => vec![Format::Data, Format::Fulltext],
            _ => vec![Format::Data],
        }
    }

    fn extract(&self, view: &ItemView<'_>, _: &LibraryContext) -> Option<Value> {
        let mut selected = self.selected(view).peekable();
        let values: Vec<Value> = match self.output {
            ChildOutput::Exists => return Some(Value::Bool(selected.peek().is_some())),
            ChildOutput::Text => selected
                .filter_map(|c| match c.item.data_str("note") {
                    Some(html) => Some(strip_markup(html)),
                    None => c.item.data_str("title").map(str::to_string),
                })
                .filter(|t| !t.is_empty())
                .map(Value::String)
                .collect(),
            ChildOutput::NoteHtml => selected
                .filter_map(|c| c.item.data_str("note"))
                .map(|n| Value::String(n.to_string()))
                .collect(),
            ChildOutput::Fulltext => selected
                .filter_map(|c| c.fulltext.as_deref())
                .filter(|t| !t.trim().is_empty())
                .map(|t| Value::String(t.to_string()))
                .collect(),
            ChildOutput::Raw => selected
                .filter_map(|c| c.item.data().cloned())
                .map(Value::Object)
                .collect(),
            ChildOutput::Attachments => selected.map(attachment_summary).collect(),
        };
        non_empty(Value::Array(values))
    }
}

fn attachment_summary(child: &CacheRecord) -> Value {
    let data = |k: &str| {
        child
            .item
            .data_str(k)
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null)
    };
    json!({
        "key": child.key,
        "title": data("title"),
        "filename": data("filename"),
        "content_type": data("contentType"),
        "md5": data("md5"),
        "link_mode": data("linkMode"),
        "url": data("url"),
    })
}

/// Drop markup tags, decode the common entities and collapse whitespace.
pub fn strip_markup(html: &str) -> String {
    let text = RE_TAG.replace_all(html, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    RE_SPACE.replace_all(text.trim(), " ").into_owned()
}

// -- Composites --

fn union_formats(extractors: &[BoxedExtractor]) -> Vec<Format> {
    let mut formats: Vec<Format> = Vec::new();
    for f in extractors.iter().flat_map(|e| e.formats()) {
        if !formats.contains(&f) {
            formats.push(f);
        }
    }
    formats
}

/// Concatenates the outputs of several extractors into one list, flattening
/// list outputs and dropping duplicates.
#[derive(Debug)]
pub struct Multi(pub Vec<BoxedExtractor>);

impl Extractor for Multi {
    fn formats(&self) -> Vec<Format> {
        union_formats(&self.0)
    }

    fn extract(&self, view: &ItemView<'_>, library: &LibraryContext) -> Option<Value> {
        let mut values: Vec<Value> = Vec::new();
        let mut push = |v: Value| {
            if !values.contains(&v) {
                values.push(v);
            }
        };
        for extractor in &self.0 {
            match extractor.extract(view, library) {
                Some(Value::Array(items)) => items.into_iter().for_each(&mut push),
                Some(v) => push(v),
                None => {}
            }
        }
        non_empty(Value::Array(values))
    }
}

/// The first non-null result of its extractors, in order.
#[derive(Debug)]
pub struct Chain(pub Vec<BoxedExtractor>);

impl Extractor for Chain {
    fn formats(&self) -> Vec<Format> {
        union_formats(&self.0)
    }

    fn extract(&self, view: &ItemView<'_>, library: &LibraryContext) -> Option<Value> {
        self.0.iter().find_map(|e| e.extract(view, library))
    }
}

/// A pure step applied to an extracted value. Both steps map over lists.
#[derive(Debug, Clone)]
pub enum Transform {
    /// Every match of the pattern; the first capture group when the pattern
    /// has one, else the whole match.
    Find(Regex),
    /// Split strings on a separator, trimming and dropping empty pieces.
    Split(String),
}

impl Transform {
    pub fn find(pattern: &str) -> Result<Self> {
        Ok(Self::Find(Regex::new(pattern)?))
    }

    pub fn split(separator: &str) -> Self {
        Self::Split(separator.to_string())
    }

    fn apply(&self, value: Value) -> Value {
        let strings: Vec<String> = match value {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Value::String(s) => vec![s],
            other => return other,
        };
        let out: Vec<Value> = match self {
            Self::Find(re) => strings
                .iter()
                .flat_map(|s| {
                    re.captures_iter(s)
                        .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
                        .map(|m| Value::String(m.as_str().to_string()))
                        .collect::<Vec<_>>()
                })
                .collect(),
            Self::Split(sep) => strings
                .iter()
                .flat_map(|s| s.split(sep.as_str()))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect(),
        };
        Value::Array(out)
    }
}

/// Pipes the result of an extractor through ordered transforms.
#[derive(Debug)]
pub struct Transformer {
    pub inner: BoxedExtractor,
    pub transforms: Vec<Transform>,
}

impl Extractor for Transformer {
    fn formats(&self) -> Vec<Format> {
        self.inner.formats()
    }

    fn extract(&self, view: &ItemView<'_>, library: &LibraryContext) -> Option<Value> {
        let value = self.inner.extract(view, library)?;
        let value = self
            .transforms
            .iter()
            .fold(value, |v, transform| transform.apply(v));
        non_empty(value)
    }
}
