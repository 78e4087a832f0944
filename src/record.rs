//! Raw records as returned by the remote library, and their cached form.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Item type of child notes.
pub const NOTE: &str = "note";
/// Item type of child attachments (files and links).
pub const ATTACHMENT: &str = "attachment";
/// Item type of PDF annotations.
pub const ANNOTATION: &str = "annotation";

/// Item types that never become documents of their own.
pub const CHILD_TYPES: &[&str] = &[NOTE, ATTACHMENT, ANNOTATION];

pub fn is_child_type(item_type: &str) -> bool {
    CHILD_TYPES.contains(&item_type)
}

/// A representation of an item the remote service can render.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Format {
    /// The structured `data` object.
    Data,
    /// Formatted bibliography entry (HTML).
    Bib,
    /// In-text citation (HTML).
    Citation,
    /// COinS span for reference managers.
    Coins,
    /// Text extracted from attachment files, fetched separately from the
    /// item listing.
    Fulltext,
    /// Any export format the remote supports, such as `ris` or `bibtex`.
    Export(String),
}

impl Format {
    pub fn name(&self) -> &str {
        match self {
            Self::Data => "data",
            Self::Bib => "bib",
            Self::Citation => "citation",
            Self::Coins => "coins",
            Self::Fulltext => "fulltext",
            Self::Export(name) => name,
        }
    }

    /// Whether the format is requested through the item listing itself.
    pub fn is_listed(&self) -> bool {
        !matches!(self, Self::Fulltext)
    }
}

impl From<String> for Format {
    fn from(value: String) -> Self {
        match value.as_str() {
            "data" => Self::Data,
            "bib" => Self::Bib,
            "citation" => Self::Citation,
            "coins" => Self::Coins,
            "fulltext" => Self::Fulltext,
            _ => Self::Export(value),
        }
    }
}

impl From<Format> for String {
    fn from(value: Format) -> Self {
        value.name().to_string()
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A loosely typed item object, kept exactly as the remote sent it.
///
/// The structured fields live under `data`, server-computed values under
/// `meta`, and each requested format under its own name (`bib`, `ris`...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Map<String, Value>);

impl RawRecord {
    pub fn new(object: Map<String, Value>) -> Self {
        Self(object)
    }

    /// Build a record from a JSON value; anything but an object is rejected.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn data(&self) -> Option<&Map<String, Value>> {
        self.0.get("data").and_then(Value::as_object)
    }

    pub fn meta(&self) -> Option<&Map<String, Value>> {
        self.0.get("meta").and_then(Value::as_object)
    }

    pub fn data_value(&self, field: &str) -> Option<&Value> {
        self.data().and_then(|d| d.get(field))
    }

    /// A non-empty string from the `data` object.
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data_value(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn meta_str(&self, field: &str) -> Option<&str> {
        self.meta()
            .and_then(|m| m.get(field))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn key(&self) -> Option<&str> {
        self.0
            .get("key")
            .and_then(Value::as_str)
            .or_else(|| self.data_str("key"))
            .filter(|s| !s.is_empty())
    }

    pub fn version(&self) -> u64 {
        self.0
            .get("version")
            .and_then(Value::as_u64)
            .or_else(|| self.data_value("version").and_then(Value::as_u64))
            .unwrap_or(0)
    }

    pub fn item_type(&self) -> Option<&str> {
        self.data_str("itemType")
    }

    pub fn parent_item(&self) -> Option<&str> {
        self.data_str("parentItem")
    }

    pub fn tags(&self) -> Vec<&str> {
        self.data_value("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.get("tag").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn collections(&self) -> Vec<&str> {
        self.data_value("collections")
            .and_then(Value::as_array)
            .map(|keys| keys.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Whether the item sits in the remote trash.
    pub fn is_trashed(&self) -> bool {
        match self.data_value("deleted") {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0) != 0,
            _ => false,
        }
    }

    /// The payload of a rendered format, if it was requested and returned.
    pub fn format(&self, format: &Format) -> Option<&Value> {
        match format {
            Format::Data => self.0.get("data"),
            Format::Fulltext => None,
            other => self.0.get(other.name()),
        }
    }
}

/// A raw record as persisted in the cache, with its denormalized lookup
/// keys and the full text extracted from it, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: String,
    pub version: u64,
    pub item_type: String,
    pub parent_item: Option<String>,
    pub item: RawRecord,
    #[serde(default)]
    pub fulltext: Option<String>,
}

impl CacheRecord {
    /// Returns `None` when the record lacks a key.
    pub fn from_raw(item: RawRecord) -> Option<Self> {
        let key = item.key()?.to_string();
        Some(Self {
            version: item.version(),
            item_type: item.item_type().unwrap_or_default().to_string(),
            parent_item: item.parent_item().map(str::to_string),
            key,
            item,
            fulltext: None,
        })
    }

    pub fn tags(&self) -> Vec<&str> {
        self.item.tags()
    }

    pub fn is_child(&self) -> bool {
        self.parent_item.is_some()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> RawRecord {
        RawRecord::from_value(value).unwrap()
    }

    #[test]
    fn accessors_read_data_object() {
        let r = record(json!({
            "key": "ABCD1234",
            "version": 17,
            "data": {
                "itemType": "book",
                "title": "Rust",
                "tags": [{"tag": "lang"}, {"tag": "systems", "type": 1}],
                "collections": ["C1", "C2"],
            },
            "meta": {"parsedDate": "2021-03-04"},
            "bib": "<div>Rust</div>",
        }));
        assert_eq!(r.key(), Some("ABCD1234"));
        assert_eq!(r.version(), 17);
        assert_eq!(r.item_type(), Some("book"));
        assert_eq!(r.parent_item(), None);
        assert_eq!(r.tags(), vec!["lang", "systems"]);
        assert_eq!(r.collections(), vec!["C1", "C2"]);
        assert_eq!(r.meta_str("parsedDate"), Some("2021-03-04"));
        assert_eq!(r.format(&Format::Bib), Some(&json!("<div>Rust</div>")));
        assert!(r.format(&Format::Export("ris".into())).is_none());
    }

    #[test]
    fn empty_strings_read_as_missing() {
        let r = record(json!({"key": "K", "data": {"title": ""}}));
        assert_eq!(r.data_str("title"), None);
    }

    #[test]
    fn trashed_flag_accepts_number_or_bool() {
        assert!(record(json!({"data": {"deleted": 1}})).is_trashed());
        assert!(record(json!({"data": {"deleted": true}})).is_trashed());
        assert!(!record(json!({"data": {}})).is_trashed());
    }

    #[test]
    fn cache_record_requires_key() {
        assert!(CacheRecord::from_raw(record(json!({"data": {}}))).is_none());
        let child = CacheRecord::from_raw(record(json!({
            "key": "N1",
            "version": 3,
            "data": {"itemType": "note", "parentItem": "P1"},
        })))
        .unwrap();
        assert_eq!(child.parent_item.as_deref(), Some("P1"));
        assert_eq!(child.item_type, "note");
        assert!(child.is_child());
    }

    #[test]
    fn format_names_round_trip_through_strings() {
        for f in [
            Format::Data,
            Format::Bib,
            Format::Citation,
            Format::Coins,
            Format::Fulltext,
            Format::Export("ris".into()),
        ] {
            assert_eq!(Format::from(String::from(f.clone())), f);
        }
    }
}
