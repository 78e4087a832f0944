//! Translation between extracted values and what the index stores.
//!
//! [`FieldCodec`] covers plain fields; [`FacetCodec`] covers facet terms,
//! which also carry a human label and know how a selected value becomes a
//! query term.

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator between the levels of a hierarchical facet value.
pub const PATH_SEPARATOR: char = '.';

/// One value as stored in an index field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stored {
    Bool(bool),
    U64(u64),
    Text(String),
}

impl Stored {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// A string form of any stored value, used for grouping and sorting.
    pub fn to_term(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::U64(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCodec {
    /// A single string; lists are joined with newlines.
    Text,
    /// Zero or more strings.
    List,
    /// Any JSON value, serialized into one string.
    Json,
    Bool,
    Integer,
}

impl FieldCodec {
    /// Encode an extracted value. `None` means nothing worth storing.
    pub fn encode(self, value: &Value) -> Option<Vec<Stored>> {
        let encoded = match self {
            Self::Text => {
                let text = match value {
                    Value::Array(values) => values
                        .iter()
                        .filter_map(scalar_string)
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                        .join("\n"),
                    other => scalar_string(other)?,
                };
                vec![Stored::Text(text)]
            }
            Self::List => match value {
                Value::Array(values) => values
                    .iter()
                    .filter_map(scalar_string)
                    .filter(|s| !s.is_empty())
                    .map(Stored::Text)
                    .collect(),
                other => vec![Stored::Text(scalar_string(other)?)],
            },
            Self::Json => match value {
                Value::Null => return None,
                other => vec![Stored::Text(other.to_string())],
            },
            Self::Bool => vec![Stored::Bool(truthy(value)?)],
            Self::Integer => {
                let n = match value {
                    Value::Number(n) => n.as_u64()?,
                    Value::String(s) => s.trim().parse().ok()?,
                    _ => return None,
                };
                vec![Stored::U64(n)]
            }
        };
        let empty = encoded.is_empty()
            || encoded
                .iter()
                .all(|s| matches!(s, Stored::Text(t) if t.is_empty()));
        (!empty).then_some(encoded)
    }

    pub fn decode(self, stored: &[Stored]) -> Value {
        match self {
            Self::Text => stored
                .first()
                .map(|s| Value::String(s.to_term()))
                .unwrap_or(Value::Null),
            Self::List => Value::Array(
                stored.iter().map(|s| Value::String(s.to_term())).collect(),
            ),
            Self::Json => match stored.first() {
                Some(Stored::Text(s)) => {
                    serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
                }
                Some(other) => Value::String(other.to_term()),
                None => Value::Null,
            },
            Self::Bool => match stored.first() {
                Some(Stored::Bool(b)) => Value::Bool(*b),
                Some(Stored::Text(s)) => parse_flag(s).map(Value::Bool).unwrap_or(Value::Null),
                Some(Stored::U64(n)) => Value::Bool(*n != 0),
                None => Value::Null,
            },
            Self::Integer => match stored.first() {
                Some(Stored::U64(n)) => Value::from(*n),
                Some(Stored::Text(s)) => s.parse::<u64>().map(Value::from).unwrap_or(Value::Null),
                _ => Value::Null,
            },
        }
    }
}

/// How a selected facet value is matched against the stored terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOperator {
    Equals,
    Prefix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacetCodec {
    Identity,
    Boolean {
        true_label: String,
        false_label: String,
    },
    /// `value<separator>label`.
    Labeled { separator: char },
    /// `key.key.key label`: a dotted ancestor path, a space, then a label.
    CollectionPath,
    /// `century.decade.year`, labelled as year ranges.
    YearTree,
}

impl FacetCodec {
    pub fn boolean() -> Self {
        Self::Boolean {
            true_label: "Yes".into(),
            false_label: "No".into(),
        }
    }

    pub fn labeled() -> Self {
        Self::Labeled { separator: ':' }
    }

    /// Encode an extracted value into zero or more stored terms.
    ///
    /// Labeled and collection codecs expect `{"value": .., "label": ..}`
    /// objects (or lists of them); collection objects name the value
    /// `path`. Plain strings pass through untouched.
    pub fn encode(&self, value: &Value) -> Vec<String> {
        if let Value::Array(values) = value {
            let mut terms: Vec<String> = Vec::new();
            for v in values {
                for term in self.encode(v) {
                    if !terms.contains(&term) {
                        terms.push(term);
                    }
                }
            }
            return terms;
        }
        match self {
            Self::Identity => scalar_string(value)
                .filter(|s| !s.is_empty())
                .into_iter()
                .collect(),
            Self::Boolean { .. } => truthy(value).map(|b| b.to_string()).into_iter().collect(),
            Self::Labeled { separator } => match value {
                Value::Object(o) => {
                    let Some(v) = o.get("value").and_then(Value::as_str) else {
                        return Vec::new();
                    };
                    let label = o.get("label").and_then(Value::as_str).unwrap_or(v);
                    vec![format!("{v}{separator}{label}")]
                }
                other => scalar_string(other).into_iter().collect(),
            },
            Self::CollectionPath => match value {
                Value::Object(o) => {
                    let Some(path) = o.get("path").and_then(Value::as_str) else {
                        return Vec::new();
                    };
                    let label = o.get("label").and_then(Value::as_str).unwrap_or(path);
                    vec![format!("{path} {label}")]
                }
                other => scalar_string(other).into_iter().collect(),
            },
            Self::YearTree => scalar_string(value)
                .and_then(|s| year_path(&s))
                .map(|path| expand_paths(&path, PATH_SEPARATOR))
                .unwrap_or_default(),
        }
    }

    /// Split a stored term into `(value, label)`. An empty term yields the
    /// defaults.
    pub fn decode(
        &self,
        stored: &str,
        default_value: &str,
        default_label: &str,
    ) -> (String, String) {
        if stored.is_empty() {
            return (default_value.to_string(), default_label.to_string());
        }
        match self {
            Self::Identity => (stored.to_string(), stored.to_string()),
            Self::Boolean {
                true_label,
                false_label,
            } => match parse_flag(stored) {
                Some(true) => ("true".into(), true_label.clone()),
                Some(false) => ("false".into(), false_label.clone()),
                None => (default_value.to_string(), default_label.to_string()),
            },
            Self::Labeled { separator } => match stored.split_once(*separator) {
                Some((v, l)) => (v.to_string(), l.to_string()),
                None => (stored.to_string(), stored.to_string()),
            },
            Self::CollectionPath => match stored.split_once(' ') {
                Some((path, label)) => (path.to_string(), label.to_string()),
                None => (stored.to_string(), stored.to_string()),
            },
            Self::YearTree => (
                stored.to_string(),
                year_label(stored, chrono::Local::now().year()),
            ),
        }
    }

    pub fn default_operator(&self) -> QueryOperator {
        match self {
            Self::Labeled { .. } | Self::CollectionPath => QueryOperator::Prefix,
            _ => QueryOperator::Equals,
        }
    }

    /// The term to look up for a selected filter value.
    pub fn query_term(&self, value: &str) -> String {
        match self {
            Self::Labeled { separator } => format!("{value}{separator}"),
            Self::CollectionPath => format!("{value} "),
            Self::Boolean { .. } => match parse_flag(value) {
                Some(b) => b.to_string(),
                None => value.to_string(),
            },
            _ => value.to_string(),
        }
    }
}

/// All ancestor paths of `path`, shortest first, ending with `path`.
///
/// `expand_paths("a.b.c", '.')` is `["a", "a.b", "a.b.c"]`.
pub fn expand_paths(path: &str, separator: char) -> Vec<String> {
    let mut expanded = Vec::new();
    for (i, c) in path.char_indices() {
        if c == separator && i > 0 {
            expanded.push(path[..i].to_string());
        }
    }
    if !path.is_empty() {
        expanded.push(path.to_string());
    }
    expanded
}

/// `"2024"` → `"2000.2020.2024"`. Anything that does not start with a year
/// yields `None`.
pub fn year_path(value: &str) -> Option<String> {
    let digits: String = value
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    if digits.is_empty() || digits.len() > 4 {
        return None;
    }
    let year: i32 = digits.parse().ok()?;
    let decade = year / 10 * 10;
    let century = year / 100 * 100;
    Some(format!("{century}.{decade}.{year}"))
}

/// Human label for a year-tree path, given the current year.
///
/// Century and decade nodes become ranges clamped to `current_year`; a
/// range that collapses to one year reads "In {year}".
pub fn year_label(path: &str, current_year: i32) -> String {
    let parts: Vec<&str> = path.split(PATH_SEPARATOR).collect();
    let Some(Ok(start)) = parts.last().map(|p| p.parse::<i32>()) else {
        return path.to_string();
    };
    let span = match parts.len() {
        1 => 99,
        2 => 9,
        _ => return start.to_string(),
    };
    let end = (start + span).min(current_year.max(start));
    if start == end {
        format!("In {start}")
    } else {
        format!("Between {start} and {end}")
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().unwrap_or(0.0) != 0.0),
        Value::String(s) => parse_flag(s),
        Value::Array(a) => Some(!a.is_empty()),
        _ => None,
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "y" | "yes" => Some(true),
        "false" | "f" | "0" | "n" | "no" => Some(false),
        _ => None,
    }
}
