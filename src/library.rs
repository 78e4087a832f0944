//! Snapshot of library-wide metadata taken once per sync.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::Result,
    remote::{Pager, RemoteClient},
    retry::RetryPolicy,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub parent: Option<String>,
    pub name: String,
}

/// The collection tree of the library, keyed by collection key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collections {
    entries: BTreeMap<String, Collection>,
}

impl Collections {
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        parent: Option<String>,
        name: impl Into<String>,
    ) {
        self.entries.insert(
            key.into(),
            Collection {
                parent,
                name: name.into(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<&Collection> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Collection)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys of the direct children of `parent` (top-level ones for `None`).
    pub fn children(&self, parent: Option<&str>) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, c)| c.parent.as_deref() == parent)
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Keys from the top-level ancestor down to `key` itself.
    ///
    /// Returns an empty path for an unknown key. A cycle in the parent
    /// links stops the walk rather than looping.
    pub fn ancestors(&self, key: &str) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = Some(key.to_string());
        while let Some(k) = current {
            if path.contains(&k) {
                warn!(collection = %k, "cycle in collection tree");
                break;
            }
            let Some(collection) = self.entries.get(&k) else {
                break;
            };
            current = collection.parent.clone();
            path.push(k);
        }
        path.reverse();
        path
    }
}

/// Localized metadata for one field of an item type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemField {
    pub field: String,
    pub localized: String,
}

/// Localized metadata for one creator role of an item type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatorType {
    pub creator_type: String,
    pub localized: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryContext {
    pub library_id: String,
    pub library_type: String,
    pub collections: Collections,
    /// Item type code to localized label.
    pub item_types: BTreeMap<String, String>,
    pub item_fields: BTreeMap<String, Vec<ItemField>>,
    pub creator_types: BTreeMap<String, Vec<CreatorType>>,
}

impl LibraryContext {
    /// Read the collection tree and the item-type taxonomy from the remote.
    pub fn fetch(
        remote: &dyn RemoteClient,
        retry: &RetryPolicy,
        batch_size: usize,
    ) -> Result<Self> {
        let mut collections = Collections::default();
        let mut pager = Pager::new(batch_size, |start, limit| {
            retry.run("list_collections", || remote.list_collections(false, start, limit))
        });
        while let Some(page) = pager.next_page()? {
            for c in page.items {
                collections.insert(c.key, c.parent, c.name);
            }
        }

        let mut context = Self {
            library_id: remote.library_id().to_string(),
            library_type: remote.library_type().to_string(),
            collections,
            ..Self::default()
        };

        for item_type in retry.run("item_types", || remote.item_types())? {
            let fields = retry.run("item_type_fields", || {
                remote.item_type_fields(&item_type.item_type)
            })?;
            let creators = retry.run("item_type_creator_types", || {
                remote.item_type_creator_types(&item_type.item_type)
            })?;
            context
                .item_fields
                .insert(item_type.item_type.clone(), fields);
            context
                .creator_types
                .insert(item_type.item_type.clone(), creators);
            context
                .item_types
                .insert(item_type.item_type, item_type.localized);
        }

        debug!(
            collections = context.collections.len(),
            item_types = context.item_types.len(),
            "library context loaded"
        );
        Ok(context)
    }

    pub fn item_type_label<'a>(&'a self, item_type: &'a str) -> &'a str {
        self.item_types
            .get(item_type)
            .map(String::as_str)
            .unwrap_or(item_type)
    }

    pub fn field_label(&self, item_type: &str, field: &str) -> Option<&str> {
        self.item_fields
            .get(item_type)?
            .iter()
            .find(|f| f.field == field)
            .map(|f| f.localized.as_str())
    }

    pub fn creator_type_label(
        &self,
        item_type: &str,
        creator_type: &str,
    ) -> Option<&str> {
        self.creator_types
            .get(item_type)?
            .iter()
            .find(|c| c.creator_type == creator_type)
            .map(|c| c.localized.as_str())
    }
}
