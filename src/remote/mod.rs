//! The remote library service, seen from the sync layer.
//!
//! [`RemoteClient`] is the boundary: [`http::ZoteroClient`] talks to the
//! Zotero Web API, [`fixture::FixtureRemote`] serves a library held in
//! memory. Paged listings go through [`Pager`].

pub mod fixture;
pub mod http;

use std::{collections::BTreeMap, marker::PhantomData};

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    library::{CreatorType, ItemField},
    record::{Format, RawRecord},
};

/// One page of a listing, plus the totals the remote reported with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total number of results across all pages.
    pub total: usize,
    /// Library version at the time the page was served.
    pub library_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub key: String,
    pub version: u64,
    pub parent: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemTypeInfo {
    pub item_type: String,
    pub localized: String,
}

pub trait RemoteClient {
    fn library_id(&self) -> &str;

    fn library_type(&self) -> &str;

    /// Items (top-level and children) modified after version `since`.
    fn list_items(
        &self,
        since: u64,
        start: usize,
        limit: usize,
        formats: &[Format],
    ) -> Result<Page<RawRecord>>;

    /// Keys of items deleted or moved to the trash after version `since`.
    fn list_deleted(&self, since: u64) -> Result<Vec<String>>;

    /// Keys of items whose full text changed after `since`, with the
    /// version of the change.
    fn list_changed_fulltext(&self, since: u64) -> Result<BTreeMap<String, u64>>;

    fn get_fulltext(&self, key: &str) -> Result<Option<String>>;

    fn get_file(&self, key: &str) -> Result<Vec<u8>>;

    fn list_collections(
        &self,
        top_level: bool,
        start: usize,
        limit: usize,
    ) -> Result<Page<CollectionInfo>>;

    fn item_types(&self) -> Result<Vec<ItemTypeInfo>>;

    fn item_type_fields(&self, item_type: &str) -> Result<Vec<ItemField>>;

    fn item_type_creator_types(&self, item_type: &str) -> Result<Vec<CreatorType>>;

    /// Current version of the whole library.
    fn last_modified_version(&self) -> Result<u64>;
}

/// Explicit paging over a remote listing.
///
/// Each call to [`Pager::next_page`] fetches one fully materialized page.
/// The first page is always fetched, even when the listing is empty, so
/// that its library version is observed.
pub struct Pager<T, F> {
    fetch: F,
    start: usize,
    limit: usize,
    total: Option<usize>,
    library_version: u64,
    _item: PhantomData<T>,
}

impl<T, F> Pager<T, F>
where
    F: FnMut(usize, usize) -> Result<Page<T>>,
{
    pub fn new(limit: usize, fetch: F) -> Self {
        Self {
            fetch,
            start: 0,
            limit: limit.max(1),
            total: None,
            library_version: 0,
            _item: PhantomData,
        }
    }

    pub fn has_more(&self) -> bool {
        self.total.is_none_or(|total| self.start < total)
    }

    pub fn next_page(&mut self) -> Result<Option<Page<T>>> {
        if !self.has_more() {
            return Ok(None);
        }
        let page = (self.fetch)(self.start, self.limit)?;
        self.start += page.items.len();
        // An empty page ends the listing even if the reported total
        // disagrees; this keeps a misbehaving remote from looping us.
        self.total = Some(if page.items.is_empty() {
            self.start
        } else {
            page.total
        });
        self.library_version = self.library_version.max(page.library_version);
        Ok(Some(page))
    }

    /// Highest library version seen on any page so far.
    pub fn library_version(&self) -> u64 {
        self.library_version
    }

    /// Number of entries fetched so far.
    pub fn fetched(&self) -> usize {
        self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(len: usize, version: u64) -> impl FnMut(usize, usize) -> Result<Page<usize>> {
        move |start, limit| {
            Ok(Page {
                items: (start..(start + limit).min(len)).collect(),
                total: len,
                library_version: version,
            })
        }
    }

    #[test]
    fn pages_until_total() {
        let mut pager = Pager::new(2, listing(5, 9));
        let mut seen = Vec::new();
        assert!(pager.has_more());
        while let Some(page) = pager.next_page().unwrap() {
            seen.extend(page.items);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(!pager.has_more());
        assert_eq!(pager.fetched(), 5);
        assert_eq!(pager.library_version(), 9);
    }

    #[test]
    fn empty_listing_still_reports_version() {
        let mut pager = Pager::new(10, listing(0, 4));
        let page = pager.next_page().unwrap().unwrap();
        assert!(page.items.is_empty());
        assert_eq!(pager.library_version(), 4);
        assert!(pager.next_page().unwrap().is_none());
    }

    #[test]
    fn empty_page_stops_inconsistent_listing() {
        let mut pager = Pager::new(10, |_, _| {
            Ok(Page::<u8> {
                items: vec![],
                total: 100,
                library_version: 1,
            })
        });
        assert!(pager.next_page().unwrap().is_some());
        assert!(!pager.has_more());
    }
}
