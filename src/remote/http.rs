//! Zotero Web API v3 client over blocking HTTP.
//!
//! Uses `ureq` for synchronous requests. Connection failures and the
//! service's transient statuses map to retryable [`Error::Remote`] values;
//! the caller wraps each call in a [`crate::retry::RetryPolicy`].

use std::{collections::BTreeMap, io::Read, time::Duration};

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    config::ZoteroConfig,
    error::{Error, Result},
    library::{CreatorType, ItemField},
    record::{Format, RawRecord},
    remote::{CollectionInfo, ItemTypeInfo, Page, RemoteClient},
};

const API_VERSION: &str = "3";

/// Statuses the Zotero API uses for conditions that clear up on their own.
const TRANSIENT_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// Upper bound on a downloaded attachment (512 MB).
const MAX_FILE_SIZE: u64 = 512 * 1024 * 1024;

pub struct ZoteroClient {
    agent: ureq::Agent,
    base_url: String,
    library_id: String,
    library_type: String,
    api_key: String,
    locale: String,
}

/// A decoded JSON body with the paging headers that came with it.
struct JsonResponse {
    body: Value,
    total: Option<usize>,
    version: u64,
}

impl ZoteroClient {
    pub fn new(config: &ZoteroConfig) -> Result<Self> {
        if config.library_id.is_empty() {
            return Err(Error::Config("zotero.library_id is not set".into()));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build();
        Ok(Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            library_id: config.library_id.clone(),
            library_type: config.library_type.clone(),
            api_key: config.api_key.clone(),
            locale: config.locale.clone(),
        })
    }

    fn library_url(&self, path: &str) -> String {
        format!(
            "{}/{}s/{}/{}",
            self.base_url, self.library_type, self.library_id, path
        )
    }

    fn global_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn call(&self, url: &str, query: &[(&str, String)]) -> Result<ureq::Response> {
        let mut request = self.agent.get(url).set("Zotero-API-Version", API_VERSION);
        if !self.api_key.is_empty() {
            request = request.set("Zotero-API-Key", &self.api_key);
        }
        for (name, value) in query {
            request = request.query(name, value);
        }
        debug!(url, "GET");
        request.call().map_err(|e| classify(url, e))
    }

    /// Like [`Self::call`], with a 404 as `None`.
    fn call_optional(&self, url: &str, query: &[(&str, String)]) -> Result<Option<ureq::Response>> {
        match self.call(url, query) {
            Ok(response) => Ok(Some(response)),
            Err(Error::Remote { status: Some(404), .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn fetch_json(&self, url: &str, query: &[(&str, String)]) -> Result<JsonResponse> {
        read_json(url, self.call(url, query)?)
    }

    fn fetch_list(&self, url: &str, query: &[(&str, String)]) -> Result<(Vec<Value>, usize, u64)> {
        let response = self.fetch_json(url, query)?;
        let items = match response.body {
            Value::Array(items) => items,
            other => {
                return Err(Error::remote(
                    format!("expected a list from {url}, got {other}"),
                    false,
                ));
            }
        };
        let total = response.total.unwrap_or(items.len());
        Ok((items, total, response.version))
    }

    fn fetch_keys(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<String>> {
        let response = self.call(url, query)?;
        let body = response.into_string().map_err(|e| {
            Error::remote(format!("unreadable response from {url}: {e}"), true)
        })?;
        Ok(body
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl RemoteClient for ZoteroClient {
    fn library_id(&self) -> &str {
        &self.library_id
    }

    fn library_type(&self) -> &str {
        &self.library_type
    }

    fn list_items(
        &self,
        since: u64,
        start: usize,
        limit: usize,
        formats: &[Format],
    ) -> Result<Page<RawRecord>> {
        let mut include: Vec<&str> = formats
            .iter()
            .filter(|f| f.is_listed())
            .map(Format::name)
            .collect();
        if include.is_empty() {
            include.push(Format::Data.name());
        }
        let include = include.join(",");
        let (items, total, version) = self.fetch_list(
            &self.library_url("items"),
            &[
                ("since", since.to_string()),
                ("start", start.to_string()),
                ("limit", limit.to_string()),
                ("format", "json".into()),
                ("include", include),
                ("locale", self.locale.clone()),
            ],
        )?;
        Ok(Page {
            items: items.into_iter().filter_map(RawRecord::from_value).collect(),
            total,
            library_version: version,
        })
    }

    fn list_deleted(&self, since: u64) -> Result<Vec<String>> {
        let response =
            self.fetch_json(&self.library_url("deleted"), &[("since", since.to_string())])?;
        let mut keys: Vec<String> = response
            .body
            .get("items")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        keys.extend(self.fetch_keys(
            &self.library_url("items/trash"),
            &[("since", since.to_string()), ("format", "keys".into())],
        )?);
        Ok(keys)
    }

    fn list_changed_fulltext(&self, since: u64) -> Result<BTreeMap<String, u64>> {
        let response =
            self.fetch_json(&self.library_url("fulltext"), &[("since", since.to_string())])?;
        Ok(response
            .body
            .as_object()
            .map(|changes| {
                changes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_u64().unwrap_or(0)))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_fulltext(&self, key: &str) -> Result<Option<String>> {
        let url = self.library_url(&format!("items/{key}/fulltext"));
        let Some(response) = self.call_optional(&url, &[])? else {
            return Ok(None);
        };
        Ok(read_json(&url, response)?
            .body
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    fn get_file(&self, key: &str) -> Result<Vec<u8>> {
        let url = self.library_url(&format!("items/{key}/file"));
        let response = self.call(&url, &[])?;
        read_capped(key, response.into_reader(), MAX_FILE_SIZE)
    }

    fn list_collections(
        &self,
        top_level: bool,
        start: usize,
        limit: usize,
    ) -> Result<Page<CollectionInfo>> {
        let path = if top_level { "collections/top" } else { "collections" };
        let (items, total, version) = self.fetch_list(
            &self.library_url(path),
            &[("start", start.to_string()), ("limit", limit.to_string())],
        )?;
        Ok(Page {
            items: items.iter().filter_map(parse_collection).collect(),
            total,
            library_version: version,
        })
    }

    fn item_types(&self) -> Result<Vec<ItemTypeInfo>> {
        let (items, _, _) = self.fetch_list(
            &self.global_url("itemTypes"),
            &[("locale", self.locale.clone())],
        )?;
        Ok(items
            .iter()
            .filter_map(|t| {
                Some(ItemTypeInfo {
                    item_type: t.get("itemType")?.as_str()?.to_string(),
                    localized: t.get("localized")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    fn item_type_fields(&self, item_type: &str) -> Result<Vec<ItemField>> {
        let (items, _, _) = self.fetch_list(
            &self.global_url("itemTypeFields"),
            &[
                ("itemType", item_type.to_string()),
                ("locale", self.locale.clone()),
            ],
        )?;
        Ok(items
            .iter()
            .filter_map(|f| {
                Some(ItemField {
                    field: f.get("field")?.as_str()?.to_string(),
                    localized: f.get("localized")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    fn item_type_creator_types(&self, item_type: &str) -> Result<Vec<CreatorType>> {
        let (items, _, _) = self.fetch_list(
            &self.global_url("itemTypeCreatorTypes"),
            &[
                ("itemType", item_type.to_string()),
                ("locale", self.locale.clone()),
            ],
        )?;
        Ok(items
            .iter()
            .filter_map(|c| {
                Some(CreatorType {
                    creator_type: c.get("creatorType")?.as_str()?.to_string(),
                    localized: c.get("localized")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    fn last_modified_version(&self) -> Result<u64> {
        let response = self.call(
            &self.library_url("items"),
            &[("limit", "1".into()), ("format", "keys".into())],
        )?;
        header_u64(&response, "Last-Modified-Version").ok_or_else(|| {
            Error::remote("response lacks a Last-Modified-Version header", false)
        })
    }
}

fn header_u64(response: &ureq::Response, name: &str) -> Option<u64> {
    response.header(name).and_then(|v| v.trim().parse().ok())
}

fn parse_collection(value: &Value) -> Option<CollectionInfo> {
    let data = value.get("data")?;
    Some(CollectionInfo {
        key: data.get("key")?.as_str()?.to_string(),
        version: value.get("version").and_then(Value::as_u64).unwrap_or(0),
        // `parentCollection` is `false` for top-level collections.
        parent: data
            .get("parentCollection")
            .and_then(Value::as_str)
            .map(str::to_string),
        name: data
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn read_json(url: &str, response: ureq::Response) -> Result<JsonResponse> {
    let version = header_u64(&response, "Last-Modified-Version").unwrap_or(0);
    let total = header_u64(&response, "Total-Results").map(|t| t as usize);
    let body: Value = response
        .into_json()
        .map_err(|e| Error::remote(format!("unreadable response from {url}: {e}"), true))?;
    Ok(JsonResponse {
        body,
        total,
        version,
    })
}

/// Read at most `cap` bytes of a download. A longer body is refused
/// rather than truncated.
fn read_capped(key: &str, reader: impl Read, cap: u64) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader
        .take(cap.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|e| Error::remote(format!("download of {key} interrupted: {e}"), true))?;
    if bytes.len() as u64 > cap {
        warn!(key, cap, "attachment exceeds the download size limit");
        return Err(Error::remote(
            format!("download of {key} exceeds {cap} bytes"),
            false,
        ));
    }
    Ok(bytes)
}

fn classify(url: &str, error: ureq::Error) -> Error {
    match error {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let preview: String = body.chars().take(200).collect();
            Error::Remote {
                message: format!("GET {url} failed with status {code}: {preview}"),
                transient: TRANSIENT_STATUSES.contains(&code),
                status: Some(code),
            }
        }
        ureq::Error::Transport(transport) => {
            Error::remote(format!("transport error on GET {url}: {transport}"), true)
        }
    }
}
