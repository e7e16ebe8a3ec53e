//! Upstream page contract + Find a Tender and fixture-backed page sources.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use ftclone_core::CloneFilters;
use ftclone_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "ftclone-adapters";

pub const DEFAULT_PAGE_LIMIT: u32 = 100;
pub const FIND_TENDER_SOURCE: &str = "find-tender-api";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed upstream page: {0}")]
    MalformedPage(String),
    #[error("fixture source: {0}")]
    Fixture(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One listing request. Absent values are omitted from the query string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: u32,
    pub cursor: Option<String>,
    pub filters: CloneFilters,
}

impl PageRequest {
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("limit".to_string(), self.limit.to_string())];
        if let Some(cursor) = self.cursor.as_deref().filter(|c| !c.is_empty()) {
            pairs.push(("cursor".into(), cursor.to_string()));
        }
        if let Some(stage) = self.filters.stages {
            pairs.push(("stages".into(), stage.as_str().to_string()));
        }
        if let Some(from) = &self.filters.updated_from {
            pairs.push(("updatedFrom".into(), from.clone()));
        }
        if let Some(to) = &self.filters.updated_to {
            pairs.push(("updatedTo".into(), to.clone()));
        }
        pairs
    }
}

/// A parsed release-package page. Records stay opaque JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamPage {
    pub records: Vec<JsonValue>,
    pub next_cursor: Option<String>,
    pub uri: Option<String>,
    pub next_link: Option<String>,
    pub published_date: Option<JsonValue>,
    pub date: Option<JsonValue>,
}

impl UpstreamPage {
    pub fn from_json(body: JsonValue) -> Result<Self, AdapterError> {
        let JsonValue::Object(mut map) = body else {
            return Err(AdapterError::MalformedPage(
                "expected a JSON object at the top level".into(),
            ));
        };

        let records = match map.remove("releases") {
            None | Some(JsonValue::Null) => Vec::new(),
            Some(JsonValue::Array(items)) => items,
            Some(other) => {
                return Err(AdapterError::MalformedPage(format!(
                    "`releases` must be an array, got {}",
                    json_kind(&other)
                )))
            }
        };

        let next_link = map
            .get("links")
            .and_then(|links| links.get("next"))
            .and_then(JsonValue::as_str)
            .map(str::to_owned);

        Ok(Self {
            records,
            next_cursor: non_empty_str(map.get("nextCursor")),
            uri: non_empty_str(map.get("uri")),
            next_link,
            published_date: map.remove("publishedDate").filter(|v| !v.is_null()),
            date: map.remove("date").filter(|v| !v.is_null()),
        })
    }

    /// `nextCursor`, falling back to the `cursor` parameter of the `links.next` URL.
    pub fn following_cursor(&self) -> Option<String> {
        self.next_cursor
            .clone()
            .or_else(|| extract_cursor(self.next_link.as_deref()))
    }

    /// The upper time bound the upstream applied implicitly, read from the echoed request
    /// URI and then from the `links.next` URL.
    pub fn implied_updated_to(&self) -> Option<String> {
        extract_query_param(self.uri.as_deref(), "updatedTo")
            .or_else(|| extract_query_param(self.next_link.as_deref(), "updatedTo"))
    }

    /// Declared upstream version fields of `record` within this page.
    pub fn provenance(&self, record: &JsonValue) -> BTreeMap<String, JsonValue> {
        let mut upstream = BTreeMap::new();
        let candidates = [
            ("release_id", record.get("id")),
            ("release_date", record.get("date")),
            ("page_publishedDate", self.published_date.as_ref()),
            ("page_date", self.date.as_ref()),
        ];
        for (key, value) in candidates {
            if let Some(value) = value.filter(|v| !v.is_null()) {
                upstream.insert(key.to_string(), value.clone());
            }
        }
        upstream
    }
}

pub fn record_ocid(record: &JsonValue) -> Option<String> {
    record.get("ocid").and_then(JsonValue::as_str).map(str::to_owned)
}

fn non_empty_str(value: Option<&JsonValue>) -> Option<String> {
    value
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// First non-empty value of query parameter `name`. Relative and malformed URLs are tolerated.
pub fn extract_query_param(url: Option<&str>, name: &str) -> Option<String> {
    let raw = url?.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = Url::parse(raw)
        .or_else(|_| Url::parse("http://upstream.invalid/").and_then(|base| base.join(raw)))
        .ok()?;
    parsed
        .query_pairs()
        .find(|(key, value)| key == name && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

pub fn extract_cursor(next_link: Option<&str>) -> Option<String> {
    extract_query_param(next_link, "cursor")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub source: String,
    pub base_url: String,
    pub version: String,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    fn info(&self) -> SourceInfo;

    async fn fetch_page(&self, request: &PageRequest) -> Result<UpstreamPage, AdapterError>;
}

/// Live source: `{base_url}/api/{version}/ocdsReleasePackages`.
#[derive(Debug)]
pub struct FindTenderSource {
    http: HttpFetcher,
    base_url: String,
    version: String,
    endpoint: String,
}

impl FindTenderSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, version: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let version = version.into();
        let endpoint = format!("{base_url}/api/{version}/ocdsReleasePackages");
        Self {
            http,
            base_url,
            version,
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PageSource for FindTenderSource {
    fn info(&self) -> SourceInfo {
        SourceInfo {
            source: FIND_TENDER_SOURCE.to_string(),
            base_url: self.base_url.clone(),
            version: self.version.clone(),
        }
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<UpstreamPage, AdapterError> {
        let fetched = self
            .http
            .get_json(&self.endpoint, &request.query_pairs())
            .await?;
        debug!(url = %fetched.final_url, "fetched release package page");
        UpstreamPage::from_json(fetched.body)
    }
}

/// Serves recorded pages by following their cursor chain; every request is kept for
/// inspection. The page after the last recorded one is an empty page.
#[derive(Debug)]
pub struct FixturePageSource {
    origin: String,
    pages: Vec<JsonValue>,
    index_by_cursor: HashMap<String, usize>,
    requests: Mutex<Vec<PageRequest>>,
    fail_at_call: Mutex<Option<usize>>,
}

impl FixturePageSource {
    pub fn from_pages(pages: Vec<JsonValue>) -> Result<Self, AdapterError> {
        Self::build("memory".into(), pages)
    }

    /// Load `page-*.json` files from `dir`, in file-name order.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let dir = dir.as_ref();
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("reading fixture directory {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|n| n.starts_with("page-") && n.ends_with(".json"))
            })
            .collect::<Vec<PathBuf>>();
        paths.sort();
        if paths.is_empty() {
            return Err(AdapterError::Fixture(format!(
                "no page-*.json files in {}",
                dir.display()
            )));
        }

        let mut pages = Vec::with_capacity(paths.len());
        for path in &paths {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading fixture page {}", path.display()))?;
            let page: JsonValue = serde_json::from_str(&text)
                .with_context(|| format!("parsing fixture page {}", path.display()))?;
            pages.push(page);
        }
        Self::build(dir.display().to_string(), pages)
    }

    fn build(origin: String, pages: Vec<JsonValue>) -> Result<Self, AdapterError> {
        let mut index_by_cursor = HashMap::new();
        for (i, page) in pages.iter().enumerate() {
            let parsed = UpstreamPage::from_json(page.clone())?;
            if let Some(cursor) = parsed.following_cursor() {
                index_by_cursor.insert(cursor, i + 1);
            }
        }
        Ok(Self {
            origin,
            pages,
            index_by_cursor,
            requests: Mutex::new(Vec::new()),
            fail_at_call: Mutex::new(None),
        })
    }

    /// Make the request with zero-based index `call` fail once as "upstream unavailable".
    pub fn fail_once_at_call(&self, call: usize) {
        *self
            .fail_at_call
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(call);
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    fn info(&self) -> SourceInfo {
        SourceInfo {
            source: "fixtures".to_string(),
            base_url: self.origin.clone(),
            version: "fixture".to_string(),
        }
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<UpstreamPage, AdapterError> {
        let call = {
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            requests.push(request.clone());
            requests.len() - 1
        };

        {
            let mut fail_at = self
                .fail_at_call
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *fail_at == Some(call) {
                *fail_at = None;
                return Err(AdapterError::Fetch(FetchError::RetriesExhausted {
                    attempts: 1,
                    last_error: "injected fixture failure".into(),
                }));
            }
        }

        let index = match request.cursor.as_deref() {
            None => 0,
            Some(cursor) => *self.index_by_cursor.get(cursor).ok_or_else(|| {
                AdapterError::Fixture(format!("no recorded page for cursor `{cursor}`"))
            })?,
        };

        match self.pages.get(index) {
            Some(page) => UpstreamPage::from_json(page.clone()),
            None => Ok(UpstreamPage {
                records: Vec::new(),
                next_cursor: None,
                uri: None,
                next_link: None,
                published_date: None,
                date: None,
            }),
        }
    }
}
