//! Mock server state management.
//!
//! Provides the in-memory data store for the mock GData server.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::models::{rel, Entry, Link};

const ENTRY_ID_PREFIX: &str = "urn:gdata-mock:entries:";

/// Default size of the streamed blob at `/blobs/large` (100 MiB).
pub const DEFAULT_BLOB_SIZE: u64 = 100 * 1024 * 1024;

/// Default page size of the JSON task collection.
pub const DEFAULT_TASK_PAGE_SIZE: usize = 100;

/// OAuth 2.0 credentials the token endpoint accepts.
#[derive(Debug, Clone)]
pub struct OAuthPolicy {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// The only bearer token protected routes accept.
    pub access_token: Option<String>,
    /// Tokens issued so far, used to name the next one.
    pub issued: u32,
}

/// A resumable upload in progress.
#[derive(Debug, Clone, Default)]
pub struct UploadSession {
    pub metadata: Option<Entry>,
    pub slug: Option<String>,
    pub content_type: String,
    pub total_length: Option<u64>,
    pub received: Vec<u8>,
    /// Set once the upload has produced an entry.
    pub finished: Option<Entry>,
}

/// Shared state for the mock server.
///
/// This struct holds all the mock data that the server will serve.
/// It's wrapped in `Arc<RwLock<_>>` for concurrent access.
#[derive(Debug)]
pub struct MockState {
    /// Base URL of the running server, used for links.
    pub base_url: String,

    /// Atom collection at `/feeds/entries`, in insertion order.
    pub entries: Vec<Entry>,

    /// JSON collection at `/tasks`, in insertion order.
    pub tasks: Vec<Map<String, Value>>,

    /// Page size of `/tasks` when the request has no `max-results`.
    pub task_page_size: usize,

    /// Uploaded media by entry key.
    pub media: HashMap<String, (String, Bytes)>,

    /// Resumable upload sessions by id.
    pub uploads: HashMap<String, UploadSession>,

    /// Global data-chunk numbers (1-based) whose response is withheld
    /// after the chunk has been stored.
    pub dropped_chunks: Vec<u32>,

    /// Data-carrying chunk PUTs received so far.
    pub chunk_count: u32,

    /// Size of the blob streamed at `/blobs/large`.
    pub blob_size: u64,

    /// Blob response bodies currently alive.
    pub open_streams: Arc<AtomicUsize>,

    /// If set, protected routes require the policy's bearer token.
    pub oauth: Option<OAuthPolicy>,

    /// Token endpoint calls.
    pub token_requests: u32,

    /// `Authorization` header of every request to a protected route.
    pub seen_authorization: Vec<Option<String>>,

    next_id: u64,
    next_etag: u64,
    feed_version: u64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            entries: Vec::new(),
            tasks: Vec::new(),
            task_page_size: DEFAULT_TASK_PAGE_SIZE,
            media: HashMap::new(),
            uploads: HashMap::new(),
            dropped_chunks: Vec::new(),
            chunk_count: 0,
            blob_size: DEFAULT_BLOB_SIZE,
            open_streams: Arc::new(AtomicUsize::new(0)),
            oauth: None,
            token_requests: 0,
            seen_authorization: Vec::new(),
            next_id: 1,
            next_etag: 1,
            feed_version: 1,
        }
    }
}

impl MockState {
    /// Create a new empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create state wrapped in Arc<RwLock> for sharing.
    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }

    /// Add an entry to the Atom collection.
    pub fn with_entry(mut self, entry: Entry) -> Self {
        self.insert_entry(entry);
        self
    }

    /// Add a task object to the JSON collection.
    pub fn with_task(mut self, task: Map<String, Value>) -> Self {
        self.insert_task(task);
        self
    }

    /// Require OAuth 2.0 bearer tokens on protected routes.
    pub fn with_oauth(mut self, client_id: &str, client_secret: &str, refresh_token: &str) -> Self {
        self.oauth = Some(OAuthPolicy {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            refresh_token: refresh_token.to_string(),
            access_token: None,
            issued: 0,
        });
        self
    }

    /// Set the bearer token currently accepted.
    pub fn with_access_token(mut self, token: &str) -> Self {
        if let Some(policy) = &mut self.oauth {
            policy.access_token = Some(token.to_string());
        }
        self
    }

    /// Withhold the response to the given data chunk (1-based).
    pub fn with_dropped_chunk(mut self, chunk: u32) -> Self {
        self.dropped_chunks.push(chunk);
        self
    }

    pub fn with_blob_size(mut self, size: u64) -> Self {
        self.blob_size = size;
        self
    }

    pub fn with_task_page_size(mut self, size: usize) -> Self {
        self.task_page_size = size;
        self
    }

    /// Invalidate the current bearer token; the next request gets 401.
    pub fn expire_access_token(&mut self) {
        if let Some(policy) = &mut self.oauth {
            policy.access_token = None;
        }
    }

    /// ETag of the Atom collection; changes whenever an entry changes.
    pub fn entries_etag(&self) -> String {
        format!("W/\"entries-{}\"", self.feed_version)
    }

    /// ETag of the JSON collection.
    pub fn tasks_etag(&self) -> String {
        format!("\"tasks-{}\"", self.feed_version)
    }

    fn fresh_etag(&mut self) -> String {
        let etag = format!("\"e{}\"", self.next_etag);
        self.next_etag += 1;
        self.feed_version += 1;
        etag
    }

    /// Store a new entry, assigning its id, ETag and timestamps.
    pub fn insert_entry(&mut self, mut entry: Entry) -> Entry {
        let key = self.next_id.to_string();
        self.next_id += 1;
        entry.id = Some(format!("{ENTRY_ID_PREFIX}{key}"));
        entry.etag = Some(self.fresh_etag());
        entry.links.clear();
        let now = Utc::now();
        entry.published = Some(now);
        entry.updated = Some(now);
        self.entries.push(entry.clone());
        entry
    }

    /// Key used in `/feeds/entries/{key}` for an entry id.
    pub fn entry_key(id: &str) -> Option<&str> {
        id.strip_prefix(ENTRY_ID_PREFIX)
    }

    pub fn get_entry(&self, key: &str) -> Option<&Entry> {
        let id = format!("{ENTRY_ID_PREFIX}{key}");
        self.entries.iter().find(|e| e.id.as_deref() == Some(id.as_str()))
    }

    /// Replace the mutable parts of an entry, returning the stored result.
    pub fn update_entry(&mut self, key: &str, changes: Entry) -> Option<Entry> {
        let etag = self.fresh_etag();
        let id = format!("{ENTRY_ID_PREFIX}{key}");
        let stored = self
            .entries
            .iter_mut()
            .find(|e| e.id.as_deref() == Some(id.as_str()))?;
        stored.title = changes.title;
        stored.summary = changes.summary;
        stored.content = changes.content;
        stored.rights = changes.rights;
        stored.categories = changes.categories;
        stored.authors = changes.authors;
        stored.extra_elements = changes.extra_elements;
        stored.etag = Some(etag);
        stored.updated = Some(Utc::now());
        Some(stored.clone())
    }

    pub fn delete_entry(&mut self, key: &str) -> bool {
        let id = format!("{ENTRY_ID_PREFIX}{key}");
        let before = self.entries.len();
        self.entries.retain(|e| e.id.as_deref() != Some(id.as_str()));
        let removed = self.entries.len() != before;
        if removed {
            self.feed_version += 1;
            self.media.remove(key);
        }
        removed
    }

    /// Entries whose title contains `q`, ignoring case.
    pub fn search_entries(&self, q: Option<&str>) -> Vec<&Entry> {
        let q = q.map(str::to_lowercase);
        self.entries
            .iter()
            .filter(|e| match &q {
                Some(q) => e
                    .title
                    .as_deref()
                    .is_some_and(|t| t.to_lowercase().contains(q.as_str())),
                None => true,
            })
            .collect()
    }

    /// The entry as served: with `self`, `edit` and media links.
    pub fn present_entry(&self, entry: &Entry) -> Entry {
        let mut presented = entry.clone();
        if let Some(key) = entry.id.as_deref().and_then(Self::entry_key) {
            let uri = format!("{}/feeds/entries/{key}", self.base_url);
            presented.add_link(Link::new(rel::SELF, &uri));
            presented.add_link(Link::new(rel::EDIT, &uri));
            if self.media.contains_key(key) {
                presented.add_link(Link::new(
                    rel::EDIT_MEDIA,
                    &format!("{}/media/{key}", self.base_url),
                ));
            }
        }
        presented
    }

    /// Store a new task, assigning its id and ETag.
    pub fn insert_task(&mut self, mut task: Map<String, Value>) -> Map<String, Value> {
        let id = format!("t{}", self.next_id);
        self.next_id += 1;
        let etag = self.fresh_etag();
        task.insert("kind".into(), Value::from("tasks#task"));
        task.insert("id".into(), Value::from(id));
        task.insert("etag".into(), Value::from(etag));
        task.insert("updated".into(), Value::from(Utc::now().to_rfc3339()));
        task.remove("selfLink");
        self.tasks.push(task.clone());
        task
    }

    pub fn get_task(&self, id: &str) -> Option<&Map<String, Value>> {
        self.tasks
            .iter()
            .find(|t| t.get("id").and_then(Value::as_str) == Some(id))
    }

    pub fn update_task(&mut self, id: &str, changes: Map<String, Value>) -> Option<Map<String, Value>> {
        let etag = self.fresh_etag();
        let stored = self
            .tasks
            .iter_mut()
            .find(|t| t.get("id").and_then(Value::as_str) == Some(id))?;
        for (name, value) in changes {
            if !matches!(name.as_str(), "id" | "etag" | "kind" | "selfLink" | "updated") {
                stored.insert(name, value);
            }
        }
        stored.insert("etag".into(), Value::from(etag));
        stored.insert("updated".into(), Value::from(Utc::now().to_rfc3339()));
        Some(stored.clone())
    }

    pub fn delete_task(&mut self, id: &str) -> bool {
        let before = self.tasks.len();
        self.tasks
            .retain(|t| t.get("id").and_then(Value::as_str) != Some(id));
        let removed = self.tasks.len() != before;
        if removed {
            self.feed_version += 1;
        }
        removed
    }

    /// The task as served, with its `selfLink`.
    pub fn present_task(&self, task: &Map<String, Value>) -> Map<String, Value> {
        let mut presented = task.clone();
        if let Some(id) = task.get("id").and_then(Value::as_str) {
            presented.insert(
                "selfLink".into(),
                Value::from(format!("{}/tasks/{id}", self.base_url)),
            );
        }
        presented
    }

    /// Open a resumable upload session and return its id.
    pub fn open_upload(&mut self, session: UploadSession) -> String {
        let id = format!("s{}", self.next_id);
        self.next_id += 1;
        self.uploads.insert(id.clone(), session);
        id
    }
}
