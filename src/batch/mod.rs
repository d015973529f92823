//! Batch operations.
//!
//! A [`BatchOperation`] collects queries, insertions, updates and deletions
//! and sends them as one request to a feed's batch endpoint. Each
//! sub-operation has its own callback, called exactly once with either the
//! resulting entity or the error for that sub-operation.

mod atom;
mod json;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthorizationDomain;
use crate::error::{GDataError, Result};
use crate::models::Feed;
use crate::parsable::{ContentType, Parsable};
use crate::request::{read_body, Conditional, ServiceRequest};
use crate::service::Service;

pub use atom::AtomBatchCodec;
pub use json::JsonBatchCodec;

/// What a sub-operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchOperationType {
    Query,
    Insertion,
    Update,
    Deletion,
}

impl BatchOperationType {
    /// Name used in `<batch:operation type=...>`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Insertion => "insert",
            Self::Update => "update",
            Self::Deletion => "delete",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "query" => Some(Self::Query),
            "insert" => Some(Self::Insertion),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Deletion),
            _ => None,
        }
    }
}

impl fmt::Display for BatchOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Called once per sub-operation with its id, type, and either the
/// resulting entity (none for deletions) or an error.
pub type BatchCallback<E> =
    Box<dyn FnOnce(u32, BatchOperationType, Option<E>, Option<GDataError>) + Send>;

/// One sub-operation as the codec sees it.
#[derive(Debug)]
pub struct BatchItem<'a, E> {
    pub id: u32,
    pub kind: BatchOperationType,
    /// Entity for insertions, updates and deletions.
    pub entity: Option<&'a E>,
    /// Entry URI for queries.
    pub query_uri: Option<&'a str>,
}

/// One sub-operation result decoded from the response.
#[derive(Debug)]
pub struct BatchResult<E> {
    pub id: u32,
    pub outcome: Result<Option<E>>,
}

/// Wire format of a batch request and its response.
pub trait BatchCodec<E: Parsable>: Send + Sync + fmt::Debug {
    /// Encode `items` as a request body, returning its content type too.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::Protocol`] if an item cannot be expressed.
    fn encode(&self, items: &[BatchItem<'_, E>]) -> Result<(String, Bytes)>;

    /// Decode the response into per-sub-operation results, in response
    /// order. `kinds` maps ids to the type of the operation sent.
    ///
    /// # Errors
    ///
    /// Returns an error when the response as a whole cannot be decoded.
    fn decode(
        &self,
        content_type: Option<&str>,
        body: &[u8],
        kinds: &HashMap<u32, BatchOperationType>,
    ) -> Result<Vec<BatchResult<E>>>;
}

struct PendingOperation<E> {
    id: u32,
    kind: BatchOperationType,
    entity: Option<E>,
    query_uri: Option<String>,
    callback: BatchCallback<E>,
}

/// A set of sub-operations sent in one request.
///
/// # Example
///
/// ```no_run
/// use gdata::batch::BatchOperation;
/// use gdata::{Entry, Service};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(service: Service, existing: Entry) -> gdata::Result<()> {
/// let mut batch = BatchOperation::<Entry>::new(&service, "https://example.com/feeds/items/batch", None);
/// batch.add_insertion(&Entry::new("new"), |id, kind, entry, error| {
///     println!("{id} {kind}: {:?} {:?}", entry.map(|e| e.id), error);
/// });
/// batch.add_deletion(&existing, |_, _, _, error| assert!(error.is_none()));
/// batch.run(&CancellationToken::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct BatchOperation<E: Parsable> {
    service: Service,
    batch_uri: String,
    domain: Option<AuthorizationDomain>,
    codec: Arc<dyn BatchCodec<E>>,
    operations: Vec<PendingOperation<E>>,
    next_id: u32,
    has_run: bool,
}

impl<E: Parsable> fmt::Debug for BatchOperation<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOperation")
            .field("batch_uri", &self.batch_uri)
            .field("codec", &self.codec)
            .field("operations", &self.operations.len())
            .field("has_run", &self.has_run)
            .finish_non_exhaustive()
    }
}

impl<E: Parsable> BatchOperation<E> {
    /// Create a batch for `batch_uri`, encoded in `E`'s content type.
    ///
    /// JSON batches post insertions to `batch_uri` itself; use
    /// [`with_codec`](Self::with_codec) with a [`JsonBatchCodec`] to post
    /// them elsewhere.
    #[must_use]
    pub fn new(service: &Service, batch_uri: &str, domain: Option<AuthorizationDomain>) -> Self {
        let codec: Arc<dyn BatchCodec<E>> = match E::CONTENT_TYPE {
            ContentType::Atom => Arc::new(AtomBatchCodec),
            ContentType::Json => Arc::new(JsonBatchCodec::new(batch_uri)),
        };
        Self {
            service: service.clone(),
            batch_uri: batch_uri.to_string(),
            domain,
            codec,
            operations: Vec::new(),
            next_id: 1,
            has_run: false,
        }
    }

    /// Create a batch for the `batch` link a feed advertises.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::Protocol`] if the feed has no batch link.
    pub fn for_feed<T>(
        service: &Service,
        feed: &Feed<T>,
        domain: Option<AuthorizationDomain>,
    ) -> Result<Self> {
        let link = feed
            .batch_link()
            .ok_or_else(|| GDataError::Protocol("feed does not support batch operations".to_string()))?;
        Ok(Self::new(service, &link.href, domain))
    }

    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn BatchCodec<E>>) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn batch_uri(&self) -> &str {
        &self.batch_uri
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Fetch the entry at `entry_uri`.
    pub fn add_query<F>(&mut self, entry_uri: &str, callback: F) -> u32
    where
        F: FnOnce(u32, BatchOperationType, Option<E>, Option<GDataError>) + Send + 'static,
    {
        self.push(BatchOperationType::Query, None, Some(entry_uri.to_string()), Box::new(callback))
    }

    pub fn add_insertion<F>(&mut self, entity: &E, callback: F) -> u32
    where
        F: FnOnce(u32, BatchOperationType, Option<E>, Option<GDataError>) + Send + 'static,
    {
        self.push(BatchOperationType::Insertion, Some(entity.clone()), None, Box::new(callback))
    }

    pub fn add_update<F>(&mut self, entity: &E, callback: F) -> u32
    where
        F: FnOnce(u32, BatchOperationType, Option<E>, Option<GDataError>) + Send + 'static,
    {
        self.push(BatchOperationType::Update, Some(entity.clone()), None, Box::new(callback))
    }

    pub fn add_deletion<F>(&mut self, entity: &E, callback: F) -> u32
    where
        F: FnOnce(u32, BatchOperationType, Option<E>, Option<GDataError>) + Send + 'static,
    {
        self.push(BatchOperationType::Deletion, Some(entity.clone()), None, Box::new(callback))
    }

    fn push(
        &mut self,
        kind: BatchOperationType,
        entity: Option<E>,
        query_uri: Option<String>,
        callback: BatchCallback<E>,
    ) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.operations.push(PendingOperation {
            id,
            kind,
            entity,
            query_uri,
            callback,
        });
        id
    }

    /// Send every sub-operation and call their callbacks.
    ///
    /// Succeeds when the batch request itself succeeded, even if some
    /// sub-operations failed. When the request fails, every callback
    /// receives that error.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::Protocol`] if the batch has already run, or
    /// the error that failed the whole request.
    #[tracing::instrument(skip(self, cancel), fields(uri = %self.batch_uri, operations = self.operations.len()))]
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.has_run {
            return Err(GDataError::Protocol("batch operation has already been run".to_string()));
        }
        self.has_run = true;

        let operations = std::mem::take(&mut self.operations);
        if operations.is_empty() {
            return Ok(());
        }

        match self.exchange(&operations, cancel).await {
            Ok(results) => {
                demultiplex(operations, results);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "batch request failed");
                for op in operations {
                    (op.callback)(op.id, op.kind, None, Some(err.clone()));
                }
                Err(err)
            }
        }
    }

    async fn exchange(
        &self,
        operations: &[PendingOperation<E>],
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchResult<E>>> {
        let items: Vec<BatchItem<'_, E>> = operations
            .iter()
            .map(|op| BatchItem {
                id: op.id,
                kind: op.kind,
                entity: op.entity.as_ref(),
                query_uri: op.query_uri.as_deref(),
            })
            .collect();
        let (content_type, body) = self.codec.encode(&items)?;

        let request = ServiceRequest::new(Method::POST, &self.batch_uri)
            .with_body(&content_type, body)
            .with_domain(self.domain);
        let response = match self.service.send(&request, cancel).await? {
            Conditional::Modified(response) => response,
            Conditional::NotModified => {
                return Err(GDataError::Protocol("unexpected 304 response".to_string()))
            }
        };
        let response_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = read_body(response, cancel).await?;

        let kinds: HashMap<u32, BatchOperationType> =
            operations.iter().map(|op| (op.id, op.kind)).collect();
        self.codec.decode(response_type.as_deref(), &body, &kinds)
    }
}

/// Call each operation's callback in response order; operations the
/// response does not mention fail afterwards.
fn demultiplex<E>(operations: Vec<PendingOperation<E>>, results: Vec<BatchResult<E>>) {
    let mut pending: HashMap<u32, PendingOperation<E>> =
        operations.into_iter().map(|op| (op.id, op)).collect();

    for result in results {
        let Some(op) = pending.remove(&result.id) else {
            tracing::warn!(id = result.id, "ignoring result for unknown or repeated batch id");
            continue;
        };
        match result.outcome {
            Ok(entity) => (op.callback)(op.id, op.kind, entity, None),
            Err(err) => (op.callback)(op.id, op.kind, None, Some(err)),
        }
    }

    let mut missing: Vec<_> = pending.into_values().collect();
    missing.sort_by_key(|op| op.id);
    for op in missing {
        tracing::debug!(id = op.id, "no result for batch operation");
        let err = GDataError::Protocol(format!("batch response has no result for operation {}", op.id));
        (op.callback)(op.id, op.kind, None, Some(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::models::{rel, Entry, Link};
    use parking_lot::Mutex;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    type Log = Arc<Mutex<Vec<(u32, BatchOperationType, Option<String>, Option<GDataError>)>>>;

    fn recorder(log: &Log) -> impl FnOnce(u32, BatchOperationType, Option<Entry>, Option<GDataError>) + Send + 'static {
        let log = log.clone();
        move |id, kind, entry, error| {
            log.lock().push((id, kind, entry.and_then(|e| e.id), error));
        }
    }

    fn service() -> Service {
        Service::anonymous(ServiceConfig::new("test").with_insecure_http(true)).unwrap()
    }

    #[test]
    fn test_ids_are_sequential() {
        let mut batch = BatchOperation::<Entry>::new(&service(), "https://example/batch", None);
        let a = batch.add_query("https://example/e/1", |_, _, _, _| {});
        let b = batch.add_insertion(&Entry::new("x"), |_, _, _, _| {});
        assert_eq!((a, b), (1, 2));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_demultiplex_reports_missing_operations() {
        let log: Log = Arc::default();
        let ops = (1..=3)
            .map(|id| PendingOperation::<Entry> {
                id,
                kind: BatchOperationType::Query,
                entity: None,
                query_uri: None,
                callback: Box::new(recorder(&log)),
            })
            .collect();
        let results = vec![
            BatchResult { id: 3, outcome: Ok(None) },
            BatchResult { id: 9, outcome: Ok(None) },
            BatchResult { id: 1, outcome: Ok(None) },
        ];
        demultiplex(ops, results);

        let log = log.lock();
        let ids: Vec<_> = log.iter().map(|(id, ..)| *id).collect();
        assert_eq!(ids, [3, 1, 2]);
        assert!(matches!(log[2].3, Some(GDataError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_run_twice_is_error() {
        let mut batch = BatchOperation::<Entry>::new(&service(), "https://example/batch", None);
        batch.run(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            batch.run(&CancellationToken::new()).await,
            Err(GDataError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_fails_every_operation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let log: Log = Arc::default();
        let mut batch = BatchOperation::<Entry>::new(&service(), &server.uri(), None);
        batch.add_insertion(&Entry::new("a"), recorder(&log));
        batch.add_query("https://example/e/1", recorder(&log));
        let err = batch.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, GDataError::Server { status: 503, .. }));

        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert!(log
            .iter()
            .all(|(_, _, _, e)| matches!(e, Some(GDataError::Server { status: 503, .. }))));
    }

    #[tokio::test]
    async fn test_mixed_outcomes_in_response_order() {
        let server = MockServer::start().await;
        let response = "<feed xmlns='http://www.w3.org/2005/Atom' \
            xmlns:batch='http://schemas.google.com/gdata/batch' \
            xmlns:gd='http://schemas.google.com/g/2005'><id>batch</id>\
            <entry><batch:id>3</batch:id><batch:operation type='delete'/>\
              <batch:status code='200' reason='Success'/></entry>\
            <entry><batch:id>2</batch:id><batch:operation type='update'/>\
              <batch:status code='409' reason='Conflict'/></entry>\
            <entry gd:etag='\"a1\"'><batch:id>1</batch:id><batch:operation type='insert'/>\
              <batch:status code='201' reason='Created'/><id>https://example/e/A</id>\
              <title>A</title></entry>\
            </feed>";
        Mock::given(method("POST"))
            .and(path("/batch"))
            .and(body_string_contains("<batch:operation type=\"insert\"/>"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(response, "application/atom+xml"))
            .expect(1)
            .mount(&server)
            .await;

        let mut existing = Entry::new("B");
        existing.id = Some("https://example/e/B".into());
        existing.etag = Some("\"b0\"".into());
        existing.add_link(Link::new(rel::EDIT, "https://example/e/B"));
        let mut doomed = existing.clone();
        doomed.id = Some("https://example/e/C".into());

        let log: Log = Arc::default();
        let mut batch = BatchOperation::<Entry>::new(&service(), &format!("{}/batch", server.uri()), None);
        batch.add_insertion(&Entry::new("A"), recorder(&log));
        batch.add_update(&existing, recorder(&log));
        batch.add_deletion(&doomed, recorder(&log));
        batch.run(&CancellationToken::new()).await.unwrap();

        let log = log.lock();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].0, 3);
        assert_eq!(log[0].1, BatchOperationType::Deletion);
        assert!(log[0].2.is_none() && log[0].3.is_none());
        assert_eq!(log[1].0, 2);
        assert!(matches!(log[1].3, Some(GDataError::Conflict(_))));
        assert_eq!(log[2].0, 1);
        assert_eq!(log[2].2.as_deref(), Some("https://example/e/A"));
        assert!(log[2].3.is_none());
    }
}
