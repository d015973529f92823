//! Synchronous variants of the service operations.
//!
//! [`Service`] owns a Tokio runtime and drives the asynchronous
//! [`crate::Service`] on it. Upload and download streams are exposed as
//! [`std::io::Write`] and [`std::io::Read`].
//!
//! These types must not be used from within an async context: blocking
//! calls, and dropping the last handle (which shuts down the runtime),
//! panic there.
//!
//! # Example
//!
//! ```no_run
//! use gdata::blocking::Service;
//! use gdata::{Entry, ServiceConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # fn example() -> gdata::Result<()> {
//! let service = Service::anonymous(ServiceConfig::new("example-app"))?;
//! let feed = service
//!     .query::<Entry>("https://example.com/feeds/public", None, None, &CancellationToken::new())?
//!     .into_modified()
//!     .unwrap_or_default();
//! for entry in feed.iter() {
//!     println!("{:?}", entry.title);
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthorizationDomain, Authorizer};
use crate::batch::BatchOperation;
use crate::config::ServiceConfig;
use crate::download::DownloadStream;
use crate::error::{GDataError, Result};
use crate::models::Feed;
use crate::parsable::Parsable;
use crate::query::QueryOps;
use crate::request::Conditional;
use crate::traits::List;
use crate::upload::{UploadRequest, UploadResponse, UploadStream};

/// Blocking handle to a GData service.
///
/// Cloning is cheap; clones share the runtime and the authorizer.
#[derive(Clone)]
pub struct Service {
    inner: crate::Service,
    runtime: Arc<Runtime>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("blocking::Service")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl Service {
    /// # Errors
    ///
    /// Returns an error if the HTTP client or the runtime cannot be built.
    pub fn new(authorizer: Arc<dyn Authorizer>, config: ServiceConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("gdata-blocking")
            .enable_all()
            .build()
            .map_err(|e| GDataError::Protocol(format!("failed to start runtime: {e}")))?;
        let inner = {
            let _guard = runtime.enter();
            crate::Service::new(authorizer, config)?
        };
        Ok(Self {
            inner,
            runtime: Arc::new(runtime),
        })
    }

    /// # Errors
    ///
    /// Returns an error if the HTTP client or the runtime cannot be built.
    pub fn anonymous(config: ServiceConfig) -> Result<Self> {
        Self::new(Arc::new(crate::auth::AnonymousAuthorizer), config)
    }

    /// The asynchronous service this handle drives.
    #[must_use]
    pub fn as_async(&self) -> &crate::Service {
        &self.inner
    }

    /// Ask the authorizer for new credentials.
    ///
    /// # Errors
    ///
    /// See [`Authorizer::refresh_authorization`].
    pub fn refresh_authorization(&self, cancel: &CancellationToken) -> Result<bool> {
        self.runtime
            .block_on(self.inner.authorizer().refresh_authorization(cancel))
    }

    /// # Errors
    ///
    /// See [`crate::Service::query`].
    pub fn query<E: Parsable>(
        &self,
        feed_uri: &str,
        query: Option<&mut dyn QueryOps>,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Conditional<Feed<E>>> {
        self.runtime
            .block_on(self.inner.query(feed_uri, query, domain, cancel))
    }

    /// # Errors
    ///
    /// See [`crate::Service::query_with_progress`].
    pub fn query_with_progress<E, F>(
        &self,
        feed_uri: &str,
        query: Option<&mut dyn QueryOps>,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
        progress: F,
    ) -> Result<Conditional<Feed<E>>>
    where
        E: Parsable,
        F: FnMut(usize, Option<u32>, &E) + Send,
    {
        self.runtime.block_on(
            self.inner
                .query_with_progress(feed_uri, query, domain, cancel, progress),
        )
    }

    /// Fetch every page of a feed.
    ///
    /// # Errors
    ///
    /// See [`List::list_all`].
    pub fn list_all<E: Parsable>(
        &self,
        feed_uri: &str,
        query: &mut dyn QueryOps,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Vec<E>> {
        self.runtime
            .block_on(E::list_all(&self.inner, feed_uri, query, domain, cancel))
    }

    /// # Errors
    ///
    /// See [`crate::Service::query_single_entry`].
    pub fn query_single_entry<E: Parsable>(
        &self,
        entry_uri: &str,
        etag: Option<&str>,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Conditional<E>> {
        self.runtime
            .block_on(self.inner.query_single_entry(entry_uri, etag, domain, cancel))
    }

    /// # Errors
    ///
    /// See [`crate::Service::insert_entry`].
    pub fn insert_entry<E: Parsable>(
        &self,
        upload_uri: &str,
        entry: &E,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<E> {
        self.runtime
            .block_on(self.inner.insert_entry(upload_uri, entry, domain, cancel))
    }

    /// # Errors
    ///
    /// See [`crate::Service::update_entry`].
    pub fn update_entry<E: Parsable>(
        &self,
        entry: &E,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<E> {
        self.runtime
            .block_on(self.inner.update_entry(entry, domain, cancel))
    }

    /// # Errors
    ///
    /// See [`crate::Service::delete_entry`].
    pub fn delete_entry<E: Parsable>(
        &self,
        entry: &E,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.runtime
            .block_on(self.inner.delete_entry(entry, domain, cancel))
    }

    /// Run a batch built against [`as_async`](Self::as_async).
    ///
    /// # Errors
    ///
    /// See [`BatchOperation::run`].
    pub fn run_batch<E: Parsable>(
        &self,
        batch: &mut BatchOperation<E>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.runtime.block_on(batch.run(cancel))
    }

    /// Start a non-resumable upload.
    #[must_use]
    pub fn upload(&self, request: UploadRequest, cancel: CancellationToken) -> UploadWriter {
        let _guard = self.runtime.enter();
        let stream = UploadStream::new(&self.inner, request, cancel);
        UploadWriter::new(stream, &self.runtime)
    }

    /// Start a resumable upload of `total_length` bytes, if known.
    #[must_use]
    pub fn upload_resumable(
        &self,
        request: UploadRequest,
        total_length: Option<u64>,
        cancel: CancellationToken,
    ) -> UploadWriter {
        let _guard = self.runtime.enter();
        let stream = UploadStream::new_resumable(&self.inner, request, total_length, cancel);
        UploadWriter::new(stream, &self.runtime)
    }

    /// Open a download, returning once the response headers arrive.
    ///
    /// # Errors
    ///
    /// See [`DownloadStream::open`].
    pub fn download(
        &self,
        uri: &str,
        domain: Option<AuthorizationDomain>,
        cancel: CancellationToken,
    ) -> Result<DownloadReader> {
        let stream = self
            .runtime
            .block_on(DownloadStream::open(&self.inner, uri, domain, cancel))?;
        Ok(DownloadReader {
            content_type: stream.content_type().map(str::to_string),
            content_length: stream.content_length(),
            bridge: SyncIoBridge::new_with_handle(stream, self.runtime.handle().clone()),
            _runtime: self.runtime.clone(),
        })
    }
}

/// A blocking upload.
///
/// Write the media, then call [`finish`](Self::finish) for the server's
/// reply. Dropping the writer without finishing cancels the transfer.
pub struct UploadWriter {
    bridge: SyncIoBridge<UploadStream>,
    runtime: Arc<Runtime>,
    content_type: String,
}

impl fmt::Debug for UploadWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadWriter")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

impl UploadWriter {
    fn new(stream: UploadStream, runtime: &Arc<Runtime>) -> Self {
        Self {
            content_type: stream.content_type().to_string(),
            bridge: SyncIoBridge::new_with_handle(stream, runtime.handle().clone()),
            runtime: runtime.clone(),
        }
    }

    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// # Errors
    ///
    /// See [`UploadStream::finish`].
    pub fn finish(self) -> Result<UploadResponse> {
        let stream = self.bridge.into_inner();
        self.runtime.block_on(stream.finish())
    }

    /// # Errors
    ///
    /// See [`UploadStream::finish_upload`].
    pub fn finish_upload<E: Parsable>(self) -> Result<E> {
        self.finish()?.parse()
    }
}

impl io::Write for UploadWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bridge.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.bridge.flush()
    }
}

/// A blocking download.
pub struct DownloadReader {
    bridge: SyncIoBridge<DownloadStream>,
    content_type: Option<String>,
    content_length: Option<u64>,
    // Keeps the runtime driving the transfer alive.
    _runtime: Arc<Runtime>,
}

impl fmt::Debug for DownloadReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadReader")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl DownloadReader {
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Stop the transfer and release the connection.
    pub fn close(self) {
        let Self { bridge, _runtime, .. } = self;
        bridge.into_inner().close();
    }
}

impl io::Read for DownloadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.bridge.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Entry;
    use crate::query::Query;
    use std::io::{Read, Write};
    use wiremock::matchers::{body_bytes, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// The mock server lives on its own runtime; the code under test runs
    /// on the plain test thread.
    fn start_server() -> (Runtime, MockServer) {
        let runtime = Runtime::new().unwrap();
        let server = runtime.block_on(MockServer::start());
        (runtime, server)
    }

    fn service() -> Service {
        Service::anonymous(ServiceConfig::new("test").with_insecure_http(true)).unwrap()
    }

    #[test]
    fn test_blocking_query() {
        let (runtime, server) = start_server();
        runtime.block_on(
            Mock::given(method("GET"))
                .and(path("/feed"))
                .and(query_param("max-results", "5"))
                .respond_with(ResponseTemplate::new(200).set_body_raw(
                    "<feed xmlns='http://www.w3.org/2005/Atom'><id>f</id>\
                     <entry><id>e1</id><title>One</title></entry></feed>",
                    "application/atom+xml",
                ))
                .expect(1)
                .mount(&server),
        );

        let mut query = Query::default();
        query.set_max_results(5);
        let feed = service()
            .query::<Entry>(
                &format!("{}/feed", server.uri()),
                Some(&mut query),
                None,
                &CancellationToken::new(),
            )
            .unwrap()
            .into_modified()
            .unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed.entries()[0].title.as_deref(), Some("One"));
    }

    #[test]
    fn test_blocking_download() {
        let (runtime, server) = start_server();
        runtime.block_on(
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_raw(vec![7u8; 100_000], "application/pdf"))
                .expect(1)
                .mount(&server),
        );

        let mut reader = service()
            .download(&server.uri(), None, CancellationToken::new())
            .unwrap();
        assert_eq!(reader.content_type(), Some("application/pdf"));

        let mut body = Vec::new();
        reader.read_to_end(&mut body).unwrap();
        assert_eq!(body.len(), 100_000);
        assert!(body.iter().all(|b| *b == 7));
    }

    #[test]
    fn test_blocking_raw_upload() {
        let (runtime, server) = start_server();
        runtime.block_on(
            Mock::given(method("POST"))
                .and(path("/media"))
                .and(body_bytes(b"hello world".to_vec()))
                .respond_with(ResponseTemplate::new(201).set_body_raw(
                    "<entry xmlns='http://www.w3.org/2005/Atom'><id>m1</id></entry>",
                    "application/atom+xml",
                ))
                .expect(1)
                .mount(&server),
        );

        let request = UploadRequest::new(
            reqwest::Method::POST,
            &format!("{}/media", server.uri()),
            "text/plain",
        );
        let mut writer = service().upload(request, CancellationToken::new());
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let entry: Entry = writer.finish_upload().unwrap();
        assert_eq!(entry.id.as_deref(), Some("m1"));
    }
}
