//! Streaming uploads.
//!
//! An [`UploadStream`] is an [`AsyncWrite`] whose bytes are sent while they
//! are written. A background task owns the HTTP request; writes hand chunks
//! to it over a bounded channel, so memory use is fixed by the channel
//! capacity (and, for resumable uploads, one chunk) whatever the size of
//! the upload.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{future, stream, StreamExt};
use reqwest::header::{HeaderName, HeaderValue, CONTENT_RANGE, CONTENT_TYPE, IF_MATCH, RANGE};
use reqwest::{Method, Response, StatusCode};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::Instrument;

use crate::auth::AuthorizationDomain;
use crate::error::{GDataError, Result};
use crate::models::{rel, Entry};
use crate::parsable::{self, Parsable};
use crate::request::{location, read_body, Conditional, ServiceRequest, GDATA_VERSION};
use crate::service::Service;

/// Separator between the metadata and media parts of a multipart upload.
pub const BOUNDARY: &str = "0003Z5W789deadbeefRTE456KlemsnoZV";

/// Largest single item handed to the upload task per write.
const MAX_WRITE: usize = 64 * 1024;

/// Transport failures tolerated per chunk before the upload gives up.
const MAX_CHUNK_RETRIES: u32 = 3;

const SLUG: HeaderName = HeaderName::from_static("slug");
const X_UPLOAD_CONTENT_TYPE: HeaderName = HeaderName::from_static("x-upload-content-type");
const X_UPLOAD_CONTENT_LENGTH: HeaderName = HeaderName::from_static("x-upload-content-length");
const PERMANENT_REDIRECT: StatusCode = StatusCode::PERMANENT_REDIRECT;

/// Chooses where media for an entity is uploaded.
pub trait UploadUriStrategy: Send + Sync + fmt::Debug {
    /// Method and URI for uploading media for `entry`; `None` or an entry
    /// without an id means a new entity.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::Protocol`] if the entry lacks the link needed.
    fn upload_uri(&self, entry: Option<&Entry>, resumable: bool) -> Result<(Method, String)>;
}

/// POSTs new media to a fixed collection URI and PUTs updates to the
/// entry's `edit-media` (or `resumable-edit-media`) link.
#[derive(Debug, Clone)]
pub struct LinkUploadUri {
    create_uri: String,
}

impl LinkUploadUri {
    #[must_use]
    pub fn new(create_uri: &str) -> Self {
        Self {
            create_uri: create_uri.to_string(),
        }
    }
}

impl UploadUriStrategy for LinkUploadUri {
    fn upload_uri(&self, entry: Option<&Entry>, resumable: bool) -> Result<(Method, String)> {
        let Some(entry) = entry.filter(|e| e.is_inserted()) else {
            return Ok((Method::POST, self.create_uri.clone()));
        };
        let rel = if resumable {
            rel::RESUMABLE_EDIT_MEDIA
        } else {
            rel::EDIT_MEDIA
        };
        entry
            .look_up_link(rel)
            .map(|link| (Method::PUT, link.href.clone()))
            .ok_or_else(|| GDataError::Protocol(format!("entry has no '{rel}' link")))
    }
}

#[derive(Debug, Clone)]
struct Metadata {
    content_type: &'static str,
    document: Bytes,
    etag: Option<String>,
}

/// Where and what to upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub method: Method,
    pub uri: String,
    pub slug: Option<String>,
    /// Content type of the media bytes.
    pub content_type: String,
    pub domain: Option<AuthorizationDomain>,
    metadata: Option<Metadata>,
}

impl UploadRequest {
    #[must_use]
    pub fn new(method: Method, uri: &str, content_type: &str) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            slug: None,
            content_type: content_type.to_string(),
            domain: None,
            metadata: None,
        }
    }

    /// Resolve the method and URI through `strategy`.
    ///
    /// # Errors
    ///
    /// Returns the strategy's error.
    pub fn for_entity<E: Parsable>(
        strategy: &dyn UploadUriStrategy,
        metadata: Option<&E>,
        content_type: &str,
        resumable: bool,
    ) -> Result<Self> {
        let (method, uri) = strategy.upload_uri(metadata.map(|e| e.entry()), resumable)?;
        let request = Self::new(method, &uri, content_type);
        Ok(match metadata {
            Some(entity) => request.with_metadata(entity),
            None => request,
        })
    }

    #[must_use]
    pub fn with_slug(mut self, slug: &str) -> Self {
        self.slug = Some(slug.to_string());
        self
    }

    #[must_use]
    pub fn with_domain(mut self, domain: Option<AuthorizationDomain>) -> Self {
        self.domain = domain;
        self
    }

    /// Send `entity` ahead of the media.
    #[must_use]
    pub fn with_metadata<E: Parsable>(mut self, entity: &E) -> Self {
        self.metadata = Some(Metadata {
            content_type: E::CONTENT_TYPE.mime_type(),
            document: Bytes::from(parsable::serialize(entity)),
            etag: entity.entry().etag.clone(),
        });
        self
    }

    fn slug_header(&self) -> Option<HeaderValue> {
        let slug = self.slug.as_deref()?;
        HeaderValue::from_str(slug)
            .or_else(|_| HeaderValue::from_str(&urlencoding::encode(slug)))
            .ok()
    }
}

/// The server's reply to a finished upload.
#[derive(Debug, Clone)]
pub struct UploadResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl UploadResponse {
    async fn read(response: Response, cancel: &CancellationToken) -> Result<Self> {
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = read_body(response, cancel).await?;
        Ok(Self {
            status,
            content_type,
            body,
        })
    }

    /// Decode the returned entity.
    ///
    /// # Errors
    ///
    /// Returns a parser error if the body is not a valid entity.
    pub fn parse<E: Parsable>(&self) -> Result<E> {
        Ok(parsable::parse_from_bytes(&self.body)?)
    }
}

/// An upload in progress.
///
/// Write the media with the [`AsyncWrite`] methods, then call
/// [`finish`](Self::finish) or [`finish_upload`](Self::finish_upload).
/// Dropping the stream without finishing cancels the upload.
///
/// Must be created inside a Tokio runtime.
///
/// # Example
///
/// ```no_run
/// use gdata::upload::{UploadRequest, UploadStream};
/// use gdata::{Entry, Service};
/// use reqwest::Method;
/// use tokio::io::AsyncWriteExt;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(service: Service, data: Vec<u8>) -> gdata::Result<()> {
/// let metadata = Entry::new("holiday.jpg");
/// let request = UploadRequest::new(Method::POST, "https://example.com/upload/photos", "image/jpeg")
///     .with_slug("holiday.jpg")
///     .with_metadata(&metadata);
///
/// let mut stream = UploadStream::new_resumable(&service, request, Some(data.len() as u64), CancellationToken::new());
/// stream.write_all(&data).await.map_err(|e| gdata::GDataError::from_io(&e))?;
/// let photo: Entry = stream.finish_upload().await?;
/// # Ok(())
/// # }
/// ```
pub struct UploadStream {
    sender: PollSender<Bytes>,
    worker: Option<JoinHandle<Result<UploadResponse>>>,
    cancel: CancellationToken,
    content_type: String,
}

impl fmt::Debug for UploadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadStream")
            .field("content_type", &self.content_type)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl UploadStream {
    /// Start a single-request upload: `multipart/related` when metadata is
    /// given, otherwise the raw media.
    #[must_use]
    pub fn new(service: &Service, request: UploadRequest, cancel: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::channel(service.config().upload_buffer_chunks);
        let cancel = cancel.child_token();
        let content_type = request.content_type.clone();
        let span = tracing::debug_span!("upload", uri = %request.uri, resumable = false);
        let worker = tokio::spawn(
            run_multipart(service.clone(), request, receiver, cancel.clone()).instrument(span),
        );
        Self {
            sender: PollSender::new(sender),
            worker: Some(worker),
            cancel,
            content_type,
        }
    }

    /// Start a resumable upload of `total_length` bytes (unknown if `None`).
    #[must_use]
    pub fn new_resumable(
        service: &Service,
        request: UploadRequest,
        total_length: Option<u64>,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(service.config().upload_buffer_chunks);
        let cancel = cancel.child_token();
        let content_type = request.content_type.clone();
        let span = tracing::debug_span!("upload", uri = %request.uri, resumable = true);
        let session = ResumableSession {
            service: service.clone(),
            request,
            total_length,
            chunk_size: service.config().resumable_chunk_size,
            cancel: cancel.clone(),
        };
        let worker = tokio::spawn(session.run(receiver).instrument(span));
        Self {
            sender: PollSender::new(sender),
            worker: Some(worker),
            cancel,
            content_type,
        }
    }

    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Abort the transfer. [`finish`](Self::finish) then returns
    /// [`GDataError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Close the stream and wait for the server's reply.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::Cancelled`] if the upload was cancelled, or
    /// the error that stopped the transfer.
    pub async fn finish(mut self) -> Result<UploadResponse> {
        self.sender.close();
        let Some(worker) = self.worker.take() else {
            return Err(GDataError::Protocol("upload already finished".to_string()));
        };
        let result = match worker.await {
            Ok(result) => result,
            Err(err) => Err(GDataError::Protocol(format!("upload task failed: {err}"))),
        };
        if self.cancel.is_cancelled() {
            return Err(GDataError::Cancelled);
        }
        result
    }

    /// [`finish`](Self::finish) and decode the returned entity.
    ///
    /// # Errors
    ///
    /// See [`finish`](Self::finish); also a parser error for a bad body.
    pub async fn finish_upload<E: Parsable>(self) -> Result<E> {
        self.finish().await?.parse()
    }

    fn stopped_error(&self) -> io::Error {
        if self.cancel.is_cancelled() {
            GDataError::Cancelled.into_io()
        } else {
            io::Error::new(io::ErrorKind::BrokenPipe, "upload stopped; call finish() for the cause")
        }
    }
}

impl AsyncWrite for UploadStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(Err(GDataError::Cancelled.into_io()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(self.sender.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(self.stopped_error()));
        }
        let len = buf.len().min(MAX_WRITE);
        if self
            .sender
            .send_item(Bytes::copy_from_slice(&buf[..len]))
            .is_err()
        {
            return Poll::Ready(Err(self.stopped_error()));
        }
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(Err(GDataError::Cancelled.into_io()));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.sender.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for UploadStream {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.cancel.cancel();
        }
    }
}

fn receiver_stream(receiver: mpsc::Receiver<Bytes>) -> impl futures::Stream<Item = io::Result<Bytes>> {
    stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|chunk| (Ok(chunk), receiver))
    })
}

async fn run_multipart(
    service: Service,
    request: UploadRequest,
    receiver: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) -> Result<UploadResponse> {
    let uri = service.config().secure_uri(&request.uri);
    let mut builder = service
        .http
        .request(request.method.clone(), &uri)
        .header(GDATA_VERSION, &service.config().api_version);
    if let Some(slug) = request.slug_header() {
        builder = builder.header(SLUG, slug);
    }

    let body = match &request.metadata {
        Some(metadata) => {
            let head = format!(
                "--{BOUNDARY}\nContent-Type: {}; charset=UTF-8\n\n{}\n--{BOUNDARY}\n\
                 Content-Type: {}\nContent-Transfer-Encoding: binary\n\n",
                metadata.content_type,
                String::from_utf8_lossy(&metadata.document),
                request.content_type,
            );
            let tail = format!("\n--{BOUNDARY}--");
            if let Some(etag) = &metadata.etag {
                builder = builder.header(IF_MATCH, etag);
            }
            builder = builder.header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={BOUNDARY}"),
            );
            let parts = stream::once(future::ready(Ok(Bytes::from(head))))
                .chain(receiver_stream(receiver))
                .chain(stream::once(future::ready(Ok(Bytes::from(tail)))));
            reqwest::Body::wrap_stream(parts)
        }
        None => {
            builder = builder.header(CONTENT_TYPE, &request.content_type);
            reqwest::Body::wrap_stream(receiver_stream(receiver))
        }
    };

    let http_request = builder.body(body).build()?;
    let response = service
        .send_once(http_request, request.domain, &cancel)
        .await?;
    tracing::debug!(status = %response.status(), "upload complete");
    UploadResponse::read(response, &cancel).await
}

/// What the server said about a chunk.
enum ChunkOutcome {
    /// Upload continues; the server has every byte before `next_offset`.
    Incomplete { next_offset: u64 },
    Complete(UploadResponse),
}

struct ResumableSession {
    service: Service,
    request: UploadRequest,
    total_length: Option<u64>,
    chunk_size: usize,
    cancel: CancellationToken,
}

impl ResumableSession {
    async fn run(mut self, mut receiver: mpsc::Receiver<Bytes>) -> Result<UploadResponse> {
        let mut session_uri = match self.initiate().await? {
            Ok(uri) => uri,
            Err(finished) => return Ok(finished),
        };

        let mut offset: u64 = 0;
        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        let mut eof = false;

        loop {
            while buffer.len() < self.chunk_size && !eof {
                let item = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(GDataError::Cancelled),
                    item = receiver.recv() => item,
                };
                match item {
                    Some(bytes) => buffer.extend_from_slice(&bytes),
                    None => eof = true,
                }
            }

            let take = buffer.len().min(self.chunk_size);
            let chunk = buffer.split_to(take).freeze();
            let is_last = eof && buffer.is_empty();
            if is_last && self.total_length.is_none() {
                self.total_length = Some(offset + chunk.len() as u64);
            }

            match self.upload_chunk(&mut session_uri, offset, chunk.clone()).await? {
                ChunkOutcome::Complete(response) => {
                    if !is_last {
                        tracing::warn!(offset, "server finalized the upload early");
                    }
                    return Ok(response);
                }
                ChunkOutcome::Incomplete { next_offset } => {
                    if is_last {
                        return Err(GDataError::Protocol(format!(
                            "server did not finalize the upload at offset {next_offset}"
                        )));
                    }
                    offset = next_offset;
                }
            }
        }
    }

    /// POST the metadata and obtain the session URI. A server that
    /// answers 201 has nothing more to receive.
    async fn initiate(&self) -> Result<std::result::Result<String, UploadResponse>> {
        let content_type = HeaderValue::from_str(&self.request.content_type)
            .map_err(|_| GDataError::BadQueryParameter("invalid content type".to_string()))?;
        let mut init = ServiceRequest::new(self.request.method.clone(), &self.request.uri)
            .with_domain(self.request.domain)
            .with_header(X_UPLOAD_CONTENT_TYPE, content_type);
        if let Some(total) = self.total_length {
            init = init.with_header(X_UPLOAD_CONTENT_LENGTH, HeaderValue::from(total));
        }
        if let Some(slug) = self.request.slug_header() {
            init = init.with_header(SLUG, slug);
        }
        if let Some(metadata) = &self.request.metadata {
            init = init
                .with_body(metadata.content_type, metadata.document.clone())
                .with_etag(metadata.etag.as_deref());
        }

        let response = match self.service.send(&init, &self.cancel).await? {
            Conditional::Modified(response) => response,
            Conditional::NotModified => {
                return Err(GDataError::Protocol("unexpected 304 response".to_string()))
            }
        };
        let session = location(&response);
        match (response.status(), session) {
            (_, Some(uri)) => {
                tracing::debug!(session = %uri, "resumable session opened");
                Ok(Ok(uri))
            }
            (StatusCode::CREATED, None) => {
                Ok(Err(UploadResponse::read(response, &self.cancel).await?))
            }
            (status, None) => Err(GDataError::Protocol(format!(
                "HTTP {status} response to upload initiation has no session URI"
            ))),
        }
    }

    /// Send `data` starting at `start`, resuming after transport failures
    /// from the offset the server confirms.
    async fn upload_chunk(
        &self,
        session_uri: &mut String,
        start: u64,
        data: Bytes,
    ) -> Result<ChunkOutcome> {
        let end = start + data.len() as u64;
        let mut start = start;
        let mut pending = data;
        let mut failures = 0;

        loop {
            let outcome = match self.put_range(session_uri, start, &pending).await {
                Ok(outcome) => outcome,
                Err(GDataError::Transport(err)) if failures < MAX_CHUNK_RETRIES => {
                    failures += 1;
                    tracing::warn!(error = %err, start, "chunk failed, asking the server where to resume");
                    self.probe(session_uri).await?
                }
                Err(err) => return Err(err),
            };

            match outcome {
                ChunkOutcome::Complete(response) => return Ok(ChunkOutcome::Complete(response)),
                ChunkOutcome::Incomplete { next_offset } => {
                    if next_offset < start || next_offset > end {
                        return Err(GDataError::Protocol(format!(
                            "server confirmed offset {next_offset} outside chunk {start}-{end}"
                        )));
                    }
                    if next_offset == end {
                        return Ok(ChunkOutcome::Incomplete { next_offset });
                    }
                    if next_offset != start {
                        tracing::debug!(from = next_offset, "resuming inside chunk");
                    }
                    pending = pending.slice((next_offset - start) as usize..);
                    start = next_offset;
                }
            }
        }
    }

    async fn put_range(&self, session_uri: &mut String, start: u64, data: &Bytes) -> Result<ChunkOutcome> {
        let total = self
            .total_length
            .map_or_else(|| "*".to_string(), |t| t.to_string());
        let range = if data.is_empty() {
            format!("bytes */{total}")
        } else {
            format!("bytes {start}-{}/{total}", start + data.len() as u64 - 1)
        };
        let request = ServiceRequest::new(Method::PUT, session_uri)
            .with_header(CONTENT_RANGE, header_value(&range)?)
            .with_body(&self.request.content_type, data.clone());
        self.exchange(session_uri, request).await
    }

    /// Ask the server how much of the upload it has.
    async fn probe(&self, session_uri: &mut String) -> Result<ChunkOutcome> {
        let total = self
            .total_length
            .map_or_else(|| "*".to_string(), |t| t.to_string());
        let request = ServiceRequest::new(Method::PUT, session_uri)
            .with_header(CONTENT_RANGE, header_value(&format!("bytes */{total}"))?);
        self.exchange(session_uri, request).await
    }

    async fn exchange(&self, session_uri: &mut String, request: ServiceRequest) -> Result<ChunkOutcome> {
        let request = request
            .with_domain(self.request.domain)
            .with_passthrough(PERMANENT_REDIRECT);
        let response = match self.service.send(&request, &self.cancel).await? {
            Conditional::Modified(response) => response,
            Conditional::NotModified => {
                return Err(GDataError::Protocol("unexpected 304 response".to_string()))
            }
        };

        if response.status() != PERMANENT_REDIRECT {
            return Ok(ChunkOutcome::Complete(
                UploadResponse::read(response, &self.cancel).await?,
            ));
        }

        if let Some(uri) = location(&response) {
            *session_uri = uri;
        }
        let next_offset = response
            .headers()
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range_end)
            .map_or(0, |last| last + 1);
        Ok(ChunkOutcome::Incomplete { next_offset })
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| GDataError::Protocol(format!("invalid header value '{value}'")))
}

/// Last byte index of a `Range: bytes=0-N` header.
fn parse_range_end(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes=")?;
    let (_, end) = range.split_once('-')?;
    end.trim().parse().ok()
}
