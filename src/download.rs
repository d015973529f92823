//! Streaming downloads.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::auth::AuthorizationDomain;
use crate::error::{GDataError, Result};
use crate::models::Content;
use crate::parsable::Parsable;
use crate::request::{Conditional, ServiceRequest};
use crate::service::Service;

/// The body of a GET, read as it arrives.
///
/// Opening the stream sends the request through the same pipeline as
/// every other operation, so headers (and the content type) are known once
/// [`open`](Self::open) returns. Dropping or [`close`](Self::close)-ing the
/// stream aborts the transfer.
///
/// # Example
///
/// ```no_run
/// use gdata::download::DownloadStream;
/// use gdata::Service;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(service: Service) -> gdata::Result<()> {
/// let mut stream = DownloadStream::open(
///     &service,
///     "https://example.com/feeds/documents/export?id=1",
///     None,
///     CancellationToken::new(),
/// )
/// .await?;
/// println!("{:?}", stream.content_type());
///
/// let mut file = tokio::fs::File::create("export.pdf").await.map_err(|e| gdata::GDataError::from_io(&e))?;
/// tokio::io::copy(&mut stream, &mut file).await.map_err(|e| gdata::GDataError::from_io(&e))?;
/// # Ok(())
/// # }
/// ```
pub struct DownloadStream {
    reader: StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    content_type: Option<String>,
    content_length: Option<u64>,
}

impl fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadStream")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl DownloadStream {
    /// Send the GET for `uri` and wait for the response headers.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's error, e.g. [`GDataError::NotFound`].
    #[tracing::instrument(skip(service, cancel))]
    pub async fn open(
        service: &Service,
        uri: &str,
        domain: Option<AuthorizationDomain>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let request = ServiceRequest::new(Method::GET, uri).with_domain(domain);
        let response = match service.send(&request, &cancel).await? {
            Conditional::Modified(response) => response,
            Conditional::NotModified => {
                return Err(GDataError::Protocol("unexpected 304 response".to_string()))
            }
        };

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();
        tracing::debug!(?content_type, ?content_length, "download started");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| GDataError::from(e).into_io()))
            .boxed();

        Ok(Self {
            reader: StreamReader::new(body),
            cancelled: Box::pin(cancel.cancelled_owned()),
            content_type,
            content_length,
        })
    }

    /// Download the content an entity links to with `<content src=...>`.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::Protocol`] if the entity has no content URI.
    pub async fn open_content<E: Parsable>(
        service: &Service,
        entity: &E,
        domain: Option<AuthorizationDomain>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let Some(Content::Uri { src, .. }) = &entity.entry().content else {
            return Err(GDataError::Protocol("entry has no content URI".to_string()));
        };
        Self::open(service, src, domain, cancel).await
    }

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
        tracing::debug!("download closed");
    }
}

impl AsyncRead for DownloadStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(GDataError::Cancelled.into_io()));
        }
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}
