//! The service handle.
//!
//! A [`Service`] holds the HTTP client, the authorizer and the service
//! configuration. Entity-level operations live here; per-entity
//! conveniences are provided by the traits in [`crate::traits`].

use std::fmt;
use std::sync::Arc;

use reqwest::{Client, Method, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::auth::{AnonymousAuthorizer, AuthorizationDomain, Authorizer};
use crate::config::ServiceConfig;
use crate::error::{GDataError, Result};
use crate::models::Feed;
use crate::parsable::{self, Parsable};
use crate::query::{QueryOps, QueryParams};
use crate::request::{read_body, Conditional, ServiceRequest};

/// Handle to one GData service.
///
/// Cheaply cloneable; clones share the connection pool and the authorizer.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use gdata::auth::{domains, OAuth2Authorizer, OAuth2Config, ServiceKind};
/// use gdata::{Entry, Query, PaginationType, Service, ServiceConfig};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> gdata::Result<()> {
/// let authorizer = OAuth2Authorizer::new(
///     OAuth2Config::new("client-id", "client-secret"),
///     domains::for_service(ServiceKind::Calendar),
/// )
/// .with_tokens(Some("access"), Some("refresh"));
///
/// let service = Service::new(Arc::new(authorizer), ServiceConfig::new("my-app"))?;
/// let mut query = Query::new(PaginationType::Indexed);
/// query.set_max_results(25);
///
/// let feed = service
///     .query::<Entry>(
///         "https://www.google.com/calendar/feeds/default/owncalendars/full",
///         Some(&mut query),
///         Some(domains::calendar()),
///         &CancellationToken::new(),
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Service {
    pub(crate) http: Client,
    authorizer: Arc<dyn Authorizer>,
    config: Arc<ServiceConfig>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("authorizer", &self.authorizer)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Create a service handle.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the HTTP client cannot be built.
    pub fn new(authorizer: Arc<dyn Authorizer>, config: ServiceConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent())
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .redirect(reqwest::redirect::Policy::none());
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            http: builder.build()?,
            authorizer,
            config: Arc::new(config),
        })
    }

    /// A service that sends no credentials.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the HTTP client cannot be built.
    pub fn anonymous(config: ServiceConfig) -> Result<Self> {
        Self::new(Arc::new(AnonymousAuthorizer), config)
    }

    #[must_use]
    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Whether the authorizer currently covers `domain`.
    #[must_use]
    pub fn is_authorized(&self, domain: AuthorizationDomain) -> bool {
        self.authorizer.is_authorized_for_domain(domain)
    }

    /// Query a feed.
    ///
    /// With a query, its ETag is sent as `If-None-Match` and, on success,
    /// replaced by the feed's; its page cursors are updated so
    /// [`Query::next_page`](crate::Query::next_page) can continue. A query
    /// that already consumed its last page returns an empty feed without
    /// touching the network.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's error, [`GDataError::BadQueryParameter`] when
    /// the query fails validation, or a parser error for a malformed feed.
    pub async fn query<E: Parsable>(
        &self,
        feed_uri: &str,
        query: Option<&mut dyn QueryOps>,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Conditional<Feed<E>>> {
        self.query_with_progress(feed_uri, query, domain, cancel, |_, _, _| {})
            .await
    }

    /// [`query`](Self::query), calling `progress(index, total, entry)` once
    /// per decoded entry, in document order.
    ///
    /// # Errors
    ///
    /// See [`query`](Self::query).
    #[tracing::instrument(skip(self, query, cancel, progress))]
    pub async fn query_with_progress<E, F>(
        &self,
        feed_uri: &str,
        mut query: Option<&mut dyn QueryOps>,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
        progress: F,
    ) -> Result<Conditional<Feed<E>>>
    where
        E: Parsable,
        F: FnMut(usize, Option<u32>, &E) + Send,
    {
        let (uri, etag) = match query.as_deref() {
            Some(q) => {
                if q.base().is_finished() {
                    tracing::debug!("query already returned its last page");
                    return Ok(Conditional::Modified(Feed::empty()));
                }
                q.validate()?;
                (q.build_uri(feed_uri), q.base().etag().map(str::to_string))
            }
            None => (feed_uri.to_string(), None),
        };

        let request = ServiceRequest::new(Method::GET, &self.localized(&uri))
            .with_etag(etag.as_deref())
            .with_domain(domain);
        let response = match self.send(&request, cancel).await? {
            Conditional::Modified(response) => response,
            Conditional::NotModified => return Ok(Conditional::NotModified),
        };

        let body = read_body(response, cancel).await?;
        let feed = Feed::<E>::parse_with_progress(&body, progress)?;
        tracing::debug!(entries = feed.len(), "feed decoded");

        if let Some(q) = query.as_deref_mut() {
            q.base_mut().apply_feed(&feed);
        }
        Ok(Conditional::Modified(feed))
    }

    /// Fetch a single entry, conditionally on `etag`.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::NotFound`] for a missing entry, otherwise the
    /// pipeline's or the parser's error.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn query_single_entry<E: Parsable>(
        &self,
        entry_uri: &str,
        etag: Option<&str>,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Conditional<E>> {
        let request = ServiceRequest::new(Method::GET, &self.localized(entry_uri))
            .with_etag(etag)
            .with_domain(domain);
        match self.send(&request, cancel).await? {
            Conditional::Modified(response) => {
                let body = read_body(response, cancel).await?;
                Ok(Conditional::Modified(parsable::parse_from_bytes(&body)?))
            }
            Conditional::NotModified => Ok(Conditional::NotModified),
        }
    }

    /// POST a new entry to `upload_uri` and return the server's copy.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::AlreadyInserted`] if the entry has an id.
    #[tracing::instrument(skip(self, entry, cancel))]
    pub async fn insert_entry<E: Parsable>(
        &self,
        upload_uri: &str,
        entry: &E,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<E> {
        if entry.entry().is_inserted() {
            return Err(GDataError::AlreadyInserted);
        }
        let request = ServiceRequest::new(Method::POST, upload_uri)
            .with_body(E::CONTENT_TYPE.mime_type(), parsable::serialize(entry))
            .with_domain(domain);
        self.send_entity(&request, cancel).await
    }

    /// PUT an entry back to its `edit` link, conditional on its ETag.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::Conflict`] if the entry changed on the server
    /// and [`GDataError::Protocol`] if it has no edit or self link.
    #[tracing::instrument(skip(self, entry, cancel))]
    pub async fn update_entry<E: Parsable>(
        &self,
        entry: &E,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<E> {
        let uri = edit_uri(entry)?;
        let request = ServiceRequest::new(Method::PUT, uri)
            .with_etag(entry.entry().etag.as_deref())
            .with_body(E::CONTENT_TYPE.mime_type(), parsable::serialize(entry))
            .with_domain(domain);
        self.send_entity(&request, cancel).await
    }

    /// DELETE an entry via its `edit` link, conditional on its ETag.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::Conflict`] if the entry changed on the server.
    #[tracing::instrument(skip(self, entry, cancel))]
    pub async fn delete_entry<E: Parsable>(
        &self,
        entry: &E,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let uri = edit_uri(entry)?;
        let request = ServiceRequest::new(Method::DELETE, uri)
            .with_etag(entry.entry().etag.as_deref())
            .with_domain(domain);
        match self.send(&request, cancel).await? {
            Conditional::Modified(_) | Conditional::NotModified => Ok(()),
        }
    }

    async fn send_entity<E: Parsable>(
        &self,
        request: &ServiceRequest,
        cancel: &CancellationToken,
    ) -> Result<E> {
        let response = match self.send(request, cancel).await? {
            Conditional::Modified(response) => response,
            Conditional::NotModified => {
                return Err(GDataError::Protocol("unexpected 304 response".to_string()))
            }
        };
        let status = response.status();
        let body = read_body(response, cancel).await?;
        if status == StatusCode::NO_CONTENT || body.is_empty() {
            return Err(GDataError::Protocol(format!(
                "HTTP {status} response has no entity"
            )));
        }
        Ok(parsable::parse_from_bytes(&body)?)
    }

    /// Append the configured locale as `hl` unless the URI already has one.
    pub(crate) fn localized(&self, uri: &str) -> String {
        let Some(locale) = &self.config.locale else {
            return uri.to_string();
        };
        if uri.contains("?hl=") || uri.contains("&hl=") {
            return uri.to_string();
        }
        let mut params = QueryParams::new(uri);
        params.push("hl", locale);
        params.finish()
    }
}

fn edit_uri<E: Parsable>(entry: &E) -> Result<&str> {
    entry
        .entry()
        .edit_uri()
        .ok_or_else(|| GDataError::Protocol("entry has no edit or self link".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{rel, Entry, Link};
    use crate::pagination::PaginationType;
    use crate::query::Query;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ATOM: &str = "application/atom+xml";

    fn service() -> Service {
        Service::anonymous(ServiceConfig::new("test").with_insecure_http(true)).unwrap()
    }

    fn entry_xml(id: &str, etag: &str, title: &str, edit: &str) -> String {
        format!(
            "<entry xmlns='http://www.w3.org/2005/Atom' xmlns:gd='http://schemas.google.com/g/2005' \
             gd:etag='{etag}'><id>{id}</id><title type='text'>{title}</title>\
             <updated>2009-06-01T10:00:00Z</updated>\
             <link rel='edit' href='{edit}'/></entry>"
        )
    }

    fn feed_xml(entries: &[String], extra: &str) -> String {
        format!(
            "<feed xmlns='http://www.w3.org/2005/Atom' xmlns:gd='http://schemas.google.com/g/2005' \
             gd:etag='W/\"feed1\"'><id>feed</id><title>Feed</title>\
             <updated>2009-06-01T10:00:00Z</updated>{extra}{}</feed>",
            entries.join("")
        )
    }

    #[tokio::test]
    async fn test_query_updates_etag() {
        let server = MockServer::start().await;
        let body = feed_xml(
            &[entry_xml("e1", "\"a\"", "One", "http://x/e1")],
            "",
        );
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(query_param("max-results", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, ATOM))
            .expect(1)
            .mount(&server)
            .await;

        let mut query = Query::default();
        query.set_max_results(10);
        let feed = service()
            .query::<Entry>(
                &format!("{}/feed", server.uri()),
                Some(&mut query),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .into_modified()
            .unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(query.etag(), Some("W/\"feed1\""));
    }

    #[tokio::test]
    async fn test_query_not_modified_keeps_etag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "W/\"abc\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let mut query = Query::default();
        query.set_max_results(10);
        query.set_etag(Some("W/\"abc\""));
        let result = service()
            .query::<Entry>(&server.uri(), Some(&mut query), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_not_modified());
        assert_eq!(query.etag(), Some("W/\"abc\""));
    }

    #[tokio::test]
    async fn test_finished_query_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let mut query = Query::new(PaginationType::Tokens);
        query.next_page();
        let feed = service()
            .query::<Entry>(&server.uri(), Some(&mut query), None, &CancellationToken::new())
            .await
            .unwrap()
            .into_modified()
            .unwrap();
        assert!(feed.is_empty());
    }

    #[tokio::test]
    async fn test_locale_appended() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("hl", "en_GB"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(feed_xml(&[], ""), ATOM))
            .expect(1)
            .mount(&server)
            .await;

        let config = ServiceConfig::new("test")
            .with_insecure_http(true)
            .with_locale("en_GB");
        let service = Service::anonymous(config).unwrap();
        service
            .query::<Entry>(&server.uri(), None, None, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_insert_rejects_inserted_entry() {
        let mut entry = Entry::new("x");
        entry.id = Some("https://example/e/1".into());
        let err = service()
            .insert_entry("https://example/feed", &entry, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GDataError::AlreadyInserted));
    }

    #[tokio::test]
    async fn test_insert_returns_server_entry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/feed"))
            .and(header("Content-Type", ATOM))
            .and(body_string_contains("<title type=\"text\">New</title>"))
            .respond_with(ResponseTemplate::new(201).set_body_raw(
                entry_xml("https://example/e/42", "\"v1\"", "New", "http://x/e/42"),
                ATOM,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let inserted = service()
            .insert_entry(
                &format!("{}/feed", server.uri()),
                &Entry::new("New"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(inserted.id.as_deref(), Some("https://example/e/42"));
        assert_eq!(inserted.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn test_update_uses_edit_link_and_etag() {
        let server = MockServer::start().await;
        let edit = format!("{}/e/1", server.uri());
        Mock::given(method("PUT"))
            .and(path("/e/1"))
            .and(header("If-Match", "\"v1\""))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(entry_xml("e1", "\"v2\"", "Renamed", &edit), ATOM),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut entry = Entry::new("Renamed");
        entry.id = Some("e1".into());
        entry.etag = Some("\"v1\"".into());
        entry.add_link(Link::new(rel::EDIT, &edit));

        let updated = service()
            .update_entry(&entry, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(updated.id, entry.id);
        assert_eq!(updated.etag.as_deref(), Some("\"v2\""));
    }

    #[tokio::test]
    async fn test_update_without_edit_link() {
        let err = service()
            .update_entry(&Entry::new("x"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GDataError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_delete_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;

        let mut entry = Entry::new("x");
        entry.etag = Some("\"old\"".into());
        entry.add_link(Link::new(rel::EDIT, &format!("{}/e/1", server.uri())));
        let err = service()
            .delete_entry(&entry, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GDataError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_single_entry_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = service()
            .query_single_entry::<Entry>(&server.uri(), None, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GDataError::NotFound(_)));
    }
}
