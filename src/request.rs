//! The request pipeline.
//!
//! Every request a [`Service`] makes goes through [`Service::send`], which
//! adds the protocol headers, asks the authorizer to stamp the request,
//! follows at most one redirect and refreshes credentials at most once.

use std::future::Future;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, IF_MATCH, IF_NONE_MATCH, LOCATION};
use reqwest::{Method, Response, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthorizationDomain;
use crate::error::{GDataError, Result};
use crate::service::Service;

/// Name of the protocol version header.
pub const GDATA_VERSION: &str = "GData-Version";

/// Outcome of a request that may be answered from the caller's cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conditional<T> {
    Modified(T),
    /// The server answered 304 to `If-None-Match`; keep the cached value.
    NotModified,
}

impl<T> Conditional<T> {
    #[must_use]
    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::NotModified)
    }

    pub fn into_modified(self) -> Option<T> {
        match self {
            Self::Modified(value) => Some(value),
            Self::NotModified => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Conditional<U> {
        match self {
            Self::Modified(value) => Conditional::Modified(f(value)),
            Self::NotModified => Conditional::NotModified,
        }
    }
}

/// A body that can be sent again if the request has to be retried.
#[derive(Debug, Clone)]
pub struct RequestBody {
    pub content_type: String,
    pub data: Bytes,
}

/// One logical request.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
    /// Sent as `If-None-Match` on GET and `If-Match` on PUT, PATCH and DELETE.
    pub etag: Option<String>,
    pub domain: Option<AuthorizationDomain>,
    /// Statuses handed back to the caller as-is, e.g. `308` during a
    /// resumable upload.
    pub passthrough: Vec<StatusCode>,
}

impl ServiceRequest {
    #[must_use]
    pub fn new(method: Method, uri: &str) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            headers: HeaderMap::new(),
            body: None,
            etag: None,
            domain: None,
            passthrough: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, content_type: &str, data: impl Into<Bytes>) -> Self {
        self.body = Some(RequestBody {
            content_type: content_type.to_string(),
            data: data.into(),
        });
        self
    }

    #[must_use]
    pub fn with_etag(mut self, etag: Option<&str>) -> Self {
        self.etag = etag.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_domain(mut self, domain: Option<AuthorizationDomain>) -> Self {
        self.domain = domain;
        self
    }

    #[must_use]
    pub fn with_passthrough(mut self, status: StatusCode) -> Self {
        self.passthrough.push(status);
        self
    }

    fn is_get(&self) -> bool {
        self.method == Method::GET
    }

    fn etag_header(&self) -> Option<HeaderName> {
        match self.method {
            Method::GET => Some(IF_NONE_MATCH),
            Method::PUT | Method::PATCH | Method::DELETE => Some(IF_MATCH),
            _ => None,
        }
    }
}

/// Await `future` unless `cancel` fires first.
pub(crate) async fn cancellable<F, T, E>(cancel: &CancellationToken, future: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<GDataError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GDataError::Cancelled),
        result = future => result.map_err(Into::into),
    }
}

/// Read a whole response body.
pub(crate) async fn read_body(response: Response, cancel: &CancellationToken) -> Result<Bytes> {
    cancellable(cancel, response.bytes()).await
}

/// Resolve a `Location` header against the request URI.
pub(crate) fn location(response: &Response) -> Option<String> {
    let value = response.headers().get(LOCATION)?.to_str().ok()?;
    match response.url().join(value) {
        Ok(url) => Some(url.to_string()),
        Err(_) => Some(value.to_string()),
    }
}

impl Service {
    /// Send one logical request.
    ///
    /// 2xx responses and the request's passthrough statuses are returned
    /// unread. A 304 to a conditional GET is [`Conditional::NotModified`].
    /// A 401 or 403 triggers one credential refresh and retry; a redirect
    /// is followed once. Everything else is classified with
    /// [`GDataError::from_status`].
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::Cancelled`] when `cancel` fires, a transport
    /// error when the server cannot be reached, and the classified status
    /// otherwise.
    #[tracing::instrument(skip(self, request, cancel), fields(method = %request.method, uri = %request.uri))]
    pub async fn send(
        &self,
        request: &ServiceRequest,
        cancel: &CancellationToken,
    ) -> Result<Conditional<Response>> {
        let mut uri = self.config().secure_uri(&request.uri);
        let mut refreshed = false;
        let mut retried = false;
        let mut redirected = false;

        loop {
            let seen_version = self.authorizer().credential_version();
            let http_request = self.build_request(request, &uri)?;
            let response = cancellable(cancel, self.http.execute(http_request)).await?;
            let status = response.status();
            tracing::debug!(%status, "response received");

            if request.passthrough.contains(&status) || status.is_success() {
                return Ok(Conditional::Modified(response));
            }

            if status == StatusCode::NOT_MODIFIED && request.is_get() && request.etag.is_some() {
                return Ok(Conditional::NotModified);
            }

            if status.is_redirection() && !redirected {
                if let Some(target) = location(&response) {
                    tracing::debug!(%target, "following redirect");
                    redirected = true;
                    uri = self.config().secure_uri(&target);
                    continue;
                }
            }

            if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) && !refreshed {
                refreshed = true;
                match self
                    .authorizer()
                    .refresh_authorization_since(seen_version, cancel)
                    .await
                {
                    Ok(true) => {
                        tracing::debug!("credentials refreshed, retrying");
                        retried = true;
                        continue;
                    }
                    Ok(false) => tracing::debug!("authorizer declined to refresh"),
                    Err(GDataError::Cancelled) => return Err(GDataError::Cancelled),
                    Err(err) => {
                        tracing::warn!(error = %err, "credential refresh failed");
                        return Err(GDataError::AuthenticationRequired(err.to_string()));
                    }
                }
            }

            let body = read_body(response, cancel).await?;
            let err = GDataError::from_status(status.as_u16(), request.is_get(), &body);
            return Err(match err {
                GDataError::NotAuthorized(message) if retried => {
                    GDataError::AuthenticationRequired(message)
                }
                err => err,
            });
        }
    }

    /// Send a request whose body can only be produced once, such as a
    /// streamed upload. Credentials are not refreshed; a 401 is reported
    /// as [`GDataError::AuthenticationRequired`].
    pub(crate) async fn send_once(
        &self,
        mut http_request: reqwest::Request,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        self.authorizer().process_request(domain, &mut http_request);
        let is_get = http_request.method() == Method::GET;
        let response = cancellable(cancel, self.http.execute(http_request)).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = read_body(response, cancel).await?;
        Err(GDataError::from_status(status.as_u16(), is_get, &body))
    }

    fn build_request(&self, request: &ServiceRequest, uri: &str) -> Result<reqwest::Request> {
        let mut builder = self
            .http
            .request(request.method.clone(), uri)
            .header(GDATA_VERSION, &self.config().api_version)
            .headers(request.headers.clone());

        if let (Some(etag), Some(header)) = (&request.etag, request.etag_header()) {
            builder = builder.header(header, etag);
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, &body.content_type)
                .body(body.data.clone());
        }

        let mut http_request = builder.build()?;
        if let Some(domain) = request.domain {
            if !self.authorizer().is_authorized_for_domain(domain) {
                tracing::debug!(?domain, "not authorized for domain, sending anyway");
            }
        }
        self.authorizer().process_request(request.domain, &mut http_request);
        Ok(http_request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AnonymousAuthorizer, Authorizer};
    use crate::config::ServiceConfig;
    use async_trait::async_trait;
    use reqwest::header::AUTHORIZATION;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Hands out `token-<n>` and counts refreshes.
    #[derive(Debug, Default)]
    struct CountingAuthorizer {
        version: AtomicU64,
        refreshes: AtomicU32,
        refuse: bool,
    }

    #[async_trait]
    impl Authorizer for CountingAuthorizer {
        fn process_request(&self, _domain: Option<AuthorizationDomain>, request: &mut reqwest::Request) {
            let token = format!("Bearer token-{}", self.version.load(Ordering::SeqCst));
            request
                .headers_mut()
                .insert(AUTHORIZATION, HeaderValue::from_str(&token).unwrap());
        }

        fn is_authorized_for_domain(&self, _domain: AuthorizationDomain) -> bool {
            true
        }

        fn credential_version(&self) -> u64 {
            self.version.load(Ordering::SeqCst)
        }

        async fn refresh_authorization(&self, _cancel: &CancellationToken) -> Result<bool> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Ok(false);
            }
            self.version.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn service(authorizer: Arc<dyn Authorizer>) -> Service {
        let config = ServiceConfig::new("test").with_insecure_http(true);
        Service::new(authorizer, config).unwrap()
    }

    #[tokio::test]
    async fn test_protocol_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header(GDATA_VERSION, "2"))
            .and(header("If-None-Match", "W/\"abc\""))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let service = service(Arc::new(AnonymousAuthorizer));
        let request = ServiceRequest::new(Method::GET, &format!("{}/feed", server.uri()))
            .with_etag(Some("W/\"abc\""));
        let response = service
            .send(&request, &CancellationToken::new())
            .await
            .unwrap()
            .into_modified()
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let service = service(Arc::new(AnonymousAuthorizer));
        let request = ServiceRequest::new(Method::GET, &server.uri()).with_etag(Some("\"e\""));
        let result = service.send(&request, &CancellationToken::new()).await.unwrap();
        assert!(result.is_not_modified());
    }

    #[tokio::test]
    async fn test_refresh_once_then_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Authorization", "Bearer token-0"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("Authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let authorizer = Arc::new(CountingAuthorizer::default());
        let service = service(authorizer.clone());
        let request = ServiceRequest::new(Method::GET, &server.uri());
        service.send(&request, &CancellationToken::new()).await.unwrap();
        assert_eq!(authorizer.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_401_requires_authentication() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let authorizer = Arc::new(CountingAuthorizer::default());
        let service = service(authorizer.clone());
        let request = ServiceRequest::new(Method::GET, &server.uri());
        let err = service
            .send(&request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GDataError::AuthenticationRequired(_)));
        assert_eq!(authorizer.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forbidden_without_refresh_is_not_authorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let authorizer = Arc::new(CountingAuthorizer {
            refuse: true,
            ..CountingAuthorizer::default()
        });
        let service = service(authorizer);
        let request = ServiceRequest::new(Method::GET, &server.uri());
        let err = service
            .send(&request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GDataError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn test_redirect_followed_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .and(header(GDATA_VERSION, "2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let service = service(Arc::new(AnonymousAuthorizer));
        let request = ServiceRequest::new(Method::GET, &format!("{}/old", server.uri()));
        service.send(&request, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_on_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(header("If-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;

        let service = service(Arc::new(AnonymousAuthorizer));
        let request = ServiceRequest::new(Method::PUT, &server.uri())
            .with_etag(Some("\"v1\""))
            .with_body("application/atom+xml", "<entry/>");
        let err = service
            .send(&request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GDataError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let server = MockServer::start().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let service = service(Arc::new(AnonymousAuthorizer));
        let request = ServiceRequest::new(Method::GET, &server.uri());
        let err = service.send(&request, &cancel).await.unwrap_err();
        assert!(matches!(err, GDataError::Cancelled));
    }

    #[test]
    fn test_conditional_map() {
        assert_eq!(Conditional::Modified(2).map(|v| v * 2), Conditional::Modified(4));
        assert!(Conditional::<u8>::NotModified.map(|v| v + 1).is_not_modified());
    }
}
