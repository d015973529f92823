//! An authorizer that never authorizes anything.

use async_trait::async_trait;

use super::{AuthorizationDomain, Authorizer};

/// Sends every request without credentials. Useful for public feeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousAuthorizer;

#[async_trait]
impl Authorizer for AnonymousAuthorizer {
    fn process_request(&self, _domain: Option<AuthorizationDomain>, _request: &mut reqwest::Request) {}

    fn is_authorized_for_domain(&self, _domain: AuthorizationDomain) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_refresh_is_unsupported() {
        let auth = AnonymousAuthorizer;
        let refreshed = auth
            .refresh_authorization(&CancellationToken::new())
            .await
            .unwrap();
        assert!(!refreshed);
        assert_eq!(auth.credential_version(), 0);
    }

    #[test]
    fn test_leaves_request_untouched() {
        let mut request = reqwest::Request::new(
            reqwest::Method::GET,
            "https://example/feed".parse().unwrap(),
        );
        AnonymousAuthorizer.process_request(None, &mut request);
        assert!(request.headers().is_empty());
    }
}
