//! The authorizer capability.

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::AuthorizationDomain;
use crate::error::Result;

/// Attaches credentials to outgoing requests and refreshes them on demand.
///
/// Implementations are shared by every request a service handle makes and
/// must be safe to call concurrently; any mutable state (tokens, the set of
/// covered domains) is guarded internally.
///
/// # Example
///
/// ```
/// use gdata::auth::{AuthorizationDomain, Authorizer};
/// use reqwest::header::{HeaderValue, AUTHORIZATION};
///
/// #[derive(Debug)]
/// struct ApiKey(String);
///
/// #[async_trait::async_trait]
/// impl Authorizer for ApiKey {
///     fn process_request(&self, _domain: Option<AuthorizationDomain>, request: &mut reqwest::Request) {
///         if let Ok(value) = HeaderValue::from_str(&format!("Key {}", self.0)) {
///             request.headers_mut().insert(AUTHORIZATION, value);
///         }
///     }
///
///     fn is_authorized_for_domain(&self, _domain: AuthorizationDomain) -> bool {
///         true
///     }
/// }
/// ```
#[async_trait]
pub trait Authorizer: Send + Sync + fmt::Debug {
    /// Stamp `request` with credentials for `domain`.
    ///
    /// Without a valid credential the request may be left unchanged; it will
    /// then fail with 401 and the pipeline asks for a refresh.
    fn process_request(&self, domain: Option<AuthorizationDomain>, request: &mut reqwest::Request);

    /// Cheap local check of whether this authorizer currently covers `domain`.
    fn is_authorized_for_domain(&self, domain: AuthorizationDomain) -> bool;

    /// Monotonic counter bumped every time the credentials change.
    fn credential_version(&self) -> u64 {
        0
    }

    /// Obtain new credentials.
    ///
    /// Returns `Ok(false)` when refreshing is not supported, `Ok(true)` on
    /// success and an error on genuine failure. Observing `cancel` yields
    /// [`GDataError::Cancelled`](crate::GDataError::Cancelled).
    async fn refresh_authorization(&self, _cancel: &CancellationToken) -> Result<bool> {
        Ok(false)
    }

    /// Refresh unless the credentials already changed since `seen_version`.
    ///
    /// The pipeline records the version before sending; when several
    /// requests fail together, only the first one to get here needs to hit
    /// the network and the rest retry with the new credentials.
    async fn refresh_authorization_since(
        &self,
        _seen_version: u64,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.refresh_authorization(cancel).await
    }
}
