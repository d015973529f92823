//! Insert trait for creating entities.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthorizationDomain;
use crate::error::Result;
use crate::parsable::Parsable;
use crate::service::Service;

/// Create a new entity in a feed.
#[async_trait]
pub trait Insert: Sized + Send {
    /// POST the entity to `feed_uri` and return the server's copy, which
    /// carries the new id and ETag.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::AlreadyInserted`](crate::GDataError::AlreadyInserted)
    /// if the entity already has an id, or an error if the request fails.
    async fn insert(
        &self,
        service: &Service,
        feed_uri: &str,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Self>;
}

#[async_trait]
impl<E: Parsable> Insert for E {
    async fn insert(
        &self,
        service: &Service,
        feed_uri: &str,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        service.insert_entry(feed_uri, self, domain, cancel).await
    }
}
