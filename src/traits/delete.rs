//! Delete trait for removing entities.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthorizationDomain;
use crate::error::Result;
use crate::parsable::Parsable;
use crate::service::Service;

/// Delete an entity through its `edit` link, conditional on its ETag.
#[async_trait]
pub trait Delete: Send + Sync {
    /// # Errors
    ///
    /// Returns [`GDataError::Conflict`](crate::GDataError::Conflict) if the
    /// entity changed on the server, or an error if the request fails.
    async fn delete(
        &self,
        service: &Service,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

#[async_trait]
impl<E: Parsable> Delete for E {
    async fn delete(
        &self,
        service: &Service,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        service.delete_entry(self, domain, cancel).await
    }
}
