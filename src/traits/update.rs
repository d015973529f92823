//! Update trait for modifying entities.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthorizationDomain;
use crate::error::Result;
use crate::parsable::Parsable;
use crate::service::Service;

/// Update an existing entity.
///
/// The entity is sent to its `edit` link with `If-Match` set to its ETag,
/// so an entity changed on the server since it was fetched is rejected
/// with [`GDataError::Conflict`](crate::GDataError::Conflict).
///
/// # Example
///
/// ```no_run
/// use gdata::{Entry, Get, Service, Update};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(service: Service) -> gdata::Result<()> {
/// let cancel = CancellationToken::new();
/// let mut entry = Entry::get(&service, "https://example.com/feeds/items/1", None, &cancel).await?;
/// entry.title = Some("New Title".to_string());
/// let updated = entry.update(&service, None, &cancel).await?;
/// assert_ne!(updated.etag, entry.etag);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Update: Sized + Send {
    /// Update the entity and return the server's new version.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity changed on the server or the request
    /// fails.
    async fn update(
        &self,
        service: &Service,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Self>;
}

#[async_trait]
impl<E: Parsable> Update for E {
    async fn update(
        &self,
        service: &Service,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        service.update_entry(self, domain, cancel).await
    }
}
