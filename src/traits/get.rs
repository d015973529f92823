//! Get trait for fetching single entities.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthorizationDomain;
use crate::error::{GDataError, Result};
use crate::models::rel;
use crate::parsable::Parsable;
use crate::request::Conditional;
use crate::service::Service;

/// Fetch a single entity by URI.
///
/// Implemented for every [`Parsable`] type.
///
/// # Example
///
/// ```no_run
/// use gdata::{Entry, Get, Service, ServiceConfig};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(service: Service) -> gdata::Result<()> {
/// let cancel = CancellationToken::new();
/// let entry = Entry::get(&service, "https://example.com/feeds/items/1", None, &cancel).await?;
///
/// // Later: only download it again if it changed.
/// if let Some(newer) = entry.refresh(&service, None, &cancel).await?.into_modified() {
///     println!("changed: {:?}", newer.title);
/// }
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Get: Sized + Send {
    /// Fetch the entity at `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::NotFound`] if the entity does not exist, or an
    /// error if the request fails.
    async fn get(
        service: &Service,
        uri: &str,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Self>;

    /// Fetch the entity again from its `self` link, conditional on its ETag.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::Protocol`] if the entity has no `self` link.
    async fn refresh(
        &self,
        service: &Service,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Conditional<Self>>;
}

#[async_trait]
impl<E: Parsable> Get for E {
    async fn get(
        service: &Service,
        uri: &str,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        match service.query_single_entry(uri, None, domain, cancel).await? {
            Conditional::Modified(entity) => Ok(entity),
            Conditional::NotModified => Err(GDataError::Protocol(
                "unconditional request returned 304".to_string(),
            )),
        }
    }

    async fn refresh(
        &self,
        service: &Service,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Conditional<Self>> {
        let entry = self.entry();
        let uri = entry
            .look_up_link(rel::SELF)
            .map(|l| l.href.clone())
            .ok_or_else(|| GDataError::Protocol("entry has no self link".to_string()))?;
        service
            .query_single_entry(&uri, entry.etag.as_deref(), domain, cancel)
            .await
    }
}
