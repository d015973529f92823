//! List trait for fetching feeds of entities.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthorizationDomain;
use crate::error::Result;
use crate::models::Feed;
use crate::pagination::PaginationType;
use crate::parsable::Parsable;
use crate::query::QueryOps;
use crate::request::Conditional;
use crate::service::Service;

/// Maximum pages to fetch (safety limit).
pub const MAX_PAGES: u32 = 1000;

/// List the entities of a feed with pagination support.
///
/// # Example
///
/// ```no_run
/// use gdata::{Entry, List, PaginationType, Query, Service};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(service: Service) -> gdata::Result<()> {
/// let cancel = CancellationToken::new();
/// let mut query = Query::new(PaginationType::Tokens);
/// query.set_max_results(50);
///
/// // Fetch a single page
/// let page = Entry::list_page(&service, "https://example.com/feed", &mut query, None, &cancel).await?;
///
/// // Fetch all pages
/// let mut query = Query::new(PaginationType::Tokens);
/// let all = Entry::list_all(&service, "https://example.com/feed", &mut query, None, &cancel).await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait List: Sized + Send {
    /// Fetch the page `query` currently points at.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn list_page(
        service: &Service,
        feed_uri: &str,
        query: &mut dyn QueryOps,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Conditional<Feed<Self>>>;

    /// Fetch every page from the query's current position onwards.
    ///
    /// The query's ETag is ignored so every page is downloaded.
    ///
    /// # Errors
    ///
    /// Returns an error if any page request fails.
    async fn list_all(
        service: &Service,
        feed_uri: &str,
        query: &mut dyn QueryOps,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Self>>;
}

#[async_trait]
impl<E: Parsable> List for E {
    async fn list_page(
        service: &Service,
        feed_uri: &str,
        query: &mut dyn QueryOps,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Conditional<Feed<Self>>> {
        service.query(feed_uri, Some(query), domain, cancel).await
    }

    async fn list_all(
        service: &Service,
        feed_uri: &str,
        query: &mut dyn QueryOps,
        domain: Option<AuthorizationDomain>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Self>> {
        let mut all_items = Vec::new();
        let mut page = 1;

        loop {
            query.base_mut().set_etag(None);
            let feed = match Self::list_page(service, feed_uri, &mut *query, domain, cancel).await? {
                Conditional::Modified(feed) => feed,
                Conditional::NotModified => break,
            };
            if feed.is_empty() {
                break;
            }

            let items_count = feed.len();
            let has_next_link = feed.next_link().is_some();
            let page_size = feed.items_per_page;
            all_items.extend(feed.into_entries());

            let base = query.base_mut();
            if base.pagination() == PaginationType::Indexed {
                if base.max_results() == 0 {
                    if !has_next_link {
                        break;
                    }
                    base.set_max_results(page_size.unwrap_or(items_count as u32));
                } else if items_count < base.max_results() as usize {
                    break;
                }
            }
            base.next_page();
            if base.is_finished() {
                break;
            }
            page += 1;

            // Safety limit to prevent infinite loops
            if page > MAX_PAGES {
                tracing::warn!("Reached pagination limit of {} pages, stopping", MAX_PAGES);
                break;
            }
        }

        Ok(all_items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::models::Entry;
    use crate::query::Query;
    use wiremock::matchers::{method, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn json_page(ids: &[&str], next: Option<&str>) -> serde_json::Value {
        let items: Vec<_> = ids.iter().map(|id| serde_json::json!({"id": id})).collect();
        let mut page = serde_json::json!({"kind": "tasks#tasks", "items": items});
        if let Some(next) = next {
            page["nextPageToken"] = serde_json::Value::from(next);
        }
        page
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Task {
        entry: Entry,
    }

    impl Parsable for Task {
        const CONTENT_TYPE: crate::parsable::ContentType = crate::parsable::ContentType::Json;

        fn entry(&self) -> &Entry {
            &self.entry
        }

        fn entry_mut(&mut self) -> &mut Entry {
            &mut self.entry
        }
    }

    #[tokio::test]
    async fn test_list_all_follows_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param_is_missing("pageToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json_page(&["a", "b"], Some("pg2"))))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("pageToken", "pg2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json_page(&["c"], None)))
            .expect(1)
            .mount(&server)
            .await;

        let service = Service::anonymous(ServiceConfig::new("test").with_insecure_http(true)).unwrap();
        let mut query = Query::new(PaginationType::Tokens);
        let tasks = Task::list_all(&service, &server.uri(), &mut query, None, &CancellationToken::new())
            .await
            .unwrap();
        let ids: Vec<_> = tasks.iter().map(|t| t.entry.id.as_deref().unwrap()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_list_all_indexed_stops_on_short_page() {
        let server = MockServer::start().await;
        let feed = |ids: &[&str]| {
            let entries: String = ids
                .iter()
                .map(|id| format!("<entry><id>{id}</id></entry>"))
                .collect();
            format!("<feed xmlns='http://www.w3.org/2005/Atom'><id>f</id>{entries}</feed>")
        };
        Mock::given(method("GET"))
            .and(query_param_is_missing("start-index"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(feed(&["1", "2"]), "application/atom+xml"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("start-index", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(feed(&["3"]), "application/atom+xml"))
            .expect(1)
            .mount(&server)
            .await;

        let service = Service::anonymous(ServiceConfig::new("test").with_insecure_http(true)).unwrap();
        let mut query = Query::default();
        query.set_max_results(2);
        let entries = Entry::list_all(&service, &server.uri(), &mut query, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
    }
}
