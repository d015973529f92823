//! Query parameters and request URI construction.
//!
//! A [`Query`] is a reusable parameter set. Changing any parameter clears the
//! cached ETag, so a stale ETag never suppresses the next request. Services
//! with extra parameters wrap a `Query` and implement [`QueryOps`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{GDataError, Result};
use crate::models::Feed;
use crate::pagination::{PageCursor, PaginationType};
use crate::parsable::format_iso8601;

/// Parameter names written by [`Query`] itself.
const RESERVED_PARAMS: &[&str] = &[
    "q",
    "author",
    "orderby",
    "updated-min",
    "updated-max",
    "published-min",
    "published-max",
    "start-index",
    "strict",
    "max-results",
    "pageToken",
    "hl",
];

/// Incrementally built query URI.
#[derive(Debug, Clone)]
pub struct QueryParams {
    uri: String,
    params_started: bool,
}

impl QueryParams {
    #[must_use]
    pub fn new(feed_uri: &str) -> Self {
        Self {
            uri: feed_uri.to_string(),
            params_started: feed_uri.contains('?'),
        }
    }

    /// Append `name=value`, escaping the value.
    pub fn push(&mut self, name: &str, value: &str) {
        self.push_raw(name, &urlencoding::encode(value));
    }

    /// Append `name=value` with the value already escaped.
    pub fn push_raw(&mut self, name: &str, value: &str) {
        self.uri.push(if self.params_started { '&' } else { '?' });
        self.params_started = true;
        self.uri.push_str(name);
        self.uri.push('=');
        self.uri.push_str(value);
    }

    /// Append path segments; only valid before any parameter.
    fn push_path(&mut self, path: &str) {
        self.uri.push_str(path);
    }

    #[must_use]
    pub fn finish(self) -> String {
        self.uri
    }
}

/// The standard GData query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    q: Option<String>,
    search_clauses: Vec<String>,
    categories: Option<String>,
    author: Option<String>,
    order_by: Option<String>,
    updated_min: Option<DateTime<Utc>>,
    updated_max: Option<DateTime<Utc>>,
    published_min: Option<DateTime<Utc>>,
    published_max: Option<DateTime<Utc>>,
    start_index: u32,
    max_results: u32,
    max_results_limit: Option<u32>,
    strict: bool,
    etag: Option<String>,
    pagination: PaginationType,
    cursor: PageCursor,
    params: BTreeMap<String, String>,
}

impl Default for Query {
    fn default() -> Self {
        Self::new(PaginationType::Indexed)
    }
}

impl Query {
    /// Create an empty query for a service paginating with `pagination`.
    #[must_use]
    pub fn new(pagination: PaginationType) -> Self {
        Self {
            q: None,
            search_clauses: Vec::new(),
            categories: None,
            author: None,
            order_by: None,
            updated_min: None,
            updated_max: None,
            published_min: None,
            published_max: None,
            start_index: 0,
            max_results: 0,
            max_results_limit: None,
            strict: false,
            etag: None,
            pagination,
            cursor: PageCursor::default(),
            params: BTreeMap::new(),
        }
    }

    /// Cap `max-results` at a service-specific limit.
    #[must_use]
    pub fn with_max_results_limit(mut self, limit: u32) -> Self {
        self.max_results_limit = Some(limit);
        self.max_results = self.max_results.min(limit);
        self
    }

    #[must_use]
    pub fn pagination(&self) -> PaginationType {
        self.pagination
    }

    #[must_use]
    pub fn q(&self) -> Option<&str> {
        self.q.as_deref()
    }

    /// Free-text search terms.
    pub fn set_q(&mut self, q: Option<&str>) {
        self.q = q.map(str::to_string);
        self.clear_etag();
    }

    /// AND an extra clause onto the `q` parameter. Services use this for
    /// properties that are expressed as search clauses on the wire.
    pub fn add_search_clause(&mut self, clause: &str) {
        if !clause.is_empty() {
            self.search_clauses.push(clause.to_string());
            self.clear_etag();
        }
    }

    pub fn clear_search_clauses(&mut self) {
        self.search_clauses.clear();
        self.clear_etag();
    }

    #[must_use]
    pub fn categories(&self) -> Option<&str> {
        self.categories.as_deref()
    }

    /// Category filter, e.g. `"Fritz|Laurie/-Hugh"`, sent as `/-/<categories>`.
    pub fn set_categories(&mut self, categories: Option<&str>) {
        self.categories = categories.map(str::to_string);
        self.clear_etag();
    }

    #[must_use]
    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn set_author(&mut self, author: Option<&str>) {
        self.author = author.map(str::to_string);
        self.clear_etag();
    }

    #[must_use]
    pub fn order_by(&self) -> Option<&str> {
        self.order_by.as_deref()
    }

    pub fn set_order_by(&mut self, order_by: Option<&str>) {
        self.order_by = order_by.map(str::to_string);
        self.clear_etag();
    }

    #[must_use]
    pub fn updated_min(&self) -> Option<DateTime<Utc>> {
        self.updated_min
    }

    pub fn set_updated_min(&mut self, value: Option<DateTime<Utc>>) {
        self.updated_min = value;
        self.clear_etag();
    }

    #[must_use]
    pub fn updated_max(&self) -> Option<DateTime<Utc>> {
        self.updated_max
    }

    pub fn set_updated_max(&mut self, value: Option<DateTime<Utc>>) {
        self.updated_max = value;
        self.clear_etag();
    }

    #[must_use]
    pub fn published_min(&self) -> Option<DateTime<Utc>> {
        self.published_min
    }

    pub fn set_published_min(&mut self, value: Option<DateTime<Utc>>) {
        self.published_min = value;
        self.clear_etag();
    }

    #[must_use]
    pub fn published_max(&self) -> Option<DateTime<Utc>> {
        self.published_max
    }

    pub fn set_published_max(&mut self, value: Option<DateTime<Utc>>) {
        self.published_max = value;
        self.clear_etag();
    }

    #[must_use]
    pub fn start_index(&self) -> u32 {
        self.start_index
    }

    /// One-based index of the first result; `0` leaves it unset.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::BadQueryParameter`] unless the query uses
    /// indexed pagination.
    pub fn set_start_index(&mut self, start_index: u32) -> Result<()> {
        self.require_pagination(PaginationType::Indexed, "start-index")?;
        self.start_index = start_index;
        self.clear_etag();
        Ok(())
    }

    #[must_use]
    pub fn max_results(&self) -> u32 {
        self.max_results
    }

    /// Page size; `0` leaves it to the server. Capped at the service limit.
    pub fn set_max_results(&mut self, max_results: u32) {
        self.max_results = match self.max_results_limit {
            Some(limit) => max_results.min(limit),
            None => max_results,
        };
        self.clear_etag();
    }

    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
        self.clear_etag();
    }

    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Set the ETag to send as `If-None-Match`. This is the one setter that
    /// does not clear it.
    pub fn set_etag(&mut self, etag: Option<&str>) {
        self.etag = etag.map(str::to_string);
    }

    /// Resume from an explicit page token.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::BadQueryParameter`] unless the query uses token
    /// pagination.
    pub fn set_page_token(&mut self, token: Option<&str>) -> Result<()> {
        self.require_pagination(PaginationType::Tokens, "pageToken")?;
        self.cursor.next_page_token = token.map(str::to_string);
        self.cursor.use_next_page = token.is_some();
        self.cursor.use_previous_page = false;
        self.clear_etag();
        Ok(())
    }

    /// Token of the page after the last one fetched.
    #[must_use]
    pub fn next_page_token(&self) -> Option<&str> {
        self.cursor.next_page_token.as_deref()
    }

    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Set a service-specific parameter.
    ///
    /// # Errors
    ///
    /// Returns [`GDataError::BadQueryParameter`] for names this query writes
    /// itself or an empty name.
    pub fn set_param(&mut self, name: &str, value: Option<&str>) -> Result<()> {
        if name.is_empty() || RESERVED_PARAMS.contains(&name) {
            return Err(GDataError::BadQueryParameter(format!(
                "'{name}' cannot be set as a custom parameter"
            )));
        }
        match value {
            Some(v) => {
                self.params.insert(name.to_string(), v.to_string());
            }
            None => {
                self.params.remove(name);
            }
        }
        self.clear_etag();
        Ok(())
    }

    /// Move to the next page of results.
    pub fn next_page(&mut self) {
        match self.pagination {
            PaginationType::Indexed => {
                if self.start_index == 0 {
                    self.start_index += 1;
                }
                self.start_index += self.max_results;
            }
            PaginationType::Uris | PaginationType::Tokens => {
                self.cursor.use_next_page = true;
                self.cursor.use_previous_page = false;
            }
        }
        self.clear_etag();
    }

    /// Move to the previous page. Returns false when there is none.
    pub fn previous_page(&mut self) -> bool {
        let moved = match self.pagination {
            PaginationType::Indexed => {
                if self.start_index <= self.max_results {
                    false
                } else {
                    self.start_index -= self.max_results;
                    if self.start_index == 1 {
                        self.start_index = 0;
                    }
                    true
                }
            }
            PaginationType::Uris => {
                if self.cursor.previous_uri.is_some() {
                    self.cursor.use_next_page = false;
                    self.cursor.use_previous_page = true;
                    true
                } else {
                    false
                }
            }
            // Tokens only ever point forwards.
            PaginationType::Tokens => false,
        };
        if moved {
            self.clear_etag();
        }
        moved
    }

    /// Whether a follow-up query would request a page past the end.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.cursor.is_finished(self.pagination)
    }

    /// Record what a successful query returned: its ETag and the cursors to
    /// the adjacent pages.
    pub(crate) fn apply_feed<E>(&mut self, feed: &Feed<E>) {
        self.etag = feed.etag.clone();
        self.cursor.clear(self.pagination);
        match self.pagination {
            PaginationType::Indexed => {}
            PaginationType::Uris => {
                self.cursor.next_uri = feed.next_link().map(|l| l.href.clone());
                self.cursor.previous_uri = feed.previous_link().map(|l| l.href.clone());
            }
            PaginationType::Tokens => {
                self.cursor.next_page_token = feed.next_page_token.clone();
            }
        }
    }

    /// Write the standard parameters.
    pub fn append_base_params(&self, params: &mut QueryParams) {
        if let Some(categories) = &self.categories {
            let escaped: Vec<_> = categories
                .split('/')
                .map(|segment| urlencoding::encode(segment).into_owned())
                .collect();
            params.push_path("/-/");
            params.push_path(&escaped.join("/"));
        }

        if self.q.is_some() || !self.search_clauses.is_empty() {
            let mut terms: Vec<&str> = Vec::new();
            if let Some(q) = &self.q {
                terms.push(q);
            }
            let internal = self.search_clauses.join(" and ");
            if !internal.is_empty() {
                terms.push(&internal);
            }
            params.push("q", &terms.join(" and "));
        }

        if let Some(author) = &self.author {
            params.push("author", author);
        }
        if let Some(order_by) = &self.order_by {
            params.push("orderby", order_by);
        }

        let bounds = [
            ("updated-min", &self.updated_min),
            ("updated-max", &self.updated_max),
            ("published-min", &self.published_min),
            ("published-max", &self.published_max),
        ];
        for (name, value) in bounds {
            if let Some(value) = value {
                params.push_raw(name, &format_iso8601(value));
            }
        }

        if self.start_index > 0 {
            params.push_raw("start-index", &self.start_index.to_string());
        }
        if self.strict {
            params.push_raw("strict", "true");
        }
        if self.max_results > 0 {
            params.push_raw("max-results", &self.max_results.to_string());
        }
        if let Some(token) = self.cursor.page_token(self.pagination) {
            params.push("pageToken", token);
        }

        for (name, value) in &self.params {
            params.push(name, value);
        }
    }

    fn clear_etag(&mut self) {
        self.etag = None;
    }

    fn require_pagination(&self, wanted: PaginationType, param: &str) -> Result<()> {
        if self.pagination == wanted {
            return Ok(());
        }
        Err(GDataError::BadQueryParameter(format!(
            "'{param}' requires {wanted:?} pagination but this query uses {:?}",
            self.pagination
        )))
    }
}

/// A query the service can turn into a request URI.
///
/// Service-specific queries wrap a [`Query`], return it from
/// [`base`](QueryOps::base) and add their own parameters in
/// [`append_query_params`](QueryOps::append_query_params), which runs after
/// the standard ones.
///
/// # Example
///
/// ```
/// use gdata::{PaginationType, Query, QueryOps, QueryParams};
///
/// #[derive(Debug)]
/// struct TasksQuery {
///     base: Query,
///     show_completed: bool,
/// }
///
/// impl QueryOps for TasksQuery {
///     fn base(&self) -> &Query { &self.base }
///     fn base_mut(&mut self) -> &mut Query { &mut self.base }
///
///     fn append_query_params(&self, params: &mut QueryParams) {
///         if self.show_completed {
///             params.push("showCompleted", "true");
///         }
///     }
/// }
///
/// let mut query = TasksQuery { base: Query::new(PaginationType::Tokens), show_completed: true };
/// query.base_mut().set_max_results(20);
/// assert_eq!(
///     query.build_uri("https://www.googleapis.com/tasks/v1/users/@me/lists"),
///     "https://www.googleapis.com/tasks/v1/users/@me/lists?max-results=20&showCompleted=true"
/// );
/// ```
pub trait QueryOps: Send + Sync + fmt::Debug {
    fn base(&self) -> &Query;

    fn base_mut(&mut self) -> &mut Query;

    /// Append service-specific parameters.
    fn append_query_params(&self, _params: &mut QueryParams) {}

    /// Reject parameters the service does not accept before any request.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Build the request URI for `feed_uri`.
    fn build_uri(&self, feed_uri: &str) -> String {
        let base = self.base();
        if let Some(uri) = base.cursor.pagination_uri(base.pagination) {
            return uri.to_string();
        }
        let mut params = QueryParams::new(feed_uri);
        base.append_base_params(&mut params);
        self.append_query_params(&mut params);
        params.finish()
    }
}

impl QueryOps for Query {
    fn base(&self) -> &Query {
        self
    }

    fn base_mut(&mut self) -> &mut Query {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{rel, Link};
    use chrono::TimeZone;

    const FEED: &str = "https://example.com/feeds/items";

    #[test]
    fn test_every_setter_clears_etag() {
        let setters: Vec<Box<dyn Fn(&mut Query)>> = vec![
            Box::new(|q| q.set_q(Some("x"))),
            Box::new(|q| q.set_categories(Some("a"))),
            Box::new(|q| q.set_author(Some("me"))),
            Box::new(|q| q.set_order_by(Some("updated"))),
            Box::new(|q| q.set_updated_min(Some(Utc::now()))),
            Box::new(|q| q.set_updated_max(Some(Utc::now()))),
            Box::new(|q| q.set_published_min(Some(Utc::now()))),
            Box::new(|q| q.set_published_max(Some(Utc::now()))),
            Box::new(|q| q.set_start_index(5).unwrap()),
            Box::new(|q| q.set_max_results(10)),
            Box::new(|q| q.set_strict(true)),
            Box::new(|q| q.set_param("alt", Some("json")).unwrap()),
            Box::new(|q| q.add_search_clause("trashed = false")),
            Box::new(|q| q.next_page()),
        ];
        for setter in setters {
            let mut query = Query::default();
            query.set_etag(Some("W/\"abc\""));
            setter(&mut query);
            assert_eq!(query.etag(), None);
        }
    }

    #[test]
    fn test_uri_parameter_order() {
        let mut query = Query::default();
        query.set_categories(Some("Fritz/Laurie"));
        query.set_q(Some("fish chips"));
        query.set_author(Some("joe"));
        query.set_updated_min(Some(Utc.with_ymd_and_hms(2009, 1, 1, 0, 0, 0).unwrap()));
        query.set_start_index(11).unwrap();
        query.set_strict(true);
        query.set_max_results(10);

        assert_eq!(
            query.build_uri(FEED),
            "https://example.com/feeds/items/-/Fritz/Laurie?q=fish%20chips&author=joe\
             &updated-min=2009-01-01T00:00:00Z&start-index=11&strict=true&max-results=10"
        );
    }

    #[test]
    fn test_existing_query_string_uses_ampersand() {
        let mut query = Query::default();
        query.set_max_results(5);
        assert_eq!(
            query.build_uri("https://example.com/feed?alt=json"),
            "https://example.com/feed?alt=json&max-results=5"
        );
    }

    #[test]
    fn test_search_clauses_joined() {
        let mut query = Query::default();
        query.set_q(Some("title contains 'x'"));
        query.add_search_clause("trashed = false");
        let uri = query.build_uri(FEED);
        let parsed: std::collections::HashMap<String, String> =
            serde_qs::from_str(uri.split_once('?').unwrap().1).unwrap();
        assert_eq!(parsed["q"], "title contains 'x' and trashed = false");
    }

    #[test]
    fn test_same_values_same_uri() {
        let build = || {
            let mut query = Query::new(PaginationType::Tokens);
            query.set_param("zeta", Some("1")).unwrap();
            query.set_param("alpha", Some("2")).unwrap();
            query.set_max_results(3);
            query.build_uri(FEED)
        };
        assert_eq!(build(), build());
        assert!(build().ends_with("max-results=3&alpha=2&zeta=1"));
    }

    #[test]
    fn test_reserved_params_rejected() {
        let mut query = Query::default();
        for name in ["q", "max-results", "pageToken", ""] {
            assert!(matches!(
                query.set_param(name, Some("x")),
                Err(GDataError::BadQueryParameter(_))
            ));
        }
    }

    #[test]
    fn test_wrong_pagination_mode_is_error() {
        let mut tokens = Query::new(PaginationType::Tokens);
        assert!(tokens.set_start_index(3).is_err());

        let mut indexed = Query::default();
        assert!(indexed.set_page_token(Some("pg2")).is_err());
    }

    #[test]
    fn test_max_results_capped() {
        let mut query = Query::new(PaginationType::Tokens).with_max_results_limit(100);
        query.set_max_results(1000);
        assert_eq!(query.max_results(), 100);
    }

    #[test]
    fn test_indexed_paging() {
        let mut query = Query::default();
        query.set_max_results(10);
        query.next_page();
        assert_eq!(query.start_index(), 11);
        query.next_page();
        assert_eq!(query.start_index(), 21);
        assert!(query.previous_page());
        assert_eq!(query.start_index(), 11);
        assert!(query.previous_page());
        assert_eq!(query.start_index(), 0);
        assert!(!query.previous_page());
    }

    #[test]
    fn test_token_paging_from_feed() {
        let mut query = Query::new(PaginationType::Tokens);
        let mut feed: Feed<crate::Entry> = Feed::empty();
        feed.etag = Some("\"f1\"".into());
        feed.next_page_token = Some("pg2".into());

        query.apply_feed(&feed);
        assert_eq!(query.etag(), Some("\"f1\""));
        assert!(!query.build_uri(FEED).contains("pageToken"));

        query.next_page();
        assert_eq!(query.etag(), None);
        assert_eq!(query.build_uri(FEED), format!("{FEED}?pageToken=pg2"));
        assert!(!query.previous_page());

        // Last page: no token advertised.
        query.apply_feed(&Feed::<crate::Entry>::empty());
        assert!(!query.is_finished());
        query.next_page();
        assert!(query.is_finished());
    }

    #[test]
    fn test_feed_without_etag_clears_stale_etag() {
        let mut query = Query::default();
        query.set_etag(Some("W/\"old\""));
        query.apply_feed(&Feed::<crate::Entry>::empty());
        assert_eq!(query.etag(), None);
    }

    #[test]
    fn test_explicit_page_token() {
        let mut query = Query::new(PaginationType::Tokens);
        query.set_page_token(Some("pg2")).unwrap();
        assert_eq!(query.build_uri(FEED), format!("{FEED}?pageToken=pg2"));
    }

    #[test]
    fn test_uri_paging_follows_links() {
        let mut query = Query::new(PaginationType::Uris);
        let mut feed: Feed<crate::Entry> = Feed::empty();
        feed.links.push(Link::new(rel::NEXT, "https://example.com/feed?page=2"));
        feed.links.push(Link::new(rel::PREVIOUS, "https://example.com/feed?page=0"));
        query.apply_feed(&feed);

        query.next_page();
        assert_eq!(query.build_uri(FEED), "https://example.com/feed?page=2");
        assert!(query.previous_page());
        assert_eq!(query.build_uri(FEED), "https://example.com/feed?page=0");
    }
}
