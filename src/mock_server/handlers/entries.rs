//! Atom entry collection handlers.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::{
    atom_response, authorize, entity_response, gdata_error, not_modified, precondition_holds,
    SharedState,
};
use crate::models::{rel, Entry};
use crate::mock_server::state::MockState;
use crate::parsable::{self, format_iso8601, ns, XmlWriter};

/// Query parameters for listing entries.
#[derive(Debug, Default, Deserialize)]
pub struct ListEntriesQuery {
    #[serde(rename = "start-index")]
    pub start_index: Option<usize>,
    #[serde(rename = "max-results")]
    pub max_results: Option<usize>,
    pub q: Option<String>,
}

/// Default page size of the Atom collection.
const DEFAULT_MAX_RESULTS: usize = 25;

/// GET /feeds/entries
pub async fn list_entries(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListEntriesQuery>,
) -> Response {
    let mut state = state.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }

    let etag = state.entries_etag();
    if not_modified(&headers, &etag) {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    let matching = state.search_entries(query.q.as_deref());
    let total = matching.len();
    let start = query.start_index.unwrap_or(1).max(1);
    let per_page = query.max_results.unwrap_or(DEFAULT_MAX_RESULTS);
    let page: Vec<Entry> = matching
        .into_iter()
        .skip(start - 1)
        .take(per_page)
        .map(|e| state.present_entry(e))
        .collect();

    let feed_uri = format!("{}/feeds/entries", state.base_url);
    let mut writer = XmlWriter::new();
    writer.start(
        "feed",
        &[
            ("xmlns", ns::ATOM),
            ("xmlns:gd", ns::GD),
            ("xmlns:openSearch", ns::OPENSEARCH),
            ("gd:etag", etag.as_str()),
        ],
    );
    writer.text_element("id", &[], &feed_uri);
    writer.text_element("title", &[], "Entries");
    writer.text_element("updated", &[], &format_iso8601(&chrono::Utc::now()));
    writer.empty("link", &[("rel", rel::FEED), ("href", feed_uri.as_str())]);
    writer.empty("link", &[("rel", rel::POST), ("href", feed_uri.as_str())]);
    let batch_uri = format!("{feed_uri}/batch");
    writer.empty("link", &[("rel", rel::BATCH), ("href", batch_uri.as_str())]);
    if start - 1 + page.len() < total {
        let next = format!(
            "{feed_uri}?start-index={}&max-results={per_page}",
            start + page.len()
        );
        writer.empty("link", &[("rel", "next"), ("href", next.as_str())]);
    }
    if start > 1 {
        let previous = format!(
            "{feed_uri}?start-index={}&max-results={per_page}",
            start.saturating_sub(per_page).max(1)
        );
        writer.empty("link", &[("rel", "previous"), ("href", previous.as_str())]);
    }
    writer.text_element("openSearch:totalResults", &[], &total.to_string());
    writer.text_element("openSearch:startIndex", &[], &start.to_string());
    writer.text_element("openSearch:itemsPerPage", &[], &per_page.to_string());
    for entry in &page {
        parsable::write_xml_entry(entry, &mut writer, &[], |_| {});
    }
    writer.end("feed");

    atom_response(StatusCode::OK, writer.into_string())
}

/// GET /feeds/entries/{key}
pub async fn get_entry(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    let mut state = state.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }

    match state.get_entry(&key) {
        Some(entry) if entry.etag.as_deref().is_some_and(|e| not_modified(&headers, e)) => {
            StatusCode::NOT_MODIFIED.into_response()
        }
        Some(entry) => entity_response(StatusCode::OK, &state.present_entry(entry)),
        None => gdata_error(StatusCode::NOT_FOUND, "notFound", &format!("No entry {key}")),
    }
}

/// POST /feeds/entries
pub async fn insert_entry(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }

    let entry: Entry = match parsable::parse_from_bytes(&body) {
        Ok(entry) => entry,
        Err(err) => return gdata_error(StatusCode::BAD_REQUEST, "invalid", &err.to_string()),
    };
    if entry.is_inserted() {
        return gdata_error(StatusCode::BAD_REQUEST, "invalid", "Entry already has an id");
    }
    let inserted = state.insert_entry(entry);
    entity_response(StatusCode::CREATED, &state.present_entry(&inserted))
}

/// PUT /feeds/entries/{key}
pub async fn update_entry(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    let mut state = state.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }

    let Some(current) = state.get_entry(&key).and_then(|e| e.etag.clone()) else {
        return gdata_error(StatusCode::NOT_FOUND, "notFound", &format!("No entry {key}"));
    };
    if !precondition_holds(&headers, Some(&current)) {
        return gdata_error(StatusCode::PRECONDITION_FAILED, "etagsMismatch", "Etags mismatch");
    }
    let changes: Entry = match parsable::parse_from_bytes(&body) {
        Ok(entry) => entry,
        Err(err) => return gdata_error(StatusCode::BAD_REQUEST, "invalid", &err.to_string()),
    };
    if let Some(etag) = &changes.etag {
        if *etag != current {
            return gdata_error(StatusCode::CONFLICT, "conflict", "Entry has been modified");
        }
    }

    match state.update_entry(&key, changes) {
        Some(updated) => entity_response(StatusCode::OK, &state.present_entry(&updated)),
        None => gdata_error(StatusCode::NOT_FOUND, "notFound", &format!("No entry {key}")),
    }
}

/// DELETE /feeds/entries/{key}
pub async fn delete_entry(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    let mut state = state.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }

    let Some(current) = state.get_entry(&key).map(|e| e.etag.clone()) else {
        return gdata_error(StatusCode::NOT_FOUND, "notFound", &format!("No entry {key}"));
    };
    if !precondition_holds(&headers, current.as_deref()) {
        return gdata_error(StatusCode::PRECONDITION_FAILED, "etagsMismatch", "Etags mismatch");
    }
    state.delete_entry(&key);
    StatusCode::OK.into_response()
}

/// Key of an entry addressed by an absolute URI or a bare id.
pub(crate) fn key_from_uri<'a>(state: &MockState, uri: &'a str) -> Option<&'a str> {
    MockState::entry_key(uri).or_else(|| {
        uri.strip_prefix(state.base_url.as_str())
            .and_then(|path| path.strip_prefix("/feeds/entries/"))
    })
}
