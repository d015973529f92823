//! Media upload handlers: simple, multipart and resumable.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{
        header::{CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE},
        HeaderMap, HeaderName, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};

use super::{authorize, entity_response, gdata_error, header, SharedState};
use crate::mock_server::state::{MockState, UploadSession};
use crate::models::{Content, Entry};
use crate::parsable;

const SLUG: HeaderName = HeaderName::from_static("slug");
const X_UPLOAD_CONTENT_TYPE: HeaderName = HeaderName::from_static("x-upload-content-type");
const X_UPLOAD_CONTENT_LENGTH: HeaderName = HeaderName::from_static("x-upload-content-length");

/// A parsed `Content-Range` header.
#[derive(Debug, PartialEq, Eq)]
enum ContentRange {
    /// `bytes */total`: how much has been received?
    Probe { total: Option<u64> },
    /// `bytes first-last/total`
    Data { first: u64, last: u64, total: Option<u64> },
}

fn parse_content_range(value: &str) -> Option<ContentRange> {
    let spec = value.strip_prefix("bytes ")?;
    let (range, total) = spec.split_once('/')?;
    let total = match total {
        "*" => None,
        n => Some(n.parse().ok()?),
    };
    if range == "*" {
        return Some(ContentRange::Probe { total });
    }
    let (first, last) = range.split_once('-')?;
    let (first, last) = (first.parse().ok()?, last.parse().ok()?);
    (first <= last).then_some(ContentRange::Data { first, last, total })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split a two-part `multipart/related` body into the metadata document
/// and the media part's content type and bytes.
fn split_related(body: &[u8], boundary: &str) -> Option<(Bytes, String, Bytes)> {
    let opener = format!("--{boundary}\n");
    let separator = format!("\n--{boundary}\n");
    let closer = format!("\n--{boundary}--");

    let rest = body.strip_prefix(opener.as_bytes())?;
    let split = find(rest, separator.as_bytes())?;
    let (first, second) = (&rest[..split], &rest[split + separator.len()..]);

    let first_body = find(first, b"\n\n")?;
    let metadata = Bytes::copy_from_slice(&first[first_body + 2..]);

    let second_body = find(second, b"\n\n")?;
    let media_type = std::str::from_utf8(&second[..second_body])
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("Content-Type:"))
        .map(|v| v.trim().to_string())?;
    let end = find(second, closer.as_bytes())?;
    let media = Bytes::copy_from_slice(second.get(second_body + 2..end)?);
    Some((metadata, media_type, media))
}

fn decode_metadata(document: &[u8]) -> Result<Entry, Response> {
    parsable::parse_from_bytes::<Entry>(document)
        .map_err(|err| gdata_error(StatusCode::BAD_REQUEST, "invalid", &err.to_string()))
}

/// Create the entry that describes uploaded media and store the bytes.
fn store_media(
    state: &mut MockState,
    metadata: Option<Entry>,
    slug: Option<&str>,
    content_type: &str,
    data: Bytes,
) -> Entry {
    let mut entry = metadata.unwrap_or_default();
    if entry.title.is_none() {
        entry.title = Some(slug.unwrap_or("Untitled").to_string());
    }
    entry.id = None;
    let mut inserted = state.insert_entry(entry);
    let Some(key) = inserted.id.as_deref().and_then(MockState::entry_key).map(str::to_string)
    else {
        return inserted;
    };

    inserted.content = Some(Content::Uri {
        src: format!("{}/media/{key}", state.base_url),
        content_type: Some(content_type.to_string()),
    });
    if let Some(stored) = state
        .entries
        .iter_mut()
        .find(|e| e.id == inserted.id)
    {
        stored.content = inserted.content.clone();
    }
    tracing::debug!(key = %key, bytes = data.len(), "stored media");
    state.media.insert(key, (content_type.to_string(), data));
    inserted
}

/// POST /upload/entries
///
/// Opens a resumable session when `X-Upload-Content-Type` is present;
/// otherwise stores the body directly.
pub async fn start_upload(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }
    let slug = header(&headers, &SLUG)
        .map(|s| urlencoding::decode(s).map_or_else(|_| s.to_string(), |d| d.into_owned()));

    if let Some(upload_type) = header(&headers, &X_UPLOAD_CONTENT_TYPE) {
        let metadata = if body.is_empty() {
            None
        } else {
            match decode_metadata(&body) {
                Ok(entry) => Some(entry),
                Err(response) => return response,
            }
        };
        let total_length = header(&headers, &X_UPLOAD_CONTENT_LENGTH).and_then(|v| v.parse().ok());
        let session = UploadSession {
            metadata,
            slug,
            content_type: upload_type.to_string(),
            total_length,
            ..Default::default()
        };
        let id = state.open_upload(session);
        let location = format!("{}/upload/sessions/{id}", state.base_url);
        tracing::debug!(session = %id, "opened resumable upload");
        return match HeaderValue::from_str(&location) {
            Ok(location) => (StatusCode::OK, [(LOCATION, location)]).into_response(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        };
    }

    let content_type = header(&headers, &CONTENT_TYPE).unwrap_or("application/octet-stream");
    let (metadata, media_type, data) = match content_type
        .strip_prefix("multipart/related; boundary=")
    {
        Some(boundary) => {
            let Some((document, media_type, data)) = split_related(&body, boundary) else {
                return gdata_error(StatusCode::BAD_REQUEST, "invalid", "Malformed multipart body");
            };
            match decode_metadata(&document) {
                Ok(entry) => (Some(entry), media_type, data),
                Err(response) => return response,
            }
        }
        None => (None, content_type.to_string(), body),
    };

    let inserted = store_media(&mut state, metadata, slug.as_deref(), &media_type, data);
    entity_response(StatusCode::CREATED, &state.present_entry(&inserted))
}

/// 308 with the range received so far.
fn resume_incomplete(received: usize) -> Response {
    let mut response = StatusCode::PERMANENT_REDIRECT.into_response();
    if received > 0 {
        if let Ok(range) = HeaderValue::from_str(&format!("bytes=0-{}", received - 1)) {
            response.headers_mut().insert(RANGE, range);
        }
    }
    response
}

/// PUT /upload/sessions/{id}
pub async fn upload_chunk(
    State(shared): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let mut state = shared.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }

    let Some(range) = header(&headers, &CONTENT_RANGE).and_then(parse_content_range) else {
        return gdata_error(StatusCode::BAD_REQUEST, "invalid", "Missing or invalid Content-Range");
    };
    match state.uploads.get(&id).map(|s| s.finished.clone()) {
        None => {
            return gdata_error(StatusCode::NOT_FOUND, "notFound", &format!("No upload session {id}"))
        }
        Some(Some(finished)) => {
            return entity_response(StatusCode::CREATED, &state.present_entry(&finished))
        }
        Some(None) => {}
    }

    let (total, drop_response) = match range {
        ContentRange::Probe { total } => (total, false),
        ContentRange::Data { first, last, total } => {
            let Some(session) = state.uploads.get_mut(&id) else {
                return StatusCode::NOT_FOUND.into_response();
            };
            if first != session.received.len() as u64 || body.len() as u64 != last - first + 1 {
                return gdata_error(StatusCode::BAD_REQUEST, "invalid", "Chunk is not contiguous");
            }
            session.received.extend_from_slice(&body);
            state.chunk_count += 1;
            let dropped = state.dropped_chunks.contains(&state.chunk_count);
            (total, dropped)
        }
    };

    let Some(session) = state.uploads.get_mut(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if total.is_some() {
        session.total_length = total;
    }
    let received = session.received.len();
    let complete = session.total_length.is_some_and(|t| t == received as u64);

    let response = if complete {
        let session = session.clone();
        let inserted = store_media(
            &mut state,
            session.metadata,
            session.slug.as_deref(),
            &session.content_type,
            Bytes::from(session.received),
        );
        if let Some(open) = state.uploads.get_mut(&id) {
            open.finished = Some(inserted.clone());
        }
        entity_response(StatusCode::CREATED, &state.present_entry(&inserted))
    } else {
        resume_incomplete(received)
    };

    if drop_response {
        tracing::debug!(chunk = state.chunk_count, "withholding chunk response");
        drop(state);
        return std::future::pending::<Response>().await;
    }
    response
}

/// GET /media/{key}
pub async fn get_media(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Response {
    let mut state = state.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }

    match state.media.get(&key) {
        Some((content_type, data)) => {
            let content_type = HeaderValue::from_str(content_type)
                .unwrap_or(HeaderValue::from_static("application/octet-stream"));
            (StatusCode::OK, [(CONTENT_TYPE, content_type)], data.clone()).into_response()
        }
        None => gdata_error(StatusCode::NOT_FOUND, "notFound", &format!("No media {key}")),
    }
}
