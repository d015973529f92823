//! JSON batches as `multipart/mixed` bodies.
//!
//! Every part is an `application/http` message holding one sub-request,
//! identified by `Content-ID: <itemN>`. The server answers with one part
//! per sub-request, identified by `<response-itemN>`.

use std::collections::HashMap;
use std::fmt::Write as _;

use bytes::Bytes;

use super::{BatchCodec, BatchItem, BatchOperationType, BatchResult};
use crate::error::{GDataError, Result};
use crate::parsable::{self, ContentType, Parsable};

const BOUNDARY: &str = "batch_gdata_boundary";

/// Encodes batches of JSON entities as `multipart/mixed`.
#[derive(Debug, Clone)]
pub struct JsonBatchCodec {
    insert_uri: String,
}

impl JsonBatchCodec {
    /// `insert_uri` is where insertions are posted.
    #[must_use]
    pub fn new(insert_uri: &str) -> Self {
        Self {
            insert_uri: insert_uri.to_string(),
        }
    }
}

impl<E: Parsable> BatchCodec<E> for JsonBatchCodec {
    fn encode(&self, items: &[BatchItem<'_, E>]) -> Result<(String, Bytes)> {
        let mut out = String::new();
        for item in items {
            let _ = write!(
                out,
                "--{BOUNDARY}\r\nContent-Type: application/http\r\nContent-ID: <item{}>\r\n\r\n",
                item.id
            );
            match (item.kind, item.entity, item.query_uri) {
                (BatchOperationType::Query, _, Some(uri)) => {
                    let _ = write!(out, "GET {uri} HTTP/1.1\r\n\r\n");
                }
                (BatchOperationType::Insertion, Some(entity), _) => {
                    if entity.entry().is_inserted() {
                        return Err(GDataError::AlreadyInserted);
                    }
                    write_with_body(&mut out, "POST", &self.insert_uri, None, entity);
                }
                (BatchOperationType::Update, Some(entity), _) => {
                    let uri = edit_uri(entity)?;
                    let etag = entity.entry().etag.as_deref();
                    write_with_body(&mut out, "PUT", uri, etag, entity);
                }
                (BatchOperationType::Deletion, Some(entity), _) => {
                    let uri = edit_uri(entity)?;
                    let _ = write!(out, "DELETE {uri} HTTP/1.1\r\n");
                    if let Some(etag) = &entity.entry().etag {
                        let _ = write!(out, "If-Match: {etag}\r\n");
                    }
                    out.push_str("\r\n");
                }
                _ => {
                    return Err(GDataError::Protocol(format!(
                        "batch {} operation {} has nothing to send",
                        item.kind, item.id
                    )))
                }
            }
            out.push_str("\r\n");
        }
        let _ = write!(out, "--{BOUNDARY}--\r\n");

        Ok((
            format!("multipart/mixed; boundary={BOUNDARY}"),
            Bytes::from(out),
        ))
    }

    fn decode(
        &self,
        content_type: Option<&str>,
        body: &[u8],
        kinds: &HashMap<u32, BatchOperationType>,
    ) -> Result<Vec<BatchResult<E>>> {
        let boundary = content_type.and_then(boundary_of).ok_or_else(|| {
            GDataError::Protocol("batch response is not multipart/mixed".to_string())
        })?;
        let text = std::str::from_utf8(body)
            .map_err(|_| GDataError::Protocol("batch response is not UTF-8".to_string()))?;

        let delimiter = format!("--{boundary}");
        let mut results = Vec::new();
        // The first segment is the preamble; the last starts with `--`.
        for part in text.split(delimiter.as_str()).skip(1) {
            if part.starts_with("--") {
                break;
            }
            let Some((part_headers, message)) = split_head(part.trim_start_matches(['\r', '\n']))
            else {
                tracing::warn!("batch response part without headers");
                continue;
            };
            let Some(id) = header(part_headers, "content-id").and_then(item_id) else {
                tracing::warn!("batch response part without a usable Content-ID");
                continue;
            };
            let Some((status, payload)) = parse_http_response(message) else {
                tracing::warn!(id, "batch response part without an HTTP status line");
                continue;
            };
            let kind = kinds.get(&id).copied().unwrap_or(BatchOperationType::Query);
            let payload = payload.trim_end_matches(['\r', '\n']);

            let outcome = if (200..300).contains(&status) {
                if kind == BatchOperationType::Deletion || payload.trim().is_empty() {
                    Ok(None)
                } else {
                    parsable::parse_from_bytes::<E>(payload.as_bytes())
                        .map(Some)
                        .map_err(GDataError::from)
                }
            } else {
                tracing::debug!(id, status, "batch operation failed");
                Err(GDataError::from_status(
                    status,
                    kind == BatchOperationType::Query,
                    payload.as_bytes(),
                ))
            };
            results.push(BatchResult { id, outcome });
        }
        Ok(results)
    }
}

fn write_with_body<E: Parsable>(
    out: &mut String,
    method: &str,
    uri: &str,
    etag: Option<&str>,
    entity: &E,
) {
    let json = parsable::to_json_value(entity).to_string();
    let _ = write!(
        out,
        "{method} {uri} HTTP/1.1\r\nContent-Type: {}\r\nContent-Length: {}\r\n",
        ContentType::Json.mime_type(),
        json.len()
    );
    if let Some(etag) = etag {
        let _ = write!(out, "If-Match: {etag}\r\n");
    }
    let _ = write!(out, "\r\n{json}\r\n");
}

fn edit_uri<E: Parsable>(entity: &E) -> Result<&str> {
    entity
        .entry()
        .edit_uri()
        .ok_or_else(|| GDataError::Protocol("entry has no edit or self link".to_string()))
}

fn boundary_of(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let essence = params.next()?.trim();
    if !essence.eq_ignore_ascii_case("multipart/mixed") {
        return None;
    }
    params
        .filter_map(|p| p.trim().split_once('='))
        .find(|(name, _)| name.eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim_matches('"').to_string())
}

/// Split a message into its header block and body at the first blank line.
fn split_head(message: &str) -> Option<(&str, &str)> {
    if let Some(at) = message.find("\r\n\r\n") {
        return Some((&message[..at], &message[at + 4..]));
    }
    message
        .find("\n\n")
        .map(|at| (&message[..at], &message[at + 2..]))
}

fn header<'a>(block: &'a str, name: &str) -> Option<&'a str> {
    block
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(n, _)| n.trim().eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim())
}

/// `<response-item12>` → 12
fn item_id(content_id: &str) -> Option<u32> {
    let value = content_id.trim_start_matches('<').trim_end_matches('>');
    let digits_at = value
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    value[digits_at..].parse().ok()
}

fn parse_http_response(message: &str) -> Option<(u16, &str)> {
    let message = message.trim_start_matches(['\r', '\n']);
    let (head, body) = split_head(message).unwrap_or((message, ""));
    let status_line = head.lines().next()?;
    let mut fields = status_line.split_whitespace();
    if !fields.next()?.starts_with("HTTP/") {
        return None;
    }
    let status = fields.next()?.parse().ok()?;
    Some((status, body))
}
