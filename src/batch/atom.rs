//! Atom batch feeds.
//!
//! Each sub-operation is an `<entry>` carrying `<batch:id>` and
//! `<batch:operation type=...>`. The response echoes the id and adds
//! `<batch:status code=... reason=...>`.

use std::collections::HashMap;

use bytes::Bytes;

use super::{BatchCodec, BatchItem, BatchOperationType, BatchResult};
use crate::error::{GDataError, ParseErrorKind, Result};
use crate::models::Entry;
use crate::parsable::{self, ns, xml, Parsable, XmlElement, XmlNode, XmlWriter};

const QUERY_TITLE: &str = "Batch operation query";

/// Encodes batches as Atom feeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomBatchCodec;

impl<E: Parsable> BatchCodec<E> for AtomBatchCodec {
    fn encode(&self, items: &[BatchItem<'_, E>]) -> Result<(String, Bytes)> {
        let mut writer = XmlWriter::new();
        writer.raw("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        writer.start(
            "feed",
            &[
                ("xmlns", ns::ATOM),
                ("xmlns:gd", ns::GD),
                ("xmlns:batch", ns::BATCH),
            ],
        );
        writer.text_element("title", &[], "Batch operation feed");

        for item in items {
            let id = item.id.to_string();
            let batch_elements = |w: &mut XmlWriter| {
                w.text_element("batch:id", &[], &id);
                w.empty("batch:operation", &[("type", item.kind.as_str())]);
            };
            let extra_ns = [("batch", ns::BATCH)];

            match (item.kind, item.entity, item.query_uri) {
                (BatchOperationType::Query, _, Some(uri)) => {
                    let mut placeholder = Entry::new(QUERY_TITLE);
                    placeholder.id = Some(uri.to_string());
                    parsable::write_xml_entry(&placeholder, &mut writer, &extra_ns, batch_elements);
                }
                (_, Some(entity), _) => {
                    parsable::write_xml_entry(entity, &mut writer, &extra_ns, batch_elements);
                }
                _ => {
                    return Err(GDataError::Protocol(format!(
                        "batch {} operation {} has nothing to send",
                        item.kind, item.id
                    )))
                }
            }
        }

        writer.end("feed");
        Ok((
            "application/atom+xml".to_string(),
            Bytes::from(writer.into_string()),
        ))
    }

    fn decode(
        &self,
        _content_type: Option<&str>,
        body: &[u8],
        kinds: &HashMap<u32, BatchOperationType>,
    ) -> Result<Vec<BatchResult<E>>> {
        let root = xml::parse_document(body).map_err(|e| e.with_source(body))?;
        if !root.is(ns::ATOM, "feed") {
            return Err(root
                .error(ParseErrorKind::MissingElement)
                .with_literal("feed")
                .with_source(body)
                .into());
        }

        let mut results = Vec::new();
        for entry in root.elements().filter(|e| e.is(ns::ATOM, "entry")) {
            let Some(id) = entry
                .child(ns::BATCH, "id")
                .and_then(|e| e.text().trim().parse::<u32>().ok())
            else {
                tracing::warn!("batch response entry without a usable batch:id");
                continue;
            };
            let Some(status) = entry.child(ns::BATCH, "status") else {
                tracing::warn!(id, "batch response entry without batch:status");
                continue;
            };
            let Some(code) = status.attribute("code").and_then(|c| c.parse::<u16>().ok()) else {
                tracing::warn!(id, "batch:status without a numeric code");
                continue;
            };
            let kind = kinds.get(&id).copied().unwrap_or(BatchOperationType::Query);

            let outcome = if (200..300).contains(&code) {
                decode_success::<E>(entry, kind)
            } else {
                tracing::debug!(id, code, reason = status.attribute("reason"), "batch operation failed");
                Err(GDataError::from_status(
                    code,
                    kind == BatchOperationType::Query,
                    status_body(status).as_bytes(),
                ))
            };
            results.push(BatchResult { id, outcome });
        }
        Ok(results)
    }
}

fn decode_success<E: Parsable>(entry: &XmlElement, kind: BatchOperationType) -> Result<Option<E>> {
    if kind == BatchOperationType::Deletion {
        return Ok(None);
    }
    let mut stripped = entry.clone();
    stripped.children.retain(|node| match node {
        XmlNode::Element(e) => e.namespace.as_deref() != Some(ns::BATCH),
        XmlNode::Text(_) => true,
    });
    match parsable::decode_xml::<E>(&stripped)? {
        Some(entity) => Ok(Some(entity)),
        None => Err(GDataError::Protocol(
            "batch result entry has an unexpected kind".to_string(),
        )),
    }
}

/// Serialized children of `<batch:status>`, used as the error body.
fn status_body(status: &XmlElement) -> String {
    let mut writer = XmlWriter::new();
    for child in &status.children {
        match child {
            XmlNode::Text(t) => writer.text(t),
            XmlNode::Element(e) => writer.element(e),
        }
    }
    writer.into_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{rel, Link};

    fn kinds(pairs: &[(u32, BatchOperationType)]) -> HashMap<u32, BatchOperationType> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_encode_query_and_update() {
        let mut existing = Entry::new("Existing");
        existing.id = Some("https://example/e/1".into());
        existing.etag = Some("W/\"x\"".into());
        existing.add_link(Link::new(rel::EDIT, "https://example/e/1"));

        let items = [
            BatchItem::<Entry> {
                id: 1,
                kind: BatchOperationType::Query,
                entity: None,
                query_uri: Some("https://example/e/2"),
            },
            BatchItem {
                id: 2,
                kind: BatchOperationType::Update,
                entity: Some(&existing),
                query_uri: None,
            },
        ];
        let (content_type, body) = BatchCodec::<Entry>::encode(&AtomBatchCodec, &items).unwrap();
        assert_eq!(content_type, "application/atom+xml");

        let root = xml::parse_document(&body).unwrap();
        let entries: Vec<_> = root.elements().filter(|e| e.is(ns::ATOM, "entry")).collect();
        assert_eq!(entries.len(), 2);

        let query = entries[0];
        assert_eq!(query.child(ns::BATCH, "id").unwrap().text(), "1");
        assert_eq!(
            query.child(ns::BATCH, "operation").unwrap().attribute("type"),
            Some("query")
        );
        assert_eq!(query.child(ns::ATOM, "id").unwrap().text(), "https://example/e/2");
        assert_eq!(query.child(ns::ATOM, "title").unwrap().text(), QUERY_TITLE);

        let update = entries[1];
        assert_eq!(
            update.child(ns::BATCH, "operation").unwrap().attribute("type"),
            Some("update")
        );
        assert_eq!(update.attribute_ns(ns::GD, "etag"), Some("W/\"x\""));
    }

    #[test]
    fn test_encode_rejects_missing_entity() {
        let items = [BatchItem::<Entry> {
            id: 1,
            kind: BatchOperationType::Insertion,
            entity: None,
            query_uri: None,
        }];
        let result = BatchCodec::<Entry>::encode(&AtomBatchCodec, &items);
        assert!(matches!(result, Err(GDataError::Protocol(_))));
    }

    #[test]
    fn test_decode_strips_batch_elements() {
        let body = br#"<feed xmlns='http://www.w3.org/2005/Atom' xmlns:batch='http://schemas.google.com/gdata/batch'>
            <entry><batch:id>1</batch:id><batch:status code='200' reason='OK'/>
              <id>https://example/e/2</id><title>Found</title></entry>
            </feed>"#;
        let results: Vec<BatchResult<Entry>> = AtomBatchCodec
            .decode(None, body, &kinds(&[(1, BatchOperationType::Query)]))
            .unwrap();
        let entry = results[0].outcome.as_ref().unwrap().as_ref().unwrap();
        assert_eq!(entry.title.as_deref(), Some("Found"));
        assert!(entry.extra_elements.is_empty());
    }

    #[test]
    fn test_decode_error_status_uses_body() {
        let body = br#"<feed xmlns='http://www.w3.org/2005/Atom' xmlns:batch='http://schemas.google.com/gdata/batch'>
            <entry><batch:id>4</batch:id><batch:status code='404' reason='Not Found'>No such entry</batch:status></entry>
            <entry><batch:status code='200'/></entry>
            </feed>"#;
        let results: Vec<BatchResult<Entry>> = AtomBatchCodec
            .decode(None, body, &kinds(&[(4, BatchOperationType::Query)]))
            .unwrap();
        assert_eq!(results.len(), 1);
        match &results[0].outcome {
            Err(GDataError::NotFound(message)) => assert!(message.contains("No such entry")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_non_feed() {
        let result: Result<Vec<BatchResult<Entry>>> =
            AtomBatchCodec.decode(None, b"<entry xmlns='http://www.w3.org/2005/Atom'/>", &HashMap::new());
        assert!(matches!(result, Err(GDataError::Parser(_))));
    }
}
