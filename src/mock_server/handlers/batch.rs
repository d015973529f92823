//! Atom batch endpoint.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
};

use super::entries::key_from_uri;
use super::{atom_response, authorize, gdata_error, SharedState};
use crate::mock_server::state::MockState;
use crate::models::Entry;
use crate::parsable::{self, ns, xml, XmlElement, XmlNode, XmlWriter};

/// Outcome of one batch entry.
struct Outcome {
    id: String,
    operation: String,
    code: u16,
    reason: &'static str,
    entry: Option<Entry>,
}

impl Outcome {
    fn bare(id: String, operation: String, code: u16, reason: &'static str) -> Self {
        Self {
            id,
            operation,
            code,
            reason,
            entry: None,
        }
    }
}

/// POST /feeds/entries/batch
pub async fn run_batch(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.write().await;
    if let Err(response) = authorize(&mut state, &headers) {
        return response;
    }

    let root = match xml::parse_document(&body) {
        Ok(root) if root.is(ns::ATOM, "feed") => root,
        Ok(_) => return gdata_error(StatusCode::BAD_REQUEST, "invalid", "Expected a batch feed"),
        Err(err) => return gdata_error(StatusCode::BAD_REQUEST, "invalid", &err.to_string()),
    };

    let outcomes: Vec<Outcome> = root
        .elements()
        .filter(|e| e.is(ns::ATOM, "entry"))
        .map(|element| apply(&mut state, element))
        .collect();

    let mut writer = XmlWriter::new();
    writer.start(
        "feed",
        &[
            ("xmlns", ns::ATOM),
            ("xmlns:gd", ns::GD),
            ("xmlns:batch", ns::BATCH),
        ],
    );
    writer.text_element("id", &[], &format!("{}/feeds/entries/batch", state.base_url));
    writer.text_element("title", &[], "Batch operation results");
    for outcome in &outcomes {
        let code = outcome.code.to_string();
        let batch_elements = |w: &mut XmlWriter| {
            w.text_element("batch:id", &[], &outcome.id);
            w.empty("batch:operation", &[("type", outcome.operation.as_str())]);
            w.empty("batch:status", &[("code", code.as_str()), ("reason", outcome.reason)]);
        };
        match &outcome.entry {
            Some(entry) => {
                let presented = state.present_entry(entry);
                parsable::write_xml_entry(&presented, &mut writer, &[("batch", ns::BATCH)], batch_elements);
            }
            None => {
                writer.start("entry", &[]);
                batch_elements(&mut writer);
                writer.end("entry");
            }
        }
    }
    writer.end("feed");

    atom_response(StatusCode::OK, writer.into_string())
}

fn apply(state: &mut MockState, element: &XmlElement) -> Outcome {
    let id = element
        .child(ns::BATCH, "id")
        .map(|e| e.text().trim().to_string())
        .unwrap_or_default();
    let operation = element
        .child(ns::BATCH, "operation")
        .and_then(|e| e.attribute("type"))
        .unwrap_or("insert")
        .to_string();

    let mut stripped = element.clone();
    stripped.children.retain(|node| match node {
        XmlNode::Element(e) => e.namespace.as_deref() != Some(ns::BATCH),
        XmlNode::Text(_) => true,
    });
    let entry = match parsable::decode_xml::<Entry>(&stripped) {
        Ok(Some(entry)) => entry,
        _ => return Outcome::bare(id, operation, 400, "Bad Request"),
    };

    let key = entry
        .id
        .as_deref()
        .and_then(|uri| key_from_uri(state, uri))
        .map(str::to_string);

    match (operation.as_str(), key) {
        ("insert", _) => {
            if entry.is_inserted() {
                return Outcome::bare(id, operation, 400, "Bad Request");
            }
            let inserted = state.insert_entry(entry);
            Outcome {
                id,
                operation,
                code: 201,
                reason: "Created",
                entry: Some(inserted),
            }
        }
        ("query", Some(key)) => match state.get_entry(&key).cloned() {
            Some(found) => Outcome {
                id,
                operation,
                code: 200,
                reason: "Success",
                entry: Some(found),
            },
            None => Outcome::bare(id, operation, 404, "Not Found"),
        },
        ("update", Some(key)) => {
            let Some(current) = state.get_entry(&key).map(|e| e.etag.clone()) else {
                return Outcome::bare(id, operation, 404, "Not Found");
            };
            if entry.etag.is_some() && entry.etag != current {
                return Outcome::bare(id, operation, 409, "Conflict");
            }
            match state.update_entry(&key, entry) {
                Some(updated) => Outcome {
                    id,
                    operation,
                    code: 200,
                    reason: "Success",
                    entry: Some(updated),
                },
                None => Outcome::bare(id, operation, 404, "Not Found"),
            }
        }
        ("delete", Some(key)) => {
            let Some(current) = state.get_entry(&key).map(|e| e.etag.clone()) else {
                return Outcome::bare(id, operation, 404, "Not Found");
            };
            if entry.etag.is_some() && entry.etag != current {
                return Outcome::bare(id, operation, 409, "Conflict");
            }
            state.delete_entry(&key);
            Outcome::bare(id, operation, 200, "Success")
        }
        (_, None) => Outcome::bare(id, operation, 404, "Not Found"),
        _ => Outcome::bare(id, operation, 400, "Bad Request"),
    }
}
