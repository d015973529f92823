//! HTTP request handlers for the mock server.

pub mod batch;
pub mod blobs;
pub mod entries;
pub mod oauth;
pub mod tasks;
pub mod uploads;

pub use batch::*;
pub use blobs::*;
pub use entries::*;
pub use oauth::*;
pub use tasks::*;
pub use uploads::*;

use std::sync::Arc;

use axum::{
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE, IF_MATCH, IF_NONE_MATCH},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use tokio::sync::RwLock;

use crate::mock_server::state::MockState;
use crate::parsable::{self, ns, Parsable, XmlWriter};

pub(crate) type SharedState = Arc<RwLock<MockState>>;

pub(crate) const ATOM: &str = "application/atom+xml; charset=UTF-8";

/// Record the request's credentials and reject it unless they are the
/// current bearer token.
pub(crate) fn authorize(state: &mut MockState, headers: &HeaderMap) -> Result<(), Response> {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.seen_authorization.push(presented.clone());

    let Some(policy) = &state.oauth else {
        return Ok(());
    };
    let expected = policy.access_token.as_ref().map(|t| format!("Bearer {t}"));
    if expected.is_some() && presented == expected {
        return Ok(());
    }
    Err((
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": {
                "errors": [{"domain": "global", "reason": "authError", "message": "Invalid Credentials"}],
                "code": 401,
                "message": "Invalid Credentials"
            }
        })),
    )
        .into_response())
}

pub(crate) fn header<'a>(headers: &'a HeaderMap, name: &axum::http::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// True when `If-None-Match` names the current ETag.
pub(crate) fn not_modified(headers: &HeaderMap, current: &str) -> bool {
    header(headers, &IF_NONE_MATCH) == Some(current)
}

/// False when `If-Match` is present and names neither `*` nor `current`.
pub(crate) fn precondition_holds(headers: &HeaderMap, current: Option<&str>) -> bool {
    match header(headers, &IF_MATCH) {
        None | Some("*") => true,
        Some(etag) => Some(etag) == current,
    }
}

pub(crate) fn atom_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(CONTENT_TYPE, HeaderValue::from_static(ATOM))],
        body,
    )
        .into_response()
}

/// Serialize a single entity in its wire format.
pub(crate) fn entity_response<E: Parsable>(status: StatusCode, entity: &E) -> Response {
    let content_type = match E::CONTENT_TYPE {
        parsable::ContentType::Atom => ATOM,
        parsable::ContentType::Json => "application/json; charset=UTF-8",
    };
    (
        status,
        [(CONTENT_TYPE, HeaderValue::from_static(content_type))],
        parsable::serialize(entity),
    )
        .into_response()
}

/// A GData-style XML error document.
pub(crate) fn gdata_error(status: StatusCode, code: &str, reason: &str) -> Response {
    let mut writer = XmlWriter::new();
    writer.start("errors", &[("xmlns", ns::GD)]);
    writer.start("error", &[]);
    writer.text_element("domain", &[], "GData");
    writer.text_element("code", &[], code);
    writer.text_element("internalReason", &[], reason);
    writer.end("error");
    writer.end("errors");
    (
        status,
        [(CONTENT_TYPE, HeaderValue::from_static("application/vnd.google.gdata.error+xml"))],
        writer.into_string(),
    )
        .into_response()
}

/// A JSON error document.
pub(crate) fn json_error(status: StatusCode, reason: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": {
                "errors": [{"domain": "global", "reason": reason, "message": message}],
                "code": status.as_u16(),
                "message": message
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_holds() {
        let mut headers = HeaderMap::new();
        assert!(precondition_holds(&headers, Some("\"a\"")));

        headers.insert(IF_MATCH, HeaderValue::from_static("\"a\""));
        assert!(precondition_holds(&headers, Some("\"a\"")));
        assert!(!precondition_holds(&headers, Some("\"b\"")));

        headers.insert(IF_MATCH, HeaderValue::from_static("*"));
        assert!(precondition_holds(&headers, Some("\"b\"")));
    }

    #[test]
    fn test_authorize_without_policy_records_header() {
        let mut state = MockState::new();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer x"));
        assert!(authorize(&mut state, &headers).is_ok());
        assert_eq!(state.seen_authorization, [Some("Bearer x".to_string())]);
    }

    #[test]
    fn test_authorize_rejects_stale_token() {
        let mut state = MockState::new()
            .with_oauth("client", "secret", "refresh")
            .with_access_token("fresh");
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer stale"));
        let response = authorize(&mut state, &headers).unwrap_err();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer fresh"));
        assert!(authorize(&mut state, &headers).is_ok());
    }
}
