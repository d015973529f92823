//! Error types for GData operations.
//!
//! Every fallible operation in the crate returns [`GDataError`]. The set of
//! variants is closed: transport, cancellation, authorization, conditional
//! request, local misuse, parsing, service and server failures.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur during GData operations.
///
/// The error is cheaply cloneable so a single failure (for example a batch
/// request that never reached the server) can be reported to several
/// callbacks.
#[derive(Debug, Clone, Error)]
pub enum GDataError {
    /// Connection, TLS or DNS failure.
    #[error("HTTP transport error: {0}")]
    Transport(Arc<reqwest::Error>),

    /// The operation observed its cancellation token.
    #[error("Operation was cancelled")]
    Cancelled,

    /// Credentials were rejected and refreshing them did not help.
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),

    /// The server rejected the request with 403 and the authorizer declined to refresh.
    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    /// The requested resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The entity changed on the server since it was last fetched.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A conditional request did not match the server's ETag.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// The entry already carries a server id.
    #[error("Entry has already been inserted")]
    AlreadyInserted,

    /// The server response could not be understood.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A response or entity document was malformed.
    #[error("Parse error: {0}")]
    Parser(#[from] ParseError),

    /// A structured 4xx error reported by the service.
    #[error("Service error ({status} {domain}/{reason}): {message}")]
    Service {
        status: u16,
        domain: String,
        reason: String,
        message: String,
    },

    /// A query parameter was rejected before the request was sent.
    #[error("Bad query parameter: {0}")]
    BadQueryParameter(String),

    /// The server failed with a 5xx status.
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
}

impl GDataError {
    /// HTTP status associated with the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            Self::NotFound(_) => Some(404),
            Self::Conflict(_) => Some(409),
            Self::PreconditionFailed(_) => Some(412),
            Self::Service { status, .. } | Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true for failures the caller may reasonably retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Server { .. })
    }

    /// Wrap the error for a `tokio::io` stream boundary.
    pub(crate) fn into_io(self) -> io::Error {
        let kind = match self {
            Self::Cancelled => io::ErrorKind::Interrupted,
            Self::Transport(_) => io::ErrorKind::BrokenPipe,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// Recover a [`GDataError`] from an I/O error produced by an upload or
    /// download stream.
    #[must_use]
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<GDataError>()) {
            return inner.clone();
        }
        Self::Protocol(format!("stream I/O failed: {err}"))
    }

    /// Classify a non-success HTTP status and its body.
    ///
    /// `is_get` distinguishes a missing resource (404 on a read) from a 404
    /// on a write, which the service reports like any other client error.
    #[must_use]
    pub fn from_status(status: u16, is_get: bool, body: &[u8]) -> Self {
        let detail = ServiceErrorBody::parse(body);
        let message = detail
            .as_ref()
            .map(|d| d.message.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| fallback_message(status, body));

        match status {
            401 => Self::AuthenticationRequired(message),
            403 => Self::NotAuthorized(message),
            404 if is_get => Self::NotFound(message),
            409 => Self::Conflict(message),
            412 => Self::PreconditionFailed(message),
            400..=499 => {
                let detail = detail.unwrap_or_default();
                Self::Service {
                    status,
                    domain: detail.domain,
                    reason: detail.reason,
                    message,
                }
            }
            500..=599 => Self::Server { status, message },
            _ => Self::Protocol(format!("unexpected HTTP status {status}: {message}")),
        }
    }
}

/// The first error of a structured service error response.
#[derive(Debug, Default)]
struct ServiceErrorBody {
    domain: String,
    reason: String,
    message: String,
}

impl ServiceErrorBody {
    /// Accepts both `{"error": {"errors": [...]}}` and GData's
    /// `<errors><error>...</error></errors>`.
    fn parse(body: &[u8]) -> Option<Self> {
        let trimmed = body.trim_ascii_start();
        match trimmed.first()? {
            b'{' => Self::parse_json(trimmed),
            b'<' => Self::parse_xml(trimmed),
            _ => None,
        }
    }

    fn parse_json(body: &[u8]) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_slice(body).ok()?;
        let error = value.get("error")?;
        let first = error
            .get("errors")
            .and_then(|e| e.as_array())
            .and_then(|e| e.first());
        let field = |name: &str| {
            first
                .and_then(|f| f.get(name))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| field("message"));
        Some(Self {
            domain: field("domain"),
            reason: field("reason"),
            message,
        })
    }

    fn parse_xml(body: &[u8]) -> Option<Self> {
        let root = crate::parsable::xml::parse_document(body).ok()?;
        if root.name != "errors" {
            return None;
        }
        let error = root.elements().find(|e| e.name == "error")?;
        let text = |name: &str| {
            error
                .elements()
                .find(|e| e.name == name)
                .map(|e| e.text().trim().to_string())
                .unwrap_or_default()
        };
        Some(Self {
            domain: text("domain"),
            reason: text("code"),
            message: text("internalReason"),
        })
    }
}

fn fallback_message(status: u16, body: &[u8]) -> String {
    let summary = match status {
        400 => "Invalid request URI or header, or unsupported nonstandard parameter",
        401 => "Authorization required",
        403 => "Access forbidden",
        404 => "Resource not found",
        409 => "The entry has been modified since it was downloaded",
        412 => "The entry does not match the given ETag",
        500..=599 => "Internal server error",
        _ => "Request failed",
    };
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return summary.to_string();
    }
    let snippet: String = text.chars().take(200).collect();
    format!("{summary}: {snippet}")
}

impl From<reqwest::Error> for GDataError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(Arc::new(err))
    }
}

impl From<url::ParseError> for GDataError {
    fn from(err: url::ParseError) -> Self {
        Self::BadQueryParameter(format!("invalid URI: {err}"))
    }
}

impl From<serde_json::Error> for GDataError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parser(ParseError::from(err))
    }
}

/// What went wrong while decoding a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// The document is not well-formed XML or JSON.
    Malformed,
    /// A required element, attribute or member is absent.
    MissingElement,
    /// A singleton element appeared more than once.
    DuplicateElement,
    /// A value is not in the expected lexical format.
    InvalidFormat,
    /// A value is outside its permitted range.
    OutOfRange,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Malformed => "malformed document",
            Self::MissingElement => "required element missing",
            Self::DuplicateElement => "duplicate element",
            Self::InvalidFormat => "invalid value format",
            Self::OutOfRange => "value out of range",
        };
        f.write_str(text)
    }
}

/// A decoding failure located at an element or member path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    /// Slash-separated element or member path, e.g. `/entry/updated`.
    pub path: String,
    /// The offending literal, when there is one.
    pub literal: Option<String>,
    /// Byte offset into the source document.
    pub offset: Option<usize>,
    /// A short excerpt of the source around `offset`.
    pub excerpt: Option<String>,
}

/// Bytes of context kept on either side of an error offset.
const EXCERPT_RADIUS: usize = 40;

impl ParseError {
    #[must_use]
    pub fn new(kind: ParseErrorKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            literal: None,
            offset: None,
            excerpt: None,
        }
    }

    #[must_use]
    pub fn with_literal(mut self, literal: impl Into<String>) -> Self {
        self.literal = Some(literal.into());
        self
    }

    #[must_use]
    pub fn at_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Fill in the source excerpt from the document the error came from.
    #[must_use]
    pub fn with_source(mut self, source: &[u8]) -> Self {
        if self.excerpt.is_some() {
            return self;
        }
        let Some(offset) = self.offset else {
            return self;
        };
        let offset = offset.min(source.len());
        let start = offset.saturating_sub(EXCERPT_RADIUS);
        let end = (offset + EXCERPT_RADIUS).min(source.len());
        let excerpt = String::from_utf8_lossy(&source[start..end]);
        self.excerpt = Some(excerpt.replace(['\n', '\r'], " "));
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at '{}'", self.kind, self.path)?;
        if let Some(literal) = &self.literal {
            write!(f, ": '{literal}'")?;
        }
        if let Some(excerpt) = &self.excerpt {
            write!(f, " (near \"{excerpt}\")")?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        let kind = if err.is_data() {
            ParseErrorKind::InvalidFormat
        } else {
            ParseErrorKind::Malformed
        };
        Self::new(kind, format!("line {} column {}", err.line(), err.column()))
            .with_literal(err.to_string())
    }
}

/// Result type alias for GData operations.
pub type Result<T> = core::result::Result<T, GDataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display_includes_path_and_literal() {
        let err = ParseError::new(ParseErrorKind::InvalidFormat, "/entry/updated")
            .with_literal("yesterday");
        let text = err.to_string();
        assert!(text.contains("/entry/updated"));
        assert!(text.contains("yesterday"));
    }

    #[test]
    fn test_parse_error_excerpt_from_source() {
        let source = b"<entry><updated>not a date</updated></entry>";
        let err = ParseError::new(ParseErrorKind::InvalidFormat, "/entry/updated")
            .at_offset(16)
            .with_source(source);
        assert!(err.excerpt.as_deref().unwrap().contains("not a date"));
    }

    #[test]
    fn test_io_round_trip_preserves_variant() {
        let io = GDataError::Cancelled.into_io();
        assert_eq!(io.kind(), io::ErrorKind::Interrupted);
        assert!(matches!(GDataError::from_io(&io), GDataError::Cancelled));

        let io = GDataError::Conflict("etag".into()).into_io();
        assert!(matches!(GDataError::from_io(&io), GDataError::Conflict(_)));
    }

    #[test]
    fn test_foreign_io_error_becomes_protocol() {
        let io = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(GDataError::from_io(&io), GDataError::Protocol(_)));
    }

    #[test]
    fn test_from_status_json_service_error() {
        let body = br#"{"error": {"errors": [{"domain": "usageLimits",
            "reason": "dailyLimitExceeded", "message": "Daily Limit Exceeded"}],
            "code": 400, "message": "Daily Limit Exceeded"}}"#;
        match GDataError::from_status(400, true, body) {
            GDataError::Service {
                status,
                domain,
                reason,
                message,
            } => {
                assert_eq!(status, 400);
                assert_eq!(domain, "usageLimits");
                assert_eq!(reason, "dailyLimitExceeded");
                assert_eq!(message, "Daily Limit Exceeded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_status_xml_service_error() {
        let body = b"<errors xmlns='http://schemas.google.com/g/2005'><error>\
            <domain>GData</domain><code>invalidUri</code>\
            <internalReason>Bad category</internalReason></error></errors>";
        match GDataError::from_status(400, false, body) {
            GDataError::Service { domain, reason, message, .. } => {
                assert_eq!(domain, "GData");
                assert_eq!(reason, "invalidUri");
                assert_eq!(message, "Bad category");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_status_classification() {
        assert!(matches!(GDataError::from_status(404, true, b""), GDataError::NotFound(_)));
        assert!(matches!(
            GDataError::from_status(404, false, b""),
            GDataError::Service { status: 404, .. }
        ));
        assert!(matches!(GDataError::from_status(409, false, b""), GDataError::Conflict(_)));
        assert!(matches!(
            GDataError::from_status(412, true, b""),
            GDataError::PreconditionFailed(_)
        ));
        assert!(matches!(
            GDataError::from_status(403, true, b""),
            GDataError::NotAuthorized(_)
        ));
        assert!(matches!(
            GDataError::from_status(503, true, b"busy"),
            GDataError::Server { status: 503, .. }
        ));
    }

    #[test]
    fn test_fallback_message_uses_table_and_body() {
        match GDataError::from_status(500, true, b"") {
            GDataError::Server { message, .. } => assert_eq!(message, "Internal server error"),
            other => panic!("unexpected error: {other:?}"),
        }
        match GDataError::from_status(404, true, b"no such entry") {
            GDataError::NotFound(message) => {
                assert_eq!(message, "Resource not found: no such entry");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(GDataError::Conflict(String::new()).status(), Some(409));
        assert_eq!(
            GDataError::Server {
                status: 503,
                message: String::new()
            }
            .status(),
            Some(503)
        );
        assert_eq!(GDataError::Cancelled.status(), None);
    }
}
