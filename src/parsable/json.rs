//! JSON member access for entity decoders.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::parse_iso8601;
use crate::error::{ParseError, ParseErrorKind};

/// One member of a JSON object being decoded, with its path.
#[derive(Debug, Clone)]
pub struct JsonMember<'a> {
    pub name: &'a str,
    pub value: &'a Value,
    path: String,
}

impl<'a> JsonMember<'a> {
    #[must_use]
    pub fn new(parent_path: &str, name: &'a str, value: &'a Value) -> Self {
        Self {
            name,
            value,
            path: format!("{parent_path}/{name}"),
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// An error located at this member, carrying its literal value.
    #[must_use]
    pub fn error(&self, kind: ParseErrorKind) -> ParseError {
        ParseError::new(kind, self.path.clone()).with_literal(self.value.to_string())
    }

    pub fn string(&self) -> Result<String, ParseError> {
        match self.value {
            Value::String(s) => Ok(s.clone()),
            _ => Err(self.error(ParseErrorKind::InvalidFormat)),
        }
    }

    /// A string member that may be `null`.
    pub fn optional_string(&self) -> Result<Option<String>, ParseError> {
        match self.value {
            Value::Null => Ok(None),
            _ => self.string().map(Some),
        }
    }

    pub fn boolean(&self) -> Result<bool, ParseError> {
        self.value
            .as_bool()
            .ok_or_else(|| self.error(ParseErrorKind::InvalidFormat))
    }

    /// A 64-bit integer sent either as a JSON number or as a decimal string.
    pub fn int64(&self) -> Result<i64, ParseError> {
        match self.value {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| self.error(ParseErrorKind::OutOfRange)),
            Value::String(s) => s.trim().parse::<i64>().map_err(|e| {
                let kind = match e.kind() {
                    std::num::IntErrorKind::PosOverflow | std::num::IntErrorKind::NegOverflow => {
                        ParseErrorKind::OutOfRange
                    }
                    _ => ParseErrorKind::InvalidFormat,
                };
                self.error(kind)
            }),
            _ => Err(self.error(ParseErrorKind::InvalidFormat)),
        }
    }

    /// Like [`int64`](Self::int64) but rejects negative values.
    pub fn uint64(&self) -> Result<u64, ParseError> {
        let value = self.int64()?;
        u64::try_from(value).map_err(|_| self.error(ParseErrorKind::OutOfRange))
    }

    pub fn datetime(&self) -> Result<DateTime<Utc>, ParseError> {
        let text = self.string()?;
        parse_iso8601(&text).ok_or_else(|| self.error(ParseErrorKind::InvalidFormat))
    }

    pub fn array(&self) -> Result<&'a [Value], ParseError> {
        self.value
            .as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| self.error(ParseErrorKind::InvalidFormat))
    }

    pub fn object(&self) -> Result<&'a serde_json::Map<String, Value>, ParseError> {
        self.value
            .as_object()
            .ok_or_else(|| self.error(ParseErrorKind::InvalidFormat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_int64_accepts_number_and_string() {
        let number = json!(42);
        let string = json!("9007199254740993");
        assert_eq!(JsonMember::new("", "n", &number).int64().unwrap(), 42);
        assert_eq!(
            JsonMember::new("", "quotaBytesUsed", &string).int64().unwrap(),
            9_007_199_254_740_993
        );
    }

    #[test]
    fn test_int64_reports_path_and_literal() {
        let value = json!("lots");
        let err = JsonMember::new("/items/0", "fileSize", &value)
            .int64()
            .unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidFormat);
        assert_eq!(err.path, "/items/0/fileSize");
        assert_eq!(err.literal.as_deref(), Some("\"lots\""));
    }

    #[test]
    fn test_int64_overflow_is_out_of_range() {
        let value = json!("99999999999999999999");
        let err = JsonMember::new("", "n", &value).int64().unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::OutOfRange);
    }

    #[test]
    fn test_uint64_rejects_negative() {
        let value = json!(-1);
        let err = JsonMember::new("", "n", &value).uint64().unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::OutOfRange);
    }

    #[test]
    fn test_datetime() {
        let value = json!("2012-04-01T10:00:00.000Z");
        let dt = JsonMember::new("", "updated", &value).datetime().unwrap();
        assert_eq!(dt.timestamp(), 1_333_274_400);
    }
}
