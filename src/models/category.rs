//! Atom categories.

use crate::error::ParseError;
use crate::parsable::{XmlElement, XmlWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    /// Stable key within the scheme.
    pub term: String,
    pub scheme: Option<String>,
    /// Human-readable label.
    pub label: Option<String>,
}

impl Category {
    /// Scheme of the category that names an entry's concrete kind.
    pub const KIND_SCHEME: &'static str = "http://schemas.google.com/g/2005#kind";

    #[must_use]
    pub fn new(scheme: &str, term: &str) -> Self {
        Self {
            term: term.to_owned(),
            scheme: Some(scheme.to_owned()),
            label: None,
        }
    }

    #[must_use]
    pub fn kind(term: &str) -> Self {
        Self::new(Self::KIND_SCHEME, term)
    }

    #[must_use]
    pub fn is_kind(&self) -> bool {
        self.scheme.as_deref() == Some(Self::KIND_SCHEME)
    }

    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, ParseError> {
        Ok(Self {
            term: element.required_attribute("term")?.to_owned(),
            scheme: element.attribute("scheme").map(str::to_owned),
            label: element.attribute("label").map(str::to_owned),
        })
    }

    pub(crate) fn write_xml(&self, writer: &mut XmlWriter) {
        let mut attributes = vec![("term", self.term.as_str())];
        if let Some(scheme) = &self.scheme {
            attributes.push(("scheme", scheme.as_str()));
        }
        if let Some(label) = &self.label {
            attributes.push(("label", label.as_str()));
        }
        writer.empty("category", &attributes);
    }
}
