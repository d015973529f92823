//! Atom authors.

use crate::error::ParseError;
use crate::parsable::{ns, XmlElement, XmlWriter};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: Option<String>,
    pub uri: Option<String>,
}

impl Author {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, ParseError> {
        let name = element.required_child(ns::ATOM, "name")?.text();
        Ok(Self {
            name,
            email: element.child(ns::ATOM, "email").map(XmlElement::text),
            uri: element.child(ns::ATOM, "uri").map(XmlElement::text),
        })
    }

    pub(crate) fn write_xml(&self, writer: &mut XmlWriter) {
        writer.start("author", &[]);
        writer.text_element("name", &[], &self.name);
        if let Some(email) = &self.email {
            writer.text_element("email", &[], email);
        }
        if let Some(uri) = &self.uri {
            writer.text_element("uri", &[], uri);
        }
        writer.end("author");
    }
}
