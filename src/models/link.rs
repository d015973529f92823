//! Atom links.

use crate::error::{ParseError, ParseErrorKind};
use crate::parsable::{XmlElement, XmlWriter};

/// Link relation URIs used by the core.
pub mod rel {
    pub const SELF: &str = "self";
    pub const EDIT: &str = "edit";
    pub const EDIT_MEDIA: &str = "edit-media";
    pub const ALTERNATE: &str = "alternate";
    pub const FEED: &str = "http://schemas.google.com/g/2005#feed";
    pub const POST: &str = "http://schemas.google.com/g/2005#post";
    pub const BATCH: &str = "http://schemas.google.com/g/2005#batch";
    pub const RESUMABLE_CREATE_MEDIA: &str =
        "http://schemas.google.com/g/2005#resumable-create-media";
    pub const RESUMABLE_EDIT_MEDIA: &str =
        "http://schemas.google.com/g/2005#resumable-edit-media";
    pub const NEXT: &str = "http://www.iana.org/assignments/relation/next";
    pub const PREVIOUS: &str = "http://www.iana.org/assignments/relation/previous";

    /// Relations that appear both as a bare token and as an IANA URI.
    pub(crate) fn matches(actual: &str, wanted: &str) -> bool {
        if actual == wanted {
            return true;
        }
        const IANA: &str = "http://www.iana.org/assignments/relation/";
        actual.strip_prefix(IANA) == Some(wanted) || wanted.strip_prefix(IANA) == Some(actual)
    }
}

/// A typed reference from an entry or feed to another resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub rel: String,
    pub href: String,
    pub content_type: Option<String>,
    pub hreflang: Option<String>,
    pub title: Option<String>,
    pub length: Option<u64>,
}

impl Link {
    #[must_use]
    pub fn new(rel: &str, href: &str) -> Self {
        Self {
            rel: rel.to_owned(),
            href: href.to_owned(),
            content_type: None,
            hreflang: None,
            title: None,
            length: None,
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    #[must_use]
    pub fn is(&self, rel: &str) -> bool {
        rel::matches(&self.rel, rel)
    }

    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, ParseError> {
        let href = element.required_attribute("href")?;
        let length = match element.attribute("length") {
            Some(value) => Some(value.trim().parse::<u64>().map_err(|_| {
                element
                    .error(ParseErrorKind::InvalidFormat)
                    .with_literal(value)
            })?),
            None => None,
        };
        Ok(Self {
            // Atom defines a missing rel as "alternate".
            rel: element.attribute("rel").unwrap_or(rel::ALTERNATE).to_owned(),
            href: href.to_owned(),
            content_type: element.attribute("type").map(str::to_owned),
            hreflang: element.attribute("hreflang").map(str::to_owned),
            title: element.attribute("title").map(str::to_owned),
            length,
        })
    }

    pub(crate) fn write_xml(&self, writer: &mut XmlWriter) {
        let length = self.length.map(|l| l.to_string());
        let mut attributes = vec![("href", self.href.as_str()), ("rel", self.rel.as_str())];
        if let Some(t) = &self.content_type {
            attributes.push(("type", t.as_str()));
        }
        if let Some(lang) = &self.hreflang {
            attributes.push(("hreflang", lang.as_str()));
        }
        if let Some(title) = &self.title {
            attributes.push(("title", title.as_str()));
        }
        if let Some(length) = &length {
            attributes.push(("length", length.as_str()));
        }
        writer.empty("link", &attributes);
    }
}

/// Shared lookup over a link list.
pub(crate) fn look_up<'a>(links: &'a [Link], rel: &str) -> Option<&'a Link> {
    links.iter().find(|l| l.is(rel))
}
