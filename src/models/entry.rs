//! The base entry shared by every entity.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::link::{self, rel};
use super::{Author, Category, Link};
use crate::error::{ParseError, ParseErrorKind};
use crate::parsable::{
    format_iso8601, ns, ContentType, JsonMember, Namespaces, Parsable, XmlElement, XmlWriter,
};

/// Entry body content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Inline text.
    Text(String),
    /// Out-of-line content referenced by URI.
    Uri {
        src: String,
        content_type: Option<String>,
    },
}

/// A parsable with server identity.
///
/// `id`, `updated` and `etag` are owned by the server; locally they stay
/// empty or stale until the entry is inserted or fetched again. The entry
/// is also the generic Atom entity: services without a richer type can
/// query and update plain `Entry` values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub id: Option<String>,
    pub etag: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub content: Option<Content>,
    pub rights: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub published: Option<DateTime<Utc>>,
    pub authors: Vec<Author>,
    pub categories: Vec<Category>,
    pub links: Vec<Link>,
    /// Elements from unknown namespaces, written back on update.
    pub extra_elements: Vec<XmlElement>,
    pub namespaces: Namespaces,
    server_constructed: bool,
}

impl Entry {
    #[must_use]
    pub fn new(title: &str) -> Self {
        Self {
            title: Some(title.to_owned()),
            ..Self::default()
        }
    }

    /// Whether the server has assigned this entry an id.
    #[must_use]
    pub fn is_inserted(&self) -> bool {
        self.id.is_some()
    }

    /// Whether the entry was decoded from a server response.
    #[must_use]
    pub fn is_server_constructed(&self) -> bool {
        self.server_constructed
    }

    pub(crate) fn mark_server_constructed(&mut self) {
        self.server_constructed = true;
    }

    /// Term of the `kind` category.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.categories
            .iter()
            .find(|c| c.is_kind())
            .map(|c| c.term.as_str())
    }

    /// Replace the `kind` category.
    pub fn set_kind(&mut self, term: &str) {
        self.categories.retain(|c| !c.is_kind());
        self.categories.push(Category::kind(term));
    }

    #[must_use]
    pub fn look_up_link(&self, rel: &str) -> Option<&Link> {
        link::look_up(&self.links, rel)
    }

    pub fn look_up_links<'a>(&'a self, rel: &'a str) -> impl Iterator<Item = &'a Link> + 'a {
        self.links.iter().filter(move |l| l.is(rel))
    }

    /// Add a link unless one with the same relation and target exists.
    pub fn add_link(&mut self, link: Link) -> bool {
        if self
            .links
            .iter()
            .any(|l| l.rel == link.rel && l.href == link.href)
        {
            return false;
        }
        self.links.push(link);
        true
    }

    /// Remove every link with the given relation.
    pub fn remove_links(&mut self, rel: &str) {
        self.links.retain(|l| !l.is(rel));
    }

    /// Add a category unless one with the same scheme and term exists.
    pub fn add_category(&mut self, category: Category) -> bool {
        if self
            .categories
            .iter()
            .any(|c| c.scheme == category.scheme && c.term == category.term)
        {
            return false;
        }
        self.categories.push(category);
        true
    }

    pub fn add_author(&mut self, author: Author) {
        self.authors.push(author);
    }

    /// URI used to update or delete the entry: `edit`, falling back to `self`.
    #[must_use]
    pub fn edit_uri(&self) -> Option<&str> {
        self.look_up_link(rel::EDIT)
            .or_else(|| self.look_up_link(rel::SELF))
            .map(|l| l.href.as_str())
    }

    pub(crate) fn parse_base_xml(&mut self, element: &XmlElement) -> Result<(), ParseError> {
        match (element.namespace.as_deref(), element.name.as_str()) {
            (Some(ns::ATOM), "id") => set_once(&mut self.id, element.text(), element),
            (Some(ns::ATOM), "title") => set_once(&mut self.title, element.text(), element),
            (Some(ns::ATOM), "summary") => set_once(&mut self.summary, element.text(), element),
            (Some(ns::ATOM), "rights") => set_once(&mut self.rights, element.text(), element),
            (Some(ns::ATOM), "updated") => set_once(&mut self.updated, element.datetime()?, element),
            (Some(ns::ATOM), "published") => {
                set_once(&mut self.published, element.datetime()?, element)
            }
            (Some(ns::ATOM), "content") => {
                let content = match element.attribute("src") {
                    Some(src) => Content::Uri {
                        src: src.to_owned(),
                        content_type: element.attribute("type").map(str::to_owned),
                    },
                    None => Content::Text(element.text()),
                };
                set_once(&mut self.content, content, element)
            }
            (Some(ns::ATOM), "category") => {
                self.add_category(Category::from_xml(element)?);
                Ok(())
            }
            (Some(ns::ATOM), "link") => {
                self.links.push(Link::from_xml(element)?);
                Ok(())
            }
            (Some(ns::ATOM), "author") => {
                self.authors.push(Author::from_xml(element)?);
                Ok(())
            }
            (Some(ns::ATOM | ns::GD | ns::APP | ns::BATCH | ns::OPENSEARCH), _) => {
                tracing::debug!(path = element.path(), "ignoring unhandled element");
                Ok(())
            }
            _ => {
                self.extra_elements.push(element.clone());
                Ok(())
            }
        }
    }

    pub(crate) fn parse_base_json(&mut self, member: &JsonMember<'_>) -> Result<(), ParseError> {
        match member.name {
            "id" => self.id = member.optional_string()?,
            "title" => self.title = member.optional_string()?,
            "description" => self.summary = member.optional_string()?,
            "etag" => self.etag = member.optional_string()?,
            "updated" => self.updated = Some(member.datetime()?),
            "selfLink" => {
                let href = member.string()?;
                self.remove_links(rel::SELF);
                self.links.push(Link::new(rel::SELF, &href));
            }
            "kind" => self.set_kind(&member.string()?),
            _ => tracing::debug!(path = member.path(), "ignoring unhandled member"),
        }
        Ok(())
    }

    pub(crate) fn write_base_xml(&self, writer: &mut XmlWriter, kind: Option<&str>) {
        if let Some(title) = &self.title {
            writer.text_element("title", &[("type", "text")], title);
        }
        if let Some(id) = &self.id {
            writer.text_element("id", &[], id);
        }
        if let Some(updated) = &self.updated {
            writer.text_element("updated", &[], &format_iso8601(updated));
        }
        if let Some(published) = &self.published {
            writer.text_element("published", &[], &format_iso8601(published));
        }
        if let Some(summary) = &self.summary {
            writer.text_element("summary", &[("type", "text")], summary);
        }
        if let Some(rights) = &self.rights {
            writer.text_element("rights", &[], rights);
        }
        match &self.content {
            Some(Content::Text(text)) => writer.text_element("content", &[("type", "text")], text),
            Some(Content::Uri { src, content_type }) => {
                let mut attributes = vec![("src", src.as_str())];
                if let Some(t) = content_type {
                    attributes.push(("type", t.as_str()));
                }
                writer.empty("content", &attributes);
            }
            None => {}
        }
        if let (Some(kind), None) = (kind, self.kind()) {
            Category::kind(kind).write_xml(writer);
        }
        for category in &self.categories {
            category.write_xml(writer);
        }
        for link in &self.links {
            link.write_xml(writer);
        }
        for author in &self.authors {
            author.write_xml(writer);
        }
    }

    pub(crate) fn write_base_json(&self, object: &mut Map<String, Value>, kind: Option<&str>) {
        if let Some(kind) = self.kind().or(kind) {
            object.insert("kind".into(), Value::from(kind));
        }
        if let Some(id) = &self.id {
            object.insert("id".into(), Value::from(id.as_str()));
        }
        if let Some(title) = &self.title {
            object.insert("title".into(), Value::from(title.as_str()));
        }
        if let Some(etag) = &self.etag {
            object.insert("etag".into(), Value::from(etag.as_str()));
        }
        if let Some(summary) = &self.summary {
            object.insert("description".into(), Value::from(summary.as_str()));
        }
        if let Some(updated) = &self.updated {
            object.insert("updated".into(), Value::from(format_iso8601(updated)));
        }
        if let Some(link) = self.look_up_link(rel::SELF) {
            object.insert("selfLink".into(), Value::from(link.href.as_str()));
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, element: &XmlElement) -> Result<(), ParseError> {
    if slot.is_some() {
        return Err(element.error(ParseErrorKind::DuplicateElement));
    }
    *slot = Some(value);
    Ok(())
}

impl Parsable for Entry {
    const CONTENT_TYPE: ContentType = ContentType::Atom;

    fn entry(&self) -> &Entry {
        self
    }

    fn entry_mut(&mut self) -> &mut Entry {
        self
    }
}
