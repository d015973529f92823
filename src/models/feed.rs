//! Paginated collections of entries.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::link::{self, rel};
use super::{Author, Category, Link};
use crate::error::{ParseError, ParseErrorKind};
use crate::parsable::{self, ns, xml, ContentType, JsonMember, Parsable, XmlElement};

/// A page of entries returned by a query, plus its paging metadata.
///
/// Feeds are read-only once decoded. Entries are owned by the feed; take
/// clones or call [`into_entries`](Feed::into_entries) to keep them.
#[derive(Debug, Clone)]
pub struct Feed<E> {
    pub id: Option<String>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub kind: Option<String>,
    pub links: Vec<Link>,
    pub categories: Vec<Category>,
    pub authors: Vec<Author>,
    /// Total number of results across all pages, when the server says.
    pub total_results: Option<u32>,
    pub items_per_page: Option<u32>,
    /// One-based index of the first entry (offset-paginated services).
    pub start_index: Option<u32>,
    /// Token for the next page (token-paginated services).
    pub next_page_token: Option<String>,
    entries: Vec<E>,
}

impl<E> Default for Feed<E> {
    fn default() -> Self {
        Self {
            id: None,
            title: None,
            subtitle: None,
            updated: None,
            etag: None,
            kind: None,
            links: Vec::new(),
            categories: Vec::new(),
            authors: Vec::new(),
            total_results: None,
            items_per_page: None,
            start_index: None,
            next_page_token: None,
            entries: Vec::new(),
        }
    }
}

impl<E> Feed<E> {
    /// An empty feed, returned when a paginated query has no more pages.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    #[must_use]
    pub fn into_entries(self) -> Vec<E> {
        self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn look_up_link(&self, rel: &str) -> Option<&Link> {
        link::look_up(&self.links, rel)
    }

    #[must_use]
    pub fn next_link(&self) -> Option<&Link> {
        self.look_up_link(rel::NEXT)
    }

    #[must_use]
    pub fn previous_link(&self) -> Option<&Link> {
        self.look_up_link(rel::PREVIOUS)
    }

    /// The service-advertised endpoint for batch operations.
    #[must_use]
    pub fn batch_link(&self) -> Option<&Link> {
        self.look_up_link(rel::BATCH)
    }
}

impl<E: Parsable> Feed<E> {
    /// Decode a feed without progress reporting.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        Self::parse_with_progress(bytes, |_, _, _| {})
    }

    /// Decode a feed, calling `progress(index, total, entry)` for every
    /// entry in document order as soon as it is decoded.
    ///
    /// Entries whose kind `E` does not represent are logged and skipped;
    /// they do not consume an index.
    pub fn parse_with_progress<F>(bytes: &[u8], mut progress: F) -> Result<Self, ParseError>
    where
        F: FnMut(usize, Option<u32>, &E),
    {
        match E::CONTENT_TYPE {
            ContentType::Atom => Self::parse_xml(bytes, &mut progress),
            ContentType::Json => Self::parse_json(bytes, &mut progress),
        }
    }

    /// Find an entry by its server id.
    #[must_use]
    pub fn look_up_entry(&self, id: &str) -> Option<&E> {
        self.entries
            .iter()
            .find(|e| e.entry().id.as_deref() == Some(id))
    }

    fn parse_xml(
        bytes: &[u8],
        progress: &mut dyn FnMut(usize, Option<u32>, &E),
    ) -> Result<Self, ParseError> {
        let root = xml::parse_document(bytes).map_err(|e| e.with_source(bytes))?;
        if !root.is(ns::ATOM, "feed") {
            return Err(root
                .error(ParseErrorKind::MissingElement)
                .with_literal(root.name.clone())
                .with_source(bytes));
        }

        let mut feed = Self {
            etag: root.attribute_ns(ns::GD, "etag").map(str::to_owned),
            ..Self::default()
        };

        // Metadata first so the progress callback knows the total.
        for child in root.elements().filter(|c| !c.is(ns::ATOM, "entry")) {
            feed.parse_xml_metadata(child)
                .map_err(|e| e.with_source(bytes))?;
        }

        for child in root.elements().filter(|c| c.is(ns::ATOM, "entry")) {
            match parsable::decode_xml::<E>(child).map_err(|e| e.with_source(bytes))? {
                Some(entry) => feed.push_entry(entry, progress),
                None => tracing::debug!(
                    kind = parsable::xml_kind(child).as_deref(),
                    "skipping feed entry of unknown kind"
                ),
            }
        }

        Ok(feed)
    }

    fn parse_xml_metadata(&mut self, element: &XmlElement) -> Result<(), ParseError> {
        match (element.namespace.as_deref(), element.name.as_str()) {
            (Some(ns::ATOM), "id") => set_once(&mut self.id, element.text(), element)?,
            (Some(ns::ATOM), "title") => set_once(&mut self.title, element.text(), element)?,
            (Some(ns::ATOM), "subtitle") => set_once(&mut self.subtitle, element.text(), element)?,
            (Some(ns::ATOM), "updated") => {
                set_once(&mut self.updated, element.datetime()?, element)?;
            }
            (Some(ns::ATOM), "link") => self.links.push(Link::from_xml(element)?),
            (Some(ns::ATOM), "author") => self.authors.push(Author::from_xml(element)?),
            (Some(ns::ATOM), "category") => {
                let category = Category::from_xml(element)?;
                if category.is_kind() {
                    self.kind = Some(category.term.clone());
                }
                self.categories.push(category);
            }
            (Some(ns::OPENSEARCH), "totalResults") => {
                set_once(&mut self.total_results, element.parse_text()?, element)?;
            }
            (Some(ns::OPENSEARCH), "startIndex") => {
                set_once(&mut self.start_index, element.parse_text()?, element)?;
            }
            (Some(ns::OPENSEARCH), "itemsPerPage") => {
                set_once(&mut self.items_per_page, element.parse_text()?, element)?;
            }
            _ => tracing::trace!(path = element.path(), "ignoring feed element"),
        }
        Ok(())
    }

    fn parse_json(
        bytes: &[u8],
        progress: &mut dyn FnMut(usize, Option<u32>, &E),
    ) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let object = value
            .as_object()
            .ok_or_else(|| ParseError::new(ParseErrorKind::Malformed, "/"))?;

        let mut feed = Self::default();
        let mut items = None;
        for (name, value) in object {
            let member = JsonMember::new("", name, value);
            match member.name {
                "items" => items = Some(member.array()?),
                "kind" => feed.kind = member.optional_string()?,
                "etag" => feed.etag = member.optional_string()?,
                "id" => feed.id = member.optional_string()?,
                "title" => feed.title = member.optional_string()?,
                "nextPageToken" => feed.next_page_token = member.optional_string()?,
                "updated" => feed.updated = Some(member.datetime()?),
                "selfLink" => feed.links.push(Link::new(rel::SELF, &member.string()?)),
                "nextLink" => feed.links.push(Link::new(rel::NEXT, &member.string()?)),
                "totalItems" | "totalResults" => {
                    let total = member.uint64()?;
                    feed.total_results = Some(
                        u32::try_from(total)
                            .map_err(|_| member.error(ParseErrorKind::OutOfRange))?,
                    );
                }
                _ => tracing::trace!(path = member.path(), "ignoring feed member"),
            }
        }

        for (index, item) in items.unwrap_or_default().iter().enumerate() {
            let path = format!("/items/{index}");
            let object = item
                .as_object()
                .ok_or_else(|| ParseError::new(ParseErrorKind::Malformed, path.clone()))?;
            match parsable::decode_json::<E>(object, &path)? {
                Some(entry) => feed.push_entry(entry, progress),
                None => {
                    let kind = object.get("kind").and_then(Value::as_str);
                    tracing::debug!(kind, "skipping feed item of unknown kind");
                }
            }
        }

        Ok(feed)
    }

    fn push_entry(&mut self, entry: E, progress: &mut dyn FnMut(usize, Option<u32>, &E)) {
        progress(self.entries.len(), self.total_results, &entry);
        self.entries.push(entry);
    }
}

impl<E> IntoIterator for Feed<E> {
    type Item = E;
    type IntoIter = std::vec::IntoIter<E>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a, E> IntoIterator for &'a Feed<E> {
    type Item = &'a E;
    type IntoIter = std::slice::Iter<'a, E>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, element: &XmlElement) -> Result<(), ParseError> {
    if slot.is_some() {
        return Err(element.error(ParseErrorKind::DuplicateElement));
    }
    *slot = Some(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Entry;
    use crate::parsable::{JsonMember, Handled};

    const FEED: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<feed xmlns='http://www.w3.org/2005/Atom'
      xmlns:openSearch='http://a9.com/-/spec/opensearch/1.1/'
      xmlns:gd='http://schemas.google.com/g/2005' gd:etag='W/"feed1"'>
  <id>https://example/feeds/items</id>
  <updated>2012-01-01T00:00:00Z</updated>
  <title>Items</title>
  <link rel='http://schemas.google.com/g/2005#batch' href='https://example/feeds/items/batch'/>
  <link rel='next' href='https://example/feeds/items?start-index=3'/>
  <entry><id>a</id><title>A</title></entry>
  <entry><id>b</id><title>B</title></entry>
  <openSearch:totalResults>7</openSearch:totalResults>
  <openSearch:startIndex>1</openSearch:startIndex>
  <openSearch:itemsPerPage>2</openSearch:itemsPerPage>
</feed>"#;

    #[test]
    fn test_atom_feed_metadata_and_progress() {
        let mut seen = Vec::new();
        let feed = Feed::<Entry>::parse_with_progress(FEED.as_bytes(), |i, total, e| {
            seen.push((i, total, e.id.clone().unwrap()));
        })
        .unwrap();

        assert_eq!(feed.len(), 2);
        assert_eq!(feed.etag.as_deref(), Some("W/\"feed1\""));
        assert_eq!(feed.total_results, Some(7));
        assert_eq!(feed.items_per_page, Some(2));
        assert_eq!(feed.start_index, Some(1));
        assert_eq!(
            feed.batch_link().map(|l| l.href.as_str()),
            Some("https://example/feeds/items/batch")
        );
        assert!(feed.next_link().is_some());
        // Total is known even though it follows the entries in the document.
        assert_eq!(
            seen,
            vec![(0, Some(7), "a".to_owned()), (1, Some(7), "b".to_owned())]
        );
        assert_eq!(feed.look_up_entry("b").unwrap().title.as_deref(), Some("B"));
    }

    #[test]
    fn test_not_a_feed() {
        let err = Feed::<Entry>::parse_from_bytes(b"<entry xmlns='http://www.w3.org/2005/Atom'/>")
            .unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MissingElement);
    }

    #[derive(Debug, Clone, Default)]
    struct TaskList {
        entry: Entry,
    }

    impl Parsable for TaskList {
        const CONTENT_TYPE: ContentType = ContentType::Json;
        const KIND: Option<&'static str> = Some("tasks#taskList");

        fn entry(&self) -> &Entry {
            &self.entry
        }

        fn entry_mut(&mut self) -> &mut Entry {
            &mut self.entry
        }

        fn parse_json_member(&mut self, _member: &JsonMember<'_>) -> Result<Handled, ParseError> {
            Ok(Handled::No)
        }
    }

    #[test]
    fn test_json_feed_skips_unknown_kinds() {
        let body = serde_json::json!({
            "kind": "tasks#taskLists",
            "etag": "\"e1\"",
            "nextPageToken": "pg2",
            "items": [
                {"kind": "tasks#taskList", "id": "l1", "title": "One"},
                {"kind": "tasks#somethingElse", "id": "x"},
                {"kind": "tasks#taskList", "id": "l2", "title": "Two"}
            ]
        });
        let mut indices = Vec::new();
        let feed = Feed::<TaskList>::parse_with_progress(body.to_string().as_bytes(), |i, _, _| {
            indices.push(i);
        })
        .unwrap();

        assert_eq!(feed.len(), 2);
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(feed.next_page_token.as_deref(), Some("pg2"));
        assert_eq!(feed.etag.as_deref(), Some("\"e1\""));
        assert_eq!(feed.entries()[1].entry.id.as_deref(), Some("l2"));
    }

    #[test]
    fn test_json_item_errors_carry_index() {
        let body = br#"{"items":[{"updated":"nope"}]}"#;
        let err = Feed::<TaskList>::parse_from_bytes(body).unwrap_err();
        assert_eq!(err.path, "/items/0/updated");
    }
}
