//! The parsable entity model.
//!
//! A [`Parsable`] is anything that travels over the wire as a single Atom
//! `<entry>` document or a single JSON object. The base [`Entry`] decodes the
//! common members; concrete entities add their own through the
//! `parse_*`/`write_*` hooks, which run before the base decoder and may
//! claim an element by returning [`Handled::Yes`].
//!
//! Each entity declares exactly one [`ContentType`]; the decoder is chosen
//! from it.
//!
//! # Example
//!
//! ```
//! use gdata::parsable::{self, ContentType, Handled, JsonMember, Parsable};
//! use gdata::{Entry, ParseError};
//!
//! #[derive(Debug, Clone, Default)]
//! struct Task {
//!     entry: Entry,
//!     notes: Option<String>,
//! }
//!
//! impl Parsable for Task {
//!     const CONTENT_TYPE: ContentType = ContentType::Json;
//!     const KIND: Option<&'static str> = Some("tasks#task");
//!
//!     fn entry(&self) -> &Entry { &self.entry }
//!     fn entry_mut(&mut self) -> &mut Entry { &mut self.entry }
//!
//!     fn parse_json_member(&mut self, member: &JsonMember<'_>) -> Result<Handled, ParseError> {
//!         if member.is("notes") {
//!             self.notes = member.optional_string()?;
//!             return Ok(Handled::Yes);
//!         }
//!         Ok(Handled::No)
//!     }
//! }
//!
//! let task: Task = parsable::parse_from_bytes(br#"{"kind":"tasks#task","title":"Buy milk","notes":"2%"}"#).unwrap();
//! assert_eq!(task.entry.title.as_deref(), Some("Buy milk"));
//! assert_eq!(task.notes.as_deref(), Some("2%"));
//! ```

pub mod json;
pub mod xml;

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{ParseError, ParseErrorKind};
use crate::models::{Category, Entry};

pub use json::JsonMember;
pub use xml::{XmlAttribute, XmlElement, XmlNode, XmlWriter};

/// Well-known namespace URIs.
pub mod ns {
    pub const ATOM: &str = "http://www.w3.org/2005/Atom";
    pub const GD: &str = "http://schemas.google.com/g/2005";
    pub const BATCH: &str = "http://schemas.google.com/gdata/batch";
    pub const OPENSEARCH: &str = "http://a9.com/-/spec/opensearch/1.1/";
    pub const APP: &str = "http://www.w3.org/2007/app";
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
}

/// Wire dialect of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Atom,
    Json,
}

impl ContentType {
    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Atom => "application/atom+xml",
            Self::Json => "application/json",
        }
    }

    /// Match a `Content-Type` header value, ignoring parameters.
    #[must_use]
    pub fn from_mime_type(value: &str) -> Option<Self> {
        let essence = value.split(';').next().unwrap_or_default().trim();
        match essence {
            "application/atom+xml" | "application/xml" | "text/xml" => Some(Self::Atom),
            "application/json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Result of an entity decoding hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The hook consumed the element or member.
    Yes,
    /// Delegate to the base decoder.
    No,
}

/// XML namespace prefixes declared on the root of a serialized entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespaces(BTreeMap<String, String>);

impl Namespaces {
    /// Bind `prefix` to `uri`, replacing an earlier binding.
    pub fn register(&mut self, prefix: &str, uri: &str) {
        self.0.insert(prefix.to_owned(), uri.to_owned());
    }

    #[must_use]
    pub fn get(&self, prefix: &str) -> Option<&str> {
        self.0.get(prefix).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(p, u)| (p.as_str(), u.as_str()))
    }
}

/// An entity with wire serialize/deserialize contracts.
///
/// Implementors embed an [`Entry`] and expose it through
/// [`entry`](Parsable::entry)/[`entry_mut`](Parsable::entry_mut). Entity
/// families that share a feed are modelled as an enum whose
/// [`new_for_kind`](Parsable::new_for_kind) picks the variant from the wire
/// discriminator.
pub trait Parsable: Default + Clone + Send + Sync + 'static {
    /// The single wire dialect this entity supports.
    const CONTENT_TYPE: ContentType;

    /// Discriminator written as the `kind` category (Atom) or member (JSON).
    const KIND: Option<&'static str> = None;

    /// Extra `(prefix, uri)` pairs declared on the serialized root.
    const NAMESPACES: &'static [(&'static str, &'static str)] = &[];

    fn entry(&self) -> &Entry;

    fn entry_mut(&mut self) -> &mut Entry;

    /// Construct an empty entity for a wire discriminator, or `None` if
    /// this type does not represent that kind.
    fn new_for_kind(kind: Option<&str>) -> Option<Self> {
        match (Self::KIND, kind) {
            (Some(expected), Some(found)) if expected != found => None,
            _ => Some(Self::default()),
        }
    }

    fn parse_xml_element(&mut self, _element: &XmlElement) -> Result<Handled, ParseError> {
        Ok(Handled::No)
    }

    fn parse_json_member(&mut self, _member: &JsonMember<'_>) -> Result<Handled, ParseError> {
        Ok(Handled::No)
    }

    /// Write the entity's own elements after the base Atom elements.
    fn write_xml(&self, _writer: &mut XmlWriter) {}

    /// Add the entity's own members after the base JSON members.
    fn write_json(&self, _object: &mut Map<String, Value>) {}

    /// Runs once every element or member has been visited.
    fn post_parse(&mut self) -> Result<(), ParseError> {
        Ok(())
    }

    /// Fill in defaults for an entity created locally.
    fn apply_default_values(&mut self) {}
}

/// Create a client-side entity with its default values applied.
#[must_use]
pub fn new_entity<P: Parsable>() -> P {
    let mut entity = P::default();
    entity.apply_default_values();
    entity
}

/// Decode a single entity from its wire representation.
pub fn parse_from_bytes<P: Parsable>(bytes: &[u8]) -> Result<P, ParseError> {
    let decoded = match P::CONTENT_TYPE {
        ContentType::Atom => {
            let root = xml::parse_document(bytes).map_err(|e| e.with_source(bytes))?;
            if !root.is(ns::ATOM, "entry") {
                return Err(root
                    .error(ParseErrorKind::MissingElement)
                    .with_literal(root.name.clone())
                    .with_source(bytes));
            }
            decode_xml::<P>(&root).map_err(|e| e.with_source(bytes))?
        }
        ContentType::Json => {
            let value: Value = serde_json::from_slice(bytes)?;
            let object = value
                .as_object()
                .ok_or_else(|| ParseError::new(ParseErrorKind::Malformed, "/"))?;
            decode_json::<P>(object, "")?
        }
    };
    decoded.ok_or_else(|| {
        ParseError::new(ParseErrorKind::OutOfRange, "kind")
            .with_literal(P::KIND.unwrap_or_default())
    })
}

/// Encode an entity in its declared content type.
#[must_use]
pub fn serialize<P: Parsable>(entity: &P) -> Vec<u8> {
    match P::CONTENT_TYPE {
        ContentType::Atom => {
            let mut writer = XmlWriter::new();
            write_xml_entry(entity, &mut writer, &[], |_| {});
            writer.into_string().into_bytes()
        }
        ContentType::Json => to_json_value(entity).to_string().into_bytes(),
    }
}

/// Declare `prefix` on the root element when `entity` is serialized.
///
/// JSON entities ignore namespaces.
pub fn register_namespace<P: Parsable>(entity: &mut P, prefix: &str, uri: &str) {
    entity.entry_mut().namespaces.register(prefix, uri);
}

/// The `kind` category term of an Atom element, if any.
pub(crate) fn xml_kind(element: &XmlElement) -> Option<String> {
    element
        .elements()
        .filter(|c| c.is(ns::ATOM, "category"))
        .find(|c| c.attribute("scheme") == Some(Category::KIND_SCHEME))
        .and_then(|c| c.attribute("term"))
        .map(str::to_owned)
}

/// Decode an `<entry>` element. `Ok(None)` means the kind is not one `P`
/// represents.
pub(crate) fn decode_xml<P: Parsable>(element: &XmlElement) -> Result<Option<P>, ParseError> {
    let kind = xml_kind(element);
    let Some(mut entity) = P::new_for_kind(kind.as_deref()) else {
        return Ok(None);
    };
    let etag = element.attribute_ns(ns::GD, "etag").map(str::to_owned);
    {
        let entry = entity.entry_mut();
        entry.mark_server_constructed();
        entry.etag = etag;
    }
    for child in element.elements() {
        if entity.parse_xml_element(child)? == Handled::No {
            entity.entry_mut().parse_base_xml(child)?;
        }
    }
    entity.post_parse()?;
    Ok(Some(entity))
}

/// Decode a JSON object. `Ok(None)` means the kind is not one `P`
/// represents.
pub(crate) fn decode_json<P: Parsable>(
    object: &Map<String, Value>,
    path: &str,
) -> Result<Option<P>, ParseError> {
    let kind = object.get("kind").and_then(Value::as_str);
    let Some(mut entity) = P::new_for_kind(kind) else {
        return Ok(None);
    };
    entity.entry_mut().mark_server_constructed();
    for (name, value) in object {
        let member = JsonMember::new(path, name, value);
        if entity.parse_json_member(&member)? == Handled::No {
            entity.entry_mut().parse_base_json(&member)?;
        }
    }
    entity.post_parse()?;
    Ok(Some(entity))
}

/// Write `entity` as an `<entry>` element. `extra` runs first inside the
/// element and is used by batch encoding.
pub(crate) fn write_xml_entry<P: Parsable>(
    entity: &P,
    writer: &mut XmlWriter,
    extra_namespaces: &[(&str, &str)],
    extra: impl FnOnce(&mut XmlWriter),
) {
    let entry = entity.entry();

    let mut declarations: Vec<(String, String)> = vec![
        ("xmlns".to_owned(), ns::ATOM.to_owned()),
        ("xmlns:gd".to_owned(), ns::GD.to_owned()),
    ];
    let mut registered: Vec<(&str, &str)> = P::NAMESPACES.to_vec();
    registered.extend_from_slice(extra_namespaces);
    registered.extend(entry.namespaces.iter());
    for (prefix, uri) in registered {
        let key = format!("xmlns:{prefix}");
        if !declarations.iter().any(|(k, _)| *k == key) {
            declarations.push((key, uri.to_owned()));
        }
    }
    if let Some(etag) = &entry.etag {
        declarations.push(("gd:etag".to_owned(), etag.clone()));
    }
    let attributes: Vec<(&str, &str)> = declarations
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    writer.start("entry", &attributes);
    extra(writer);
    entry.write_base_xml(writer, P::KIND);
    entity.write_xml(writer);
    for element in &entry.extra_elements {
        writer.element(element);
    }
    writer.end("entry");
}

/// Encode a JSON entity as a [`Value`].
pub(crate) fn to_json_value<P: Parsable>(entity: &P) -> Value {
    let mut object = Map::new();
    entity.entry().write_base_json(&mut object, P::KIND);
    entity.write_json(&mut object);
    Value::Object(object)
}

/// Parse an ISO-8601 timestamp. Date-only values are midnight UTC and
/// values without an offset are taken as UTC.
#[must_use]
pub fn parse_iso8601(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[must_use]
pub fn format_iso8601(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Link, rel};
    use chrono::TimeZone;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Album {
        entry: Entry,
        photo_count: Option<u32>,
    }

    const PHOTO_NS: &str = "http://schemas.google.com/photos/2007";

    impl Parsable for Album {
        const CONTENT_TYPE: ContentType = ContentType::Atom;
        const KIND: Option<&'static str> = Some("http://schemas.google.com/photos/2007#album");
        const NAMESPACES: &'static [(&'static str, &'static str)] = &[("gphoto", PHOTO_NS)];

        fn entry(&self) -> &Entry {
            &self.entry
        }

        fn entry_mut(&mut self) -> &mut Entry {
            &mut self.entry
        }

        fn parse_xml_element(&mut self, element: &XmlElement) -> Result<Handled, ParseError> {
            if element.is(PHOTO_NS, "numphotos") {
                if self.photo_count.is_some() {
                    return Err(element.error(ParseErrorKind::DuplicateElement));
                }
                self.photo_count = Some(element.parse_text()?);
                return Ok(Handled::Yes);
            }
            Ok(Handled::No)
        }

        fn write_xml(&self, writer: &mut XmlWriter) {
            if let Some(count) = self.photo_count {
                writer.text_element("gphoto:numphotos", &[], &count.to_string());
            }
        }

        fn apply_default_values(&mut self) {
            self.entry.rights = Some("private".to_owned());
        }
    }

    fn sample_album() -> Album {
        let mut album: Album = new_entity();
        album.entry.id = Some("http://example/album/1".into());
        album.entry.title = Some("Holiday <2012>".into());
        album.entry.updated = Some(Utc.with_ymd_and_hms(2012, 8, 1, 9, 30, 0).unwrap());
        album.entry.add_link(Link::new(rel::SELF, "http://example/album/1"));
        album.entry.add_category(Category::new("http://example/tags", "beach"));
        album.photo_count = Some(12);
        album
    }

    #[test]
    fn test_xml_round_trip() {
        let album = sample_album();
        let bytes = serialize(&album);
        let parsed: Album = parse_from_bytes(&bytes).unwrap();

        assert_eq!(parsed.entry.id, album.entry.id);
        assert_eq!(parsed.entry.title, album.entry.title);
        assert_eq!(parsed.entry.updated, album.entry.updated);
        assert_eq!(parsed.entry.links, album.entry.links);
        assert_eq!(parsed.photo_count, Some(12));
        // The kind category is added on the wire.
        assert_eq!(parsed.entry.kind(), Album::KIND);
        assert!(parsed.entry.is_server_constructed());
        assert!(!album.entry.is_server_constructed());
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Task {
        entry: Entry,
        notes: Option<String>,
    }

    impl Parsable for Task {
        const CONTENT_TYPE: ContentType = ContentType::Json;
        const KIND: Option<&'static str> = Some("tasks#task");

        fn entry(&self) -> &Entry {
            &self.entry
        }

        fn entry_mut(&mut self) -> &mut Entry {
            &mut self.entry
        }

        fn parse_json_member(&mut self, member: &JsonMember<'_>) -> Result<Handled, ParseError> {
            if member.name == "notes" {
                self.notes = member.optional_string()?;
                return Ok(Handled::Yes);
            }
            Ok(Handled::No)
        }

        fn write_json(&self, object: &mut Map<String, Value>) {
            if let Some(notes) = &self.notes {
                object.insert("notes".into(), Value::from(notes.as_str()));
            }
        }
    }

    #[test]
    fn test_json_round_trip() {
        let mut task: Task = new_entity();
        task.entry.id = Some("t1".into());
        task.entry.title = Some("Buy milk".into());
        task.entry.etag = Some("\"v1\"".into());
        task.entry.updated = Some(Utc.with_ymd_and_hms(2012, 8, 1, 9, 30, 0).unwrap());
        task.entry.add_link(Link::new(rel::SELF, "https://example/tasks/t1"));
        task.entry.set_kind("tasks#task");
        task.notes = Some("2%".into());

        let parsed: Task = parse_from_bytes(&serialize(&task)).unwrap();

        assert_eq!(parsed.entry.id, task.entry.id);
        assert_eq!(parsed.entry.title, task.entry.title);
        assert_eq!(parsed.entry.etag, task.entry.etag);
        assert_eq!(parsed.entry.updated, task.entry.updated);
        assert_eq!(parsed.entry.links, task.entry.links);
        assert_eq!(parsed.entry.categories, task.entry.categories);
        assert_eq!(parsed.entry.kind(), Some("tasks#task"));
        assert_eq!(parsed.notes, task.notes);
    }

    #[test]
    fn test_json_etag_written() {
        let doc = br#"{"kind":"tasks#task","id":"t1","title":"x","etag":"\"v1\""}"#;
        let task: Task = parse_from_bytes(doc).unwrap();
        let value: Value = serde_json::from_slice(&serialize(&task)).unwrap();
        assert_eq!(value["etag"], "\"v1\"");
    }

    #[test]
    fn test_default_values_only_for_client_entities() {
        let local: Album = new_entity();
        assert_eq!(local.entry.rights.as_deref(), Some("private"));

        let doc = br#"<entry xmlns="http://www.w3.org/2005/Atom"><title>t</title></entry>"#;
        let parsed: Album = parse_from_bytes(doc).unwrap();
        assert_eq!(parsed.entry.rights, None);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let doc = br#"<entry xmlns="http://www.w3.org/2005/Atom">
            <category scheme="http://schemas.google.com/g/2005#kind" term="http://schemas.google.com/photos/2007#photo"/>
        </entry>"#;
        let err = parse_from_bytes::<Album>(doc).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::OutOfRange);
    }

    #[test]
    fn test_duplicate_subclass_element() {
        let doc = br#"<entry xmlns="http://www.w3.org/2005/Atom" xmlns:gphoto="http://schemas.google.com/photos/2007">
            <gphoto:numphotos>1</gphoto:numphotos><gphoto:numphotos>2</gphoto:numphotos>
        </entry>"#;
        let err = parse_from_bytes::<Album>(doc).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::DuplicateElement);
        assert_eq!(err.path, "/entry/numphotos");
        assert!(err.excerpt.is_some());
    }

    #[test]
    fn test_root_must_be_entry() {
        let err = parse_from_bytes::<Entry>(br#"<feed xmlns="http://www.w3.org/2005/Atom"/>"#)
            .unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::MissingElement);
    }

    #[test]
    fn test_registered_namespace_declared() {
        let mut entry = Entry::default();
        register_namespace(&mut entry, "media", "http://search.yahoo.com/mrss/");
        let text = String::from_utf8(serialize(&entry)).unwrap();
        assert!(text.contains("xmlns:media=\"http://search.yahoo.com/mrss/\""));
    }

    #[test]
    fn test_iso8601_variants() {
        let expected = Utc.with_ymd_and_hms(2009, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_iso8601("2009-01-01T00:00:00Z"), Some(expected));
        assert_eq!(parse_iso8601("2009-01-01T00:00:00.000Z"), Some(expected));
        assert_eq!(parse_iso8601("2009-01-01T01:00:00+01:00"), Some(expected));
        assert_eq!(parse_iso8601("2009-01-01"), Some(expected));
        assert_eq!(parse_iso8601("yesterday"), None);
        assert_eq!(format_iso8601(&expected), "2009-01-01T00:00:00Z");
    }

    #[test]
    fn test_content_type_mime() {
        assert_eq!(
            ContentType::from_mime_type("application/atom+xml; charset=UTF-8"),
            Some(ContentType::Atom)
        );
        assert_eq!(ContentType::from_mime_type("application/json"), Some(ContentType::Json));
        assert_eq!(ContentType::from_mime_type("image/png"), None);
    }
}
