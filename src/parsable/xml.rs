//! Namespace-aware XML element tree and writer.
//!
//! Atom documents are small enough to decode into a tree first; entity hooks
//! then walk the children of the root. Elements from namespaces nobody
//! claimed are kept as [`XmlElement`] values and written back verbatim.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{ns, parse_iso8601};
use crate::error::{ParseError, ParseErrorKind};

/// A decoded element with its namespace resolved.
#[derive(Debug, Clone)]
pub struct XmlElement {
    pub namespace: Option<String>,
    pub prefix: Option<String>,
    pub name: String,
    pub attributes: Vec<XmlAttribute>,
    pub children: Vec<XmlNode>,
    path: String,
    offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlAttribute {
    pub namespace: Option<String>,
    pub prefix: Option<String>,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

// Location is bookkeeping, not content.
impl PartialEq for XmlElement {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace
            && self.name == other.name
            && self.attributes == other.attributes
            && self.children == other.children
    }
}

impl Eq for XmlElement {}

impl XmlElement {
    /// Create a detached element, e.g. for building a payload by hand.
    #[must_use]
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_owned),
            prefix: None,
            name: name.to_owned(),
            attributes: Vec::new(),
            children: Vec::new(),
            path: format!("/{name}"),
            offset: 0,
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: &str) -> Self {
        self.children.push(XmlNode::Text(text.to_owned()));
        self
    }

    /// Element path from the document root, e.g. `/feed/entry/title`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.namespace.as_deref() == Some(namespace) && self.name == name
    }

    /// Look up an attribute that carries no namespace.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.name == name)
            .map(|a| a.value.as_str())
    }

    #[must_use]
    pub fn attribute_ns(&self, namespace: &str, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.as_deref() == Some(namespace) && a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn required_attribute(&self, name: &str) -> Result<&str, ParseError> {
        self.attribute(name).ok_or_else(|| {
            ParseError::new(
                ParseErrorKind::MissingElement,
                format!("{}/@{name}", self.path),
            )
            .at_offset(self.offset)
        })
    }

    /// Child elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    #[must_use]
    pub fn child(&self, namespace: &str, name: &str) -> Option<&XmlElement> {
        self.elements().find(|e| e.is(namespace, name))
    }

    pub fn required_child(&self, namespace: &str, name: &str) -> Result<&XmlElement, ParseError> {
        self.child(namespace, name).ok_or_else(|| {
            ParseError::new(
                ParseErrorKind::MissingElement,
                format!("{}/{name}", self.path),
            )
            .at_offset(self.offset)
        })
    }

    /// Concatenated character data of the direct text children.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let XmlNode::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// An error located at this element.
    #[must_use]
    pub fn error(&self, kind: ParseErrorKind) -> ParseError {
        ParseError::new(kind, self.path.clone()).at_offset(self.offset)
    }

    /// Parse the trimmed text content with [`FromStr`].
    pub fn parse_text<T: FromStr>(&self) -> Result<T, ParseError> {
        let text = self.text();
        text.trim().parse().map_err(|_| {
            self.error(ParseErrorKind::InvalidFormat)
                .with_literal(text.trim())
        })
    }

    /// Parse the text content as an ISO-8601 timestamp.
    pub fn datetime(&self) -> Result<DateTime<Utc>, ParseError> {
        let text = self.text();
        parse_iso8601(&text).ok_or_else(|| {
            self.error(ParseErrorKind::InvalidFormat)
                .with_literal(text.trim())
        })
    }
}

/// Decode a whole document into its root element.
pub fn parse_document(source: &[u8]) -> Result<XmlElement, ParseError> {
    let mut reader = Reader::from_reader(source);
    let mut buf = Vec::new();
    let mut scopes: Vec<Vec<(String, String)>> = Vec::new();
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let offset = reader.buffer_position() as usize;
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            malformed(current_path(&stack), e.to_string(), reader.buffer_position() as usize)
        })?;

        match event {
            Event::Start(start) => {
                let element = open_element(&start, &mut scopes, &stack, offset)?;
                stack.push(element);
            }
            Event::Empty(start) => {
                let element = open_element(&start, &mut scopes, &stack, offset)?;
                scopes.pop();
                attach(element, &mut stack, &mut root)?;
            }
            Event::End(_) => {
                scopes.pop();
                let element = stack.pop().ok_or_else(|| {
                    malformed("/".to_owned(), "unbalanced end tag".to_owned(), offset)
                })?;
                attach(element, &mut stack, &mut root)?;
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| malformed(current_path(&stack), e.to_string(), offset))?;
                push_text(&mut stack, text);
            }
            Event::CData(data) => {
                let bytes = data.into_inner();
                push_text(&mut stack, String::from_utf8_lossy(&bytes));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(malformed(
            current_path(&stack),
            "unexpected end of document".to_owned(),
            source.len(),
        ));
    }

    root.ok_or_else(|| malformed("/".to_owned(), "empty document".to_owned(), 0))
}

fn malformed(path: String, message: String, offset: usize) -> ParseError {
    ParseError::new(ParseErrorKind::Malformed, path)
        .with_literal(message)
        .at_offset(offset)
}

fn current_path(stack: &[XmlElement]) -> String {
    stack
        .last()
        .map_or_else(|| "/".to_owned(), |e| e.path.clone())
}

fn push_text(stack: &mut [XmlElement], text: Cow<'_, str>) {
    // Character data outside the root is only ever whitespace.
    if let Some(parent) = stack.last_mut() {
        if let Some(XmlNode::Text(previous)) = parent.children.last_mut() {
            previous.push_str(&text);
        } else {
            parent.children.push(XmlNode::Text(text.into_owned()));
        }
    }
}

fn attach(
    element: XmlElement,
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
) -> Result<(), ParseError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(XmlNode::Element(element));
        return Ok(());
    }
    if root.is_some() {
        return Err(malformed(
            element.path.clone(),
            "more than one root element".to_owned(),
            element.offset,
        ));
    }
    *root = Some(element);
    Ok(())
}

fn open_element(
    start: &BytesStart<'_>,
    scopes: &mut Vec<Vec<(String, String)>>,
    stack: &[XmlElement],
    offset: usize,
) -> Result<XmlElement, ParseError> {
    let parent_path = stack.last().map_or("", |e| e.path.as_str());
    let qname = utf8(start.name().as_ref(), parent_path, offset)?;

    let mut bindings = Vec::new();
    let mut raw_attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute =
            attribute.map_err(|e| malformed(format!("{parent_path}/{qname}"), e.to_string(), offset))?;
        let key = utf8(attribute.key.as_ref(), parent_path, offset)?;
        let value = attribute
            .unescape_value()
            .map_err(|e| malformed(format!("{parent_path}/{qname}"), e.to_string(), offset))?
            .into_owned();
        if key == "xmlns" {
            bindings.push((String::new(), value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            bindings.push((prefix.to_owned(), value));
        } else {
            raw_attributes.push((key, value));
        }
    }
    scopes.push(bindings);

    let (prefix, name) = split_qname(&qname);
    let path = format!("{parent_path}/{name}");
    let namespace = match prefix {
        Some(p) => Some(resolve(scopes, p).ok_or_else(|| {
            malformed(path.clone(), format!("unbound prefix '{p}'"), offset)
        })?),
        None => resolve(scopes, ""),
    };

    let mut attributes = Vec::with_capacity(raw_attributes.len());
    for (key, value) in raw_attributes {
        let (attr_prefix, attr_name) = split_qname(&key);
        // Unprefixed attributes never take the default namespace.
        let attr_namespace = match attr_prefix {
            Some(p) => Some(resolve(scopes, p).ok_or_else(|| {
                malformed(path.clone(), format!("unbound prefix '{p}'"), offset)
            })?),
            None => None,
        };
        attributes.push(XmlAttribute {
            namespace: attr_namespace,
            prefix: attr_prefix.map(str::to_owned),
            name: attr_name.to_owned(),
            value,
        });
    }

    Ok(XmlElement {
        namespace,
        prefix: prefix.map(str::to_owned),
        name: name.to_owned(),
        attributes,
        children: Vec::new(),
        path,
        offset,
    })
}

fn utf8(bytes: &[u8], path: &str, offset: usize) -> Result<String, ParseError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| malformed(path.to_owned(), e.to_string(), offset))
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

fn resolve(scopes: &[Vec<(String, String)>], prefix: &str) -> Option<String> {
    if prefix == "xml" {
        return Some(ns::XML.to_owned());
    }
    for scope in scopes.iter().rev() {
        if let Some((_, uri)) = scope.iter().rev().find(|(p, _)| p == prefix) {
            return (!uri.is_empty()).then(|| uri.clone());
        }
    }
    None
}

/// Incremental XML serializer.
///
/// Names are written as given, so callers use the prefixes declared on the
/// document root (`gd:etag`, `batch:id`).
#[derive(Debug, Default)]
pub struct XmlWriter {
    out: String,
}

impl XmlWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, name: &str, attributes: &[(&str, &str)]) {
        self.open_tag(name, attributes);
        self.out.push('>');
    }

    pub fn empty(&mut self, name: &str, attributes: &[(&str, &str)]) {
        self.open_tag(name, attributes);
        self.out.push_str("/>");
    }

    pub fn end(&mut self, name: &str) {
        let _ = write!(self.out, "</{name}>");
    }

    pub fn text(&mut self, text: &str) {
        self.out.push_str(&escape(text));
    }

    /// `<name attrs>text</name>`
    pub fn text_element(&mut self, name: &str, attributes: &[(&str, &str)], text: &str) {
        self.start(name, attributes);
        self.text(text);
        self.end(name);
    }

    /// Write a preserved element inside a document whose default
    /// namespace is Atom.
    pub fn element(&mut self, element: &XmlElement) {
        self.foreign_element(element, Some(ns::ATOM));
    }

    fn foreign_element(&mut self, element: &XmlElement, default_ns: Option<&str>) {
        let mut declarations: Vec<(String, String)> = Vec::new();
        let qname = match &element.prefix {
            Some(prefix) => {
                declarations.push((
                    format!("xmlns:{prefix}"),
                    element.namespace.clone().unwrap_or_default(),
                ));
                format!("{prefix}:{}", element.name)
            }
            None => {
                if element.namespace.as_deref() != default_ns {
                    declarations.push((
                        "xmlns".to_owned(),
                        element.namespace.clone().unwrap_or_default(),
                    ));
                }
                element.name.clone()
            }
        };
        let child_default = match element.prefix {
            Some(_) => default_ns,
            None => element.namespace.as_deref(),
        };

        let mut attributes: Vec<(String, String)> = declarations;
        for attribute in &element.attributes {
            match (&attribute.prefix, &attribute.namespace) {
                (Some(prefix), Some(namespace)) => {
                    let declaration = format!("xmlns:{prefix}");
                    if prefix != "xml" && !attributes.iter().any(|(k, _)| *k == declaration) {
                        attributes.push((declaration, namespace.clone()));
                    }
                    attributes.push((format!("{prefix}:{}", attribute.name), attribute.value.clone()));
                }
                _ => attributes.push((attribute.name.clone(), attribute.value.clone())),
            }
        }
        let borrowed: Vec<(&str, &str)> = attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        if element.children.is_empty() {
            self.empty(&qname, &borrowed);
            return;
        }
        self.start(&qname, &borrowed);
        for child in &element.children {
            match child {
                XmlNode::Text(t) => self.text(t),
                XmlNode::Element(e) => self.foreign_element(e, child_default),
            }
        }
        self.end(&qname);
    }

    /// Append already-serialized markup.
    pub fn raw(&mut self, markup: &str) {
        self.out.push_str(markup);
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.out
    }

    fn open_tag(&mut self, name: &str, attributes: &[(&str, &str)]) {
        self.out.push('<');
        self.out.push_str(name);
        for (key, value) in attributes {
            let _ = write!(self.out, " {key}=\"{}\"", escape(*value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_default_and_prefixed_namespaces() {
        let doc = br#"<?xml version="1.0"?>
            <entry xmlns="http://www.w3.org/2005/Atom" xmlns:gd="http://schemas.google.com/g/2005" gd:etag="W/&quot;x&quot;">
              <title type="text">Hello &amp; bye</title>
              <gd:who rel="owner"/>
            </entry>"#;
        let root = parse_document(doc).unwrap();
        assert!(root.is(ns::ATOM, "entry"));
        assert_eq!(root.attribute_ns(ns::GD, "etag"), Some("W/\"x\""));

        let title = root.child(ns::ATOM, "title").unwrap();
        assert_eq!(title.text(), "Hello & bye");
        assert_eq!(title.attribute("type"), Some("text"));
        assert_eq!(title.path(), "/entry/title");

        let who = root.child(ns::GD, "who").unwrap();
        assert_eq!(who.prefix.as_deref(), Some("gd"));
    }

    #[test]
    fn test_malformed_document_reports_offset() {
        let err = parse_document(b"<entry><title>oops</entry>").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Malformed);
        assert!(err.offset.is_some());
    }

    #[test]
    fn test_empty_document_is_malformed() {
        let err = parse_document(b"   ").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Malformed);
    }

    #[test]
    fn test_unbound_prefix_is_malformed() {
        let err = parse_document(b"<x:entry/>").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::Malformed);
    }

    #[test]
    fn test_cdata_is_text() {
        let root = parse_document(b"<a><![CDATA[<b>]]></a>").unwrap();
        assert_eq!(root.text(), "<b>");
    }

    #[test]
    fn test_foreign_element_round_trips() {
        let doc = br#"<entry xmlns="http://www.w3.org/2005/Atom"><ext xmlns="urn:ext" a="1"><inner>v</inner></ext></entry>"#;
        let root = parse_document(doc).unwrap();
        let ext = root.child("urn:ext", "ext").unwrap().clone();

        let mut writer = XmlWriter::new();
        writer.start("entry", &[("xmlns", ns::ATOM)]);
        writer.element(&ext);
        writer.end("entry");
        let written = writer.into_string();

        let reparsed = parse_document(written.as_bytes()).unwrap();
        assert_eq!(reparsed.child("urn:ext", "ext"), Some(&ext));
    }

    #[test]
    fn test_shared_prefix_declared_once() {
        let doc = br#"<entry xmlns="http://www.w3.org/2005/Atom" xmlns:ext="urn:ext"><ext:rating ext:min="1" ext:max="5"/></entry>"#;
        let root = parse_document(doc).unwrap();
        let rating = root.child("urn:ext", "rating").unwrap().clone();

        let mut writer = XmlWriter::new();
        writer.start("entry", &[("xmlns", ns::ATOM)]);
        writer.element(&rating);
        writer.end("entry");
        let written = writer.into_string();

        assert_eq!(written.matches("xmlns:ext=").count(), 1);
        let reparsed = parse_document(written.as_bytes()).unwrap();
        assert_eq!(reparsed.child("urn:ext", "rating"), Some(&rating));
    }

    #[test]
    fn test_writer_escapes() {
        let mut writer = XmlWriter::new();
        writer.text_element("title", &[("type", "a\"b")], "<&>");
        assert_eq!(
            writer.into_string(),
            "<title type=\"a&quot;b\">&lt;&amp;&gt;</title>"
        );
    }

    #[test]
    fn test_parse_text_invalid_format() {
        let root = parse_document(b"<n>abc</n>").unwrap();
        let err = root.parse_text::<u32>().unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidFormat);
        assert_eq!(err.literal.as_deref(), Some("abc"));
    }
}
