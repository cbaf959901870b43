//! Generic decoding of provider XML replies into a key/value tree.
//!
//! A childless element decodes to a [`Node::Leaf`] holding its text, with
//! absent text becoming the empty string. An element with children decodes to
//! a [`Node::Map`]: a tag seen once among siblings maps to
//! [`Field::Scalar`], while a tag repeated among siblings maps to
//! [`Field::List`] holding every occurrence in document order. Callers must
//! therefore accept either shape wherever a collection may hold one element.

use std::fmt;

use quick_xml::Reader;
use quick_xml::events::Event;
use serde::ser::{Serialize, Serializer};
use thiserror::Error;


/// Errors raised while parsing a reply body.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum XmlError {
    /// The body is not well-formed XML.
    #[error("malformed XML: {0}")]
    Malformed(String),
    /// The body contained no root element.
    #[error("XML document has no root element")]
    Empty,
}

/// A parsed XML element with its namespace removed from the tag.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Element {
    /// Local tag name.
    pub tag: String,
    /// Concatenated text content.
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<Self>,
}

impl Element {
    /// Creates an empty element, stripping any `{namespace}` or `prefix:`
    /// qualifier from `tag`.
    #[must_use]
    pub fn new(tag: &str) -> Self {
        Self {
            tag: local_name(tag).to_owned(),
            ..Self::default()
        }
    }

    /// Sets the element text.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Appends a child element.
    #[must_use]
    pub fn with_child(mut self, child: Self) -> Self {
        self.children.push(child);
        self
    }

    /// Returns the last direct child whose tag equals `tag`.
    #[must_use]
    pub fn last_child(&self, tag: &str) -> Option<&Self> {
        self.children.iter().rev().find(|child| child.tag == tag)
    }
}

/// Strips a `{namespace}` or `prefix:` qualifier from a tag.
#[must_use]
pub fn local_name(tag: &str) -> &str {
    if let Some(rest) = tag.strip_prefix('{')
        && let Some((_, local)) = rest.split_once('}')
    {
        return local;
    }
    tag.rsplit_once(':').map_or(tag, |(_, local)| local)
}

/// Parses `body` into an element tree.
///
/// # Errors
///
/// Returns [`XmlError::Malformed`] for invalid XML and [`XmlError::Empty`]
/// when no root element is present.
pub fn parse(body: &str) -> Result<Element, XmlError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut open: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                open.push(Element::new(&utf8(start.local_name().as_ref())?));
            }
            Ok(Event::Empty(start)) => {
                let element = Element::new(&utf8(start.local_name().as_ref())?);
                close(&mut open, &mut root, element);
            }
            Ok(Event::Text(text)) => {
                let unescaped = text
                    .unescape()
                    .map_err(|err| XmlError::Malformed(err.to_string()))?;
                if let Some(current) = open.last_mut() {
                    current.text.push_str(&unescaped);
                }
            }
            Ok(Event::CData(data)) => {
                if let Some(current) = open.last_mut() {
                    current.text.push_str(&utf8(&data.into_inner())?);
                }
            }
            Ok(Event::End(_)) => {
                if let Some(element) = open.pop() {
                    close(&mut open, &mut root, element);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(XmlError::Malformed(err.to_string())),
        }
    }

    if !open.is_empty() {
        return Err(XmlError::Malformed(String::from("unclosed element")));
    }
    root.ok_or(XmlError::Empty)
}

fn utf8(bytes: &[u8]) -> Result<String, XmlError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|err| XmlError::Malformed(err.to_string()))
}

fn close(open: &mut [Element], root: &mut Option<Element>, element: Element) {
    match open.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

/// Decodes an element: leaves become text, branches become records.
#[must_use]
pub fn decode(element: &Element) -> Node {
    if element.children.is_empty() {
        return Node::Leaf(element.text.clone());
    }
    let mut record = Record::default();
    for child in &element.children {
        record.push(child.tag.clone(), decode(child));
    }
    Node::Map(record)
}

/// Decodes one item of a result collection.
///
/// A leaf item becomes a single-entry record `{tag: text}` so that every item
/// in a collection is a record. A branch item decodes to the record of its
/// children and its own tag is dropped.
#[must_use]
pub fn decode_record(element: &Element) -> Node {
    if element.children.is_empty() {
        let mut record = Record::default();
        record.push(element.tag.clone(), Node::Leaf(element.text.clone()));
        return Node::Map(record);
    }
    decode(element)
}

/// A decoded value: text or a nested record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Node {
    /// Text of a childless element.
    Leaf(String),
    /// Children of a branch element.
    Map(Record),
}

/// The value stored under one key of a [`Record`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Field {
    /// The tag appeared once.
    Scalar(Node),
    /// The tag appeared more than once.
    List(Vec<Node>),
}

/// Ordered key/value record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Record {
    entries: Vec<(String, Field)>,
}

impl Record {
    /// Inserts `node` under `key`, promoting an existing scalar to a list.
    pub fn push(&mut self, key: String, node: Node) {
        if let Some((_, field)) = self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            field.append(node);
            return;
        }
        self.entries.push((key, Field::Scalar(node)));
    }

    /// Builder form of [`Record::push`] for leaf values.
    #[must_use]
    pub fn with(mut self, key: &str, text: &str) -> Self {
        self.push(key.to_owned(), Node::Leaf(text.to_owned()));
        self
    }

    /// Returns the field stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Field> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, field)| field)
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.entries.iter().map(|(key, field)| (key.as_str(), field))
    }

    /// Number of distinct keys.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the record holds no keys.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Field {
    fn append(&mut self, node: Node) {
        match self {
            Self::Scalar(existing) => {
                let first = std::mem::replace(existing, Node::Leaf(String::new()));
                *self = Self::List(vec![first, node]);
            }
            Self::List(nodes) => nodes.push(node),
        }
    }

    /// Returns the first occurrence.
    #[must_use]
    pub fn first(&self) -> Option<&Node> {
        match self {
            Self::Scalar(node) => Some(node),
            Self::List(nodes) => nodes.first(),
        }
    }

    /// Iterates every occurrence, treating a scalar as a one-element list.
    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        match self {
            Self::Scalar(node) => std::slice::from_ref(node).iter(),
            Self::List(nodes) => nodes.iter(),
        }
    }

    /// Returns `true` when the tag was repeated.
    #[must_use]
    pub const fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }
}

impl Node {
    /// Returns the text of a leaf.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Leaf(text) => Some(text),
            Self::Map(_) => None,
        }
    }

    /// Returns the record of a branch.
    #[must_use]
    pub const fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Leaf(_) => None,
            Self::Map(record) => Some(record),
        }
    }

    /// Returns the field under `key` of a branch.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Field> {
        self.as_record().and_then(|record| record.get(key))
    }

    /// Follows `path`, taking the first occurrence at each step.
    #[must_use]
    pub fn at(&self, path: &[&str]) -> Option<&Self> {
        path.iter().try_fold(self, |node, key| {
            node.get(key).and_then(Field::first)
        })
    }

    /// Text found by following `path`.
    #[must_use]
    pub fn text_at(&self, path: &[&str]) -> Option<&str> {
        self.at(path).and_then(Self::as_text)
    }

    /// Every occurrence of the last segment of `path`.
    ///
    /// Intermediate segments take the first occurrence. An empty vector is
    /// returned when any segment is missing.
    #[must_use]
    pub fn all_at(&self, path: &[&str]) -> Vec<&Self> {
        let Some((last, parents)) = path.split_last() else {
            return vec![self];
        };
        self.at(parents)
            .and_then(|parent| parent.get(last))
            .map(|field| field.iter().collect())
            .unwrap_or_default()
    }

    /// Depth-first search for the first leaf stored under `key`.
    #[must_use]
    pub fn find_text(&self, key: &str) -> Option<&str> {
        let record = self.as_record()?;
        if let Some(text) = record.get(key).and_then(Field::first).and_then(Self::as_text) {
            return Some(text);
        }
        record
            .iter()
            .flat_map(|(_, field)| field.iter())
            .find_map(|child| child.find_text(key))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Leaf(text) => serializer.serialize_str(text),
            Self::Map(record) => record.serialize(serializer),
        }
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Scalar(node) => node.serialize(serializer),
            Self::List(nodes) => nodes.serialize(serializer),
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.entries.iter().map(|(key, field)| (key, field)))
    }
}
