//! Document Tree Builder
//!
//! Turns a markup byte stream into a generic, ordered tree of named nodes.
//! The builder knows nothing about COLLADA; the asset parsers walk the tree.
//!
//! Tokenization is delegated to `xml-rs`. Namespace prefixes are dropped and
//! element/attribute names are kept by their local part, which is how the
//! asset libraries address them. Text payloads are trimmed; whitespace-only
//! text is not kept. When an element carries several text runs (mixed
//! content) they are concatenated in document order.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use xml::reader::{ParserConfig, XmlEvent};
use xml::writer::{EmitterConfig, XmlEvent as WriteEvent};

use crate::errors::{Error, Result};

/// A single element of the document tree.
///
/// Children are owned by their parent; there are no back-references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentNode {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<DocumentNode>,
    pub text: Option<String>,
}

impl DocumentNode {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_child(mut self, child: DocumentNode) -> Self {
        self.children.push(child);
        self
    }

    #[inline]
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    #[inline]
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// First child with the given element name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&DocumentNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a DocumentNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First child named `name` whose attribute `key` equals `value`.
    #[must_use]
    pub fn child_with_attribute(&self, name: &str, key: &str, value: &str) -> Option<&DocumentNode> {
        self.children
            .iter()
            .find(|c| c.name == name && c.attribute(key) == Some(value))
    }

    /// Like [`Self::child`], failing with `MalformedAsset` naming the section.
    pub fn require_child(&self, name: &str) -> Result<&DocumentNode> {
        self.child(name).ok_or_else(|| Error::malformed(name))
    }

    /// Follows a `/`-separated path of element names.
    #[must_use]
    pub fn descendant(&self, path: &str) -> Option<&DocumentNode> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |node, segment| node.child(segment))
    }

    /// Number of nodes in this subtree, including `self`.
    #[must_use]
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(DocumentNode::node_count).sum::<usize>()
    }

    /// Serializes the subtree as an XML document.
    pub fn write_to<W: Write>(&self, sink: W) -> std::io::Result<()> {
        let mut writer = EmitterConfig::new()
            .perform_indent(false)
            .write_document_declaration(true)
            .create_writer(sink);
        write_node(&mut writer, self).map_err(std::io::Error::other)
    }

    #[must_use]
    pub fn to_xml_string(&self) -> String {
        let mut buf = Vec::new();
        // Writing into a Vec only fails on malformed names, which the
        // builder never produces.
        if let Err(e) = self.write_to(&mut buf) {
            log::error!("Failed to serialize document node `{}`: {e}", self.name);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn write_node<W: Write>(
    writer: &mut xml::EventWriter<W>,
    node: &DocumentNode,
) -> std::result::Result<(), xml::writer::Error> {
    let mut start = WriteEvent::start_element(node.name.as_str());
    for (key, value) in &node.attributes {
        start = start.attr(key.as_str(), value.as_str());
    }
    writer.write(start)?;

    if let Some(text) = &node.text {
        writer.write(WriteEvent::characters(text))?;
    }
    for child in &node.children {
        write_node(writer, child)?;
    }

    writer.write(WriteEvent::end_element())
}

/// Parses a markup stream into its root element.
///
/// The stream is consumed and dropped on every exit path, including errors.
pub fn parse<R: Read>(source: R) -> Result<DocumentNode> {
    let reader = ParserConfig::new()
        .trim_whitespace(true)
        .cdata_to_characters(true)
        .ignore_comments(true)
        .coalesce_characters(true)
        .create_reader(source);

    // Stack of open elements; the bottom entry is a synthetic document holder.
    let mut stack: Vec<DocumentNode> = vec![DocumentNode::new("#document")];

    for event in reader {
        match event? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                let mut node = DocumentNode::new(name.local_name);
                for attr in attributes {
                    node.attributes.insert(attr.name.local_name, attr.value);
                }
                stack.push(node);
            }
            XmlEvent::EndElement { .. } => {
                // The reader validates tag balance, so the stack never underflows
                // below the holder here.
                if stack.len() > 1
                    && let Some(node) = stack.pop()
                    && let Some(parent) = stack.last_mut()
                {
                    parent.children.push(node);
                }
            }
            XmlEvent::Characters(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(current) = stack.last_mut() {
                    match &mut current.text {
                        Some(existing) => existing.push_str(trimmed),
                        None => current.text = Some(trimmed.to_string()),
                    }
                }
            }
            XmlEvent::EndDocument => break,
            _ => {}
        }
    }

    let mut holder = stack
        .into_iter()
        .next()
        .ok_or_else(|| Error::parse_at_start("empty document"))?;

    match holder.children.len() {
        1 => Ok(holder.children.remove(0)),
        0 => Err(Error::parse_at_start("document has no root element")),
        _ => Err(Error::parse_at_start("document has more than one root element")),
    }
}

/// Convenience wrapper over [`parse`] for in-memory text.
pub fn parse_str(text: &str) -> Result<DocumentNode> {
    parse(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descendant_follows_element_path() {
        let root = parse_str("<a><b><c x=\"1\">hi</c></b></a>").unwrap();
        let c = root.descendant("b/c").unwrap();
        assert_eq!(c.attribute("x"), Some("1"));
        assert_eq!(c.text(), Some("hi"));
        assert!(root.descendant("b/missing").is_none());
    }

    #[test]
    fn attribute_lookup_result_outlives_its_key_strings() {
        let root = parse_str("<lib><scene id=\"a\"/><scene id=\"b\" name=\"main\"/></lib>").unwrap();
        let found = {
            let element = String::from("scene");
            let wanted = String::from("b");
            root.child_with_attribute(&element, "id", &wanted)
        };
        assert_eq!(found.and_then(|n| n.attribute("name")), Some("main"));
        assert!(root.child_with_attribute("scene", "id", "c").is_none());
    }

    #[test]
    fn require_child_names_missing_section() {
        let root = DocumentNode::new("COLLADA");
        let err = root.require_child("library_geometries").unwrap_err();
        assert!(matches!(err, Error::MalformedAsset { section } if section == "library_geometries"));
    }
}
