//! Document Tree Tests
//!
//! Tests for:
//! - Element/attribute/text extraction and child ordering
//! - Parse errors carrying source positions
//! - Serialization round trip

use armature::document::{self, DocumentNode};
use armature::errors::{Error, ErrorKind};

const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<COLLADA xmlns="http://www.collada.org/2005/11/COLLADASchema" version="1.4.1">
  <asset>
    <up_axis>Z_UP</up_axis>
  </asset>
  <library_geometries>
    <geometry id="a" name="first"/>
    <geometry id="b" name="second">
      <!-- comments are dropped -->
      <mesh><float_array count="3">1 2 3</float_array></mesh>
    </geometry>
  </library_geometries>
</COLLADA>
"#;

// ============================================================================
// Tree Construction
// ============================================================================

#[test]
fn builds_named_tree_with_attributes_and_text() {
    let root = document::parse_str(SAMPLE).unwrap();
    assert_eq!(root.name, "COLLADA");
    assert_eq!(root.attribute("version"), Some("1.4.1"));
    assert_eq!(root.descendant("asset/up_axis").and_then(DocumentNode::text), Some("Z_UP"));

    let library = root.child("library_geometries").unwrap();
    let ids: Vec<&str> = library
        .children_named("geometry")
        .filter_map(|g| g.attribute("id"))
        .collect();
    assert_eq!(ids, ["a", "b"]);

    let b = library.child_with_attribute("geometry", "id", "b").unwrap();
    assert_eq!(b.attribute("name"), Some("second"));
    assert_eq!(b.children.len(), 1);
    assert_eq!(b.descendant("mesh/float_array").and_then(DocumentNode::text), Some("1 2 3"));
}

#[test]
fn whitespace_only_text_is_not_kept() {
    let root = document::parse_str("<a>\n   <b> padded </b>\n</a>").unwrap();
    assert_eq!(root.text(), None);
    assert_eq!(root.child("b").and_then(DocumentNode::text), Some("padded"));
}

#[test]
fn node_count_covers_subtree() {
    let root = document::parse_str(SAMPLE).unwrap();
    // COLLADA, asset, up_axis, library_geometries, 2 × geometry, mesh, float_array
    assert_eq!(root.node_count(), 8);
}

#[test]
fn stream_is_read_through_any_reader() {
    let cursor = std::io::Cursor::new(b"<root><leaf/></root>".to_vec());
    let root = document::parse(cursor).unwrap();
    assert!(root.child("leaf").is_some());
}

// ============================================================================
// Parse Errors
// ============================================================================

#[test]
fn mismatched_tag_reports_position() {
    let err = document::parse_str("<a>\n  <b>\n</a>").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
    match err {
        Error::Parse { line, column, .. } => {
            assert!(line >= 2, "line {line}");
            assert!(column >= 1);
        }
        other => panic!("expected Parse, got {other:?}"),
    }
}

#[test]
fn truncated_document_is_a_parse_error() {
    let err = document::parse_str("<COLLADA><asset>").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
}

#[test]
fn empty_input_is_a_parse_error() {
    let err = document::parse_str("").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parse);
}

// ============================================================================
// Serialization
// ============================================================================

#[test]
fn serialized_tree_parses_back_identically() {
    let tree = DocumentNode::new("library_animations").with_child(
        DocumentNode::new("animation")
            .with_attribute("id", "walk")
            .with_child(DocumentNode::new("float_array").with_attribute("count", "2").with_text("0 1"))
            .with_child(DocumentNode::new("channel").with_attribute("target", "hip/transform")),
    );

    let text = tree.to_xml_string();
    let parsed = document::parse_str(&text).unwrap();
    assert_eq!(parsed, tree);
}

#[test]
fn parsed_document_survives_round_trip() {
    let root = document::parse_str(SAMPLE).unwrap();
    let again = document::parse_str(&root.to_xml_string()).unwrap();
    assert_eq!(again, root);
}
