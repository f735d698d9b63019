//! Reading and writing configuration files.
//!
//! Only elements and attributes are modelled. Comments, processing
//! instructions and text nodes are not part of the tree, but
//! [`parse_with_spans`] records where every element sits in the source
//! text so that an edit can be spliced into the original file, leaving
//! everything around it byte for byte as it was.

use std::ops::Range;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use crate::error::{Error, Result};

use super::element::Element;

/// Byte ranges of a parsed element within its source text. The tree
/// mirrors the [`Element`] it was parsed with, child for child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Span {
    /// From the `<` of the start tag to the end of the closing tag
    pub outer: Range<usize>,
    /// Between the start and closing tags; `None` when self-closing
    pub content: Option<Range<usize>>,
    pub children: Vec<Span>,
}

/// Parse a configuration file into its root element
pub fn parse(text: &str) -> Result<Element> {
    parse_with_spans(text).map(|(root, _)| root)
}

/// Parse a configuration file, also returning where each element sits
pub fn parse_with_spans(text: &str) -> Result<(Element, Span)> {
    let body = text.strip_prefix('\u{feff}').unwrap_or(text);
    let offset = text.len() - body.len();
    let mut reader = Reader::from_str(body);

    let mut stack: Vec<(Element, Span)> = Vec::new();
    let mut root: Option<(Element, Span)> = None;

    loop {
        let before = reader.buffer_position() as usize;
        let event = reader.read_event()?;
        let after = reader.buffer_position() as usize + offset;
        match event {
            Event::Start(start) => {
                let span = Span {
                    outer: tag_start(body, before) + offset..after,
                    content: Some(after..after),
                    children: Vec::new(),
                };
                stack.push((element_from_start(&start)?, span));
            }
            Event::Empty(start) => {
                let span = Span {
                    outer: tag_start(body, before) + offset..after,
                    content: None,
                    children: Vec::new(),
                };
                attach(&mut stack, &mut root, (element_from_start(&start)?, span))?;
            }
            Event::End(_) => {
                let (element, mut span) = stack.pop().ok_or_else(|| {
                    Error::SchemaViolation("unbalanced closing tag".to_string())
                })?;
                if let Some(content) = span.content.as_mut() {
                    content.end = tag_start(body, before) + offset;
                }
                span.outer.end = after;
                attach(&mut stack, &mut root, (element, span))?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some((open, _)) = stack.last() {
        return Err(Error::SchemaViolation(format!(
            "element '{}' is never closed",
            open.name
        )));
    }

    root.ok_or_else(|| Error::SchemaViolation("document has no root element".to_string()))
}

/// Position of the `<` opening the markup read from `pos`. Whitespace
/// before a tag is reported as its own text event, so `pos` normally
/// points at the `<` already.
fn tag_start(body: &str, pos: usize) -> usize {
    let bytes = body.as_bytes();
    let end = pos.min(bytes.len().saturating_sub(1));
    bytes[..=end].iter().rposition(|b| *b == b'<').unwrap_or(pos)
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.insert(key, value);
    }
    Ok(element)
}

fn attach(
    stack: &mut [(Element, Span)],
    root: &mut Option<(Element, Span)>,
    node: (Element, Span),
) -> Result<()> {
    match stack.last_mut() {
        Some((parent, parent_span)) => {
            parent.children.push(node.0);
            parent_span.children.push(node.1);
        }
        None if root.is_none() => *root = Some(node),
        None => {
            return Err(Error::SchemaViolation(format!(
                "second root element '{}'",
                node.0.name
            )));
        }
    }
    Ok(())
}

/// Serialize a root element with an XML declaration
pub fn write(root: &Element) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    write_element(&mut writer, root)?;
    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

/// Serialize one element for splicing into an existing file. Lines after
/// the first are prefixed with `indent` so the fragment lines up with the
/// line it is inserted into.
pub fn write_fragment(element: &Element, indent: &str) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
    write_element(&mut writer, element)?;
    let text = String::from_utf8_lossy(&writer.into_inner()).into_owned();
    Ok(text.trim_start().replace('\n', &format!("\n{indent}")))
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element) -> Result<()> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.name.as_str())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_document() {
        let text = r#"<?xml version="1.0" encoding="utf-8"?>
<!-- server configuration -->
<configuration>
    <system.webServer>
        <security>
            <ipSecurity allowUnlisted="true">
                <add ipAddress="10.0.0.0" subnetMask="255.0.0.0" />
            </ipSecurity>
        </security>
    </system.webServer>
    <location path="site1">
        <system.webServer />
    </location>
</configuration>"#;
        let root = parse(text).unwrap();
        assert_eq!(root.name, "configuration");
        assert_eq!(root.children.len(), 2);
        let ip = root
            .descend(&["system.webServer", "security", "ipSecurity"])
            .unwrap();
        assert_eq!(ip.attribute("allowUnlisted"), Some("true"));
        assert_eq!(ip.children[0].attribute("subnetMask"), Some("255.0.0.0"));
        assert_eq!(root.children[1].attribute("path"), Some("site1"));
    }

    #[test]
    fn test_escaped_values_survive_rewrite() {
        let root = Element::new("configuration").with_child(
            Element::new("add")
                .with_attribute("name", "X-Quote")
                .with_attribute("value", "a \"b\" <c> & d"),
        );
        let bytes = write(&root).unwrap();
        let reparsed = parse(std::str::from_utf8(&bytes).unwrap()).unwrap();
        assert_eq!(reparsed, root);
    }

    #[test]
    fn test_unclosed_element_rejected() {
        assert!(parse("<configuration><system.webServer>").is_err());
    }

    #[test]
    fn test_spans_cover_source_text() {
        let text = "\u{feff}<configuration>\n  <!-- c -->\n  <a x=\"1\" />\n  <b><c/></b>\n</configuration>\n";
        let (root, spans) = parse_with_spans(text).unwrap();
        assert_eq!(root.children.len(), 2);
        assert_eq!(&text[spans.outer.clone()], &text[3..text.len() - 1]);
        assert_eq!(&text[spans.children[0].outer.clone()], "<a x=\"1\" />");
        assert!(spans.children[0].content.is_none());
        let b = &spans.children[1];
        assert_eq!(&text[b.outer.clone()], "<b><c/></b>");
        assert_eq!(&text[b.content.clone().unwrap()], "<c/>");
        assert_eq!(&text[b.children[0].outer.clone()], "<c/>");
    }

    #[test]
    fn test_fragment_is_indented_for_its_line() {
        let element = Element::new("a").with_child(Element::new("b").with_attribute("k", "v"));
        assert_eq!(
            write_fragment(&element, "  ").unwrap(),
            "<a>\n      <b k=\"v\"/>\n  </a>"
        );
    }

    #[test]
    fn test_byte_order_mark_ignored() {
        let root = parse("\u{feff}<configuration />").unwrap();
        assert_eq!(root.name, "configuration");
    }
}
