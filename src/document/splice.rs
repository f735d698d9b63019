//! Text edits that apply a section change to a file's original text.
//!
//! Only the changed section (or the wrapper created for it) is rewritten;
//! comments, whitespace and attribute formatting elsewhere in the file are
//! kept as they are.

use std::ops::Range;

use crate::error::Result;

use super::element::Element;
use super::xml::{self, Span};

const INDENT: &str = "    ";

/// An element together with its position in the source text
pub(super) type Node<'a> = (&'a Element, &'a Span);

/// Replace `range` of the text with `replacement`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Splice {
    pub range: Range<usize>,
    pub replacement: String,
}

impl Splice {
    pub fn apply(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len() + self.replacement.len());
        out.push_str(&text[..self.range.start]);
        out.push_str(&self.replacement);
        out.push_str(&text[self.range.end..]);
        out
    }
}

/// Store `element` under `container` at the group path `segments`, replacing
/// the section already there. With no container, a `location` block for
/// `location_path` is appended to `root`.
pub(super) fn put(
    text: &str,
    root: Node<'_>,
    container: Option<Node<'_>>,
    location_path: &str,
    segments: &[&str],
    element: &Element,
) -> Result<Option<Splice>> {
    let (groups, _) = segments.split_at(segments.len().saturating_sub(1));

    let Some(container) = container else {
        let location = Element::new("location")
            .with_attribute("path", location_path)
            .with_child(nest(groups, element.clone()));
        return insert(text, root, &location).map(Some);
    };

    let mut node = container;
    let mut depth = 0;
    for name in segments {
        match child(node, name) {
            Some(next) => {
                node = next;
                depth += 1;
            }
            None => break,
        }
    }

    if depth == segments.len() {
        let indent = line_indent(text, node.1.outer.start);
        return Ok(Some(Splice {
            range: node.1.outer.clone(),
            replacement: xml::write_fragment(element, indent)?,
        }));
    }

    let wrapper = nest(&groups[depth.min(groups.len())..], element.clone());
    insert(text, node, &wrapper).map(Some)
}

/// Remove the section at `segments` under `container`, together with any
/// group wrappers it leaves empty. A container left with nothing but
/// whitespace collapses to a self-closing tag.
pub(super) fn delete(text: &str, container: Node<'_>, segments: &[&str]) -> Option<Splice> {
    let mut chain = vec![container];
    for name in segments {
        let next = child(*chain.last()?, name)?;
        chain.push(next);
    }

    let mut target = chain.len() - 1;
    while target >= 2 {
        let (group, _) = chain[target - 1];
        if group.children.len() == 1 && group.attributes.is_empty() {
            target -= 1;
        } else {
            break;
        }
    }

    let span = chain[target].1;
    if target == 1 {
        if let Some(collapsed) = collapse(text, container, span) {
            return Some(collapsed);
        }
    }

    let start = span.outer.start;
    let line_start = text[..start].rfind('\n');
    let start = match line_start {
        Some(nl) if text[nl + 1..start].trim().is_empty() => nl,
        _ => start,
    };
    Some(Splice {
        range: start..span.outer.end,
        replacement: String::new(),
    })
}

/// `<parent ...>  <removed/>  </parent>` becomes `<parent .../>`
fn collapse(text: &str, parent: Node<'_>, removed: &Span) -> Option<Splice> {
    let (element, span) = parent;
    let content = span.content.as_ref()?;
    if element.children.len() != 1
        || !text[content.start..removed.outer.start].trim().is_empty()
        || !text[removed.outer.end..content.end].trim().is_empty()
    {
        return None;
    }
    let open = text[span.outer.start..content.start].trim_end_matches('>').trim_end();
    Some(Splice {
        range: span.outer.clone(),
        replacement: format!("{open}/>"),
    })
}

/// Append `fragment` as the last child of `parent`
fn insert(text: &str, parent: Node<'_>, fragment: &Element) -> Result<Splice> {
    let (element, span) = parent;
    let parent_indent = line_indent(text, span.outer.start);
    let child_indent = match span.children.last() {
        Some(last) => line_indent(text, last.outer.start).to_string(),
        None => format!("{parent_indent}{INDENT}"),
    };
    let body = xml::write_fragment(fragment, &child_indent)?;

    match &span.content {
        Some(content) => {
            let inner = &text[content.clone()];
            let trailing = &inner[inner.trim_end().len()..];
            let at = content.end - trailing.len();
            let mut replacement = format!("\n{child_indent}{body}");
            if !trailing.contains('\n') {
                replacement.push('\n');
                replacement.push_str(parent_indent);
            }
            Ok(Splice {
                range: at..at,
                replacement,
            })
        }
        None => {
            let open = text[span.outer.clone()]
                .trim_end_matches('>')
                .trim_end_matches('/')
                .trim_end();
            Ok(Splice {
                range: span.outer.clone(),
                replacement: format!(
                    "{open}>\n{child_indent}{body}\n{parent_indent}</{}>",
                    element.name
                ),
            })
        }
    }
}

/// First child with this name, with its span
fn child<'a>(node: Node<'a>, name: &str) -> Option<Node<'a>> {
    let (element, span) = node;
    let idx = element.children.iter().position(|c| c.name == name)?;
    Some((&element.children[idx], span.children.get(idx)?))
}

/// Wrap `element` in empty group elements, outermost first
fn nest(groups: &[&str], element: Element) -> Element {
    groups
        .iter()
        .rev()
        .fold(element, |inner, group| Element::new(*group).with_child(inner))
}

/// Whitespace between the start of the line and `pos`
fn line_indent(text: &str, pos: usize) -> &str {
    let line_start = text[..pos].rfind('\n').map_or(0, |nl| nl + 1);
    let prefix = &text[line_start..pos];
    &prefix[..prefix.len() - prefix.trim_start().len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(text: &str, splice: Option<Splice>) -> String {
        splice.unwrap().apply(text)
    }

    #[test]
    fn test_insert_follows_sibling_indent() {
        let text = "<configuration>\n  <!-- note -->\n  <a x=\"1\"   />\n</configuration>\n";
        let (root, spans) = xml::parse_with_spans(text).unwrap();
        let section = Element::new("c").with_attribute("y", "2");
        let splice = put(text, (&root, &spans), Some((&root, &spans)), "", &["b", "c"], &section).unwrap();
        assert_eq!(
            apply(text, splice),
            "<configuration>\n  <!-- note -->\n  <a x=\"1\"   />\n  <b>\n      <c y=\"2\"/>\n  </b>\n</configuration>\n"
        );
    }

    #[test]
    fn test_insert_into_self_closing_parent() {
        let text = "<configuration />";
        let (root, spans) = xml::parse_with_spans(text).unwrap();
        let splice = put(text, (&root, &spans), None, "site1", &["a"], &Element::new("a")).unwrap();
        assert_eq!(
            apply(text, splice),
            "<configuration>\n    <location path=\"site1\">\n        <a/>\n    </location>\n</configuration>"
        );
    }

    #[test]
    fn test_delete_prunes_groups_and_collapses() {
        let text = "<configuration>\n    <location path=\"s\">\n        <g>\n            <a />\n        </g>\n    </location>\n</configuration>";
        let (root, spans) = xml::parse_with_spans(text).unwrap();
        let location = (&root.children[0], &spans.children[0]);
        let splice = delete(text, location, &["g", "a"]);
        assert_eq!(
            apply(text, splice),
            "<configuration>\n    <location path=\"s\"/>\n</configuration>"
        );
    }

    #[test]
    fn test_delete_keeps_siblings_and_comments() {
        let text = "<configuration>\n    <g>\n        <!-- why -->\n        <a />\n        <b />\n    </g>\n</configuration>";
        let (root, spans) = xml::parse_with_spans(text).unwrap();
        let splice = delete(text, (&root, &spans), &["g", "a"]);
        assert_eq!(
            apply(text, splice),
            "<configuration>\n    <g>\n        <!-- why -->\n        <b />\n    </g>\n</configuration>"
        );
        assert!(delete(text, (&root, &spans), &["g", "missing"]).is_none());
    }
}
