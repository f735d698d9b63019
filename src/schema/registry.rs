use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::document::{Element, xml};
use crate::error::{Error, Result};

use super::types::{
    AttributeSchema, AttributeType, CollectionSchema, EnumValue, OverrideMode, SchemaNode,
    SectionSchema, Validation,
};

const BUILTIN_SCHEMA: &str = include_str!("../../schema/webserver_schema.xml");

/// A schema document and the name it is cached under
#[derive(Debug, Clone)]
pub struct SchemaSource {
    pub name: String,
    pub text: String,
}

impl SchemaSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    /// The schema bundled with this crate
    pub fn builtin() -> Self {
        Self::new("builtin:webserver_schema.xml", BUILTIN_SCHEMA)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::new(path.display().to_string(), text))
    }
}

/// A section schema plus the element path inside it that was asked for
#[derive(Debug, Clone)]
pub struct SchemaRef {
    pub section: Arc<SectionSchema>,
    pub element_path: Vec<String>,
}

impl SchemaRef {
    pub fn node(&self) -> &SchemaNode {
        self.section
            .node
            .descend(&self.element_path)
            .unwrap_or(&self.section.node)
    }
}

/// Registry of section schemas, keyed by section path.
///
/// Loading is idempotent per source name; when two sources define the same
/// section path the later one replaces the earlier.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    sections: BTreeMap<String, Arc<SectionSchema>>,
    loaded: HashSet<String>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sources(sources: &[SchemaSource]) -> Result<Self> {
        let mut registry = Self::new();
        registry.load(sources)?;
        Ok(registry)
    }

    pub fn load(&mut self, sources: &[SchemaSource]) -> Result<()> {
        for source in sources {
            if !self.loaded.insert(source.name.clone()) {
                debug!(source = %source.name, "Schema source already loaded");
                continue;
            }
            let root = xml::parse(&source.text)?;
            let sections = parse_schema_document(&root)?;
            debug!(
                source = %source.name,
                num_sections = sections.len(),
                "Loaded schema source"
            );
            for section in sections {
                self.sections.insert(section.path.clone(), Arc::new(section));
            }
        }
        Ok(())
    }

    pub fn section(&self, path: &str) -> Result<Arc<SectionSchema>> {
        self.sections
            .get(path)
            .cloned()
            .ok_or_else(|| Error::SchemaNotFound(path.to_string()))
    }

    pub fn sections(&self) -> impl Iterator<Item = &Arc<SectionSchema>> {
        self.sections.values()
    }

    /// Resolve a path to the most specific section containing it, plus the
    /// remaining element chain inside that section.
    pub fn lookup(&self, path: &str) -> Result<SchemaRef> {
        let path = path.trim_matches('/');
        let segments: Vec<&str> = path.split('/').collect();

        for split in (1..=segments.len()).rev() {
            let candidate = segments[..split].join("/");
            if let Some(section) = self.sections.get(&candidate) {
                let element_path: Vec<String> =
                    segments[split..].iter().map(|s| s.to_string()).collect();
                if section.node.descend(&element_path).is_none() {
                    return Err(Error::SchemaNotFound(path.to_string()));
                }
                return Ok(SchemaRef {
                    section: section.clone(),
                    element_path,
                });
            }
        }

        Err(Error::SchemaNotFound(path.to_string()))
    }

    /// True if `path` is a section group: a strict prefix of some section path
    pub fn is_group(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.sections.keys().any(|k| k.starts_with(&prefix))
    }
}

fn parse_schema_document(root: &Element) -> Result<Vec<SectionSchema>> {
    if root.name != "configSchema" {
        return Err(Error::SchemaViolation(format!(
            "schema root must be <configSchema>, found <{}>",
            root.name
        )));
    }

    let mut sections = Vec::new();
    for child in &root.children {
        if child.name != "sectionSchema" {
            continue;
        }
        let path = required(child, "name")?.trim_matches('/').to_string();
        let override_mode_default = match child.attribute("overrideModeDefault") {
            None | Some("Allow") => OverrideMode::Allow,
            Some("Deny") => OverrideMode::Deny,
            Some(other) => {
                return Err(Error::SchemaViolation(format!(
                    "unknown overrideModeDefault '{other}' on section '{path}'"
                )));
            }
        };
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        let node = parse_node(name, child)?;
        sections.push(SectionSchema {
            path,
            override_mode_default,
            node,
        });
    }
    Ok(sections)
}

fn parse_node(name: String, element: &Element) -> Result<SchemaNode> {
    let mut node = SchemaNode::new(name);
    for child in &element.children {
        match child.name.as_str() {
            "attribute" => {
                let attr = parse_attribute(child)?;
                node.attributes.insert(attr.name.clone(), attr);
            }
            "element" => {
                let name = required(child, "name")?.to_string();
                node.elements.insert(name.clone(), parse_node(name, child)?);
            }
            "collection" => {
                let add_element = required(child, "addElement")?.to_string();
                let item = parse_node(add_element.clone(), child)?;
                node.collection = Some(Box::new(CollectionSchema {
                    add_element,
                    remove_element: child.attribute("removeElement").unwrap_or("remove").to_string(),
                    clear_element: child.attribute("clearElement").unwrap_or("clear").to_string(),
                    item,
                }));
            }
            _ => {}
        }
    }
    Ok(node)
}

fn parse_attribute(element: &Element) -> Result<AttributeSchema> {
    let name = required(element, "name")?;
    let type_name = element.attribute("type").unwrap_or("string");
    let kind = AttributeType::parse(type_name).ok_or_else(|| {
        Error::SchemaViolation(format!("unknown type '{type_name}' for attribute '{name}'"))
    })?;

    let mut attr = AttributeSchema::new(name, kind);
    attr.is_unique_key = flag(element, "isUniqueKey");
    attr.is_required = flag(element, "required");

    for value in &element.children {
        if value.name == "enum" || value.name == "flag" {
            let value_name = required(value, "name")?;
            let number = value
                .attribute("value")
                .unwrap_or("0")
                .parse()
                .map_err(|_| {
                    Error::SchemaViolation(format!(
                        "enum value '{value_name}' of '{name}' needs a numeric value"
                    ))
                })?;
            attr.enum_values.push(EnumValue {
                name: value_name.to_string(),
                value: number,
            });
        }
    }

    attr.validation = match element.attribute("validationType") {
        None => None,
        Some("nonEmptyString") => Some(Validation::NonEmptyString),
        Some("integerRange") => {
            let param = element.attribute("validationParameter").unwrap_or_default();
            let (min, max) = param
                .split_once(',')
                .and_then(|(min, max)| Some((min.trim().parse().ok()?, max.trim().parse().ok()?)))
                .ok_or_else(|| {
                    Error::SchemaViolation(format!(
                        "integerRange on '{name}' needs 'min,max', got '{param}'"
                    ))
                })?;
            Some(Validation::IntegerRange { min, max })
        }
        Some(other) => {
            return Err(Error::SchemaViolation(format!(
                "unknown validationType '{other}' on attribute '{name}'"
            )));
        }
    };

    if let Some(default) = element.attribute("defaultValue") {
        attr.parse_value(default)?;
        attr.default = Some(default.to_string());
    }

    Ok(attr)
}

fn required<'a>(element: &'a Element, name: &str) -> Result<&'a str> {
    element.attribute(name).ok_or_else(|| {
        Error::SchemaViolation(format!(
            "<{}> is missing required '{}' attribute",
            element.name, name
        ))
    })
}

fn flag(element: &Element, name: &str) -> bool {
    element
        .attribute(name)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}
