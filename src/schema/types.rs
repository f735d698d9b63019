use std::fmt;

use indexmap::IndexMap;

use crate::document::Element;
use crate::error::{Error, Result};

use super::value::{Value, parse_time_span};

/// Declared type of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Bool,
    Int,
    Uint,
    Int64,
    TimeSpan,
    Enum,
    Flags,
}

impl AttributeType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "bool" => Some(Self::Bool),
            "int" => Some(Self::Int),
            "uint" => Some(Self::Uint),
            "int64" => Some(Self::Int64),
            "timeSpan" => Some(Self::TimeSpan),
            "enum" => Some(Self::Enum),
            "flags" => Some(Self::Flags),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Int64 => "int64",
            Self::TimeSpan => "timeSpan",
            Self::Enum => "enum",
            Self::Flags => "flags",
        };
        f.write_str(name)
    }
}

/// A named value of an enum or flags attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValue {
    pub name: String,
    pub value: i64,
}

/// Extra constraint applied after type parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    IntegerRange { min: i64, max: i64 },
    NonEmptyString,
}

#[derive(Debug, Clone)]
pub struct AttributeSchema {
    pub name: String,
    pub kind: AttributeType,
    pub default: Option<String>,
    pub is_unique_key: bool,
    pub is_required: bool,
    pub enum_values: Vec<EnumValue>,
    pub validation: Option<Validation>,
}

impl AttributeSchema {
    pub fn new(name: impl Into<String>, kind: AttributeType) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            is_unique_key: false,
            is_required: false,
            enum_values: Vec::new(),
            validation: None,
        }
    }

    /// Parse raw attribute text into a typed value
    pub fn parse_value(&self, raw: &str) -> Result<Value> {
        let invalid = || {
            Error::SchemaViolation(format!(
                "'{}' is not a valid {} value for attribute '{}'",
                raw, self.kind, self.name
            ))
        };

        let value = match self.kind {
            AttributeType::String => Value::String(raw.to_string()),
            AttributeType::Bool => match raw.trim().to_ascii_lowercase().as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => return Err(invalid()),
            },
            AttributeType::Int => {
                let v: i32 = raw.trim().parse().map_err(|_| invalid())?;
                Value::Int(v.into())
            }
            AttributeType::Uint => {
                let v: u32 = raw.trim().parse().map_err(|_| invalid())?;
                Value::Uint(v.into())
            }
            AttributeType::Int64 => Value::Int(raw.trim().parse().map_err(|_| invalid())?),
            AttributeType::TimeSpan => {
                Value::TimeSpan(parse_time_span(raw).ok_or_else(invalid)?)
            }
            AttributeType::Enum => Value::Enum(self.enum_name(raw.trim()).ok_or_else(invalid)?),
            AttributeType::Flags => {
                let names = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| self.enum_name(s).ok_or_else(invalid))
                    .collect::<Result<Vec<_>>>()?;
                Value::Flags(names)
            }
        };

        self.check(&value, raw)?;
        Ok(value)
    }

    /// Canonical text of a raw value, used for key comparison
    pub fn canonical(&self, raw: &str) -> Result<String> {
        Ok(self.parse_value(raw)?.to_string())
    }

    pub fn default_value(&self) -> Option<Value> {
        self.default
            .as_deref()
            .and_then(|raw| self.parse_value(raw).ok())
    }

    fn enum_name(&self, raw: &str) -> Option<String> {
        self.enum_values
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(raw) || v.value.to_string() == raw)
            .map(|v| v.name.clone())
    }

    fn check(&self, value: &Value, raw: &str) -> Result<()> {
        match (&self.validation, value) {
            (Some(Validation::IntegerRange { min, max }), Value::Int(v))
                if v < min || v > max =>
            {
                Err(Error::SchemaViolation(format!(
                    "value {raw} of '{}' must be between {min} and {max}",
                    self.name
                )))
            }
            (Some(Validation::IntegerRange { min, max }), Value::Uint(v))
                if (*v as i128) < (*min as i128) || (*v as i128) > (*max as i128) =>
            {
                Err(Error::SchemaViolation(format!(
                    "value {raw} of '{}' must be between {min} and {max}",
                    self.name
                )))
            }
            (Some(Validation::NonEmptyString), Value::String(s)) if s.trim().is_empty() => {
                Err(Error::SchemaViolation(format!(
                    "attribute '{}' cannot be empty",
                    self.name
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Override operations a collection supports, by element name
#[derive(Debug, Clone)]
pub struct CollectionSchema {
    pub add_element: String,
    pub remove_element: String,
    pub clear_element: String,
    pub item: SchemaNode,
}

impl CollectionSchema {
    /// Attributes forming an item's identity. Collections without declared
    /// keys are keyed on every attribute.
    pub fn key_attributes(&self) -> Vec<&AttributeSchema> {
        let keys: Vec<_> = self
            .item
            .attributes
            .values()
            .filter(|a| a.is_unique_key)
            .collect();
        if keys.is_empty() {
            self.item.attributes.values().collect()
        } else {
            keys
        }
    }

    /// Key of an `add` or `remove` element; absent key attributes take
    /// their schema default.
    pub fn key_of(&self, element: &Element) -> Result<ItemKey> {
        self.key_from(|name| element.attribute(name).map(str::to_string))
    }

    pub fn key_from(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<ItemKey> {
        let mut parts = Vec::new();
        for attr in self.key_attributes() {
            let raw = lookup(&attr.name).or_else(|| attr.default.clone());
            let canonical = match raw {
                Some(raw) => attr.canonical(&raw)?,
                None => String::new(),
            };
            parts.push((attr.name.clone(), canonical));
        }
        Ok(ItemKey(parts))
    }

    /// Element recording `remove(key)`
    pub fn remove_element_for(&self, key: &ItemKey) -> Element {
        let mut element = Element::new(&self.remove_element);
        for (name, value) in key.parts() {
            element.set_attribute(name.clone(), value.clone());
        }
        element
    }
}

/// Identity of a collection item: canonical values of its key attributes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey(Vec<(String, String)>);

impl ItemKey {
    pub fn parts(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}='{value}'")?;
        }
        f.write_str("]")
    }
}

/// Shape of one element: attributes, named child elements and an optional
/// collection of items.
#[derive(Debug, Clone, Default)]
pub struct SchemaNode {
    pub name: String,
    pub attributes: IndexMap<String, AttributeSchema>,
    pub elements: IndexMap<String, SchemaNode>,
    pub collection: Option<Box<CollectionSchema>>,
}

impl SchemaNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    /// Follow named child elements
    pub fn descend<S: AsRef<str>>(&self, path: &[S]) -> Option<&SchemaNode> {
        path.iter().try_fold(self, |node, name| {
            let name = name.as_ref();
            node.elements.get(name).or_else(|| {
                node.collection
                    .as_ref()
                    .filter(|c| c.add_element == name)
                    .map(|c| &c.item)
            })
        })
    }

    /// Check one attribute against this node
    pub fn validate_attribute(&self, path: &str, name: &str, raw: &str, permissive: bool) -> Result<()> {
        match self.attributes.get(name) {
            Some(attr) => attr.parse_value(raw).map(|_| ()),
            None if permissive || is_reserved_attribute(name) => Ok(()),
            None => Err(Error::UnknownSchemaElement {
                path: format!("{path}@{name}"),
            }),
        }
    }

    /// Recursively check an element against this node
    pub fn validate_element(&self, element: &Element, path: &str, permissive: bool) -> Result<()> {
        for (name, raw) in &element.attributes {
            self.validate_attribute(path, name, raw, permissive)?;
        }

        for child in &element.children {
            let child_path = format!("{path}/{}", child.name);
            if let Some(collection) = &self.collection {
                if child.name == collection.add_element {
                    collection.item.validate_element(child, &child_path, permissive)?;
                    collection.item.check_required(child, &child_path)?;
                    continue;
                }
                if child.name == collection.remove_element {
                    for (name, raw) in &child.attributes {
                        collection
                            .item
                            .validate_attribute(&child_path, name, raw, permissive)?;
                    }
                    continue;
                }
                if child.name == collection.clear_element {
                    continue;
                }
            }

            match self.elements.get(&child.name) {
                Some(node) => node.validate_element(child, &child_path, permissive)?,
                None if permissive => {}
                None => return Err(Error::UnknownSchemaElement { path: child_path }),
            }
        }

        Ok(())
    }

    pub(crate) fn check_required(&self, element: &Element, path: &str) -> Result<()> {
        for attr in self.attributes.values() {
            if attr.is_required && element.attribute(&attr.name).is_none() {
                return Err(Error::SchemaViolation(format!(
                    "missing required attribute '{}' on {path}",
                    attr.name
                )));
            }
        }
        Ok(())
    }
}

fn is_reserved_attribute(name: &str) -> bool {
    name.starts_with("xmlns") || name.starts_with("lock")
}

/// Whether non-root scopes may carry a section in their own override file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrideMode {
    #[default]
    Allow,
    Deny,
}

/// Schema of a top-level configuration section
#[derive(Debug, Clone)]
pub struct SectionSchema {
    /// Slash-separated element chain, e.g. `system.webServer/handlers`
    pub path: String,
    pub override_mode_default: OverrideMode,
    pub node: SchemaNode,
}

impl SectionSchema {
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').collect()
    }
}
