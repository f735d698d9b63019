use std::sync::Arc;

use indexmap::IndexMap;

use crate::document::{ConfigScope, Element, SourceId};
use crate::error::Result;
use crate::schema::{CollectionSchema, ItemKey, SchemaNode, SectionSchema, Value};

/// A scalar attribute in the effective view
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveAttribute {
    pub value: Value,
    /// Scope that wrote the value; `None` for a schema default
    pub origin: Option<ConfigScope>,
}

/// One collection entry: typed attributes plus any nested raw elements
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigItem {
    attributes: IndexMap<String, Value>,
    children: Vec<Element>,
}

impl ConfigItem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.attributes.shift_remove(name)
    }

    /// Explicitly written value; schema defaults are not consulted
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Vec<Element> {
        &mut self.children
    }

    /// Build from an `add` element, typing every attribute the schema knows.
    pub fn from_element(node: &SchemaNode, element: &Element) -> Result<Self> {
        let mut attributes = IndexMap::new();
        for (name, raw) in &element.attributes {
            let value = match node.attribute(name) {
                Some(attr) => attr.parse_value(raw)?,
                None => Value::String(raw.clone()),
            };
            attributes.insert(name.clone(), value);
        }
        Ok(Self {
            attributes,
            children: element.children.clone(),
        })
    }

    pub fn to_element(&self, name: &str) -> Element {
        let mut element = Element::new(name);
        for (attr, value) in &self.attributes {
            element.set_attribute(attr.clone(), value.to_string());
        }
        element.children = self.children.clone();
        element
    }

    /// Check against the item schema and coerce values to their declared types
    pub fn validated(&self, node: &SchemaNode, path: &str, permissive: bool) -> Result<Self> {
        let element = self.to_element(&node.name);
        node.validate_element(&element, path, permissive)?;
        node.check_required(&element, path)?;
        Self::from_element(node, &element)
    }
}

/// An item in an effective collection, with where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveItem {
    pub item: ConfigItem,
    pub key: ItemKey,
    pub origin: ConfigScope,
    pub source: SourceId,
}

#[derive(Debug, Clone)]
pub struct ConfigCollection {
    schema: CollectionSchema,
    pub(crate) items: Vec<EffectiveItem>,
}

impl ConfigCollection {
    pub fn new(schema: CollectionSchema) -> Self {
        Self {
            schema,
            items: Vec::new(),
        }
    }

    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    pub fn items(&self) -> &[EffectiveItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn find(&self, key: &ItemKey) -> Option<&EffectiveItem> {
        self.items.iter().find(|i| &i.key == key)
    }

    pub fn keys(&self) -> Vec<&ItemKey> {
        self.items.iter().map(|i| &i.key).collect()
    }

    /// Key an item would have in this collection
    pub fn key_for(&self, item: &ConfigItem) -> Result<ItemKey> {
        self.schema
            .key_from(|name| item.get(name).map(|v| v.to_string()))
    }

    /// Attribute value of `item`, falling back to the schema default
    pub fn value(&self, item: &ConfigItem, name: &str) -> Option<Value> {
        item.get(name).cloned().or_else(|| {
            self.schema
                .item
                .attribute(name)
                .and_then(|attr| attr.default_value())
        })
    }
}

/// Merged state of one element of a section
#[derive(Debug, Clone)]
pub struct ConfigElement {
    pub name: String,
    pub(crate) attributes: IndexMap<String, EffectiveAttribute>,
    pub(crate) children: IndexMap<String, ConfigElement>,
    pub(crate) collection: Option<ConfigCollection>,
}

impl ConfigElement {
    /// Element holding only schema defaults
    pub fn from_schema(node: &SchemaNode) -> Self {
        let attributes = node
            .attributes
            .values()
            .filter_map(|attr| {
                attr.default_value().map(|value| {
                    (
                        attr.name.clone(),
                        EffectiveAttribute {
                            value,
                            origin: None,
                        },
                    )
                })
            })
            .collect();
        let children = node
            .elements
            .iter()
            .map(|(name, child)| (name.clone(), ConfigElement::from_schema(child)))
            .collect();
        Self {
            name: node.name.clone(),
            attributes,
            children,
            collection: node
                .collection
                .as_ref()
                .map(|c| ConfigCollection::new(c.as_ref().clone())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).map(|a| &a.value)
    }

    pub fn attribute(&self, name: &str) -> Option<&EffectiveAttribute> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &EffectiveAttribute)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn child(&self, name: &str) -> Option<&ConfigElement> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = &ConfigElement> {
        self.children.values()
    }

    pub fn collection(&self) -> Option<&ConfigCollection> {
        self.collection.as_ref()
    }

    pub fn descend<S: AsRef<str>>(&self, path: &[S]) -> Option<&ConfigElement> {
        path.iter()
            .try_fold(self, |node, name| node.child(name.as_ref()))
    }
}

/// The effective view of a section at one scope
#[derive(Debug, Clone)]
pub struct ConfigSection {
    pub name: String,
    pub scope: ConfigScope,
    pub schema: Arc<SectionSchema>,
    pub root: ConfigElement,
}

impl ConfigSection {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.root.get(name)
    }

    pub fn child(&self, name: &str) -> Option<&ConfigElement> {
        self.root.child(name)
    }

    pub fn collection(&self) -> Option<&ConfigCollection> {
        self.root.collection()
    }
}
