use std::sync::Arc;

use tracing::trace;

use crate::document::{ConfigScope, Element, FragmentProvider, SourceId};
use crate::error::{Error, Result};
use crate::schema::{SchemaNode, SectionSchema};

use super::effective::{ConfigElement, ConfigItem, ConfigSection, EffectiveAttribute, EffectiveItem};

/// Compute the effective view of `section` at `scope`.
///
/// Ancestors are applied root first, so a more specific scope always
/// overrides a less specific one. Within a scope, fragments apply in source
/// order and each fragment's collection operations apply in declaration
/// order.
pub fn resolve<P>(provider: &P, section: &Arc<SectionSchema>, scope: &ConfigScope) -> Result<ConfigSection>
where
    P: FragmentProvider + ?Sized,
{
    let mut root = ConfigElement::from_schema(&section.node);
    for ancestor in scope.ancestry() {
        for fragment in provider.fragments_at(&ancestor, section) {
            trace!(
                section = %section.path,
                scope = %ancestor,
                source = fragment.source,
                "Applying fragment"
            );
            let mut ctx = Apply {
                section: &section.path,
                scope: &ancestor,
                source: fragment.source,
            };
            ctx.element(&mut root, &section.node, fragment.element)?;
        }
    }

    Ok(ConfigSection {
        name: section.path.clone(),
        scope: scope.clone(),
        schema: section.clone(),
        root,
    })
}

struct Apply<'a> {
    section: &'a str,
    scope: &'a ConfigScope,
    source: SourceId,
}

impl Apply<'_> {
    fn element(&mut self, target: &mut ConfigElement, node: &SchemaNode, raw: &Element) -> Result<()> {
        for (name, text) in &raw.attributes {
            let value = match node.attribute(name) {
                Some(attr) => attr.parse_value(text)?,
                None => continue,
            };
            target.attributes.insert(
                name.clone(),
                EffectiveAttribute {
                    value,
                    origin: Some(self.scope.clone()),
                },
            );
        }

        for child in &raw.children {
            if let (Some(schema), Some(collection)) = (&node.collection, target.collection.as_mut()) {
                if child.name == schema.add_element {
                    let key = schema.key_of(child)?;
                    if collection.find(&key).is_some() {
                        return Err(Error::DuplicateKey {
                            section: self.section.to_string(),
                            key: key.to_string(),
                        });
                    }
                    collection.items.push(EffectiveItem {
                        item: ConfigItem::from_element(&schema.item, child)?,
                        key,
                        origin: self.scope.clone(),
                        source: self.source,
                    });
                    continue;
                }
                if child.name == schema.remove_element {
                    let key = schema.key_of(child)?;
                    collection.items.retain(|item| item.key != key);
                    continue;
                }
                if child.name == schema.clear_element {
                    collection.items.clear();
                    continue;
                }
            }

            if let (Some(child_node), Some(child_target)) =
                (node.elements.get(&child.name), target.children.get_mut(&child.name))
            {
                self.element(child_target, child_node, child)?;
            }
        }
        Ok(())
    }
}
