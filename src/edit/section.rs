use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::document::{ConfigScope, Document, Element, Fragment, FragmentProvider, SourceId};
use crate::error::{Error, Result};
use crate::resolve::{ConfigCollection, ConfigElement, ConfigItem, ConfigSection, EffectiveItem, resolve};
use crate::schema::{CollectionSchema, ItemKey, OverrideMode, SchemaNode, SchemaRef, SectionSchema, Value};
use crate::server::{SectionLock, ServerInner};
use crate::sites;

use super::commit::write_sources;

/// Document view with the edit's working copies standing in for the
/// committed fragments at the edit scope.
struct Overlay<'a> {
    base: &'a Document,
    scope: &'a ConfigScope,
    working: &'a BTreeMap<SourceId, Element>,
}

impl FragmentProvider for Overlay<'_> {
    fn fragments_at(&self, scope: &ConfigScope, section: &SectionSchema) -> Vec<Fragment<'_>> {
        if scope != self.scope {
            return self.base.fragments_at(scope, section);
        }
        self.working
            .iter()
            .map(|(source, element)| Fragment {
                source: *source,
                element,
            })
            .collect()
    }
}

/// A tracked edit of one section (or a nested node of it) at one scope.
///
/// Mutations are recorded against working copies of the fragments stored
/// at the edit scope and re-resolved immediately, so the effective view
/// always reflects them. Nothing reaches disk until [`commit`]. Dropping
/// the edit discards pending changes and releases the section lock.
///
/// [`commit`]: EditableSection::commit
pub struct EditableSection {
    ctx: Arc<ServerInner>,
    lock: Option<SectionLock>,
    scope: ConfigScope,
    schema: SchemaRef,
    /// File that new data at this scope is written to
    target: SourceId,
    working: BTreeMap<SourceId, Element>,
    dirty: BTreeSet<SourceId>,
    view: ConfigSection,
}

impl EditableSection {
    pub(crate) fn open(
        ctx: Arc<ServerInner>,
        lock: SectionLock,
        scope: ConfigScope,
        schema: SchemaRef,
    ) -> Result<Self> {
        // Edits address plain elements; collection items are reached through
        // the item operations instead.
        schema
            .element_path
            .iter()
            .try_fold(&schema.section.node, |node, name| node.elements.get(name))
            .ok_or_else(|| {
                Error::SchemaNotFound(format!(
                    "{}/{}",
                    schema.section.path,
                    schema.element_path.join("/")
                ))
            })?;

        let document = ctx.document();
        let target = target_source(&document, &scope, &schema.section);
        let mut working: BTreeMap<SourceId, Element> = document
            .fragments_at(&scope, &schema.section)
            .into_iter()
            .map(|f| (f.source, f.element.clone()))
            .collect();
        working
            .entry(target)
            .or_insert_with(|| Element::new(section_leaf(&schema.section)));

        let overlay = Overlay {
            base: &document,
            scope: &scope,
            working: &working,
        };
        let view = resolve(&overlay, &schema.section, &scope)?;

        info!(
            %scope,
            section = %schema.section.path,
            target = %document.source(target).map(|s| s.path.display().to_string()).unwrap_or_default(),
            "Began section edit"
        );
        Ok(Self {
            ctx,
            lock: Some(lock),
            scope,
            schema,
            target,
            working,
            dirty: BTreeSet::new(),
            view,
        })
    }

    pub fn scope(&self) -> &ConfigScope {
        &self.scope
    }

    pub fn section_name(&self) -> &str {
        &self.schema.section.path
    }

    /// Full path of the edited node
    pub fn path(&self) -> String {
        let mut path = self.schema.section.path.clone();
        for name in &self.schema.element_path {
            path.push('/');
            path.push_str(name);
        }
        path
    }

    /// Effective view of the whole section including pending changes
    pub fn view(&self) -> &ConfigSection {
        &self.view
    }

    /// Effective view of the edited node
    pub fn node(&self) -> Option<&ConfigElement> {
        self.view.root.descend(&self.schema.element_path)
    }

    pub fn collection(&self) -> Option<&ConfigCollection> {
        self.node().and_then(ConfigElement::collection)
    }

    /// Effective items of the edited node, each with its origin scope
    pub fn items(&self) -> &[EffectiveItem] {
        self.collection().map(ConfigCollection::items).unwrap_or(&[])
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.node().and_then(|n| n.get(name))
    }

    /// File the edit scope's new data is written to
    pub fn target_path(&self) -> Option<PathBuf> {
        self.ctx.document().source(self.target).map(|s| s.path.clone())
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Key of the item whose key attributes are given by `pairs`
    pub fn key(&self, pairs: &[(&str, &str)]) -> Result<ItemKey> {
        let schema = self.schema.clone();
        collection_schema(&schema, &self.path())?.key_from(|name| {
            pairs
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.to_string())
        })
    }

    /// Add an item at the edit scope
    pub fn add_item(&mut self, item: ConfigItem) -> Result<ItemKey> {
        self.ensure_open()?;
        let schema = self.schema.clone();
        let collection = collection_schema(&schema, &self.path())?;
        let item = item.validated(&collection.item, &self.item_path(collection), self.ctx.permissive)?;
        let key = collection.key_from(|name| item.get(name).map(|v| v.to_string()))?;
        if self.find(&key).is_ok() {
            return Err(self.duplicate(&key));
        }

        let element = item.to_element(&collection.add_element);
        self.mutate(|edit| {
            edit.working_node_mut(edit.target).children.push(element);
            Ok(())
        })?;
        info!(scope = %self.scope, path = %self.path(), %key, "Added collection item");
        Ok(key)
    }

    /// Remove an item from the effective view. A local item's `add` is
    /// deleted; an inherited one is masked with a `remove` at the edit
    /// scope, leaving the ancestor's data alone.
    pub fn remove_item(&mut self, key: &ItemKey) -> Result<()> {
        self.ensure_open()?;
        let found = self.find(key)?.clone();
        let schema = self.schema.clone();
        let collection = collection_schema(&schema, &self.path())?;

        if found.origin == self.scope {
            self.mutate(|edit| {
                let node = edit.working_node_mut(found.source);
                let idx = position_of_add(node, collection, key).ok_or_else(|| Error::ItemNotFound {
                    key: key.to_string(),
                })?;
                node.children.remove(idx);
                Ok(())
            })?;
        } else {
            let remove = collection.remove_element_for(key);
            self.mutate(|edit| {
                edit.working_node_mut(edit.target).children.push(remove);
                Ok(())
            })?;
        }
        info!(
            scope = %self.scope,
            path = %self.path(),
            %key,
            inherited = found.origin != self.scope,
            "Removed collection item"
        );
        Ok(())
    }

    /// Replace the item with `key`. Local items are rewritten in place;
    /// inherited ones are shadowed by `remove` plus `add` at the edit scope.
    pub fn edit_item(&mut self, key: &ItemKey, item: ConfigItem) -> Result<ItemKey> {
        self.ensure_open()?;
        let found = self.find(key)?.clone();
        let schema = self.schema.clone();
        let collection = collection_schema(&schema, &self.path())?;

        let mut item = item.validated(&collection.item, &self.item_path(collection), self.ctx.permissive)?;
        if item.children().is_empty() {
            *item.children_mut() = found.item.children().to_vec();
        }
        let new_key = collection.key_from(|name| item.get(name).map(|v| v.to_string()))?;
        if &new_key != key && self.find(&new_key).is_ok() {
            return Err(self.duplicate(&new_key));
        }

        let element = item.to_element(&collection.add_element);
        if found.origin == self.scope {
            self.mutate(|edit| {
                let node = edit.working_node_mut(found.source);
                let idx = position_of_add(node, collection, key).ok_or_else(|| Error::ItemNotFound {
                    key: key.to_string(),
                })?;
                node.children[idx] = element;
                Ok(())
            })?;
        } else {
            let remove = collection.remove_element_for(key);
            self.mutate(|edit| {
                let node = edit.working_node_mut(edit.target);
                node.children.push(remove);
                node.children.push(element);
                Ok(())
            })?;
        }
        info!(scope = %self.scope, path = %self.path(), %key, %new_key, "Edited collection item");
        Ok(new_key)
    }

    /// Swap a local item with the previous local `add`. Returns false when
    /// the item is already first or a `remove`/`clear` sits in between.
    pub fn move_up(&mut self, key: &ItemKey) -> Result<bool> {
        self.move_item(key, true)
    }

    pub fn move_down(&mut self, key: &ItemKey) -> Result<bool> {
        self.move_item(key, false)
    }

    fn move_item(&mut self, key: &ItemKey, up: bool) -> Result<bool> {
        self.ensure_open()?;
        let found = self.find(key)?.clone();
        if found.origin != self.scope {
            return Err(Error::CannotReorderInherited {
                key: key.to_string(),
            });
        }
        let schema = self.schema.clone();
        let collection = collection_schema(&schema, &self.path())?;

        let swap = self
            .working
            .get(&found.source)
            .and_then(|section| section.descend(&self.schema.element_path))
            .and_then(|node| {
                let idx = position_of_add(node, collection, key)?;
                let is_op = |c: &Element| {
                    c.name == collection.add_element
                        || c.name == collection.remove_element
                        || c.name == collection.clear_element
                };
                let neighbour = if up {
                    node.children[..idx].iter().rposition(is_op)
                } else {
                    node.children[idx + 1..]
                        .iter()
                        .position(is_op)
                        .map(|p| p + idx + 1)
                }?;
                (node.children[neighbour].name == collection.add_element).then_some((idx, neighbour))
            });

        let Some((idx, neighbour)) = swap else {
            return Ok(false);
        };
        self.mutate(|edit| {
            edit.working_node_mut(found.source).children.swap(idx, neighbour);
            Ok(())
        })?;
        debug!(scope = %self.scope, %key, up, "Moved collection item");
        Ok(true)
    }

    /// Set a scalar attribute of the edited node at the edit scope
    pub fn set_attribute(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.ensure_open()?;
        let schema = self.schema.clone();
        let node = schema.node();
        let raw = value.into().to_string();
        node.validate_attribute(&self.path(), name, &raw, self.ctx.permissive)?;
        let text = match node.attribute(name) {
            Some(attr) => attr.canonical(&raw)?,
            None => raw,
        };

        self.mutate(|edit| {
            edit.working_node_mut(edit.target).set_attribute(name, text);
            Ok(())
        })?;
        info!(scope = %self.scope, path = %self.path(), attribute = name, "Set attribute");
        Ok(())
    }

    /// Drop the edit scope's value for an attribute so it is inherited again
    pub fn reset_attribute(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let holders: Vec<SourceId> = self
            .working
            .iter()
            .filter(|(_, section)| {
                section
                    .descend(&self.schema.element_path)
                    .is_some_and(|node| node.attribute(name).is_some())
            })
            .map(|(id, _)| *id)
            .collect();
        if holders.is_empty() {
            return Ok(());
        }

        self.mutate(|edit| {
            for id in holders {
                edit.working_node_mut(id).remove_attribute(name);
            }
            Ok(())
        })
    }

    /// Record `clear` at the edit scope, hiding every inherited item.
    /// The edit scope's own pending collection operations are dropped.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_open()?;
        let schema = self.schema.clone();
        let collection = collection_schema(&schema, &self.path())?;
        self.mutate(|edit| {
            let node = edit.working_node_mut(edit.target);
            node.children.retain(|c| {
                c.name != collection.add_element
                    && c.name != collection.remove_element
                    && c.name != collection.clear_element
            });
            node.children.push(Element::new(&collection.clear_element));
            Ok(())
        })?;
        info!(scope = %self.scope, path = %self.path(), "Cleared collection");
        Ok(())
    }

    /// Delete everything the edit scope stores for the edited node, so the
    /// parent's effective view shows through.
    pub fn revert_to_parent(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.scope.is_root() {
            return Err(Error::RevertNotAllowed);
        }
        let path = self.schema.element_path.clone();
        let leaf = section_leaf(&self.schema.section).to_string();
        let ids: Vec<SourceId> = self.working.keys().copied().collect();

        self.mutate(|edit| {
            for id in ids {
                edit.dirty.insert(id);
                let Some(section) = edit.working.get_mut(&id) else {
                    continue;
                };
                match path.split_last() {
                    None => *section = Element::new(&leaf),
                    Some((last, parents)) => {
                        if let Some(parent) = section.descend_mut(parents) {
                            parent.children.retain(|c| &c.name != last);
                        }
                    }
                }
            }
            Ok(())
        })?;
        info!(scope = %self.scope, path = %self.path(), "Reverted to parent");
        Ok(())
    }

    /// Discard uncommitted changes and end the edit. Not available at the
    /// server root, which has no parent to fall back to; drop the edit there.
    pub fn revert(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.scope.is_root() {
            return Err(Error::RevertNotAllowed);
        }
        info!(
            scope = %self.scope,
            section = %self.schema.section.path,
            num_files = self.dirty.len(),
            "Discarded section edit"
        );
        self.close();
        Ok(())
    }

    /// Persist the touched files and end the edit.
    ///
    /// The edit scope and every descendant scope holding the section are
    /// re-resolved against the new document first; if any fails, nothing is
    /// written and the edit stays open.
    pub fn commit(&mut self) -> Result<Vec<PathBuf>> {
        self.ensure_open()?;
        if self.dirty.is_empty() {
            self.close();
            return Ok(Vec::new());
        }

        let ctx = self.ctx.clone();
        let _guard = ctx.commit_guard();
        let section = self.schema.section.clone();

        let mut next = (*ctx.document()).clone();
        for id in &self.dirty {
            let Some(source) = next.source(*id) else {
                continue;
            };
            let mut source = source.clone();
            let element = self
                .working
                .get(id)
                .cloned()
                .map(|mut element| {
                    prune_elements(&section.node, &mut element);
                    element
                })
                .filter(|element| !element.is_empty());
            source.put_section(&self.scope, &section, element)?;
            next.replace_source(source);
        }

        validate(&next, &section, &self.scope)?;
        let written = write_sources(&next, &self.dirty)?;
        ctx.publish(next);

        info!(
            scope = %self.scope,
            section = %section.path,
            num_files = written.len(),
            "Committed section edit"
        );
        self.close();
        Ok(written)
    }

    fn mutate<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let working = self.working.clone();
        let dirty = self.dirty.clone();
        let result = op(self).and_then(|()| self.refresh());
        if result.is_err() {
            self.working = working;
            self.dirty = dirty;
        }
        result
    }

    fn refresh(&mut self) -> Result<()> {
        let document = self.ctx.document();
        let overlay = Overlay {
            base: &document,
            scope: &self.scope,
            working: &self.working,
        };
        self.view = resolve(&overlay, &self.schema.section, &self.scope)?;
        Ok(())
    }

    fn working_node_mut(&mut self, source: SourceId) -> &mut Element {
        self.dirty.insert(source);
        let leaf = section_leaf(&self.schema.section);
        self.working
            .entry(source)
            .or_insert_with(|| Element::new(leaf))
            .descend_or_insert(&self.schema.element_path)
    }

    fn find(&self, key: &ItemKey) -> Result<&EffectiveItem> {
        self.items()
            .iter()
            .find(|item| &item.key == key)
            .ok_or_else(|| Error::ItemNotFound {
                key: key.to_string(),
            })
    }

    fn duplicate(&self, key: &ItemKey) -> Error {
        Error::DuplicateKey {
            section: self.path(),
            key: key.to_string(),
        }
    }

    fn item_path(&self, collection: &CollectionSchema) -> String {
        format!("{}/{}", self.path(), collection.add_element)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.lock {
            Some(_) => Ok(()),
            None => Err(Error::EditClosed),
        }
    }

    fn close(&mut self) {
        self.lock = None;
        self.working.clear();
        self.dirty.clear();
    }
}

impl Drop for EditableSection {
    fn drop(&mut self) {
        if self.lock.is_some() && !self.dirty.is_empty() {
            debug!(
                scope = %self.scope,
                section = %self.schema.section.path,
                "Dropping edit with uncommitted changes"
            );
        }
    }
}

fn collection_schema<'a>(schema: &'a SchemaRef, path: &str) -> Result<&'a CollectionSchema> {
    schema
        .node()
        .collection
        .as_deref()
        .ok_or_else(|| Error::SchemaViolation(format!("'{path}' has no collection")))
}

fn section_leaf(section: &SectionSchema) -> &str {
    section.path.rsplit('/').next().unwrap_or(&section.path)
}

/// Locked sections are stored in a root-document `location`; others go to
/// the closest override file covering the scope.
fn target_source(document: &Document, scope: &ConfigScope, section: &SectionSchema) -> SourceId {
    if section.override_mode_default == OverrideMode::Deny {
        return 0;
    }
    document
        .sources()
        .iter()
        .skip(1)
        .filter(|s| s.scope.contains(scope))
        .max_by_key(|s| s.scope.depth())
        .map(|s| s.id)
        .unwrap_or(0)
}

fn position_of_add(node: &Element, collection: &CollectionSchema, key: &ItemKey) -> Option<usize> {
    node.children.iter().rposition(|c| {
        c.name == collection.add_element && collection.key_of(c).is_ok_and(|k| &k == key)
    })
}

/// Drop empty schema elements, leaving collection operations alone
fn prune_elements(node: &SchemaNode, element: &mut Element) {
    element.children.retain_mut(|child| match node.elements.get(&child.name) {
        Some(child_node) => {
            prune_elements(child_node, child);
            !child.is_empty()
        }
        None => true,
    });
}

fn validate(document: &Document, section: &Arc<SectionSchema>, scope: &ConfigScope) -> Result<()> {
    let mut scopes: BTreeSet<ConfigScope> = document
        .scopes_with(section)
        .into_iter()
        .filter(|s| scope.contains(s))
        .collect();
    scopes.insert(scope.clone());

    for s in scopes {
        let resolved = resolve(document, section, &s)?;
        if section.path == sites::SITES_SECTION {
            sites::validate_sites(&resolved)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaRegistry, SchemaSource};
    use crate::server::ServerContext;
    use std::path::Path;

    const IP_SECURITY: &str = "system.webServer/security/ipSecurity";
    const HANDLERS: &str = "system.webServer/handlers";

    const ROOT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<configuration>
    <system.webServer>
        <handlers>
            <add name="StaticFile" path="*" verb="*" modules="StaticFileModule" />
            <add name="CGI-exe" path="*.exe" verb="*" modules="CgiModule" />
        </handlers>
        <security>
            <ipSecurity>
                <add ipAddress="10.0.0.1" />
                <add ipAddress="10.0.0.2" />
            </ipSecurity>
        </security>
        <httpProtocol>
            <customHeaders>
                <add name="X-Powered-By" value="siteadmin" />
            </customHeaders>
        </httpProtocol>
    </system.webServer>
</configuration>
"#;

    const SITE_OVERRIDE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<configuration>
    <system.webServer>
        <staticContent enableDocFooter="true" />
    </system.webServer>
</configuration>
"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        site: PathBuf,
        ctx: ServerContext,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("applicationHost.config");
        let site = dir.path().join("site1/web.config");
        std::fs::write(&root, ROOT).unwrap();
        std::fs::create_dir_all(site.parent().unwrap()).unwrap();
        std::fs::write(&site, SITE_OVERRIDE).unwrap();
        let ctx = open(&root, &site);
        Fixture {
            _dir: dir,
            root,
            site,
            ctx,
        }
    }

    fn open(root: &Path, site: &Path) -> ServerContext {
        let registry = SchemaRegistry::from_sources(&[SchemaSource::builtin()]).unwrap();
        let document = Document::open(
            &registry,
            root,
            &[(ConfigScope::parse("site1"), site.to_path_buf())],
            false,
        )
        .unwrap();
        ServerContext::from_parts(registry, document, false)
    }

    fn names(edit: &EditableSection, attr: &str) -> Vec<String> {
        edit.items()
            .iter()
            .map(|i| i.key.get(attr).unwrap_or_default().to_string())
            .collect()
    }

    fn handler(name: &str, path: &str) -> ConfigItem {
        ConfigItem::new()
            .with("name", name)
            .with("path", path)
            .with("verb", "*")
    }

    #[test]
    fn test_inherited_remove_leaves_ancestor_untouched() {
        let f = fixture();
        let site = ConfigScope::parse("site1");
        let mut edit = f.ctx.begin_edit(&site, IP_SECURITY).unwrap();
        let key = edit.key(&[("ipAddress", "10.0.0.1")]).unwrap();
        edit.remove_item(&key).unwrap();
        assert_eq!(names(&edit, "ipAddress"), vec!["10.0.0.2"]);
        edit.commit().unwrap();

        let ctx = open(&f.root, &f.site);
        let root_view = ctx.get_effective_section(&ConfigScope::root(), IP_SECURITY).unwrap();
        assert_eq!(root_view.collection().unwrap().len(), 2);
        let site_view = ctx.get_effective_section(&site, IP_SECURITY).unwrap();
        assert_eq!(site_view.collection().unwrap().len(), 1);

        // ipSecurity is locked to the root document: the remove lands in a location.
        let root_text = std::fs::read_to_string(&f.root).unwrap();
        assert!(root_text.contains(r#"<location path="site1">"#));
        assert!(root_text.contains(r#"<remove ipAddress="10.0.0.1""#));
        assert_eq!(std::fs::read_to_string(&f.site).unwrap(), SITE_OVERRIDE);
    }

    #[test]
    fn test_local_remove_deletes_the_add() {
        let f = fixture();
        let mut edit = f.ctx.begin_edit(&ConfigScope::root(), HANDLERS).unwrap();
        let key = edit.key(&[("name", "CGI-exe")]).unwrap();
        edit.remove_item(&key).unwrap();
        edit.commit().unwrap();

        let text = std::fs::read_to_string(&f.root).unwrap();
        assert!(!text.contains("CGI-exe"));
        assert!(!text.contains("<remove"));
    }

    #[test]
    fn test_add_duplicate_key_rejected() {
        let f = fixture();
        let mut edit = f.ctx.begin_edit(&ConfigScope::parse("site1"), HANDLERS).unwrap();
        let err = edit.add_item(handler("StaticFile", "*.txt")).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
        assert!(!edit.has_changes());

        let err = edit.add_item(ConfigItem::new().with("name", "NoPath")).unwrap_err();
        assert!(matches!(err, Error::SchemaViolation(_)));
    }

    #[test]
    fn test_move_rules() {
        let f = fixture();
        let site = ConfigScope::parse("site1");
        let mut edit = f.ctx.begin_edit(&site, HANDLERS).unwrap();
        let inherited = edit.key(&[("name", "StaticFile")]).unwrap();
        assert!(matches!(
            edit.move_down(&inherited),
            Err(Error::CannotReorderInherited { .. })
        ));

        let php = edit.add_item(handler("PHP", "*.php")).unwrap();
        let asp = edit.add_item(handler("ASP", "*.asp")).unwrap();
        assert_eq!(names(&edit, "name"), vec!["StaticFile", "CGI-exe", "PHP", "ASP"]);
        assert!(edit.move_up(&asp).unwrap());
        assert_eq!(names(&edit, "name"), vec!["StaticFile", "CGI-exe", "ASP", "PHP"]);
        assert!(!edit.move_up(&asp).unwrap());
        assert!(!edit.move_down(&php).unwrap());
    }

    #[test]
    fn test_revert_rules() {
        let f = fixture();
        let mut root_edit = f.ctx.begin_edit(&ConfigScope::root(), HANDLERS).unwrap();
        assert!(matches!(root_edit.revert(), Err(Error::RevertNotAllowed)));
        assert!(matches!(root_edit.revert_to_parent(), Err(Error::RevertNotAllowed)));

        let site = ConfigScope::parse("site1");
        let mut edit = f.ctx.begin_edit(&site, HANDLERS).unwrap();
        edit.add_item(handler("PHP", "*.php")).unwrap();
        edit.revert().unwrap();
        assert!(matches!(edit.add_item(handler("X", "*.x")), Err(Error::EditClosed)));

        // The lock is free again and nothing was persisted.
        let edit = f.ctx.begin_edit(&site, HANDLERS).unwrap();
        assert_eq!(edit.items().len(), 2);
    }

    #[test]
    fn test_commit_then_reopen_reproduces_view() {
        let f = fixture();
        let site = ConfigScope::parse("site1");
        let mut edit = f.ctx.begin_edit(&site, HANDLERS).unwrap();
        let cgi = edit.key(&[("name", "CGI-exe")]).unwrap();
        edit.remove_item(&cgi).unwrap();
        edit.add_item(handler("PHP", "*.php")).unwrap();
        edit.set_attribute("accessPolicy", "Read, Script").unwrap();
        let before: Vec<EffectiveItem> = edit.items().to_vec();
        edit.commit().unwrap();

        let reopened = open(&f.root, &f.site);
        let after = reopened.get_effective_section(&site, HANDLERS).unwrap();
        assert_eq!(after.collection().unwrap().items(), before.as_slice());
        assert_eq!(
            after.get("accessPolicy"),
            Some(&Value::Flags(vec!["Read".into(), "Script".into()]))
        );
        assert_eq!(f.ctx.get_effective_section(&site, HANDLERS).unwrap().collection().unwrap().len(), 2);
    }

    #[test]
    fn test_allow_section_goes_to_override_file() {
        let f = fixture();
        let root_before = std::fs::read(&f.root).unwrap();
        let site = ConfigScope::parse("site1");
        let mut edit = f
            .ctx
            .begin_edit(&site, "system.webServer/httpProtocol/customHeaders")
            .unwrap();
        assert_eq!(edit.target_path().as_deref(), Some(f.site.as_path()));
        edit.add_item(ConfigItem::new().with("name", "X-Site").with("value", "one"))
            .unwrap();
        let written = edit.commit().unwrap();
        assert_eq!(written, vec![f.site.clone()]);

        assert_eq!(std::fs::read(&f.root).unwrap(), root_before);
        let text = std::fs::read_to_string(&f.site).unwrap();
        assert!(text.contains("X-Site"));
        assert!(text.contains(r#"        <staticContent enableDocFooter="true" />
"#));
    }

    #[test]
    fn test_commit_keeps_comments_and_untouched_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("applicationHost.config");
        let site = dir.path().join("site1/web.config");
        let original = r#"<?xml version="1.0" encoding="utf-8"?>
<configuration>
    <!-- hand-tuned, do not reformat -->
    <system.webServer>
        <security>
            <ipSecurity allowUnlisted="true" />
        </security>
    </system.webServer>
    <location path="site2">
        <system.webServer>
            <staticContent      enableDocFooter="true" />
        </system.webServer>
    </location>
</configuration>
"#;
        std::fs::write(&root, original).unwrap();
        let ctx = open(&root, &site);

        let mut edit = ctx.begin_edit(&ConfigScope::parse("site3"), IP_SECURITY).unwrap();
        edit.add_item(ConfigItem::new().with("ipAddress", "192.168.1.1"))
            .unwrap();
        assert_eq!(edit.commit().unwrap(), vec![root.clone()]);

        let site2 = r#"    <location path="site2">
        <system.webServer>
            <staticContent      enableDocFooter="true" />
        </system.webServer>
    </location>
"#;
        let untouched = &original[..original.find(site2).unwrap() + site2.len()];
        let text = std::fs::read_to_string(&root).unwrap();
        assert!(text.starts_with(untouched), "{text}");
        assert!(text.ends_with("    </location>\n</configuration>\n"));
        assert!(text.contains(r#"<location path="site3">"#));
        assert!(text.contains(r#"ipAddress="192.168.1.1""#));

        // A second commit to the same file still leaves the rest alone
        let mut edit = ctx.begin_edit(&ConfigScope::root(), IP_SECURITY).unwrap();
        edit.set_attribute("allowUnlisted", false).unwrap();
        edit.commit().unwrap();
        let text = std::fs::read_to_string(&root).unwrap();
        assert!(text.contains("<!-- hand-tuned, do not reformat -->"));
        assert!(text.contains(site2));
        assert!(text.contains(r#"<ipSecurity allowUnlisted="false"/>"#));

        let reopened = open(&root, &site);
        let view = reopened
            .get_effective_section(&ConfigScope::parse("site3"), IP_SECURITY)
            .unwrap();
        assert_eq!(view.collection().unwrap().len(), 1);
    }

    #[test]
    fn test_edit_inherited_item_shadows_it() {
        let f = fixture();
        let site = ConfigScope::parse("site1");
        let mut edit = f.ctx.begin_edit(&site, HANDLERS).unwrap();
        let key = edit.key(&[("name", "StaticFile")]).unwrap();
        edit.edit_item(&key, handler("StaticFile", "*.html")).unwrap();

        let item = &edit.items()[1];
        assert_eq!(item.origin, site);
        assert_eq!(item.item.get("path"), Some(&Value::from("*.html")));
        edit.commit().unwrap();

        let root = f.ctx.get_effective_section(&ConfigScope::root(), HANDLERS).unwrap();
        let original = root.collection().unwrap().find(&key).unwrap();
        assert_eq!(original.item.get("path"), Some(&Value::from("*")));
    }

    #[test]
    fn test_clear_and_revert_to_parent() {
        let f = fixture();
        let site = ConfigScope::parse("site1");
        let mut edit = f.ctx.begin_edit(&site, IP_SECURITY).unwrap();
        edit.clear().unwrap();
        edit.add_item(ConfigItem::new().with("ipAddress", "192.168.0.1").with("allowed", true))
            .unwrap();
        edit.set_attribute("allowUnlisted", false).unwrap();
        assert_eq!(names(&edit, "ipAddress"), vec!["192.168.0.1"]);
        edit.commit().unwrap();

        let mut edit = f.ctx.begin_edit(&site, IP_SECURITY).unwrap();
        edit.revert_to_parent().unwrap();
        assert_eq!(names(&edit, "ipAddress"), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(edit.get("allowUnlisted"), Some(&Value::Bool(true)));
        edit.commit().unwrap();

        let text = std::fs::read_to_string(&f.root).unwrap();
        assert!(!text.contains("192.168.0.1"));
        assert!(text.contains(r#"<location path="site1"/>"#));
    }

    #[test]
    fn test_reset_attribute_restores_inherited_value() {
        let f = fixture();
        let site = ConfigScope::parse("site1");
        let mut edit = f.ctx.begin_edit(&site, "system.webServer/staticContent").unwrap();
        assert_eq!(edit.get("enableDocFooter"), Some(&Value::Bool(true)));
        edit.reset_attribute("enableDocFooter").unwrap();
        assert_eq!(edit.get("enableDocFooter"), Some(&Value::Bool(false)));
        assert!(matches!(
            edit.set_attribute("enableDocFooter", "sometimes"),
            Err(Error::SchemaViolation(_))
        ));
        assert!(matches!(
            edit.set_attribute("footerColour", "red"),
            Err(Error::UnknownSchemaElement { .. })
        ));
    }

    #[test]
    fn test_commit_rejects_duplicate_below_edit_scope() {
        let f = fixture();
        let app = ConfigScope::parse("site1/app");
        let mut edit = f.ctx.begin_edit(&app, HANDLERS).unwrap();
        edit.add_item(handler("PHP", "*.php")).unwrap();
        edit.commit().unwrap();

        // Adding the same key higher up collides with the descendant's add.
        let mut edit = f.ctx.begin_edit(&ConfigScope::root(), HANDLERS).unwrap();
        edit.add_item(handler("PHP", "*.php5")).unwrap();
        let before = std::fs::read(&f.root).unwrap();
        assert!(matches!(edit.commit(), Err(Error::DuplicateKey { .. })));
        assert_eq!(std::fs::read(&f.root).unwrap(), before);
        assert!(edit.has_changes());
    }
}
