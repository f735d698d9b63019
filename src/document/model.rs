use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::schema::{SchemaRegistry, SectionSchema};

use super::element::Element;
use super::scope::ConfigScope;
use super::splice::{self, Splice};
use super::xml::{self, Span};

const ROOT_ELEMENT: &str = "configuration";
const LOCATION_ELEMENT: &str = "location";
const CONFIG_SECTIONS_ELEMENT: &str = "configSections";

/// Index of a source file within a [`Document`]. The root document is 0.
pub type SourceId = usize;

/// One persisted file: the root document or a scope's override file
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub id: SourceId,
    pub path: PathBuf,
    /// Scope that the file's top-level sections apply to
    pub scope: ConfigScope,
    pub root: Element,
    /// Text the tree was read from, kept in step with every edit
    layout: Option<Layout>,
}

#[derive(Debug, Clone)]
struct Layout {
    text: String,
    spans: Span,
}

/// Where a section is stored within a file
#[derive(Clone, Copy)]
enum Container {
    Root,
    Location(usize),
    /// No `location` block for the scope yet
    Missing,
}

impl SourceDocument {
    /// A document with no source text; it is written out in full
    pub fn new(id: SourceId, path: PathBuf, scope: ConfigScope, root: Element) -> Self {
        Self {
            id,
            path,
            scope,
            root,
            layout: None,
        }
    }

    /// A document read from `text`. Edits are applied to the text itself,
    /// so everything outside the edited section survives a commit unchanged.
    pub fn parse(id: SourceId, path: PathBuf, scope: ConfigScope, text: &str) -> Result<Self> {
        let (root, spans) = xml::parse_with_spans(text)?;
        Ok(Self {
            layout: Some(Layout {
                text: text.to_string(),
                spans,
            }),
            ..Self::new(id, path, scope, root)
        })
    }

    fn load(id: SourceId, path: &Path, scope: ConfigScope, must_exist: bool) -> Result<Self> {
        if !must_exist && !path.exists() {
            debug!(path = %path.display(), %scope, "Override file absent, starting empty");
            return Ok(Self::new(id, path.to_path_buf(), scope, Element::new(ROOT_ELEMENT)));
        }
        Self::parse(id, path.to_path_buf(), scope, &std::fs::read_to_string(path)?)
    }

    /// Top-level containers with their scopes: the root element itself, then
    /// every `location` block in document order.
    fn containers(&self) -> Vec<(ConfigScope, &Element)> {
        let mut out = vec![(self.scope.clone(), &self.root)];
        for child in &self.root.children {
            if child.name == LOCATION_ELEMENT {
                let path = child.attribute("path").unwrap_or_default();
                out.push((self.scope.join(path), child));
            }
        }
        out
    }

    /// The section element stored directly at `scope`, if any
    pub fn section_at(&self, scope: &ConfigScope, section: &SectionSchema) -> Option<&Element> {
        let segments = section.segments();
        self.containers()
            .into_iter()
            .filter(|(s, _)| s == scope)
            .find_map(|(_, container)| container.descend(&segments))
    }

    /// Scopes at which this file stores the section
    pub fn scopes_with(&self, section: &SectionSchema) -> Vec<ConfigScope> {
        let segments = section.segments();
        self.containers()
            .into_iter()
            .filter(|(_, container)| container.descend(&segments).is_some())
            .map(|(scope, _)| scope)
            .collect()
    }

    /// Replace the section element stored at `scope`, or delete it with
    /// `None`. Empty section groups left behind are pruned; a `location`
    /// wrapper is kept.
    pub fn put_section(
        &mut self,
        scope: &ConfigScope,
        section: &SectionSchema,
        element: Option<Element>,
    ) -> Result<()> {
        let segments = section.segments();
        let (groups, name) = segments.split_at(segments.len() - 1);
        let relative = scope.relative_to(&self.scope).ok_or_else(|| {
            Error::SchemaViolation(format!(
                "scope '{}' cannot be stored in '{}'",
                scope,
                self.path.display()
            ))
        })?;
        let container = self.find_container(&relative, &segments);

        let splice = match &self.layout {
            Some(layout) => {
                let root = (&self.root, &layout.spans);
                let node = match container {
                    Container::Root => Some(root),
                    Container::Location(idx) => self.root.children.get(idx).zip(layout.spans.children.get(idx)),
                    Container::Missing => None,
                };
                match (&element, node) {
                    (Some(element), node) => {
                        splice::put(&layout.text, root, node, &relative, &segments, element)?
                    }
                    (None, Some(node)) => splice::delete(&layout.text, node, &segments),
                    (None, None) => None,
                }
            }
            None => None,
        };

        let container = match container {
            Container::Root => &mut self.root,
            Container::Location(idx) => &mut self.root.children[idx],
            Container::Missing if element.is_some() => {
                self.root
                    .children
                    .push(Element::new(LOCATION_ELEMENT).with_attribute("path", relative));
                let idx = self.root.children.len() - 1;
                &mut self.root.children[idx]
            }
            Container::Missing => return Ok(()),
        };

        let parent = container.descend_or_insert(groups);
        match element {
            Some(element) => match parent.children.iter().position(|c| c.name == name[0]) {
                Some(idx) => parent.children[idx] = element,
                None => parent.children.push(element),
            },
            None => parent.children.retain(|c| c.name != name[0]),
        }
        prune_groups(container, groups);

        self.sync_layout(splice);
        Ok(())
    }

    fn find_container(&self, relative: &str, segments: &[&str]) -> Container {
        if relative.is_empty() && self.root.descend(segments).is_some() {
            return Container::Root;
        }

        let matches = |child: &Element| {
            child.name == LOCATION_ELEMENT
                && ConfigScope::parse(child.attribute("path").unwrap_or_default())
                    == ConfigScope::parse(relative)
        };
        let with_section = self
            .root
            .children
            .iter()
            .position(|c| matches(c) && c.descend(segments).is_some());
        let any = self.root.children.iter().position(|c| matches(c));

        match (with_section, any) {
            (Some(idx), _) => Container::Location(idx),
            _ if relative.is_empty() => Container::Root,
            (None, Some(idx)) => Container::Location(idx),
            (None, None) => Container::Missing,
        }
    }

    /// Apply the text edit matching a tree edit. If the edited text does
    /// not read back as the tree, the file is written out in full instead.
    fn sync_layout(&mut self, splice: Option<Splice>) {
        let Some(layout) = self.layout.take() else {
            return;
        };
        let text = match splice {
            Some(splice) => splice.apply(&layout.text),
            None => layout.text,
        };
        match xml::parse_with_spans(&text) {
            Ok((root, spans)) if root == self.root => self.layout = Some(Layout { text, spans }),
            _ => warn!(
                path = %self.path.display(),
                "Edit cannot be applied in place, the file will be rewritten"
            ),
        }
    }

    /// File contents reflecting the current tree
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match &self.layout {
            Some(layout) => Ok(layout.text.as_bytes().to_vec()),
            None => xml::write(&self.root),
        }
    }
}

/// A section element stored at one scope by one source
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    pub source: SourceId,
    pub element: &'a Element,
}

/// The unmerged data for one section at exactly one scope
#[derive(Debug, Clone)]
pub struct RawSection {
    pub name: String,
    pub scope: ConfigScope,
    /// One entry per file holding the section at this scope, root document first
    pub parts: Vec<(SourceId, Element)>,
}

/// Supplies raw section fragments per scope to the resolver
pub trait FragmentProvider {
    fn fragments_at(&self, scope: &ConfigScope, section: &SectionSchema) -> Vec<Fragment<'_>>;
}

/// The in-memory configuration: the root document plus override files
#[derive(Debug, Clone)]
pub struct Document {
    sources: Vec<Arc<SourceDocument>>,
}

impl Document {
    /// Parse and validate the root document and each `(scope, path)` override
    pub fn open(
        registry: &SchemaRegistry,
        root: &Path,
        overrides: &[(ConfigScope, PathBuf)],
        permissive: bool,
    ) -> Result<Self> {
        let mut sources = vec![SourceDocument::load(0, root, ConfigScope::root(), true)?];
        for (idx, (scope, path)) in overrides.iter().enumerate() {
            sources.push(SourceDocument::load(idx + 1, path, scope.clone(), false)?);
        }
        let document = Self::from_sources(registry, sources, permissive)?;
        info!(
            root = %root.display(),
            num_overrides = overrides.len(),
            "Opened configuration document"
        );
        Ok(document)
    }

    pub fn from_sources(
        registry: &SchemaRegistry,
        sources: Vec<SourceDocument>,
        permissive: bool,
    ) -> Result<Self> {
        for source in &sources {
            validate_source(registry, source, permissive)?;
        }
        Ok(Self {
            sources: sources.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn sources(&self) -> &[Arc<SourceDocument>] {
        &self.sources
    }

    pub fn source(&self, id: SourceId) -> Option<&SourceDocument> {
        self.sources.get(id).map(Arc::as_ref)
    }

    pub(crate) fn replace_source(&mut self, source: SourceDocument) {
        let id = source.id;
        self.sources[id] = Arc::new(source);
    }

    /// The override file registered for exactly this scope
    pub fn override_for(&self, scope: &ConfigScope) -> Option<SourceId> {
        self.sources
            .iter()
            .skip(1)
            .find(|s| &s.scope == scope)
            .map(|s| s.id)
    }

    /// Unmerged data owned directly at `scope`; `None` if no file stores it
    pub fn get_section(&self, scope: &ConfigScope, section: &SectionSchema) -> Option<RawSection> {
        let parts: Vec<(SourceId, Element)> = self
            .fragments_at(scope, section)
            .into_iter()
            .map(|f| (f.source, f.element.clone()))
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(RawSection {
            name: section.path.clone(),
            scope: scope.clone(),
            parts,
        })
    }

    /// Every scope holding raw data for the section
    pub fn scopes_with(&self, section: &SectionSchema) -> BTreeSet<ConfigScope> {
        self.sources
            .iter()
            .flat_map(|s| s.scopes_with(section))
            .collect()
    }
}

impl FragmentProvider for Document {
    fn fragments_at(&self, scope: &ConfigScope, section: &SectionSchema) -> Vec<Fragment<'_>> {
        self.sources
            .iter()
            .filter(|s| s.scope.contains(scope))
            .filter_map(|s| {
                s.section_at(scope, section).map(|element| Fragment {
                    source: s.id,
                    element,
                })
            })
            .collect()
    }
}

/// Remove empty group wrappers along `groups`, deepest first. The container
/// itself is never removed.
fn prune_groups(container: &mut Element, groups: &[&str]) {
    let Some((first, rest)) = groups.split_first() else {
        return;
    };
    if let Some(idx) = container.children.iter().position(|c| c.name == *first) {
        prune_groups(&mut container.children[idx], rest);
        if container.children[idx].is_empty() {
            container.children.remove(idx);
        }
    }
}

fn validate_source(registry: &SchemaRegistry, source: &SourceDocument, permissive: bool) -> Result<()> {
    if source.root.name != ROOT_ELEMENT {
        return Err(Error::SchemaViolation(format!(
            "'{}' must have a <{}> root, found <{}>",
            source.path.display(),
            ROOT_ELEMENT,
            source.root.name
        )));
    }

    // Each section may be stored once per scope and file
    let mut seen: BTreeSet<(ConfigScope, String)> = BTreeSet::new();
    for (scope, container) in source.containers() {
        let mut sections = Vec::new();
        for child in &container.children {
            if child.name == LOCATION_ELEMENT || child.name == CONFIG_SECTIONS_ELEMENT {
                continue;
            }
            validate_group(registry, child, child.name.clone(), permissive, &mut sections)?;
        }
        for section in sections {
            if !seen.insert((scope.clone(), section.clone())) {
                return Err(Error::SchemaViolation(format!(
                    "'{}' defines section '{}' more than once for scope '{}'",
                    source.path.display(),
                    section,
                    scope
                )));
            }
        }
    }
    Ok(())
}

fn validate_group(
    registry: &SchemaRegistry,
    element: &Element,
    path: String,
    permissive: bool,
    sections: &mut Vec<String>,
) -> Result<()> {
    if let Ok(section) = registry.section(&path) {
        section.node.validate_element(element, &path, permissive)?;
        sections.push(path);
        return Ok(());
    }

    if registry.is_group(&path) {
        for child in &element.children {
            validate_group(
                registry,
                child,
                format!("{path}/{}", child.name),
                permissive,
                sections,
            )?;
        }
        return Ok(());
    }

    if permissive {
        return Ok(());
    }
    Err(Error::UnknownSchemaElement { path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaSource;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_sources(&[SchemaSource::builtin()]).unwrap()
    }

    fn source(id: SourceId, scope: &str, text: &str) -> SourceDocument {
        SourceDocument::parse(
            id,
            PathBuf::from(format!("/virtual/{id}.config")),
            ConfigScope::parse(scope),
            text,
        )
        .unwrap()
    }

    fn text(doc: &SourceDocument) -> String {
        String::from_utf8(doc.to_bytes().unwrap()).unwrap()
    }

    const ROOT: &str = r#"<configuration>
    <configSections><section name="anything" /></configSections>
    <system.webServer>
        <security>
            <ipSecurity>
                <add ipAddress="10.0.0.0" subnetMask="255.0.0.0" />
            </ipSecurity>
        </security>
    </system.webServer>
    <location path="site1">
        <system.webServer>
            <security>
                <ipSecurity allowUnlisted="false" />
            </security>
        </system.webServer>
    </location>
</configuration>"#;

    #[test]
    fn test_get_section_is_unmerged() {
        let registry = registry();
        let doc = Document::from_sources(&registry, vec![source(0, "", ROOT)], false).unwrap();
        let section = registry.section("system.webServer/security/ipSecurity").unwrap();

        let root = doc.get_section(&ConfigScope::root(), &section).unwrap();
        assert_eq!(root.parts.len(), 1);
        assert_eq!(root.parts[0].1.children.len(), 1);

        let site = doc.get_section(&ConfigScope::parse("site1"), &section).unwrap();
        assert!(site.parts[0].1.children.is_empty());
        assert_eq!(site.parts[0].1.attribute("allowUnlisted"), Some("false"));

        assert!(doc.get_section(&ConfigScope::parse("site2"), &section).is_none());
    }

    #[test]
    fn test_unknown_element_rejected_unless_permissive() {
        let registry = registry();
        let text = r#"<configuration><system.webServer><fancyModule on="yes" /></system.webServer></configuration>"#;
        let err = Document::from_sources(&registry, vec![source(0, "", text)], false).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownSchemaElement { ref path } if path == "system.webServer/fancyModule"
        ));
        assert!(Document::from_sources(&registry, vec![source(0, "", text)], true).is_ok());
    }

    #[test]
    fn test_override_file_fragments_follow_root() {
        let registry = registry();
        let override_text = r#"<configuration>
    <system.webServer>
        <security><ipSecurity enableReverseDns="true" /></security>
    </system.webServer>
</configuration>"#;
        let doc = Document::from_sources(
            &registry,
            vec![source(0, "", ROOT), source(1, "site1", override_text)],
            false,
        )
        .unwrap();
        let section = registry.section("system.webServer/security/ipSecurity").unwrap();
        let fragments = doc.fragments_at(&ConfigScope::parse("site1"), &section);
        let ids: Vec<SourceId> = fragments.iter().map(|f| f.source).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(doc.override_for(&ConfigScope::parse("site1")), Some(1));
        assert_eq!(doc.scopes_with(&section).len(), 2);
    }

    #[test]
    fn test_put_section_creates_location_and_prunes() {
        let registry = registry();
        let section = registry.section("system.webServer/handlers").unwrap();
        let mut doc = source(0, "", "<configuration />");
        let scope = ConfigScope::parse("site1/app");

        let handlers = Element::new("handlers").with_child(
            Element::new("add")
                .with_attribute("name", "php")
                .with_attribute("path", "*.php")
                .with_attribute("verb", "*"),
        );
        doc.put_section(&scope, &section, Some(handlers)).unwrap();
        assert_eq!(doc.root.children[0].attribute("path"), Some("site1/app"));
        assert!(doc.section_at(&scope, &section).is_some());

        doc.put_section(&scope, &section, None).unwrap();
        assert!(doc.section_at(&scope, &section).is_none());
        let location = &doc.root.children[0];
        assert_eq!(location.name, "location");
        assert!(location.children.is_empty());
        assert_eq!(
            text(&doc),
            "<configuration>\n    <location path=\"site1/app\"/>\n</configuration>"
        );
    }

    #[test]
    fn test_put_section_leaves_rest_of_file_alone() {
        let registry = registry();
        let section = registry.section("system.webServer/security/ipSecurity").unwrap();
        let original = r#"<?xml version="1.0" encoding="utf-8"?>
<!-- managed by hand, keep the comments -->
<configuration>
    <system.webServer>
        <security>
            <!-- office network -->
            <ipSecurity allowUnlisted="true">
                <add ipAddress="10.0.0.1"   />
            </ipSecurity>
        </security>
    </system.webServer>
    <location path="site2">
        <system.webServer>
            <staticContent      enableDocFooter="true" />
        </system.webServer>
    </location>
</configuration>
"#;
        let mut doc = source(0, "", original);

        let ip = Element::new("ipSecurity")
            .with_child(Element::new("add").with_attribute("ipAddress", "192.168.1.1"));
        doc.put_section(&ConfigScope::parse("site3"), &section, Some(ip)).unwrap();
        let after = text(&doc);
        let (head, tail) = original.split_at(original.find("</configuration>").unwrap());
        assert!(after.starts_with(head.trim_end()), "{after}");
        assert!(after.ends_with(tail));
        assert!(after.contains(
            r#"    <location path="site3">
        <system.webServer>
            <security>
                <ipSecurity>
                    <add ipAddress="192.168.1.1"/>
                </ipSecurity>
            </security>
        </system.webServer>
    </location>"#
        ));
        assert_eq!(xml::parse(&after).unwrap(), doc.root);

        // Replacing a section rewrites that element only
        let ip = Element::new("ipSecurity").with_attribute("allowUnlisted", "false");
        doc.put_section(&ConfigScope::root(), &section, Some(ip)).unwrap();
        let after = text(&doc);
        assert!(after.contains("<!-- office network -->\n            <ipSecurity allowUnlisted=\"false\"/>\n"));
        assert!(after.contains(r#"<staticContent      enableDocFooter="true" />"#));
        assert!(after.contains("<!-- managed by hand, keep the comments -->"));
    }

    #[test]
    fn test_put_section_without_source_text_writes_whole_file() {
        let registry = registry();
        let section = registry.section("system.webServer/handlers").unwrap();
        let mut doc = SourceDocument::new(
            1,
            PathBuf::from("/virtual/site1.config"),
            ConfigScope::parse("site1"),
            Element::new(ROOT_ELEMENT),
        );
        let handlers = Element::new("handlers").with_attribute("accessPolicy", "Read");
        doc.put_section(&ConfigScope::parse("site1"), &section, Some(handlers))
            .unwrap();
        assert_eq!(xml::parse(&text(&doc)).unwrap(), doc.root);
        assert!(text(&doc).starts_with("<?xml"));
    }

    #[test]
    fn test_duplicate_location_for_same_section_rejected() {
        let registry = registry();
        let text = r#"<configuration>
    <location path="site1">
        <system.webServer><security><ipSecurity allowUnlisted="false" /></security></system.webServer>
    </location>
    <location path="site1/">
        <system.webServer><security><ipSecurity allowUnlisted="true" /></security></system.webServer>
    </location>
</configuration>"#;
        let err = Document::from_sources(&registry, vec![source(0, "", text)], false).unwrap_err();
        assert!(matches!(err, Error::SchemaViolation(ref msg) if msg.contains("ipSecurity")));

        // The root itself and a location for the root scope collide as well
        let text = r#"<configuration>
    <system.webServer><handlers /></system.webServer>
    <location path="">
        <system.webServer><handlers accessPolicy="Read" /></system.webServer>
    </location>
</configuration>"#;
        assert!(Document::from_sources(&registry, vec![source(0, "", text)], false).is_err());

        // Different sections in two blocks for one scope are fine
        let text = r#"<configuration>
    <location path="site1"><system.webServer><handlers /></system.webServer></location>
    <location path="site1"><system.webServer><staticContent /></system.webServer></location>
</configuration>"#;
        assert!(Document::from_sources(&registry, vec![source(0, "", text)], false).is_ok());
    }
}
