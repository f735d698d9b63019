use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use dashmap::DashSet;
use tracing::{debug, info};

use crate::config::Config;
use crate::document::{ConfigScope, Document, RawSection};
use crate::edit::EditableSection;
use crate::error::{Error, Result};
use crate::resolve::{ConfigSection, resolve};
use crate::schema::{SchemaRegistry, SchemaSource};

/// Explicit handle on one configuration store: schema, document and the
/// in-process edit locks. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) registry: Arc<SchemaRegistry>,
    pub(crate) permissive: bool,
    /// Current committed document. Readers take a snapshot and never block.
    document: ArcSwap<Document>,
    /// Bumped after every successful commit
    generation: AtomicU64,
    /// (scope, section) pairs with an open edit
    locks: DashSet<(ConfigScope, String)>,
    commit: Mutex<()>,
}

impl ServerContext {
    /// Load the schema sources and document named in the settings
    pub fn open(config: &Config) -> Result<Self> {
        let mut sources = Vec::new();
        if config.schema.builtin {
            sources.push(SchemaSource::builtin());
        }
        for path in &config.schema.files {
            sources.push(SchemaSource::from_file(path)?);
        }
        let registry = SchemaRegistry::from_sources(&sources)?;

        let overrides: Vec<(ConfigScope, PathBuf)> = config
            .document
            .overrides
            .iter()
            .map(|o| (ConfigScope::parse(&o.scope), o.path.clone()))
            .collect();
        let document = Document::open(
            &registry,
            &config.document.root,
            &overrides,
            config.meta.permissive,
        )?;

        info!(
            num_sections = registry.sections().count(),
            permissive = config.meta.permissive,
            "Server context ready"
        );
        Ok(Self::from_parts(registry, document, config.meta.permissive))
    }

    pub fn from_parts(registry: SchemaRegistry, document: Document, permissive: bool) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                registry: Arc::new(registry),
                permissive,
                document: ArcSwap::from_pointee(document),
                generation: AtomicU64::new(0),
                locks: DashSet::new(),
                commit: Mutex::new(()),
            }),
        }
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    pub fn document(&self) -> Arc<Document> {
        self.inner.document.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Merged view of a section at a scope
    pub fn get_effective_section(&self, scope: &ConfigScope, name: &str) -> Result<ConfigSection> {
        let section = self.inner.registry.section(name)?;
        resolve(self.document().as_ref(), &section, scope)
    }

    /// Data stored directly at `scope`, without inheritance
    pub fn get_raw_section(&self, scope: &ConfigScope, name: &str) -> Result<Option<RawSection>> {
        let section = self.inner.registry.section(name)?;
        Ok(self.document().get_section(scope, &section))
    }

    /// Open a tracked edit of `path`, which is a section path optionally
    /// followed by nested element names.
    pub fn begin_edit(&self, scope: &ConfigScope, path: &str) -> Result<EditableSection> {
        let found = self.inner.registry.lookup(path)?;
        let lock = SectionLock::acquire(self.inner.clone(), scope, &found.section.path)?;
        EditableSection::open(self.inner.clone(), lock, scope.clone(), found)
    }
}

impl ServerInner {
    pub(crate) fn document(&self) -> Arc<Document> {
        self.document.load_full()
    }

    pub(crate) fn commit_guard(&self) -> MutexGuard<'_, ()> {
        self.commit.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn publish(&self, document: Document) {
        self.document.store(Arc::new(document));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "Published committed document");
    }
}

/// Held by an open edit; dropping it releases the (scope, section) pair.
pub(crate) struct SectionLock {
    inner: Arc<ServerInner>,
    key: (ConfigScope, String),
}

impl SectionLock {
    fn acquire(inner: Arc<ServerInner>, scope: &ConfigScope, section: &str) -> Result<Self> {
        let key = (scope.clone(), section.to_string());
        if !inner.locks.insert(key.clone()) {
            return Err(Error::SectionLocked {
                scope: scope.to_string(),
                section: section.to_string(),
            });
        }
        debug!(%scope, section, "Acquired section edit lock");
        Ok(Self { inner, key })
    }
}

impl Drop for SectionLock {
    fn drop(&mut self) {
        self.inner.locks.remove(&self.key);
        debug!(scope = %self.key.0, section = %self.key.1, "Released section edit lock");
    }
}
