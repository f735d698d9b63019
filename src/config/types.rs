use serde::Deserialize;
use std::path::PathBuf;

/// Root settings structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub meta: MetaConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    pub document: DocumentConfig,
}

/// Metadata configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetaConfig {
    /// Directory holding certificate stores and the binding table
    pub storage_dir: PathBuf,

    /// Accept (and round-trip) elements and attributes the schema does not know
    #[serde(default)]
    pub permissive: bool,
}

/// Where schema definitions come from
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    /// Load the bundled schema before any file below
    #[serde(default = "default_builtin_schema")]
    pub builtin: bool,

    /// Additional schema files; later files override earlier ones
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            builtin: default_builtin_schema(),
            files: Vec::new(),
        }
    }
}

fn default_builtin_schema() -> bool {
    true
}

/// The configuration document and its per-scope override files
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentConfig {
    pub root: PathBuf,

    #[serde(default)]
    pub overrides: Vec<OverrideConfig>,
}

/// An override fragment file owned by one scope (e.g. a site's web.config)
#[derive(Debug, Clone, Deserialize)]
pub struct OverrideConfig {
    pub scope: String,
    pub path: PathBuf,
}
