use std::collections::HashSet;
use std::path::Path;

use crate::document::ConfigScope;
use crate::error::{Error, Result};

use super::types::Config;

/// Load settings from a YAML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate settings for correctness
fn validate_config(config: &Config) -> Result<()> {
    if config.meta.storage_dir.as_os_str().is_empty() {
        return Err(Error::Config(
            "Storage directory cannot be empty".to_string(),
        ));
    }

    if config.document.root.as_os_str().is_empty() {
        return Err(Error::Config(
            "Root configuration document path cannot be empty".to_string(),
        ));
    }

    for file in &config.schema.files {
        if file.as_os_str().is_empty() {
            return Err(Error::Config("Schema file path cannot be empty".to_string()));
        }
    }

    if !config.schema.builtin && config.schema.files.is_empty() {
        return Err(Error::Config(
            "At least one schema source is required when the builtin schema is disabled"
                .to_string(),
        ));
    }

    let mut scopes = HashSet::new();
    for entry in &config.document.overrides {
        let scope = ConfigScope::parse(&entry.scope);
        if scope.is_root() {
            return Err(Error::Config(format!(
                "Override '{}' cannot target the server root",
                entry.path.display()
            )));
        }
        if entry.path.as_os_str().is_empty() {
            return Err(Error::Config(format!(
                "Override for scope '{}' has an empty path",
                entry.scope
            )));
        }
        if !scopes.insert(scope.clone()) {
            return Err(Error::Config(format!(
                "Duplicate override scope: '{}'",
                scope
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let yaml = r#"
meta:
  storage_dir: /tmp/test

schema:
  files:
    - /etc/siteadmin/extra_schema.xml

document:
  root: /tmp/test/applicationHost.config
  overrides:
    - scope: Default Web Site
      path: /tmp/test/site/web.config
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(validate_config(&config).is_ok());
        assert!(config.schema.builtin);
        assert!(!config.meta.permissive);
    }

    #[test]
    fn test_optional_schema_section() {
        let yaml = r#"
meta:
  storage_dir: /tmp/test
  permissive: true

document:
  root: /tmp/test/applicationHost.config
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(validate_config(&config).is_ok());
        assert!(config.meta.permissive);
        assert!(config.document.overrides.is_empty());
    }

    #[test]
    fn test_root_override_rejected() {
        let yaml = r#"
meta:
  storage_dir: /tmp/test

document:
  root: /tmp/test/applicationHost.config
  overrides:
    - scope: /
      path: /tmp/test/web.config
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_override_scopes() {
        let yaml = r#"
meta:
  storage_dir: /tmp/test

document:
  root: /tmp/test/applicationHost.config
  overrides:
    - scope: site1
      path: /tmp/a/web.config
    - scope: /site1/
      path: /tmp/b/web.config
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_no_schema_source() {
        let yaml = r#"
meta:
  storage_dir: /tmp/test

schema:
  builtin: false

document:
  root: /tmp/test/applicationHost.config
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }
}
