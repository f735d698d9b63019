//! Typed views of the sites and application-pool sections.
//!
//! Sites are ordinary collection items; their bindings, applications and
//! virtual directories are nested collections stored inside each item. This
//! module reads them into plain structs, parses `bindingInformation`
//! strings, and holds the checks a commit to the sites section must pass.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::binding::EndpointKey;
use crate::document::Element;
use crate::error::{Error, Result};
use crate::resolve::{ConfigItem, ConfigSection};
use crate::schema::{CollectionSchema, SchemaNode, Value};

pub const SITES_SECTION: &str = "system.applicationHost/sites";
pub const APP_POOLS_SECTION: &str = "system.applicationHost/applicationPools";

const INVALID_HOST_CHARS: &str = "\"/\\[]:|<>+=;,?*$%#@{}^`";
const INVALID_PATH_CHARS: &str = "\\?;:@&=+$,|\"<>*";

/// Address part of `bindingInformation`; `*` listens on every address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingAddress {
    Any,
    Ip(IpAddr),
}

impl fmt::Display for BindingAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingAddress::Any => f.write_str("*"),
            BindingAddress::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]"),
            BindingAddress::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

/// Parsed `address:port:host`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingInformation {
    pub address: BindingAddress,
    pub port: u16,
    pub host: String,
}

impl BindingInformation {
    pub fn new(address: BindingAddress, port: u16, host: impl Into<String>) -> Result<Self> {
        let info = Self {
            address,
            port,
            host: host.into(),
        };
        info.check()?;
        Ok(info)
    }

    fn check(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::SchemaViolation(
                "the server port number must be a positive integer between 1 and 65535".to_string(),
            ));
        }
        if self.host.chars().any(|c| INVALID_HOST_CHARS.contains(c)) {
            return Err(Error::SchemaViolation(format!(
                "host name '{}' cannot contain any of {INVALID_HOST_CHARS}",
                self.host
            )));
        }
        Ok(())
    }

    /// Identity used for duplicate detection; host names are case-insensitive
    fn endpoint(&self) -> (BindingAddress, u16, String) {
        (self.address, self.port, self.host.to_ascii_lowercase())
    }
}

impl FromStr for BindingInformation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::SchemaViolation(format!("'{s}' is not valid binding information"));

        let (rest, host) = s.rsplit_once(':').ok_or_else(invalid)?;
        let (address, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let address = match address {
            "" | "*" => BindingAddress::Any,
            bracketed if bracketed.starts_with('[') && bracketed.ends_with(']') => {
                let inner = &bracketed[1..bracketed.len() - 1];
                BindingAddress::Ip(IpAddr::V6(inner.parse().map_err(|_| invalid())?))
            }
            other => BindingAddress::Ip(other.parse().map_err(|_| invalid())?),
        };
        let port: u16 = port.parse().map_err(|_| {
            Error::SchemaViolation(format!(
                "port '{port}' in '{s}' must be a positive integer between 1 and 65535"
            ))
        })?;
        Self::new(address, port, host)
    }
}

impl fmt::Display for BindingInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.address, self.port, self.host)
    }
}

/// An http or https binding of a site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteBinding {
    pub protocol: String,
    pub information: BindingInformation,
    pub certificate_hash: Option<String>,
    pub certificate_store: Option<String>,
    /// Certificate is selected by SNI host name instead of by IP endpoint
    pub sni: bool,
}

impl SiteBinding {
    pub fn http(information: BindingInformation) -> Self {
        Self {
            protocol: "http".to_string(),
            information,
            certificate_hash: None,
            certificate_store: None,
            sni: false,
        }
    }

    pub fn https(information: BindingInformation, hash: &str, store: &str, sni: bool) -> Self {
        Self {
            protocol: "https".to_string(),
            information,
            certificate_hash: Some(hash.to_string()),
            certificate_store: Some(store.to_string()),
            sni,
        }
    }

    /// Transport endpoint the certificate has to be bound to
    pub fn endpoint_key(&self) -> EndpointKey {
        let port = self.information.port;
        if self.sni {
            return EndpointKey::sni(&self.information.host, port);
        }
        let ip = match self.information.address {
            BindingAddress::Any => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            BindingAddress::Ip(ip) => ip,
        };
        EndpointKey::Ip(SocketAddr::new(ip, port))
    }

    pub fn to_item(&self) -> ConfigItem {
        let mut item = ConfigItem::new()
            .with("protocol", self.protocol.as_str())
            .with("bindingInformation", self.information.to_string());
        if let Some(hash) = &self.certificate_hash {
            item.set("certificateHash", hash.as_str());
        }
        if let Some(store) = &self.certificate_store {
            item.set("certificateStoreName", store.as_str());
        }
        if self.sni {
            item.set("sslFlags", Value::Flags(vec!["Sni".to_string()]));
        }
        item
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDirectory {
    pub path: String,
    pub physical_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub path: String,
    pub application_pool: String,
    pub virtual_directories: Vec<VirtualDirectory>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub name: String,
    pub id: u64,
    pub server_auto_start: bool,
    pub bindings: Vec<SiteBinding>,
    pub applications: Vec<Application>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationPool {
    pub name: String,
    pub managed_runtime_version: String,
    pub managed_pipeline_mode: String,
    pub auto_start: bool,
    pub queue_length: u64,
    pub start_mode: String,
}

/// Read every site of an effective sites section
pub fn sites(section: &ConfigSection) -> Result<Vec<Site>> {
    let Some(collection) = section.collection() else {
        return Ok(Vec::new());
    };
    let schema = collection.schema();
    let item_node = &schema.item;

    collection
        .items()
        .iter()
        .map(|entry| -> Result<Site> {
            let item = &entry.item;
            let bindings = match (item_node.elements.get("bindings"), find_child(item, "bindings")) {
                (Some(node), Some(element)) => nested_items(node, &element.children)?
                    .into_iter()
                    .filter_map(|(schema, binding)| site_binding(schema, &binding).transpose())
                    .collect::<Result<Vec<_>>>()?,
                _ => Vec::new(),
            };

            let applications = nested_items(item_node, item.children())?
                .into_iter()
                .map(|(app_schema, app)| -> Result<Application> {
                    let virtual_directories = nested_items(&app_schema.item, app.children())?
                        .into_iter()
                        .map(|(vdir_schema, vdir)| VirtualDirectory {
                            path: text(vdir_schema, &vdir, "path"),
                            physical_path: text(vdir_schema, &vdir, "physicalPath"),
                        })
                        .collect();
                    Ok(Application {
                        path: text(app_schema, &app, "path"),
                        application_pool: text(app_schema, &app, "applicationPool"),
                        virtual_directories,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(Site {
                name: text(schema, item, "name"),
                id: value(schema, item, "id").and_then(|v| v.as_u64()).unwrap_or(0),
                server_auto_start: value(schema, item, "serverAutoStart")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true),
                bindings,
                applications,
            })
        })
        .collect()
}

pub fn application_pools(section: &ConfigSection) -> Result<Vec<ApplicationPool>> {
    let Some(collection) = section.collection() else {
        return Ok(Vec::new());
    };
    let schema = collection.schema();
    Ok(collection
        .items()
        .iter()
        .map(|entry| {
            let item = &entry.item;
            ApplicationPool {
                name: text(schema, item, "name"),
                managed_runtime_version: text(schema, item, "managedRuntimeVersion"),
                managed_pipeline_mode: text(schema, item, "managedPipelineMode"),
                auto_start: value(schema, item, "autoStart")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true),
                queue_length: value(schema, item, "queueLength")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1000),
                start_mode: text(schema, item, "startMode"),
            }
        })
        .collect())
}

/// Checks applied whenever the sites section is committed
pub fn validate_sites(section: &ConfigSection) -> Result<()> {
    let sites = sites(section)?;
    let mut endpoints: HashMap<(BindingAddress, u16, String), &str> = HashMap::new();

    for site in &sites {
        for binding in &site.bindings {
            if let Some(owner) = endpoints.insert(binding.information.endpoint(), &site.name) {
                return Err(Error::DuplicateBinding(format!(
                    "{} is used by both '{}' and '{}'",
                    binding.information, owner, site.name
                )));
            }
        }
        for app in &site.applications {
            check_path(&app.path)?;
            for vdir in &app.virtual_directories {
                check_path(&vdir.path)?;
            }
        }
    }
    Ok(())
}

/// A new site item with one binding and a root application
pub fn new_site(name: &str, id: u64, physical_path: &str, binding: &SiteBinding, pool: &str) -> ConfigItem {
    let bindings = Element::new("bindings").with_child(binding.to_item().to_element("binding"));
    let root_app = Element::new("application")
        .with_attribute("path", "/")
        .with_attribute("applicationPool", pool)
        .with_child(
            Element::new("virtualDirectory")
                .with_attribute("path", "/")
                .with_attribute("physicalPath", physical_path),
        );
    ConfigItem::new()
        .with("name", name)
        .with("id", Value::Uint(id))
        .with_child(bindings)
        .with_child(root_app)
}

/// One more than the highest id in use
pub fn next_site_id(sites: &[Site]) -> u64 {
    sites.iter().map(|s| s.id).max().unwrap_or(0) + 1
}

fn check_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::SchemaViolation(format!(
            "application path '{path}' must start with '/'"
        )));
    }
    if path.chars().any(|c| INVALID_PATH_CHARS.contains(c)) {
        return Err(Error::SchemaViolation(format!(
            "application path '{path}' cannot contain any of {INVALID_PATH_CHARS}"
        )));
    }
    Ok(())
}

fn site_binding(schema: &CollectionSchema, item: &ConfigItem) -> Result<Option<SiteBinding>> {
    let protocol = text(schema, item, "protocol");
    if protocol != "http" && protocol != "https" {
        return Ok(None);
    }
    let information: BindingInformation = text(schema, item, "bindingInformation").parse()?;
    let non_empty = |name: &str| Some(text(schema, item, name)).filter(|s| !s.is_empty());
    let sni = matches!(
        value(schema, item, "sslFlags"),
        Some(Value::Flags(flags)) if flags.iter().any(|f| f == "Sni")
    );
    Ok(Some(SiteBinding {
        protocol,
        information,
        certificate_hash: non_empty("certificateHash"),
        certificate_store: non_empty("certificateStoreName"),
        sni,
    }))
}

fn find_child<'a>(item: &'a ConfigItem, name: &str) -> Option<&'a Element> {
    item.children().iter().find(|c| c.name == name)
}

/// Apply the add/remove/clear elements of a nested collection in order
fn nested_items<'a>(node: &'a SchemaNode, children: &[Element]) -> Result<Vec<(&'a CollectionSchema, ConfigItem)>> {
    let Some(schema) = node.collection.as_deref() else {
        return Ok(Vec::new());
    };
    let mut items = Vec::new();
    for child in children {
        if child.name == schema.add_element {
            items.push((schema.key_of(child)?, ConfigItem::from_element(&schema.item, child)?));
        } else if child.name == schema.remove_element {
            let key = schema.key_of(child)?;
            items.retain(|(k, _)| k != &key);
        } else if child.name == schema.clear_element {
            items.clear();
        }
    }
    Ok(items.into_iter().map(|(_, item)| (schema, item)).collect())
}

fn value(schema: &CollectionSchema, item: &ConfigItem, name: &str) -> Option<Value> {
    item.get(name)
        .cloned()
        .or_else(|| schema.item.attribute(name).and_then(|a| a.default_value()))
}

fn text(schema: &CollectionSchema, item: &ConfigItem, name: &str) -> String {
    value(schema, item, name).map(|v| v.to_string()).unwrap_or_default()
}
