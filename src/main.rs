use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value as Json, json};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use siteadmin::binding::BindingQuery;
use siteadmin::cert::{DEFAULT_STORE, Thumbprint};
use siteadmin::config::load_config;
use siteadmin::document::{ConfigScope, xml};
use siteadmin::resolve::{ConfigElement, ConfigItem};
use siteadmin::sites::{self, APP_POOLS_SECTION, SITES_SECTION};
use siteadmin::{CertificateService, Error, ServerContext};

#[derive(Parser)]
#[command(name = "siteadmin")]
#[command(about = "Inspect and edit web server configuration, certificates and SSL bindings", long_about = None)]
struct Cli {
    /// Settings file (YAML)
    #[arg(short, long, env = "SITEADMIN_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective (or raw) state of a section
    Section {
        name: String,
        #[arg(short, long, default_value = "/")]
        scope: String,
        /// Only what is stored at the scope itself, as XML
        #[arg(long)]
        raw: bool,
    },
    /// Add a collection item
    AddItem {
        /// Section path, optionally followed by nested element names
        path: String,
        #[arg(short, long, default_value = "/")]
        scope: String,
        /// Attribute as name=value; repeat for more
        #[arg(short, long = "attr", value_parser = parse_pair)]
        attributes: Vec<(String, String)>,
    },
    /// Remove a collection item, masking it if it is inherited
    RemoveItem {
        path: String,
        #[arg(short, long, default_value = "/")]
        scope: String,
        /// Key attribute as name=value; repeat for composite keys
        #[arg(short, long = "key", value_parser = parse_pair)]
        key: Vec<(String, String)>,
    },
    /// Set a scalar attribute of a section or nested element
    Set {
        path: String,
        #[arg(short, long, default_value = "/")]
        scope: String,
        #[arg(value_parser = parse_pair)]
        attribute: (String, String),
    },
    /// List sites and application pools
    Sites,
    /// List certificates in a store
    Certificates {
        #[arg(short, long, default_value = DEFAULT_STORE)]
        store: String,
    },
    /// List SSL bindings
    Bindings {
        #[arg(long, conflicts_with_all = ["sni", "owner", "certificate"])]
        ip: bool,
        #[arg(long, conflicts_with_all = ["owner", "certificate"])]
        sni: bool,
        #[arg(long, conflicts_with = "certificate")]
        owner: Option<Uuid>,
        #[arg(long)]
        certificate: Option<Thumbprint>,
        /// Only bindings whose certificate is missing
        #[arg(long)]
        dangling: bool,
    },
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{s}'"))
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "siteadmin=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "Command failed");
        match e.downcast_ref::<Error>() {
            Some(err) => eprintln!("{}", err.user_message()),
            None => eprintln!("{e:#}"),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Section { name, scope, raw } => {
            let server = ServerContext::open(&config)?;
            let scope = ConfigScope::parse(&scope);
            if raw {
                match server.get_raw_section(&scope, &name)? {
                    Some(section) => {
                        for (_, element) in &section.parts {
                            println!("{}", String::from_utf8_lossy(&xml::write(element)?));
                        }
                    }
                    None => info!(section = %name, scope = %scope, "Nothing stored at this scope"),
                }
            } else {
                let section = server.get_effective_section(&scope, &name)?;
                println!("{}", serde_json::to_string_pretty(&element_json(&section.root))?);
            }
        }
        Commands::AddItem {
            path,
            scope,
            attributes,
        } => {
            let server = ServerContext::open(&config)?;
            let mut edit = server.begin_edit(&ConfigScope::parse(&scope), &path)?;
            let item = attributes
                .into_iter()
                .fold(ConfigItem::new(), |item, (name, value)| item.with(name, value));
            let key = edit.add_item(item)?;
            let written = edit.commit()?;
            println!("added {key} ({} file(s) written)", written.len());
        }
        Commands::RemoveItem { path, scope, key } => {
            let server = ServerContext::open(&config)?;
            let mut edit = server.begin_edit(&ConfigScope::parse(&scope), &path)?;
            let pairs: Vec<(&str, &str)> = key.iter().map(|(n, v)| (n.as_str(), v.as_str())).collect();
            let key = edit.key(&pairs)?;
            edit.remove_item(&key)?;
            edit.commit()?;
            println!("removed {key}");
        }
        Commands::Set {
            path,
            scope,
            attribute: (name, value),
        } => {
            let server = ServerContext::open(&config)?;
            let mut edit = server.begin_edit(&ConfigScope::parse(&scope), &path)?;
            edit.set_attribute(&name, value)?;
            edit.commit()?;
        }
        Commands::Sites => {
            let server = ServerContext::open(&config)?;
            let root = ConfigScope::root();
            for site in sites::sites(&server.get_effective_section(&root, SITES_SECTION)?)? {
                println!("{} (id {})", site.name, site.id);
                for binding in &site.bindings {
                    match &binding.certificate_hash {
                        Some(hash) => println!(
                            "  {} {} cert {hash}{}",
                            binding.protocol,
                            binding.information,
                            if binding.sni { " sni" } else { "" }
                        ),
                        None => println!("  {} {}", binding.protocol, binding.information),
                    }
                }
                for app in &site.applications {
                    println!("  app {} pool {}", app.path, app.application_pool);
                }
            }
            for pool in sites::application_pools(&server.get_effective_section(&root, APP_POOLS_SECTION)?)? {
                println!(
                    "pool {} {} {} queue {}",
                    pool.name, pool.managed_runtime_version, pool.managed_pipeline_mode, pool.queue_length
                );
            }
        }
        Commands::Certificates { store } => {
            let service = CertificateService::open(&config.meta.storage_dir).await?;
            let records = service.list_certificates(&store).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Commands::Bindings {
            ip,
            sni,
            owner,
            certificate,
            dangling,
        } => {
            let service = CertificateService::open(&config.meta.storage_dir).await?;
            let query = match (ip, sni, owner, certificate) {
                (true, _, _, _) => BindingQuery::Ip,
                (_, true, _, _) => BindingQuery::Sni,
                (_, _, Some(owner), _) => BindingQuery::Owner(owner),
                (_, _, _, Some(thumbprint)) => BindingQuery::Certificate(thumbprint),
                _ => BindingQuery::All,
            };
            let mut bindings = service.query_bindings(&query).await?;
            if dangling {
                let missing = service.dangling_bindings().await?;
                bindings.retain(|b| missing.contains(b));
            }
            for binding in bindings {
                println!(
                    "{} {} {} {}",
                    binding.endpoint, binding.thumbprint, binding.store, binding.owner
                );
            }
        }
    }
    Ok(())
}

fn element_json(element: &ConfigElement) -> Json {
    let mut out = Map::new();
    let attributes: Map<String, Json> = element
        .attributes()
        .map(|(name, attr)| {
            let origin = attr
                .origin
                .as_ref()
                .map_or_else(|| "default".to_string(), |s| s.to_string());
            (name.to_string(), json!({ "value": attr.value.to_string(), "origin": origin }))
        })
        .collect();
    if !attributes.is_empty() {
        out.insert("attributes".to_string(), Json::Object(attributes));
    }
    for child in element.children() {
        out.insert(child.name.clone(), element_json(child));
    }
    if let Some(collection) = element.collection() {
        let items: Vec<Json> = collection
            .items()
            .iter()
            .map(|entry| {
                let attributes: Map<String, Json> = entry
                    .item
                    .attributes()
                    .map(|(name, value)| (name.to_string(), Json::String(value.to_string())))
                    .collect();
                json!({
                    "key": entry.key.to_string(),
                    "origin": entry.origin.to_string(),
                    "attributes": attributes,
                })
            })
            .collect();
        out.insert("items".to_string(), Json::Array(items));
    }
    Json::Object(out)
}
