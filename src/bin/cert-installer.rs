//! One-shot certificate installer.
//!
//! The operation is chosen by which flags are present:
//!
//! * no `-h`: import the PKCS#12 file `-f` into store `-s`
//! * `-h` without `-a`/`-o`: remove the certificate and its IP bindings, or
//!   with `-x` only its SNI bindings
//! * `-h` with `-a`/`-o`: bind the certificate to `address:port`, or with
//!   `-x` to `host:port`, on behalf of application `-i`

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use siteadmin::binding::{BindOutcome, EndpointKey};
use siteadmin::cert::{DEFAULT_STORE, Thumbprint};
use siteadmin::{CertificateService, Error};

#[derive(Parser, Debug)]
#[command(name = "cert-installer")]
#[command(about = "Import, remove and bind server certificates", long_about = None)]
#[command(disable_help_flag = true, arg_required_else_help = true)]
struct Args {
    /// PKCS#12 file name
    #[arg(short = 'f')]
    file: Option<PathBuf>,

    /// Password
    #[arg(short = 'p')]
    password: Option<String>,

    /// Friendly name
    #[arg(short = 'n')]
    friendly_name: Option<String>,

    /// Store name
    #[arg(short = 's', default_value = DEFAULT_STORE)]
    store: String,

    /// Certificate hash (not required when adding certificates)
    #[arg(short = 'h')]
    hash: Option<Thumbprint>,

    /// IP address
    #[arg(short = 'a')]
    address: Option<String>,

    /// Port number
    #[arg(short = 'o')]
    port: Option<u16>,

    /// Application ID
    #[arg(short = 'i')]
    id: Option<Uuid>,

    /// SNI host name (not required when managing IP based bindings)
    #[arg(short = 'x')]
    host: Option<String>,

    /// Directory holding certificate stores and the binding table
    #[arg(long, env = "SITEADMIN_STORAGE", default_value = "/var/lib/siteadmin")]
    storage_dir: PathBuf,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "siteadmin=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %format!("{e:#}"), "Certificate installer failed");
        match e.downcast_ref::<Error>() {
            Some(err) => eprintln!("{}", err.user_message()),
            None => eprintln!("{e:#}"),
        }
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let service = CertificateService::open(&args.storage_dir).await?;

    let Some(hash) = args.hash else {
        let file = args
            .file
            .ok_or_else(|| Error::InvalidInput("-f is required when adding a certificate".to_string()))?;
        let archive = tokio::fs::read(&file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        let record = service
            .import_certificate(
                &archive,
                args.password.as_deref().unwrap_or_default(),
                args.friendly_name.as_deref(),
                &args.store,
            )
            .await?;
        println!("{}", record.thumbprint);
        return Ok(());
    };

    if args.address.is_none() && args.port.is_none() {
        if args.host.is_some() {
            for endpoint in service.unbind_certificate(&args.store, &hash).await? {
                println!("unbound {endpoint}");
            }
        } else {
            for binding in service.remove_certificate_and_bindings(&args.store, &hash).await? {
                println!("still bound: {}", binding.endpoint);
            }
        }
        return Ok(());
    }

    let port = args
        .port
        .ok_or_else(|| Error::InvalidInput("-o is required when binding".to_string()))?;
    let owner = args
        .id
        .ok_or_else(|| Error::InvalidInput("-i is required when binding".to_string()))?;
    let endpoint = match (&args.host, &args.address) {
        (Some(host), _) => EndpointKey::sni(host, port),
        (None, Some(address)) => EndpointKey::Ip(SocketAddr::new(parse_address(address)?, port)),
        (None, None) => {
            return Err(Error::InvalidInput("-a or -x is required when binding".to_string()).into());
        }
    };

    let outcome = service.bind_endpoint(endpoint.clone(), hash, &args.store, owner).await?;
    match outcome {
        BindOutcome::Created => println!("bound {endpoint}"),
        BindOutcome::Replaced => println!("rebound {endpoint}"),
        BindOutcome::Unchanged => println!("{endpoint} already bound"),
    }
    Ok(())
}

fn parse_address(address: &str) -> Result<IpAddr, Error> {
    if address == "*" {
        return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    address
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| Error::InvalidInput(format!("'{address}' is not an IP address")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_parse() {
        let args = Args::try_parse_from([
            "cert-installer",
            "-h",
            "A909502DD82AE41433E6F83886B00D4277A32A7B",
            "-a",
            "10.0.0.1",
            "-o",
            "443",
            "-i",
            "214124cd-d05b-4309-9af9-9caa44b2b74a",
        ])
        .unwrap();
        assert_eq!(args.store, "My");
        assert_eq!(args.port, Some(443));
        assert!(args.hash.is_some());
        assert!(args.host.is_none());
    }

    #[test]
    fn test_no_arguments_is_an_error() {
        assert!(Args::try_parse_from(["cert-installer"]).is_err());
    }

    #[test]
    fn test_extra_arguments_are_rejected() {
        assert!(Args::try_parse_from(["cert-installer", "-s", "My", "stray"]).is_err());
    }

    #[test]
    fn test_address_forms() {
        assert_eq!(parse_address("*").unwrap(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(parse_address("[::1]").unwrap(), "::1".parse::<IpAddr>().unwrap());
        assert!(parse_address("example.com").is_err());
    }
}
