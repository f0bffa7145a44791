//! cloud-init-ovf - OVF and VMware guest-customization datasource
//!
//! Runs the datasource resolution on its own, or inspects single inputs
//! (OVF environment files, VMware customization configs).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value as JsonValue};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cloud_init_ovf::config::loader::load_system_config;
use cloud_init_ovf::config::OvfSettings;
use cloud_init_ovf::datasources::ovf::{public_ssh_keys, OvfDatasource, OvfFlavor};
use cloud_init_ovf::datasources::{datasource_list, Dependency};
use cloud_init_ovf::imc::{CustomizationConfig, NicConfigurator};
use cloud_init_ovf::network::read_system_devices;
use cloud_init_ovf::ovf::read_ovf_environment;
use cloud_init_ovf::state::OvfPaths;
use cloud_init_ovf::{MetadataBundle, TransportResult};

#[derive(Parser)]
#[command(name = "cloud-init-ovf")]
#[command(author, version, about = "OVF and VMware guest-customization datasource", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look for instance data and print it as JSON
    Detect {
        /// Use the network flavor (http seedfrom, no VMware customization)
        #[arg(long)]
        net: bool,
        /// Filesystem root to operate on
        #[arg(long, env = "CLOUD_INIT_OVF_ROOT", default_value = "/")]
        root: PathBuf,
    },
    /// Parse an OVF environment file
    ParseOvf {
        file: PathBuf,
        /// Also extract the embedded network-config property
        #[arg(long)]
        network: bool,
    },
    /// Parse a VMware cust.cfg and show the resulting network config
    ShowCustomization {
        file: PathBuf,
        /// Name NICs by their config section instead of matching local devices
        #[arg(long)]
        no_system_devices: bool,
    },
    /// List the datasources available for a set of capabilities
    List {
        /// Network is available
        #[arg(long)]
        network: bool,
    },
}

fn init_logging(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))
}

fn bundle_json(source: &str, bundle: &MetadataBundle) -> Result<JsonValue> {
    Ok(json!({
        "source": source,
        "metadata": serde_json::to_value(&bundle.metadata)?,
        "config": serde_json::to_value(&bundle.config)?,
        "userdata": bundle.userdata.as_deref().map(String::from_utf8_lossy),
        "vendordata": bundle.vendordata.as_deref().map(String::from_utf8_lossy),
        "network_config": serde_json::to_value(&bundle.network_config)?,
        "public_keys": public_ssh_keys(&bundle.metadata),
    }))
}

async fn detect(net: bool, root: PathBuf) -> Result<()> {
    let paths = OvfPaths::with_root(&root);
    let flavor = if net { OvfFlavor::OvfNet } else { OvfFlavor::Ovf };
    let cfg = load_system_config(&paths)
        .await
        .context("loading system config")?;
    let settings = OvfSettings::from_system_config(&cfg, flavor);
    info!("Running {} datasource", flavor.name());

    let ds = OvfDatasource::new(flavor, paths, settings);
    let result = ds.resolve().await.inspect_err(|e| {
        if let Some(code) = e.status_code() {
            error!("Customization failed, reported status {}", code);
        }
    })?;
    match result {
        TransportResult::NotFound => {
            warn!("No OVF data found");
            println!("{}", json!({ "found": false }));
        }
        TransportResult::Found { source, bundle } => {
            let mut out = bundle_json(&source, &bundle)?;
            out["found"] = json!(true);
            out["subplatform"] = json!(ds.subplatform(&source).await);
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}

async fn parse_ovf(file: PathBuf, network: bool) -> Result<()> {
    let contents = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let env = read_ovf_environment(&contents, network)?;
    let bundle = MetadataBundle {
        network_config: env.network_config(),
        metadata: env.metadata,
        userdata: env.userdata,
        vendordata: None,
        config: env.config,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&bundle_json(&file.display().to_string(), &bundle)?)?
    );
    Ok(())
}

async fn show_customization(file: PathBuf, no_system_devices: bool) -> Result<()> {
    let contents = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let conf = CustomizationConfig::parse(&contents)?;

    let devices = if no_system_devices {
        None
    } else {
        Some(read_system_devices(&OvfPaths::new().sys_class_net()).await?)
    };
    let network = NicConfigurator::new(conf.nics.clone(), devices)?
        .network_config(&conf.name_servers, &conf.dns_suffixes)?;

    let out = json!({
        "hostname": conf.fqdn(),
        "timezone": conf.timezone,
        "locale": conf.locale,
        "admin_password": if conf.admin_password.is_some() { "set" } else { "unset" },
        "reset_password": conf.reset_password,
        "marker_id": conf.marker_id,
        "custom_script": conf.custom_script_name,
        "meta_data": conf.meta_data_name,
        "user_data": conf.user_data_name,
        "network_config": serde_json::to_value(&network)?,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Detect { net, root } => detect(net, root).await?,
        Commands::ParseOvf { file, network } => parse_ovf(file, network).await?,
        Commands::ShowCustomization {
            file,
            no_system_devices,
        } => show_customization(file, no_system_devices).await?,
        Commands::List { network } => {
            let mut depends = vec![Dependency::Filesystem];
            if network {
                depends.push(Dependency::Network);
            }
            for reg in datasource_list(&depends) {
                println!("{}", reg.name);
            }
        }
    }

    Ok(())
}
