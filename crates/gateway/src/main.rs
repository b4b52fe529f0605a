//! Provisioning gateway binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use provis_core::config::AppConfig;
use provis_gateway::bootstrap::{build_state, cloud_client, discover_datacenters};
use provis_gateway::{AppState, hosts, register_key};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// provisd - machine directory and key registration gateway
#[derive(Parser, Debug)]
#[command(name = "provisd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "PROVIS_CONFIG",
        default_value = "config/provisd.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the rendered /etc/hosts file
    Hosts,
    /// Show the machine that owns an IP address
    LookupIp {
        /// Address to look up
        ip: String,
    },
    /// Print a machine's SSH public key
    Pubkey {
        /// Machine id
        zone: String,
    },
    /// Register a machine's SSH key
    RegisterKey {
        /// Address the machine registers from
        #[arg(long)]
        ip: String,
        /// Alias the machine claims
        #[arg(long)]
        alias: String,
        /// File containing the SSH public key
        #[arg(long)]
        key_file: PathBuf,
    },
    /// Add or replace an extra /etc/hosts entry
    AddHost {
        #[arg(long)]
        ip: String,
        #[arg(long)]
        hostname: String,
        /// Environment tag stored with the entry
        #[arg(long, default_value = "")]
        environ: String,
    },
    /// List the account's datacenters
    Datacenters,
}

fn load_config(path: &str) -> Result<AppConfig> {
    // File is optional, env vars can provide/override everything
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("PROVIS_") && key != "PROVIS_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: provisd --config /path/to/config.toml\n  \
             2. Environment variables: PROVIS_CLOUD__ACCOUNT=ops \
             PROVIS_CLOUD__BOOTSTRAP_URL=https://cloudapi.example.com provisd\n\n\
             See config/provisd.example.toml for example configuration.\n\
             Set PROVIS_CONFIG env var to specify a default config file path."
        );
    }

    figment
        .merge(Env::prefixed("PROVIS_").split("__"))
        .extract()
        .context("failed to load configuration")
}

async fn list_datacenters(config: &AppConfig) -> Result<()> {
    let http = cloud_client(&config.directory)?;
    let datacenters = discover_datacenters(&http, &config.cloud, None).await?;
    for (name, url) in &datacenters {
        println!("{name:<16} {url}");
    }
    Ok(())
}

async fn run(state: &AppState, command: Command) -> Result<()> {
    match command {
        Command::Hosts => {
            print!("{}", hosts::hosts_file(state).await?);
        }
        Command::LookupIp { ip } => {
            let machine = state
                .directory
                .machine_by_ip(&ip)
                .await?
                .with_context(|| format!("no machine with address {ip}"))?;
            println!("{}", serde_json::to_string_pretty(&machine)?);
        }
        Command::Pubkey { zone } => match state.directory.pubkey_for(&zone).await? {
            Some(key) => println!("{key}"),
            None => anyhow::bail!("machine {zone} has not published a public key"),
        },
        Command::RegisterKey { ip, alias, key_file } => {
            let key = std::fs::read_to_string(&key_file)
                .with_context(|| format!("failed to read {}", key_file.display()))?;
            let outcome = register_key(state, &ip, &alias, &key).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::AddHost {
            ip,
            hostname,
            environ,
        } => {
            hosts::add_host(state, &ip, &hostname, &environ).await?;
        }
        Command::Datacenters => list_datacenters(&state.config).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("provisd v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    match args.command {
        // Needs neither the database nor the directory.
        Command::Datacenters => {
            config.validate().context("invalid configuration")?;
            list_datacenters(&config).await
        }
        command => {
            let state = build_state(config).await?;
            let result = run(&state, command).await;
            if let Err(e) = state.shutdown().await {
                tracing::error!(error = %e, "failed to close database");
            }
            result
        }
    }
}
