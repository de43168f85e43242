use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use meridian_core::KeyPair;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;
mod config;
mod node;

use cli::{Cli, Commands};
use config::{generate_cluster_configs, NodeConfig};
use node::Node;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging, RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_node(config).await?;
        }
        Commands::Init {
            output,
            validators,
            base_port,
        } => {
            init_config(output, validators, base_port)?;
        }
        Commands::Keygen { output } => {
            generate_keypair(output)?;
        }
    }

    Ok(())
}

/// Run a Meridian node
async fn run_node(config_path: PathBuf) -> Result<()> {
    info!("Loading configuration from {:?}", config_path);

    let config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        error!(
            "Configuration file not found: {:?}. Run 'meridian init' to create one.",
            config_path
        );
        return Err(anyhow::anyhow!("Configuration file not found"));
    };

    let node = Node::new(config)?;
    node.run().await?;

    Ok(())
}

/// `config.json` becomes `config-0.json`, `config-1.json`, ...
fn indexed_path(output: &Path, index: usize) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    let name = match output.extension() {
        Some(ext) => format!("{}-{}.{}", stem, index, ext.to_string_lossy()),
        None => format!("{}-{}", stem, index),
    };
    output.with_file_name(name)
}

/// Write configuration files for a local validator set
fn init_config(output: PathBuf, validators: usize, base_port: u16) -> Result<()> {
    info!("Generating configuration for {} validators", validators);

    let configs = generate_cluster_configs(validators, base_port)?;
    let mut written = Vec::new();
    for (i, config) in configs.iter().enumerate() {
        let path = if configs.len() == 1 {
            output.clone()
        } else {
            indexed_path(&output, i)
        };
        config.save(&path)?;
        info!("Configuration saved to {:?}", path);
        written.push(path);
    }

    println!("\nConfiguration files created:");
    for path in &written {
        println!("  {}", path.display());
    }
    println!("\nTo start a node, run:");
    println!("  meridian run --config {}", written[0].display());

    Ok(())
}

/// Generate a new keypair
fn generate_keypair(output: Option<PathBuf>) -> Result<()> {
    let keypair = KeyPair::generate();

    println!("Generated new keypair:");
    println!("  Public key:  {}", keypair.public.to_hex());
    println!("  Address:     {}", keypair.address());

    match output {
        Some(path) => {
            std::fs::write(&path, keypair.secret.to_hex())?;
            info!("Secret key saved to {:?}", path);
        }
        None => println!("  Secret key:  {}", keypair.secret.to_hex()),
    }

    println!("\nWARNING: Keep your secret key safe! Do not share it with anyone.");

    Ok(())
}
