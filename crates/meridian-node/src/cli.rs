use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Meridian - peer-to-peer BFT consensus node
#[derive(Parser)]
#[command(name = "meridian")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },

    /// Generate configuration for a local validator set
    Init {
        /// Output path. With more than one validator, one file per
        /// validator is written next to it with an index suffix.
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,

        /// Number of validators in the generated set
        #[arg(short, long, default_value_t = 1)]
        validators: usize,

        /// Listen port of the first validator; the rest count up from it
        #[arg(long, default_value_t = 7600)]
        base_port: u16,
    },

    /// Generate a new keypair
    Keygen {
        /// Output file for the secret key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
