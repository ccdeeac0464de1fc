#![deny(unsafe_code)]

mod commands;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use oxmedia_core::MediaKey;

use crate::commands::{cat, encrypt, get, keygen, meta};

/// Command-line interface for encrypted media vault files
#[derive(Parser)]
#[command(name = "oxmedia")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Generate a media key
    oxmedia keygen > media.key

    # Encrypt a photo into the vault
    oxmedia --key-file media.key encrypt photo.jpg vault/photo.bin

    # Stream the plaintext back out
    oxmedia --key-file media.key cat vault/photo.bin > photo.jpg

    # Fetch through the decrypt cache 8 times concurrently and print metrics
    oxmedia --key-file media.key get vault/photo.bin --repeat 8 --json
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Core configuration file (TOML)
    #[arg(long, value_name = "FILE", env = "OXMEDIA_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Media key as 64 hex characters (prefer --key-file)
    #[arg(long, env = "OXMEDIA_KEY", hide_env_values = true, global = true)]
    key: Option<String>,

    /// Read the media key from a file
    #[arg(long, value_name = "FILE", conflicts_with = "key", global = true)]
    key_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a random media key
    Keygen(keygen::Args),

    /// Encrypt a plaintext file into the vault format
    Encrypt(encrypt::Args),

    /// Stream a decrypted vault file to stdout
    Cat(cat::Args),

    /// Fetch a vault file through the decrypt cache
    Get(get::Args),

    /// Read or write metadata sidecar records
    Meta(meta::Args),
}

/// Global options shared by commands that touch vault files.
pub struct GlobalOptions {
    pub key: Option<MediaKey>,
    pub config: oxmedia_core::CoreConfig,
    pub quiet: bool,
}

impl GlobalOptions {
    pub fn require_key(&self) -> Result<&MediaKey> {
        self.key
            .as_ref()
            .context("A media key is required: pass --key, --key-file or set OXMEDIA_KEY")
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    if !cli.quiet {
        setup_tracing(cli.verbose);
    }

    let config = config::load(cli.config.as_deref())?;
    let key = load_key(cli.key.as_deref(), cli.key_file.as_deref())?;
    let ctx = GlobalOptions {
        key,
        config,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Keygen(args) => keygen::execute(&args),
        Commands::Encrypt(args) => encrypt::execute(&ctx, &args),
        Commands::Cat(args) => cat::execute(&ctx, &args),
        Commands::Get(args) => get::execute(&ctx, &args),
        Commands::Meta(args) => meta::execute(&ctx, &args),
    }
}

fn load_key(hex: Option<&str>, file: Option<&std::path::Path>) -> Result<Option<MediaKey>> {
    if let Some(path) = file {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read key file: {}", path.display()))?;
        let key = MediaKey::from_hex(contents.trim())
            .with_context(|| format!("Invalid key in {}", path.display()))?;
        return Ok(Some(key));
    }
    hex.map(|hex| MediaKey::from_hex(hex.trim()).context("Invalid media key"))
        .transpose()
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
