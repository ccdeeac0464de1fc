use anyhow::Result;
use clap::Args as ClapArgs;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::instrument;

use oxmedia_core::MediaKey;

#[derive(ClapArgs)]
pub struct Args {
    /// Write the key to this file instead of stdout
    #[arg(value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[instrument(level = "info", name = "cmd::keygen", skip_all)]
pub fn execute(args: &Args) -> Result<()> {
    let key = MediaKey::random();
    let hex = key.to_hex();
    match &args.output {
        Some(path) => std::fs::write(path, format!("{}\n", hex.as_str()))?,
        None => writeln!(io::stdout(), "{}", hex.as_str())?,
    }
    Ok(())
}
