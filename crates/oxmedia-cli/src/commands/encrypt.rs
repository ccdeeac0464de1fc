use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use std::path::PathBuf;
use tracing::instrument;

use oxmedia_core::crypto::write_media_file;

use super::format_bytes;
use crate::GlobalOptions;

#[derive(ClapArgs)]
pub struct Args {
    /// Plaintext input file
    pub input: PathBuf,

    /// Encrypted output file
    pub output: PathBuf,
}

#[instrument(level = "info", name = "cmd::encrypt", skip_all, fields(input = %args.input.display()))]
pub fn execute(opts: &GlobalOptions, args: &Args) -> Result<()> {
    let key = opts.require_key()?;
    let plaintext = std::fs::read(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    write_media_file(&args.output, &plaintext, key)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;

    if !opts.quiet {
        eprintln!(
            "Encrypted {} ({}) -> {}",
            args.input.display(),
            format_bytes(plaintext.len() as u64),
            args.output.display()
        );
    }
    Ok(())
}
