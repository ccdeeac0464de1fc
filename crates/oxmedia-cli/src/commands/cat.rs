use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::instrument;

use oxmedia_core::MediaCore;

use crate::GlobalOptions;

#[derive(ClapArgs)]
pub struct Args {
    /// Encrypted vault file
    pub file: PathBuf,

    /// Start streaming at this plaintext offset
    #[arg(long, default_value = "0")]
    pub offset: u64,

    /// Stop after this many bytes
    #[arg(long)]
    pub length: Option<u64>,

    /// Decrypt the whole file up front instead of block by block
    #[arg(long)]
    pub whole: bool,
}

#[instrument(level = "info", name = "cmd::cat", skip_all, fields(file = %args.file.display()))]
pub fn execute(opts: &GlobalOptions, args: &Args) -> Result<()> {
    let key = opts.require_key()?.clone();
    let core = if args.whole {
        let decryptor = std::sync::Arc::new(oxmedia_core::VaultDecryptor::new(key));
        MediaCore::builder()
            .config(opts.config.clone())
            .decryptor(decryptor)
            .build()?
    } else {
        MediaCore::builder()
            .config(opts.config.clone())
            .vault_key(key)
            .build()?
    };

    let mut source = core.open_stream(&args.file);
    let remaining = source
        .open(args.offset)
        .with_context(|| format!("Failed to open {}", args.file.display()))?;
    tracing::debug!(remaining, blockwise = source.is_blockwise(), "Stream opened");

    let limit = args.length.unwrap_or(u64::MAX);
    let mut stdout = io::stdout().lock();
    io::copy(&mut io::Read::take(&mut source, limit), &mut stdout)?;
    stdout.flush()?;
    source.close();
    Ok(())
}
