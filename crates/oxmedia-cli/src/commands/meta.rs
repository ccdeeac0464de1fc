//! Metadata sidecar records.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Subcommand};
use tracing::instrument;

use oxmedia_core::crypto::Decryptor;
use oxmedia_core::{MetadataSidecarCache, MetricsCollector, SidecarMetadataEntry, VaultDecryptor};

use crate::GlobalOptions;

#[derive(ClapArgs)]
pub struct Args {
    /// Directory holding sidecar records
    #[arg(long, value_name = "DIR", env = "OXMEDIA_SIDECAR_DIR")]
    pub sidecar_dir: PathBuf,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand)]
pub enum Action {
    /// Print the record for a media file
    Read {
        /// Media file path
        file: PathBuf,

        /// Print the record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Store a record for a media file
    Write {
        /// Media file path
        file: PathBuf,

        /// MIME type (detected from the decrypted content when omitted)
        #[arg(long)]
        mime: Option<String>,

        #[arg(long, requires = "height")]
        width: Option<u32>,

        #[arg(long, requires = "width")]
        height: Option<u32>,

        /// Playback duration in milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,
    },

    /// Delete the record for a media file
    Remove {
        /// Media file path
        file: PathBuf,
    },
}

#[instrument(level = "info", name = "cmd::meta", skip_all, fields(dir = %args.sidecar_dir.display()))]
pub fn execute(opts: &GlobalOptions, args: &Args) -> Result<()> {
    let sidecars = MetadataSidecarCache::new(&args.sidecar_dir, Arc::new(MetricsCollector::new()))
        .with_context(|| format!("Failed to open sidecar dir {}", args.sidecar_dir.display()))?;

    match &args.action {
        Action::Read { file, json } => {
            let entry = sidecars
                .lookup(file)
                .with_context(|| format!("No metadata recorded for {}", file.display()))?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                print_entry(&entry);
            }
        }
        Action::Write {
            file,
            mime,
            width,
            height,
            duration_ms,
        } => {
            let mime = match mime {
                Some(mime) => mime.clone(),
                None => detect_mime(opts, file)?,
            };
            let mut entry = SidecarMetadataEntry::new(file, mime);
            if let (Some(width), Some(height)) = (width, height) {
                entry = entry.with_dimensions(*width, *height);
            }
            if let Some(duration_ms) = duration_ms {
                entry = entry.with_duration_ms(*duration_ms);
            }
            let key = sidecars.write(&entry)?;
            if !opts.quiet {
                eprintln!("Wrote {}", sidecars.record_path(&key).display());
            }
        }
        Action::Remove { file } => {
            let removed = sidecars.remove(&sidecars.key_for(file))?;
            if !removed {
                anyhow::bail!("No metadata recorded for {}", file.display());
            }
        }
    }
    Ok(())
}

fn detect_mime(opts: &GlobalOptions, file: &std::path::Path) -> Result<String> {
    let key = opts
        .require_key()
        .context("Pass --mime or a media key to detect it")?;
    let media = VaultDecryptor::new(key.clone())
        .decrypt(file)
        .with_context(|| format!("Failed to decrypt {}", file.display()))?;
    Ok(media.mime_type.to_string())
}

fn print_entry(entry: &SidecarMetadataEntry) {
    println!("path:     {}", entry.path.display());
    println!("mime:     {}", entry.mime_type);
    if let (Some(width), Some(height)) = (entry.width, entry.height) {
        println!("size:     {width}x{height}");
    }
    if let Some(duration_ms) = entry.duration_ms {
        println!("duration: {duration_ms} ms");
    }
}
