//! Fetch through the decrypt cache and report cache behaviour.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};
use tracing::instrument;

use oxmedia_core::{DecryptedMedia, MediaCore, MetricsSnapshot};

use super::format_bytes;
use crate::GlobalOptions;

#[derive(ClapArgs)]
pub struct Args {
    /// Encrypted vault files
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Number of concurrent requests per pass
    #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
    pub repeat: u32,

    /// Number of sequential passes
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
    pub passes: u32,

    /// Write the plaintext of the first file here
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[instrument(level = "info", name = "cmd::get", skip_all, fields(files = args.files.len()))]
pub fn execute(opts: &GlobalOptions, args: &Args) -> Result<()> {
    let core = Arc::new(
        MediaCore::builder()
            .config(opts.config.clone())
            .vault_key(opts.require_key()?.clone())
            .build()?,
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let results = runtime.block_on(fetch(&core, args))?;

    if let (Some(path), Some((_, media))) = (&args.output, results.first()) {
        std::fs::write(path, &media.data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    let snapshot = core.metrics_snapshot();
    if args.json {
        let files: Vec<_> = results
            .iter()
            .map(|(path, media)| {
                serde_json::json!({
                    "path": path,
                    "bytes": media.len(),
                    "mime_type": &*media.mime_type,
                    "cached": core.cache().contains(path),
                })
            })
            .collect();
        let report = serde_json::json!({
            "files": files,
            "metrics": snapshot,
            "hit_rate": snapshot.hit_rate(),
            "dedup_ratio": snapshot.dedup_ratio(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !opts.quiet {
        for (path, media) in &results {
            println!(
                "{}: {} ({})",
                path.display(),
                format_bytes(media.len() as u64),
                media.mime_type
            );
        }
        print_metrics_table(&snapshot);
    }
    Ok(())
}

/// Run every pass and return the last result for each file, in argument order.
async fn fetch(core: &Arc<MediaCore>, args: &Args) -> Result<Vec<(PathBuf, DecryptedMedia)>> {
    let mut results: Vec<(PathBuf, DecryptedMedia)> = Vec::with_capacity(args.files.len());
    for pass in 0..args.passes {
        let groups: Vec<Vec<_>> = args
            .files
            .iter()
            .map(|file| {
                (0..args.repeat)
                    .map(|_| {
                        let core = Arc::clone(core);
                        let path = file.clone();
                        tokio::spawn(async move { core.get(&path).await })
                    })
                    .collect()
            })
            .collect();

        results.clear();
        for (file, group) in args.files.iter().zip(groups) {
            let mut last = None;
            for handle in group {
                let media = handle
                    .await
                    .context("Request task failed")?
                    .with_context(|| format!("Failed to decrypt {}", file.display()))?;
                last = Some(media);
            }
            if let Some(media) = last {
                results.push((file.clone(), media));
            }
        }
        tracing::debug!(pass, "Pass complete");
    }
    Ok(results)
}

fn print_metrics_table(snapshot: &MetricsSnapshot) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Requests".to_string(), snapshot.total_requests().to_string()]);
    table.add_row(vec!["Cache hits".to_string(), snapshot.cache_hits.to_string()]);
    table.add_row(vec!["Cache misses".to_string(), snapshot.cache_misses.to_string()]);
    table.add_row(vec!["Coalesced".to_string(), snapshot.coalesced_waiters.to_string()]);
    table.add_row(vec!["Decrypts".to_string(), snapshot.decrypt_invocations.to_string()]);
    table.add_row(vec![
        "Hit rate".to_string(),
        format!("{:.1}%", snapshot.hit_rate() * 100.0),
    ]);
    table.add_row(vec![
        "Dedup ratio".to_string(),
        format!("{:.1}%", snapshot.dedup_ratio() * 100.0),
    ]);
    println!("{table}");
}
