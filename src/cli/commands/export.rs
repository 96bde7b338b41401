//! Export command - run a batch of conversions through the cache

use crate::batch::{BatchReport, ConversionRequest, RequestOutcome};
use crate::canon::Canonicalizer;
use crate::cli::args::ExportArgs;
use crate::config::{Config, ConfigManager};
use crate::convert::KernelConverter;
use crate::error::{ForgeError, ForgeResult};
use crate::orchestrator::{Orchestrator, OrchestratorOptions};
use crate::registry::Registry;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One record of a JSON batch manifest
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    id: String,
    source: PathBuf,
    output: PathBuf,
}

/// A request in preparation; sources that fail to load keep their slot
enum Prepared {
    Ready(ConversionRequest),
    Rejected { request_id: String, error: ForgeError },
}

/// Execute the export command
pub async fn execute(args: ExportArgs, config: &Config) -> ForgeResult<()> {
    let cache_dir = args
        .cache_dir
        .clone()
        .or_else(|| config.cache.dir.clone())
        .unwrap_or_else(ConfigManager::default_cache_dir);

    let registry = Registry::open(
        &cache_dir,
        &config.cache.artifact_ext,
        Duration::from_secs(config.cache.stale_lock_secs),
    )?;
    debug!("Cache directory: {}", cache_dir.display());

    let prepared = prepare_requests(&args, config).await?;
    let total = prepared.len();
    if total == 0 {
        return Err(ForgeError::User(
            "nothing to export; pass input files or --batch".to_string(),
        ));
    }

    let converter = Arc::new(KernelConverter::new(
        &config.export.kernel_bin,
        config.export.kernel_args.clone(),
        Duration::from_secs(config.export.timeout_secs),
        config.cache.artifact_ext.clone(),
        config.export.validate_output,
    ));
    let orchestrator = Orchestrator::new(
        registry,
        converter,
        OrchestratorOptions {
            max_workers: config.export.max_workers,
            reservation_wait: Duration::from_secs(config.export.reservation_wait_secs),
            poll_interval: Duration::from_millis(config.export.poll_interval_ms),
        },
    );

    let ready: Vec<ConversionRequest> = prepared
        .iter()
        .filter_map(|p| match p {
            Prepared::Ready(request) => Some(request.clone()),
            Prepared::Rejected { .. } => None,
        })
        .collect();

    let spinner = batch_spinner(args.json, ready.len());
    let mut ready_outcomes = orchestrator.run(ready).await.results.into_iter();
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    // Stitch load-time rejections back into their original slots
    let results: Vec<RequestOutcome> = prepared
        .into_iter()
        .map(|p| match p {
            Prepared::Ready(request) => ready_outcomes.next().unwrap_or_else(|| {
                RequestOutcome::failed(
                    request.request_id,
                    &ForgeError::Internal("missing outcome for request".to_string()),
                )
            }),
            Prepared::Rejected { request_id, error } => {
                RequestOutcome::failed(request_id, &error)
            }
        })
        .collect();
    let report = BatchReport { results };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report_table(&report);
    }

    if report.is_success() {
        Ok(())
    } else {
        Err(ForgeError::User(format!(
            "{} of {} request(s) failed",
            report.failed_count(),
            total
        )))
    }
}

/// Build the request list from positional inputs or a batch manifest
async fn prepare_requests(args: &ExportArgs, config: &Config) -> ForgeResult<Vec<Prepared>> {
    let entries: Vec<ManifestEntry> = if let Some(ref manifest_path) = args.batch {
        let content = tokio::fs::read_to_string(manifest_path)
            .await
            .map_err(|e| ForgeError::io(format!("reading {}", manifest_path.display()), e))?;
        serde_json::from_str(&content).map_err(|e| ForgeError::BatchManifest {
            path: manifest_path.clone(),
            reason: e.to_string(),
        })?
    } else {
        args.inputs
            .iter()
            .map(|input| ManifestEntry {
                id: input
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| input.display().to_string()),
                source: input.clone(),
                output: output_path_for(input, args.out_dir.as_deref(), &config.cache.artifact_ext),
            })
            .collect()
    };

    let canonicalizer = args.canonicalize.then(|| {
        Canonicalizer::new(
            &config.canonicalize.bin,
            config.canonicalize.extra_args.clone(),
            Duration::from_secs(config.canonicalize.timeout_secs),
            config.canonicalize.search_path.clone(),
        )
    });

    let mut prepared = Vec::with_capacity(entries.len());
    for entry in entries {
        let representation = match load_representation(&entry.source, canonicalizer.as_ref()).await
        {
            Ok(bytes) => bytes,
            Err(error) => {
                prepared.push(Prepared::Rejected {
                    request_id: entry.id,
                    error,
                });
                continue;
            }
        };
        prepared.push(Prepared::Ready(ConversionRequest::new(
            entry.id,
            representation,
            entry.output,
        )));
    }
    Ok(prepared)
}

async fn load_representation(
    source: &Path,
    canonicalizer: Option<&Canonicalizer>,
) -> ForgeResult<Vec<u8>> {
    match canonicalizer {
        Some(canon) => canon.produce_canonical(source).await,
        None => tokio::fs::read(source)
            .await
            .map_err(|e| ForgeError::io(format!("reading {}", source.display()), e)),
    }
}

fn output_path_for(input: &Path, out_dir: Option<&Path>, ext: &str) -> PathBuf {
    let file_name = input.with_extension(ext);
    let file_name = file_name
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("artifact.{}", ext)));
    match out_dir {
        Some(dir) => dir.join(file_name),
        None => input
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(file_name),
    }
}

fn batch_spinner(json: bool, requests: usize) -> Option<ProgressBar> {
    if json || requests == 0 {
        return None;
    }
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("static spinner template"),
    );
    spinner.set_message(format!("Converting {} request(s)...", requests));
    spinner.enable_steady_tick(Duration::from_millis(100));
    Some(spinner)
}

fn print_report_table(report: &BatchReport) {
    println!(
        "{:<20} {:<8} {:<10} {:<14} RESOLVED",
        "REQUEST", "STATUS", "CACHE", "LINK"
    );
    println!("{}", "-".repeat(80));

    for outcome in &report.results {
        match outcome {
            RequestOutcome::Converted(result) => {
                let cache = if result.cache_hit { "hit" } else { "miss" };
                println!(
                    "{:<20} {:<8} {:<10} {:<14} {}",
                    result.request_id,
                    style("ok").green(),
                    cache,
                    result.link_strategy,
                    result.resolved_path.display()
                );
            }
            RequestOutcome::Failed {
                request_id, error, ..
            } => {
                println!(
                    "{:<20} {:<8} {:<10} {:<14} {}",
                    request_id,
                    style("failed").red(),
                    "-",
                    "-",
                    error
                );
            }
        }
    }

    println!();
    println!(
        "{} request(s), {} conversion(s), {} failure(s)",
        report.results.len(),
        report.conversions(),
        report.failed_count()
    );
}
