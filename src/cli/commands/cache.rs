//! Cache command - inspect and maintain the artifact cache

use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::{ForgeError, ForgeResult};
use crate::registry::{CacheEntry, Registry};
use console::style;
use std::io::{self, Write};
use std::time::Duration;

/// Format bytes as human-readable size (e.g., "1.5 GB")
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> ForgeResult<()> {
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

    match args.action {
        CacheAction::Status => status(&registry),
        CacheAction::List { format } => list(&registry, format),
        CacheAction::Prune { days, dry_run } => prune(&registry, days, dry_run),
        CacheAction::Clear { yes } => clear(&registry, yes),
    }
}

fn status(registry: &Registry) -> ForgeResult<()> {
    let entries = registry.entries()?;
    let total_bytes: u64 = entries.iter().map(|e| e.byte_size).sum();

    println!("Cache directory: {}", registry.root().display());
    println!("Entries:         {}", entries.len());
    println!("Total size:      {}", format_bytes(total_bytes));
    Ok(())
}

fn list(registry: &Registry, format: OutputFormat) -> ForgeResult<()> {
    let entries = registry.entries()?;
    if entries.is_empty() {
        println!("No cached artifacts.");
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_table(&entries),
        OutputFormat::Json => print_json(&entries)?,
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.fingerprint);
            }
        }
    }
    Ok(())
}

fn print_table(entries: &[CacheEntry]) {
    println!("{:<64} {:>10} {:<20}", "FINGERPRINT", "SIZE", "CREATED");
    println!("{}", "-".repeat(96));
    for entry in entries {
        println!(
            "{:<64} {:>10} {:<20}",
            entry.fingerprint,
            format_bytes(entry.byte_size),
            entry.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    println!("Total: {} entries", entries.len());
}

fn print_json(entries: &[CacheEntry]) -> ForgeResult<()> {
    #[derive(serde::Serialize)]
    struct EntryJson {
        fingerprint: String,
        path: String,
        byte_size: u64,
        created_at: String,
    }

    let json_entries: Vec<EntryJson> = entries
        .iter()
        .map(|e| EntryJson {
            fingerprint: e.fingerprint.to_hex(),
            path: e.artifact_path.display().to_string(),
            byte_size: e.byte_size,
            created_at: e.created_at.to_rfc3339(),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json_entries)?);
    Ok(())
}

fn prune(registry: &Registry, days: u32, dry_run: bool) -> ForgeResult<()> {
    let max_age = chrono::Duration::days(i64::from(days));

    if dry_run {
        let cutoff = chrono::Utc::now() - max_age;
        let candidates: Vec<_> = registry
            .entries()?
            .into_iter()
            .filter(|e| e.created_at < cutoff)
            .collect();
        if candidates.is_empty() {
            println!("Nothing to prune (threshold: {} days).", days);
            return Ok(());
        }
        println!("Would remove {} entries:", candidates.len());
        for entry in candidates {
            println!("  {} ({})", entry.fingerprint, format_bytes(entry.byte_size));
        }
        return Ok(());
    }

    let removed = registry.prune_older_than(max_age)?;
    let freed: u64 = removed.iter().map(|e| e.byte_size).sum();
    println!(
        "{} Removed {} entries, freed {}",
        style("[OK]").green(),
        removed.len(),
        format_bytes(freed)
    );
    Ok(())
}

fn clear(registry: &Registry, yes: bool) -> ForgeResult<()> {
    if !yes {
        print!(
            "Remove all cached artifacts under {}? [y/N] ",
            registry.root().display()
        );
        io::stdout()
            .flush()
            .map_err(|e| ForgeError::io("flushing stdout", e))?;
        let mut answer = String::new();
        io::stdin()
            .read_line(&mut answer)
            .map_err(|e| ForgeError::io("reading confirmation", e))?;
        if !matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let removed = registry.clear()?;
    println!("{} Removed {} entries", style("[OK]").green(), removed);
    Ok(())
}
