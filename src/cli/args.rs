//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// forgecache - content-addressed export cache for geometry pipelines
///
/// Fingerprints canonical geometry, runs the expensive solid-model
/// conversion at most once per unique fingerprint, and links every
/// requested output path to the cached artifact.
#[derive(Parser, Debug)]
#[command(name = "forgecache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "FORGECACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Skip local .forgecache.toml discovery
    #[arg(long, global = true)]
    pub no_local: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert a batch of geometry inputs through the cache
    Export(ExportArgs),

    /// Initialize a project-local .forgecache.toml config
    Init(InitArgs),

    /// Inspect and maintain the artifact cache
    Cache(CacheArgs),

    /// Show configuration
    Config(ConfigArgs),
}

/// Arguments for the export command
#[derive(Parser, Debug)]
pub struct ExportArgs {
    /// Canonical geometry files to convert (one request each)
    #[arg(conflicts_with = "batch")]
    pub inputs: Vec<PathBuf>,

    /// Directory for resolved output paths (defaults to each input's
    /// directory)
    #[arg(short, long)]
    pub out_dir: Option<PathBuf>,

    /// JSON batch manifest: a list of {id, source, output} records
    #[arg(short, long)]
    pub batch: Option<PathBuf>,

    /// Run inputs through the canonicalizer first (parametric sources
    /// instead of canonical geometry text)
    #[arg(long)]
    pub canonicalize: bool,

    /// Cache directory override
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Emit the batch report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the init command
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Overwrite existing .forgecache.toml
    #[arg(short, long)]
    pub force: bool,

    /// Target directory (defaults to current directory)
    #[arg(short, long)]
    pub path: Option<PathBuf>,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,

    /// Cache directory override
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Summarize entry count and total size
    Status,

    /// List cached artifacts
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove entries older than N days
    Prune {
        /// Age threshold in days
        #[arg(long, default_value = "30")]
        days: u32,

        /// Dry run - show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every cached artifact
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listing commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}
