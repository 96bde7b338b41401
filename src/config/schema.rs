//! Configuration schema for forgecache
//!
//! Configuration is stored at `~/.config/forgecache/config.toml`, with
//! optional per-project overrides in `.forgecache.toml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache directory and reservation settings
    pub cache: CacheConfig,

    /// Conversion (geometry kernel) settings
    pub export: ExportConfig,

    /// Canonicalization collaborator settings
    pub canonicalize: CanonicalizeConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Cache registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory (defaults to the forgecache state dir)
    pub dir: Option<PathBuf>,

    /// Extension of committed artifacts
    pub artifact_ext: String,

    /// Age in seconds after which a reservation lock counts as abandoned
    pub stale_lock_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            artifact_ext: "step".to_string(),
            stale_lock_secs: 1800,
        }
    }
}

/// Geometry kernel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Kernel binary converting canonical geometry into solid artifacts
    pub kernel_bin: String,

    /// Extra arguments passed before `-o <output> <input>`
    pub kernel_args: Vec<String>,

    /// Wall-clock limit for one conversion, in seconds
    pub timeout_secs: u64,

    /// Concurrent fingerprint groups (0 = one worker per group)
    pub max_workers: usize,

    /// Bounded wait on a fingerprint reserved elsewhere, in seconds
    pub reservation_wait_secs: u64,

    /// Poll interval while waiting on a foreign reservation, in ms
    pub poll_interval_ms: u64,

    /// Check artifact structure (STEP header) after conversion
    pub validate_output: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            kernel_bin: "openscad".to_string(),
            kernel_args: vec!["--export-format".to_string(), "step".to_string()],
            timeout_secs: 600,
            max_workers: 4,
            reservation_wait_secs: 300,
            poll_interval_ms: 250,
            validate_output: true,
        }
    }
}

/// Canonicalization collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonicalizeConfig {
    /// Binary lowering parametric sources into canonical geometry text
    pub bin: String,

    /// Extra arguments passed before the builtin export flags
    pub extra_args: Vec<String>,

    /// Wall-clock limit for one canonicalization, in seconds
    pub timeout_secs: u64,

    /// Library search path exported to the canonicalizer (OPENSCADPATH)
    pub search_path: Option<PathBuf>,
}

impl Default for CanonicalizeConfig {
    fn default() -> Self {
        Self {
            bin: "openscad".to_string(),
            extra_args: vec![],
            timeout_secs: 120,
            search_path: None,
        }
    }
}
