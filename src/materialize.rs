//! Reference materialization
//!
//! Makes a canonical cached artifact visible at a caller's requested path
//! without duplicating bytes where the platform allows it. Strategies are
//! an ordered chain (symlink, hard link, full copy) tried in sequence;
//! the first that sticks is reported. Every strategy stages at a temporary
//! sibling name and renames into place, so the requested path never shows
//! a partial or broken file.

use crate::error::{ForgeError, ForgeResult};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// How a requested path was connected to the canonical artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStrategy {
    /// Symbolic link, relative to the requested path's parent
    Symlink,
    /// Hard link; only valid on the same filesystem as the cache
    Hardlink,
    /// Full byte copy
    Copy,
}

impl fmt::Display for LinkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Symlink => write!(f, "symlink"),
            Self::Hardlink => write!(f, "hardlink"),
            Self::Copy => write!(f, "copy"),
        }
    }
}

/// Default fallback chain, cheapest first
pub const DEFAULT_STRATEGIES: &[LinkStrategy] =
    &[LinkStrategy::Symlink, LinkStrategy::Hardlink, LinkStrategy::Copy];

/// Materialize `canonical` at `requested` using the default chain
pub fn materialize(canonical: &Path, requested: &Path) -> ForgeResult<LinkStrategy> {
    materialize_with(canonical, requested, DEFAULT_STRATEGIES)
}

/// Materialize `canonical` at `requested`, trying `strategies` in order
///
/// Idempotent: a requested path that already resolves to the canonical
/// artifact is left untouched and reported with its detected strategy.
/// Hard links are attempted and the OS error caught rather than
/// pre-checking devices; cross-volume requests simply fall through to
/// the next strategy.
pub fn materialize_with(
    canonical: &Path,
    requested: &Path,
    strategies: &[LinkStrategy],
) -> ForgeResult<LinkStrategy> {
    if !canonical.exists() {
        return Err(ForgeError::PathNotFound(canonical.to_path_buf()));
    }

    if let Some(existing) = detect_existing(canonical, requested) {
        debug!(
            "{} already materialized as {}, leaving in place",
            requested.display(),
            existing
        );
        return Ok(existing);
    }

    let parent = requested.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|e| ForgeError::io(format!("creating directory {}", parent.display()), e))?;

    let mut failures = Vec::new();
    for strategy in strategies {
        match stage_and_rename(*strategy, canonical, requested, parent) {
            Ok(()) => {
                debug!(
                    "Materialized {} -> {} via {}",
                    requested.display(),
                    canonical.display(),
                    strategy
                );
                return Ok(*strategy);
            }
            Err(e) => {
                debug!("{} strategy failed for {}: {}", strategy, requested.display(), e);
                failures.push(format!("{}: {}", strategy, e));
            }
        }
    }

    Err(ForgeError::LinkExhausted {
        target: requested.to_path_buf(),
        detail: failures.join("; "),
    })
}

/// Report the strategy already connecting `requested` to `canonical`, if any
fn detect_existing(canonical: &Path, requested: &Path) -> Option<LinkStrategy> {
    let meta = fs::symlink_metadata(requested).ok()?;

    if meta.file_type().is_symlink() {
        let resolved = fs::canonicalize(requested).ok()?;
        let target = fs::canonicalize(canonical).ok()?;
        return (resolved == target).then_some(LinkStrategy::Symlink);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let canonical_meta = fs::metadata(canonical).ok()?;
        if meta.dev() == canonical_meta.dev() && meta.ino() == canonical_meta.ino() {
            return Some(LinkStrategy::Hardlink);
        }
    }

    // A plain file that is not the artifact gets replaced atomically below
    None
}

fn stage_and_rename(
    strategy: LinkStrategy,
    canonical: &Path,
    requested: &Path,
    parent: &Path,
) -> std::io::Result<()> {
    let staging = staging_path(requested, parent);
    let result = match strategy {
        LinkStrategy::Symlink => symlink_relative(canonical, &staging, parent),
        LinkStrategy::Hardlink => fs::hard_link(canonical, &staging),
        LinkStrategy::Copy => fs::copy(canonical, &staging).map(|_| ()),
    };
    if let Err(e) = result {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }

    // Replacing a pre-existing symlink or file; rename over it is atomic
    if let Err(e) = fs::rename(&staging, requested) {
        let _ = fs::remove_file(&staging);
        return Err(e);
    }
    Ok(())
}

fn staging_path(requested: &Path, parent: &Path) -> PathBuf {
    let name = requested
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    parent.join(format!(".{}.{}.staging", name, std::process::id()))
}

#[cfg(unix)]
fn symlink_relative(canonical: &Path, staging: &Path, parent: &Path) -> std::io::Result<()> {
    let target = relative_to(canonical, parent).unwrap_or_else(|| canonical.to_path_buf());
    std::os::unix::fs::symlink(target, staging)
}

#[cfg(not(unix))]
fn symlink_relative(_canonical: &Path, _staging: &Path, _parent: &Path) -> std::io::Result<()> {
    // Symlink creation needs privileges on this platform; fall through
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks not supported",
    ))
}

/// Compute `path` relative to `base` so links survive tree relocation
fn relative_to(path: &Path, base: &Path) -> Option<PathBuf> {
    let path = path.canonicalize().ok()?;
    let base = base.canonicalize().ok()?;

    let mut path_parts = path.components().peekable();
    let mut base_parts = base.components().peekable();
    while let (Some(p), Some(b)) = (path_parts.peek(), base_parts.peek()) {
        if p != b {
            break;
        }
        path_parts.next();
        base_parts.next();
    }

    let mut rel = PathBuf::new();
    for _ in base_parts {
        rel.push("..");
    }
    for part in path_parts {
        rel.push(part);
    }
    (!rel.as_os_str().is_empty()).then_some(rel)
}
