//! Filesystem-backed cache registry
//!
//! The single source of truth for fingerprint -> artifact, shared by every
//! process that opens the same cache directory. Publication uses a
//! write-to-scratch-then-rename sequence so a canonical path is only ever
//! absent or complete, and exclusive lock files scope one producer per
//! fingerprint across threads and processes.
//!
//! # Directory layout
//!
//! ```text
//! <cache_dir>/<fingerprint-hex>.<ext>        committed artifacts
//! <cache_dir>/.locks/<fingerprint-hex>.lock  reservation locks
//! <cache_dir>/.tmp/                          scratch staging (same volume)
//! ```

use crate::error::{ForgeError, ForgeResult};
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

const LOCKS_DIR: &str = ".locks";
const SCRATCH_DIR: &str = ".tmp";

/// A committed, immutable cache entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Fingerprint this entry serves
    pub fingerprint: Fingerprint,
    /// Canonical artifact path inside the cache directory
    pub artifact_path: PathBuf,
    /// When the artifact was committed
    pub created_at: DateTime<Utc>,
    /// Artifact size in bytes
    pub byte_size: u64,
}

/// Outcome of a reservation attempt
#[derive(Debug)]
pub enum ReserveOutcome {
    /// Caller is now the sole producer for this fingerprint
    Reserved(Reservation),
    /// Another thread or process holds a live reservation
    Busy,
}

/// An exclusive claim to produce the cache entry for one fingerprint
///
/// Backed by an atomically-created lock file. Released by `commit` or
/// `abort`; dropping an unreleased reservation removes the lock so a
/// panicking worker does not wedge the fingerprint until stale reclaim.
#[derive(Debug)]
pub struct Reservation {
    fingerprint: Fingerprint,
    lock_path: PathBuf,
    released: bool,
}

impl Reservation {
    /// The fingerprint this reservation covers
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    fn release(&mut self) {
        if !self.released {
            if let Err(e) = fs::remove_file(&self.lock_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove lock {}: {}", self.lock_path.display(), e);
                }
            }
            self.released = true;
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}

/// Identity of a lock file at the moment it was judged stale
#[derive(Debug, Clone, Copy)]
struct LockStamp {
    mtime: Option<SystemTime>,
    len: u64,
    #[cfg(unix)]
    ino: u64,
}

impl LockStamp {
    fn of(meta: &fs::Metadata) -> Self {
        Self {
            mtime: meta.modified().ok(),
            len: meta.len(),
            #[cfg(unix)]
            ino: {
                use std::os::unix::fs::MetadataExt;
                meta.ino()
            },
        }
    }

    fn matches(&self, meta: &fs::Metadata) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if self.ino != meta.ino() {
                return false;
            }
        }
        self.len == meta.len() && self.mtime == meta.modified().ok()
    }
}

/// Filesystem-backed registry mapping fingerprints to artifacts
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
    artifact_ext: String,
    stale_lock_after: Duration,
}

impl Registry {
    /// Open (creating if needed) a registry rooted at `dir`
    pub fn open(
        dir: impl Into<PathBuf>,
        artifact_ext: impl Into<String>,
        stale_lock_after: Duration,
    ) -> ForgeResult<Self> {
        let root = dir.into();
        for sub in [root.clone(), root.join(LOCKS_DIR), root.join(SCRATCH_DIR)] {
            fs::create_dir_all(&sub)
                .map_err(|e| ForgeError::io(format!("creating cache directory {}", sub.display()), e))?;
        }
        Ok(Self {
            root,
            artifact_ext: artifact_ext.into(),
            stale_lock_after,
        })
    }

    /// Cache directory root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical artifact path for a fingerprint
    pub fn artifact_path(&self, fingerprint: Fingerprint) -> PathBuf {
        self.root
            .join(format!("{}.{}", fingerprint.to_hex(), self.artifact_ext))
    }

    fn lock_path(&self, fingerprint: Fingerprint) -> PathBuf {
        self.root
            .join(LOCKS_DIR)
            .join(format!("{}.lock", fingerprint.to_hex()))
    }

    /// Scratch path for a reservation holder to stage its artifact
    ///
    /// Lives under the cache root so the commit rename never crosses a
    /// filesystem boundary.
    pub fn scratch_path(&self, fingerprint: Fingerprint) -> PathBuf {
        self.root.join(SCRATCH_DIR).join(format!(
            "{}.{}.partial",
            fingerprint.to_hex(),
            std::process::id()
        ))
    }

    /// Look up a committed entry; read-only, no side effects
    pub fn lookup(&self, fingerprint: Fingerprint) -> ForgeResult<Option<CacheEntry>> {
        let path = self.artifact_path(fingerprint);
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(CacheEntry {
                fingerprint,
                artifact_path: path,
                created_at: meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now()),
                byte_size: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ForgeError::io(
                format!("reading cache entry {}", path.display()),
                e,
            )),
        }
    }

    /// Attempt to become the sole producer for a fingerprint
    ///
    /// Lock creation uses `create_new`, which maps to O_CREAT|O_EXCL and is
    /// atomic against every other process sharing the cache directory. A
    /// lock older than the stale threshold is treated as abandoned by a
    /// crashed holder, removed, and the reservation retried once.
    pub fn reserve(&self, fingerprint: Fingerprint) -> ForgeResult<ReserveOutcome> {
        match self.try_create_lock(fingerprint)? {
            Some(reservation) => Ok(ReserveOutcome::Reserved(reservation)),
            None => {
                if self.reclaim_stale_lock(fingerprint)? {
                    match self.try_create_lock(fingerprint)? {
                        Some(reservation) => Ok(ReserveOutcome::Reserved(reservation)),
                        None => Ok(ReserveOutcome::Busy),
                    }
                } else {
                    Ok(ReserveOutcome::Busy)
                }
            }
        }
    }

    fn try_create_lock(&self, fingerprint: Fingerprint) -> ForgeResult<Option<Reservation>> {
        let lock_path = self.lock_path(fingerprint);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                // Contents are diagnostic only; exclusivity comes from create_new
                let _ = writeln!(file, "pid={} at={}", std::process::id(), Utc::now().to_rfc3339());
                debug!("Reserved fingerprint {}", fingerprint);
                Ok(Some(Reservation {
                    fingerprint,
                    lock_path,
                    released: false,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(ForgeError::io(
                format!("creating lock {}", lock_path.display()),
                e,
            )),
        }
    }

    /// Remove an abandoned lock; returns true if one was removed
    fn reclaim_stale_lock(&self, fingerprint: Fingerprint) -> ForgeResult<bool> {
        match self.stale_lock_stamp(fingerprint)? {
            Some(stamp) => self.take_stale_lock(fingerprint, stamp),
            None => Ok(false),
        }
    }

    /// Judge the lock stale, capturing its identity for the removal step
    fn stale_lock_stamp(&self, fingerprint: Fingerprint) -> ForgeResult<Option<LockStamp>> {
        let lock_path = self.lock_path(fingerprint);
        let meta = match fs::metadata(&lock_path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ForgeError::io(
                    format!("reading lock {}", lock_path.display()),
                    e,
                ))
            }
        };

        let age = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or(Duration::ZERO);
        if age < self.stale_lock_after {
            return Ok(None);
        }
        Ok(Some(LockStamp::of(&meta)))
    }

    /// Remove the stale lock, but only if it is still the file `stamp`
    /// was taken from
    ///
    /// The lock is renamed aside first, giving this caller sole custody
    /// of whatever currently sits at the lock path. A plain unlink here
    /// would race a concurrent reclaimer: the loser could judge the old
    /// lock stale and then delete the fresh lock the winner created,
    /// leaving two live reservations for one fingerprint.
    fn take_stale_lock(&self, fingerprint: Fingerprint, stamp: LockStamp) -> ForgeResult<bool> {
        let lock_path = self.lock_path(fingerprint);
        let taken = self.taken_lock_path(fingerprint);
        match fs::rename(&lock_path, &taken) {
            Ok(()) => {}
            // Holder released, or another reclaimer won; free either way
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(ForgeError::io(
                    format!("taking stale lock {}", lock_path.display()),
                    e,
                ))
            }
        }

        let unchanged = fs::metadata(&taken)
            .map(|m| stamp.matches(&m))
            .unwrap_or(false);
        if unchanged {
            warn!(
                "Reclaiming stale lock for {} (threshold {}s)",
                fingerprint,
                self.stale_lock_after.as_secs()
            );
            let _ = fs::remove_file(&taken);
            return Ok(true);
        }

        // Took a lock created after the staleness check; put it back.
        // hard_link refuses to clobber any lock created in the meantime.
        if let Err(e) = fs::hard_link(&taken, &lock_path) {
            warn!("Could not restore displaced lock for {}: {}", fingerprint, e);
        }
        let _ = fs::remove_file(&taken);
        Ok(false)
    }

    fn taken_lock_path(&self, fingerprint: Fingerprint) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        self.root.join(LOCKS_DIR).join(format!(
            "{}.reclaim.{}.{}",
            fingerprint.to_hex(),
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    /// Publish a staged artifact at the canonical path and release the lock
    ///
    /// The source must live on the same filesystem (use `scratch_path`);
    /// the rename is atomic, so readers observe either no entry or the
    /// complete artifact. If another producer somehow committed first, the
    /// existing entry wins and the staged bytes are discarded.
    pub fn commit(
        &self,
        mut reservation: Reservation,
        artifact_source: &Path,
    ) -> ForgeResult<CacheEntry> {
        let fingerprint = reservation.fingerprint;
        let target = self.artifact_path(fingerprint);

        if !artifact_source.exists() {
            reservation.release();
            return Err(ForgeError::PathNotFound(artifact_source.to_path_buf()));
        }

        if target.exists() {
            debug!("Entry for {} already committed, discarding staged copy", fingerprint);
            let _ = fs::remove_file(artifact_source);
        } else {
            fs::rename(artifact_source, &target).map_err(|e| {
                ForgeError::io(
                    format!(
                        "publishing {} -> {}",
                        artifact_source.display(),
                        target.display()
                    ),
                    e,
                )
            })?;
        }

        reservation.release();
        self.lookup(fingerprint)?.ok_or_else(|| {
            ForgeError::Internal(format!("entry for {} vanished after commit", fingerprint))
        })
    }

    /// Release a reservation without publishing (conversion failed)
    pub fn abort(&self, mut reservation: Reservation) {
        debug!("Aborting reservation for {}", reservation.fingerprint);
        reservation.release();
    }

    /// Enumerate committed entries, newest first
    pub fn entries(&self) -> ForgeResult<Vec<CacheEntry>> {
        let suffix = format!(".{}", self.artifact_ext);
        let mut entries = Vec::new();

        let read_dir = fs::read_dir(&self.root)
            .map_err(|e| ForgeError::io(format!("listing cache {}", self.root.display()), e))?;
        for dirent in read_dir {
            let dirent =
                dirent.map_err(|e| ForgeError::io("reading cache directory entry", e))?;
            let name = dirent.file_name();
            let Some(stem) = name.to_string_lossy().strip_suffix(&suffix).map(String::from)
            else {
                continue;
            };
            let Some(fingerprint) = Fingerprint::from_hex(&stem) else {
                continue;
            };
            if let Some(entry) = self.lookup(fingerprint)? {
                entries.push(entry);
            }
        }

        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    /// Remove entries older than `max_age`; returns the removed entries
    ///
    /// Entries whose fingerprint is currently reserved are skipped.
    pub fn prune_older_than(&self, max_age: chrono::Duration) -> ForgeResult<Vec<CacheEntry>> {
        let cutoff = Utc::now() - max_age;
        let mut removed = Vec::new();

        for entry in self.entries()? {
            if entry.created_at >= cutoff {
                continue;
            }
            if self.lock_path(entry.fingerprint).exists() {
                continue;
            }
            fs::remove_file(&entry.artifact_path).map_err(|e| {
                ForgeError::io(format!("pruning {}", entry.artifact_path.display()), e)
            })?;
            removed.push(entry);
        }

        Ok(removed)
    }

    /// Remove every committed entry; returns the count removed
    pub fn clear(&self) -> ForgeResult<usize> {
        let entries = self.entries()?;
        for entry in &entries {
            fs::remove_file(&entry.artifact_path).map_err(|e| {
                ForgeError::io(format!("removing {}", entry.artifact_path.display()), e)
            })?;
        }
        Ok(entries.len())
    }
}
