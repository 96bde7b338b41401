//! Error types for forgecache
//!
//! All modules use `ForgeResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for forgecache operations
pub type ForgeResult<T> = Result<T, ForgeError>;

/// All errors that can occur in forgecache
#[derive(Error, Debug)]
pub enum ForgeError {
    // Input errors
    #[error("Empty canonical representation")]
    EmptyRepresentation,

    #[error("Invalid batch manifest {path}: {reason}")]
    BatchManifest { path: PathBuf, reason: String },

    // Reservation errors
    #[error("Timed out after {waited_secs}s waiting for reservation on fingerprint {fingerprint}")]
    ReservationTimeout {
        fingerprint: String,
        waited_secs: u64,
    },

    // Conversion errors
    #[error("Failed to launch geometry kernel: {command}")]
    KernelLaunch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Geometry kernel failed ({command}, exit code {code}): {stderr}")]
    KernelExit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Geometry kernel timed out after {timeout_secs}s: {command}")]
    KernelTimeout { command: String, timeout_secs: u64 },

    #[error("Kernel produced malformed artifact at {path}: {reason}")]
    MalformedArtifact { path: PathBuf, reason: String },

    // Materialization errors
    #[error("All link strategies failed for {target}: {detail}")]
    LinkExhausted { target: PathBuf, detail: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl ForgeError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a kernel launch error
    pub fn kernel_launch(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::KernelLaunch {
            command: command.into(),
            source,
        }
    }

    /// Check if error is retryable by the caller
    ///
    /// Only reservation timeouts qualify: the holder will eventually commit
    /// or abort, so a later attempt can succeed. Conversion failures are
    /// deterministic for a given representation and are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ReservationTimeout { .. })
    }

    /// Short machine-readable label for batch reports
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyRepresentation => "input",
            Self::BatchManifest { .. } => "input",
            Self::ReservationTimeout { .. } => "reservation_timeout",
            Self::KernelLaunch { .. } => "process_launch_failure",
            Self::KernelExit { .. } => "non_zero_exit",
            Self::KernelTimeout { .. } => "conversion_timeout",
            Self::MalformedArtifact { .. } => "malformed_output",
            Self::LinkExhausted { .. } => "link",
            Self::ConfigInvalid { .. } | Self::ConfigDirCreate { .. } => "config",
            Self::Io { .. } | Self::PathNotFound(_) => "io",
            Self::Json(_) | Self::TomlParse(_) | Self::TomlSerialize(_) => "serialization",
            Self::Internal(_) | Self::User(_) => "internal",
        }
    }
}
