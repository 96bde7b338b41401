//! Batch request and report types
//!
//! A batch is N conversion requests in, N outcomes out, in input order.
//! The report is serde-serializable so the surrounding pipeline can
//! consume it as JSON.

use crate::error::ForgeError;
use crate::materialize::LinkStrategy;
use serde::Serialize;
use std::path::PathBuf;

/// One requested conversion: canonical bytes plus a desired output path
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    /// Caller-supplied identifier, echoed back in the report
    pub request_id: String,
    /// Canonical geometry representation, consumed read-only
    pub representation: Vec<u8>,
    /// Where the caller wants the artifact visible
    pub output_path: PathBuf,
}

impl ConversionRequest {
    pub fn new(
        request_id: impl Into<String>,
        representation: Vec<u8>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            representation,
            output_path: output_path.into(),
        }
    }
}

/// Successful resolution of one request
#[derive(Debug, Clone, Serialize)]
pub struct ConversionResult {
    pub request_id: String,
    /// Fingerprint hex of the canonical representation
    pub fingerprint: String,
    /// Path the caller can read the artifact at
    pub resolved_path: PathBuf,
    /// True when the registry already held the entry at lookup time
    pub cache_hit: bool,
    /// How the resolved path was connected to the cache
    pub link_strategy: LinkStrategy,
}

/// Per-request outcome, tagged for machine consumption
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RequestOutcome {
    Converted(ConversionResult),
    Failed {
        request_id: String,
        /// Machine label (`non_zero_exit`, `reservation_timeout`, ...)
        kind: String,
        error: String,
        retryable: bool,
    },
}

impl RequestOutcome {
    pub fn failed(request_id: impl Into<String>, error: &ForgeError) -> Self {
        Self::Failed {
            request_id: request_id.into(),
            kind: error.kind().to_string(),
            error: error.to_string(),
            retryable: error.is_retryable(),
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::Converted(result) => &result.request_id,
            Self::Failed { request_id, .. } => request_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Converted(_))
    }
}

/// Ordered outcomes for a whole batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub results: Vec<RequestOutcome>,
}

impl BatchReport {
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.is_success()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }

    /// Distinct conversions actually performed (misses that committed)
    pub fn conversions(&self) -> usize {
        let mut seen = std::collections::HashSet::new();
        self.results
            .iter()
            .filter_map(|r| match r {
                RequestOutcome::Converted(result) if !result.cache_hit => {
                    Some(result.fingerprint.clone())
                }
                _ => None,
            })
            .filter(|fp| seen.insert(fp.clone()))
            .count()
    }
}
