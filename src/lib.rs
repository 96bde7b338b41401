//! forgecache - content-addressed export cache
//!
//! Fingerprints canonical geometry representations, guarantees the
//! expensive solid-model conversion runs at most once per unique
//! fingerprint, and resolves every requester's output path to the
//! cached artifact via the cheapest available link.

pub mod batch;
pub mod canon;
pub mod cli;
pub mod config;
pub mod convert;
pub mod error;
pub mod fingerprint;
pub mod materialize;
pub mod orchestrator;
pub mod registry;

pub use error::{ForgeError, ForgeResult};
