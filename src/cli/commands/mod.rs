//! CLI command implementations

pub mod cache;
pub mod config;
pub mod export;
pub mod init;

pub use cache::execute as cache;
pub use config::execute as config;
pub use export::execute as export;
pub use init::execute as init;
