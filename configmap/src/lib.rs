//! Distribution of toolchain configs from a storage bucket.
//!
//! [`ConfigMapLoader::load`] reconciles the in-memory [`ConfigStore`] with the
//! per-runtime seq objects of the bucket, reloading only the runtimes that
//! changed. A [`ConfigMapWatcher`] tells the [`ConfigServer`] when to load.
pub mod auth;
pub mod config;
pub mod fetcher;
pub mod gcs;
pub mod loader;
pub mod metrics_defs;
pub mod pubsub;
pub mod serve;
pub mod source;
pub mod storage;
pub mod store;
pub mod types;
pub mod watcher;

#[cfg(test)]
mod testutils;

pub use config::Config;
pub use fetcher::{ConfigLoader, FetchError};
pub use loader::{ConfigMapLoader, LoadError, LoadOutcome};
pub use serve::ConfigServer;
pub use source::{ConfigMapBucket, ConfigMapError, ConfigMapSource};
pub use store::ConfigStore;
pub use types::{ConfigResp, ToolchainConfig};
pub use watcher::{ConfigMapWatcher, WatchError};
