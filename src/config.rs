//! Service configuration from the environment.
//!
//! The same variables the deployment has always used (`LOCAL_TESTING`,
//! `LOAD_ONLY`, `HARDCOVER_API_TOKEN`) plus overridable paths for the feed
//! directory and the database file.

use std::path::PathBuf;

/// Runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory holding the three gzipped CSV feeds.
    pub data_dir: PathBuf,
    /// Path of the redb database file.
    pub db_path: PathBuf,
    /// Read feeds locally and log verbosely.
    pub local_testing: bool,
    /// Ingest then exit (for prebaking the store).
    pub load_only: bool,
    /// Bearer token for the bookshelf lookup, when configured.
    pub hardcover_token: Option<String>,
}

impl ServiceConfig {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Self {
        let data_dir = std::env::var_os("DEEPSTACKS_DATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let db_path = std::env::var_os("DEEPSTACKS_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("deepstacks.redb"));
        Self {
            data_dir,
            db_path,
            local_testing: env_flag("LOCAL_TESTING"),
            load_only: env_flag("LOAD_ONLY"),
            hardcover_token: std::env::var("HARDCOVER_API_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "true")
}
