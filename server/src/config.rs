use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use ephemeral_paste_common::Url;

use crate::time::{DEFAULT_CLEANUP_INTERVAL_SECS, DEFAULT_STORAGE_TIMEOUT_MS};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Keep pastes in process memory. Everything is lost on restart.
    Memory,
    /// Keep pastes in an embedded RocksDB database at `--db-path`.
    Rocksdb,
}

/// Ephemeral paste server.
#[derive(Parser, Debug)]
#[clap(version, about)]
pub struct Opts {
    /// Address to listen on.
    #[clap(long, env = "PASTE_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,
    /// Base url used when building paste links. Derived from the request's
    /// `Host` and `X-Forwarded-Proto` headers when unset.
    #[clap(long, env = "PASTE_PUBLIC_URL")]
    pub public_url: Option<Url>,
    #[clap(long, env = "PASTE_BACKEND", value_enum, default_value = "memory")]
    pub backend: BackendKind,
    #[clap(long, env = "PASTE_DB_PATH", default_value = "database")]
    pub db_path: PathBuf,
    /// Upper bound on any single storage call, in milliseconds.
    #[clap(long, env = "PASTE_STORAGE_TIMEOUT_MS", default_value_t = DEFAULT_STORAGE_TIMEOUT_MS)]
    pub storage_timeout_ms: u64,
    /// How often lapsed pastes are physically purged, in seconds.
    #[clap(long, env = "PASTE_CLEANUP_INTERVAL_SECS", default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS)]
    pub cleanup_interval_secs: u64,
    /// Honor the `x-test-now-ms` header. Never enable this in production.
    #[clap(long, env = "PASTE_TEST_MODE")]
    pub test_mode: bool,
}

impl Opts {
    pub const fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}
