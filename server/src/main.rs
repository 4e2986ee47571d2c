#![warn(clippy::nursery, clippy::pedantic)]

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::task;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::backend::{Backend, MemoryBackend, RocksBackend};
use crate::config::{BackendKind, Opts};
use crate::routes::{router, AppState};
use crate::short_code::{ShortCodeGenerator, SHORT_CODE_SIZE};
use crate::store::PasteStore;
use crate::time::SystemClock;

mod backend;
mod config;
mod error;
mod expiry;
mod paste;
mod routes;
mod short_code;
mod store;
mod time;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();

    let backend: Arc<dyn Backend> = match opts.backend {
        BackendKind::Memory => {
            warn!("Using in-memory storage; pastes will not survive a restart");
            Arc::new(MemoryBackend::new())
        }
        BackendKind::Rocksdb => Arc::new(
            RocksBackend::open(&opts.db_path)
                .with_context(|| format!("Failed to open database at {}", opts.db_path.display()))?,
        ),
    };

    let store = PasteStore::new(
        backend,
        Arc::new(ShortCodeGenerator::<SHORT_CODE_SIZE>::from_entropy()),
    )
    .with_timeout(opts.storage_timeout());

    let stop_signal = Arc::new(AtomicBool::new(false));
    task::spawn(cleanup(
        Arc::clone(&stop_signal),
        store.clone(),
        opts.cleanup_interval(),
    ));

    if opts.test_mode {
        warn!("Test mode is on; the x-test-now-ms header overrides the clock");
    }

    let state = AppState::new(store, Arc::new(SystemClock), opts.public_url, opts.test_mode);

    let signals = Signals::new(&[SIGTERM, SIGINT]).context("Failed to register signal handlers")?;
    let signals_handle = signals.handle();

    info!(addr = %opts.bind, "Listening");
    axum::Server::bind(&opts.bind)
        .serve(router(state).into_make_service())
        .with_graceful_shutdown(shutdown(signals))
        .await?;

    signals_handle.close();
    stop_signal.store(true, Ordering::Release);
    Ok(())
}

async fn shutdown(mut signals: Signals) {
    if let Some(signal) = signals.next().await {
        info!(signal, "Shutting down");
    }
}

/// Periodic clean-up task that purges pastes the backend has let lapse.
async fn cleanup(stop_signal: Arc<AtomicBool>, store: PasteStore, interval: Duration) {
    while !stop_signal.load(Ordering::Acquire) {
        tokio::time::sleep(interval).await;
        match store.purge_expired().await {
            Ok(0) => (),
            Ok(removed) => info!(removed, "Purged expired pastes"),
            Err(e) => warn!("Failed to cleanup db: {}", e),
        }
    }
}
