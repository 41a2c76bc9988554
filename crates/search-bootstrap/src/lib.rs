//! # Search Bootstrap
//!
//! Populates the search index from the upstream service at startup.
//!
//! ## Components
//!
//! - `HttpUpstream`: one HTTP call per fetch, failures classified by status
//! - `UpstreamClient`: retries any upstream failure at a flat interval until
//!   success or shutdown
//! - `BootstrapSynchronizer`: loads the index once, only when it is empty
//!
//! ## Usage
//!
//! ```rust,ignore
//! let health = SyncHealth::new();
//! let upstream = UpstreamClient::from_config(&config.upstream, health.clone())?;
//! let bootstrap = BootstrapSynchronizer::new(store, upstream, health);
//!
//! bootstrap.run_guarded(&cancel).await;
//! ```

pub mod upstream;

pub use upstream::*;

use chrono::Utc;
use search_sync_core::prelude::*;
use search_sync_core::{BootstrapMetrics, BootstrapMode};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What a bootstrap run did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The index was empty and has been loaded with this many items
    Loaded(usize),
    /// The index already had data; nothing was fetched
    Skipped,
    /// The index already had data; this many newer items were applied
    CaughtUp(usize),
}

impl BootstrapOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loaded(_) => "loaded",
            Self::Skipped => "skipped",
            Self::CaughtUp(_) => "caught_up",
        }
    }
}

/// One-shot startup synchronizer
pub struct BootstrapSynchronizer {
    store: Arc<dyn IndexStore>,
    upstream: UpstreamClient,
    mode: BootstrapMode,
    health: SyncHealth,
    metrics: BootstrapMetrics,
    running: AtomicBool,
    loaded: AtomicU64,
}

impl BootstrapSynchronizer {
    /// Create new synchronizer
    pub fn new(store: Arc<dyn IndexStore>, upstream: UpstreamClient, health: SyncHealth) -> Self {
        Self {
            store,
            upstream,
            mode: BootstrapMode::default(),
            health,
            metrics: BootstrapMetrics::new("bootstrap"),
            running: AtomicBool::new(false),
            loaded: AtomicU64::new(0),
        }
    }

    /// Builder: what to do when the index already has data
    pub fn with_mode(mut self, mode: BootstrapMode) -> Self {
        self.mode = mode;
        self
    }

    /// Run the bootstrap once
    ///
    /// Returns `Cancelled` if shutdown is requested while waiting on the
    /// upstream. The health signal always ends in a terminal state.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<BootstrapOutcome> {
        let start = Instant::now();
        self.running.store(true, Ordering::SeqCst);

        let result = self.sync(cancel).await;

        self.running.store(false, Ordering::SeqCst);
        let elapsed = start.elapsed();

        match &result {
            Ok(outcome) => {
                self.metrics.record_run(outcome.as_str(), elapsed);
                info!(
                    store = self.store.name(),
                    outcome = outcome.as_str(),
                    loaded = self.loaded.load(Ordering::Relaxed),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Bootstrap finished"
                );
            }
            Err(e) if e.is_cancelled() => {
                self.metrics.record_run("cancelled", elapsed);
                self.health.set(BootstrapState::Cancelled);
                info!(store = self.store.name(), "Bootstrap cancelled by shutdown");
            }
            Err(e) => {
                self.metrics.record_run("failed", elapsed);
                self.health.set(BootstrapState::Failed {
                    error: e.to_string(),
                    at: Utc::now(),
                });
            }
        }

        result
    }

    /// Run the bootstrap, logging instead of returning any failure
    ///
    /// A failed bootstrap leaves the index as it was; the event consumer and
    /// the rest of the service keep running.
    pub async fn run_guarded(&self, cancel: &CancellationToken) -> Option<BootstrapOutcome> {
        match self.run(cancel).await {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                error!(error = %e, store = self.store.name(), "Bootstrap failed, index may be stale");
                None
            }
        }
    }

    async fn sync(&self, cancel: &CancellationToken) -> Result<BootstrapOutcome> {
        if !self.store.is_empty().await? {
            return match self.mode {
                BootstrapMode::EmptyOnly => self.skip().await,
                BootstrapMode::CatchUp => self.catch_up(cancel).await,
            };
        }

        info!(store = self.store.name(), "Index is empty, loading from upstream");
        self.health.set(BootstrapState::Fetching { attempts: 0 });
        let items = self.upstream.fetch_all(cancel).await?;

        if cancel.is_cancelled() {
            return Err(SyncError::cancelled("bootstrap load"));
        }

        self.health.set(BootstrapState::Loading { items: items.len() });
        let fetched = items.len();
        let loaded = self.store.bulk_replace(items).await?;

        if loaded < fetched {
            warn!(fetched, loaded, "Upstream returned duplicate ids, kept highest versions");
        }

        self.record_loaded(loaded);
        self.health.set(BootstrapState::Ready {
            items: loaded,
            skipped: false,
            at: Utc::now(),
        });
        Ok(BootstrapOutcome::Loaded(loaded))
    }

    async fn skip(&self) -> Result<BootstrapOutcome> {
        let existing = self.store.count().await?;
        info!(
            store = self.store.name(),
            existing, "Index already populated, skipping bootstrap"
        );
        self.health.set(BootstrapState::Ready {
            items: existing,
            skipped: true,
            at: Utc::now(),
        });
        Ok(BootstrapOutcome::Skipped)
    }

    async fn catch_up(&self, cancel: &CancellationToken) -> Result<BootstrapOutcome> {
        let since = self.store.latest_version().await?.unwrap_or(0);
        info!(store = self.store.name(), since, "Index populated, catching up from upstream");

        self.health.set(BootstrapState::Fetching { attempts: 0 });
        let items = self.upstream.fetch_since(cancel, since).await?;
        self.health.set(BootstrapState::Loading { items: items.len() });

        let mut applied = 0;
        for item in items {
            if cancel.is_cancelled() {
                return Err(SyncError::cancelled("bootstrap catch-up"));
            }
            match self.store.upsert(item).await? {
                UpsertOutcome::Inserted | UpsertOutcome::Replaced => applied += 1,
                UpsertOutcome::Stale => {}
            }
        }

        self.record_loaded(applied);
        self.health.set(BootstrapState::Ready {
            items: self.store.count().await?,
            skipped: false,
            at: Utc::now(),
        });
        Ok(BootstrapOutcome::CaughtUp(applied))
    }

    fn record_loaded(&self, count: usize) {
        self.loaded.fetch_add(count as u64, Ordering::Relaxed);
        self.metrics.record_items_loaded(count as u64);
    }

    /// Check if a run is in progress
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Items written by completed runs
    pub fn loaded_count(&self) -> u64 {
        self.loaded.load(Ordering::Relaxed)
    }

    pub fn health(&self) -> &SyncHealth {
        &self.health
    }
}
