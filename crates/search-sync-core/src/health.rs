//! Bootstrap health signal
//!
//! The bootstrap publishes its progress here instead of only logging it, so
//! readiness probes can keep the service out of rotation until the index has
//! been populated (or explicitly skipped).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Bootstrap progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BootstrapState {
    NotStarted,
    /// Waiting on the upstream service
    Fetching { attempts: u32 },
    /// Writing the fetched set into the index
    Loading { items: usize },
    /// Index populated, caught up, or skipped because it was not empty
    Ready {
        items: usize,
        skipped: bool,
        at: DateTime<Utc>,
    },
    /// Bootstrap hit an unexpected error; the index may be stale
    Failed { error: String, at: DateTime<Utc> },
    /// Shutdown was requested before the bootstrap finished
    Cancelled,
}

impl BootstrapState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Shared, cloneable health handle
#[derive(Clone)]
pub struct SyncHealth {
    state: Arc<watch::Sender<BootstrapState>>,
    stalled: Arc<AtomicBool>,
}

impl SyncHealth {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BootstrapState::NotStarted);
        Self {
            state: Arc::new(tx),
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set(&self, state: BootstrapState) {
        self.state.send_replace(state);
    }

    /// Record the latest fetch attempt count while fetching
    pub fn record_fetch_attempt(&self, attempts: u32) {
        self.state.send_if_modified(|state| match state {
            BootstrapState::Fetching { attempts: current } if *current != attempts => {
                *current = attempts;
                true
            }
            _ => false,
        });
    }

    pub fn current(&self) -> BootstrapState {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_ready()
    }

    /// Mark that the upstream fetch has been waiting longer than allowed
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }
}

impl Default for SyncHealth {
    fn default() -> Self {
        Self::new()
    }
}
