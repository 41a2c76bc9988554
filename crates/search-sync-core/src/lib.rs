//! # Search Sync Core
//!
//! Core types, strategy traits, and utilities for the search index synchronizer.
//!
//! The synchronizer keeps a local read-model of upstream items converged with
//! the upstream service in two ways:
//! - a one-time bootstrap that bulk-loads the index when it is empty
//! - an event consumer that applies create/update/delete notifications
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  fetch_all   ┌──────────────┐  bulk_replace
//! │UpstreamSource│─────────────►│  Bootstrap   │──────────────┐
//! └──────────────┘              └──────────────┘              ▼
//!                                                      ┌─────────────┐
//! ┌──────────────┐  Delivery    ┌──────────────┐ upsert│ IndexStore  │
//! │MessageSource │─────────────►│EventConsumer │──────►│             │
//! └──────────────┘              └──────┬───────┘ delete└─────────────┘
//!                                      │ exhausted
//!                               ┌──────▼───────┐
//!                               │DeadLetterSink│
//!                               └──────────────┘
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod message;
pub mod metrics;
pub mod retry;
pub mod store;
pub mod strategy;

pub use self::config::*;
pub use error::*;
pub use health::*;
pub use message::*;
pub use self::metrics::*;
pub use retry::*;
pub use store::*;
pub use strategy::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::SyncConfig;
    pub use crate::error::{Result, SyncError, UpstreamFailure};
    pub use crate::health::{BootstrapState, SyncHealth};
    pub use crate::message::{ChangeKind, ChangeNotification, Envelope, Item, Metadata};
    pub use crate::retry::{RetryAttempt, RetryPolicy};
    pub use crate::store::{DeleteOutcome, IndexStore, UpsertOutcome};
    pub use crate::strategy::{
        AckHandle, DeadLetter, DeadLetterSink, Delivery, HealthCheck, Lifecycle, MessageSource,
        UpstreamSource,
    };
}
