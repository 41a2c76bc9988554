//! Strategy Pattern Traits for the search index synchronizer
//!
//! Each trait marks a seam where the engine talks to an external collaborator,
//! so the synchronization logic can run against fakes in tests.
//!
//! ## Strategy Hierarchy
//!
//! ```text
//! Lifecycle (start/stop)
//!     │
//!     ├── MessageSource (change notifications, explicit ack)
//!     │       └── NatsJetStreamSource, ChannelSource
//!     │
//!     └── DeadLetterSink (terminal destination for exhausted messages)
//!             └── NatsDeadLetterSink, DeadLetterQueue
//!
//! UpstreamSource (one attempt at reading the source of truth)
//!     └── HttpUpstream, MockUpstream
//!
//! IndexStore (see `store`)
//!     └── MemoryIndexStore, ElasticIndexStore
//! ```

use crate::error::Result;
use crate::message::{Envelope, Item};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

/// Type alias for boxed async streams of deliveries
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

// ============================================================================
// Lifecycle Management
// ============================================================================

/// Lifecycle management for components
///
/// Provides graceful startup and shutdown semantics.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Start the component
    ///
    /// Called once before any operations. Should establish connections,
    /// initialize state, and prepare for operation.
    async fn start(&self) -> Result<()>;

    /// Stop the component gracefully
    ///
    /// Called during shutdown. May be called even if start() failed.
    async fn stop(&self) -> Result<()>;

    /// Check if the component is running
    fn is_running(&self) -> bool;
}

/// Health check capability
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Returns Ok(()) if healthy, Err with details if not.
    async fn health_check(&self) -> Result<()>;

    /// Get component name for health reporting
    fn component_name(&self) -> &'static str;
}

// ============================================================================
// Upstream Strategy
// ============================================================================

/// A single attempt at reading the authoritative item set
///
/// Implementations return classified `SyncError::Upstream` errors and never
/// retry themselves; retrying belongs to `UpstreamClient`.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Fetch every item
    async fn fetch_all(&self) -> Result<Vec<Item>>;

    /// Fetch items whose version is greater than `version`
    async fn fetch_since(&self, version: u64) -> Result<Vec<Item>>;

    /// Endpoint description for logs
    fn describe(&self) -> String;
}

// ============================================================================
// Message Source Strategy
// ============================================================================

/// Broker-side acknowledgement for one delivered message
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// Processing succeeded; remove the message from the unacked set
    async fn ack(&self) -> Result<()>;

    /// Processing failed; ask for redelivery, optionally after `delay`
    async fn nack(&self, delay: Option<Duration>) -> Result<()>;

    /// Still working on it; extend the ack deadline
    async fn in_progress(&self) -> Result<()>;

    /// Never redeliver this message
    async fn term(&self) -> Result<()>;
}

/// One delivered notification plus its acknowledgement handle
pub struct Delivery {
    pub envelope: Envelope,
    /// Times the broker has delivered this message, starting at 1
    pub delivered: u32,
    pub ack: Box<dyn AckHandle>,
}

impl Delivery {
    pub fn new(envelope: Envelope, delivered: u32, ack: Box<dyn AckHandle>) -> Self {
        Self {
            envelope,
            delivered,
            ack,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("msg_id", &self.envelope.metadata.msg_id)
            .field("item_id", &self.envelope.item_id())
            .field("delivered", &self.delivered)
            .finish()
    }
}

/// Message source strategy - consumes change notifications
///
/// Implementations:
/// - `NatsJetStreamSource`: durable JetStream pull consumer
/// - `ChannelSource`: in-process channel (for testing)
#[async_trait]
pub trait MessageSource: Lifecycle + HealthCheck {
    /// Stream deliveries from the transport
    ///
    /// The stream ends when the source is stopped or the transport closes.
    async fn deliveries(&self) -> Result<DeliveryStream>;
}

// ============================================================================
// Dead Letter Strategy
// ============================================================================

/// A message that exhausted its retry budget
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub reason: String,
    /// Handler invocations made before giving up
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(envelope: Envelope, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            envelope,
            reason: reason.into(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Terminal destination for messages that need operator attention
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<()>;

    /// Current size, when the sink can tell
    async fn len(&self) -> Option<usize> {
        None
    }

    fn name(&self) -> &'static str;
}
