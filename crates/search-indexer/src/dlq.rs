//! Dead letter sinks
//!
//! - `DeadLetterQueue`: bounded in-process queue, oldest entry dropped when full
//! - `NatsDeadLetterSink`: republishes to `{prefix}.{kind}` on a dedicated stream

use async_nats::jetstream::{self, Context};
use async_nats::HeaderMap;
use async_trait::async_trait;
use search_sync_core::prelude::*;
use search_sync_core::{ConsumerConfig, DeadLetterConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::consumer::connect;

pub const HEADER_REASON: &str = "x-dead-letter-reason";
pub const HEADER_ATTEMPTS: &str = "x-delivery-attempts";
pub const HEADER_MSG_ID: &str = "x-original-msg-id";

// ============================================================================
// In-memory queue
// ============================================================================

/// In-memory dead letter queue
pub struct DeadLetterQueue {
    max_size: usize,
    entries: RwLock<VecDeque<DeadLetter>>,
    dropped: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            entries: RwLock::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn drain(&self) -> Vec<DeadLetter> {
        self.entries.write().await.drain(..).collect()
    }

    pub async fn peek(&self, count: usize) -> Vec<DeadLetter> {
        self.entries.read().await.iter().take(count).cloned().collect()
    }

    /// Entries evicted because the queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterQueue {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<()> {
        let mut entries = self.entries.write().await;

        if entries.len() >= self.max_size {
            warn!(max_size = self.max_size, "DLQ full, dropping oldest entry");
            entries.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }

        entries.push_back(letter);
        Ok(())
    }

    async fn len(&self) -> Option<usize> {
        Some(self.entries.read().await.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// NATS JetStream
// ============================================================================

/// NATS dead letter sink configuration
#[derive(Debug, Clone)]
pub struct NatsDeadLetterSinkConfig {
    pub url: String,
    pub credentials_path: Option<String>,
    pub connection_name: String,
    pub stream: String,
    pub subject_prefix: String,
}

impl From<&ConsumerConfig> for NatsDeadLetterSinkConfig {
    fn from(config: &ConsumerConfig) -> Self {
        let DeadLetterConfig {
            stream,
            subject_prefix,
            ..
        } = &config.dead_letter;
        Self {
            url: config.nats.url.clone(),
            credentials_path: config.nats.credentials_path.clone(),
            connection_name: format!("{}-dlq", config.nats.connection_name),
            stream: stream.clone(),
            subject_prefix: subject_prefix.clone(),
        }
    }
}

/// Publishes dead letters to JetStream
pub struct NatsDeadLetterSink {
    config: NatsDeadLetterSinkConfig,
    client: RwLock<Option<async_nats::Client>>,
    jetstream: RwLock<Option<Context>>,
    running: AtomicBool,
    published: AtomicU64,
}

impl NatsDeadLetterSink {
    pub fn new(config: NatsDeadLetterSinkConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            jetstream: RwLock::new(None),
            running: AtomicBool::new(false),
            published: AtomicU64::new(0),
        }
    }

    /// Subject a dead letter is published on
    pub fn subject_for(&self, letter: &DeadLetter) -> String {
        letter.envelope.subject(&self.config.subject_prefix)
    }

    async fn ensure_stream(&self, js: &Context) -> Result<()> {
        if js.get_stream(&self.config.stream).await.is_ok() {
            debug!(stream = %self.config.stream, "Dead letter stream exists");
            return Ok(());
        }

        let config = jetstream::stream::Config {
            name: self.config.stream.clone(),
            subjects: vec![format!("{}.>", self.config.subject_prefix)],
            retention: jetstream::stream::RetentionPolicy::Limits,
            storage: jetstream::stream::StorageType::File,
            ..Default::default()
        };

        js.create_stream(config)
            .await
            .map_err(|e| SyncError::nats_with_source("Failed to create dead letter stream", e))?;

        info!(stream = %self.config.stream, "Created dead letter stream");
        Ok(())
    }
}

fn dead_letter_headers(letter: &DeadLetter) -> HeaderMap {
    let mut headers = HeaderMap::new();
    // header values cannot carry line breaks
    let reason: String = letter
        .reason
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();
    headers.insert(HEADER_REASON, reason.as_str());
    headers.insert(HEADER_ATTEMPTS, letter.attempts.to_string().as_str());
    headers.insert(HEADER_MSG_ID, letter.envelope.metadata.msg_id.to_string().as_str());
    headers
}

#[async_trait]
impl Lifecycle for NatsDeadLetterSink {
    async fn start(&self) -> Result<()> {
        let client = connect(
            &self.config.url,
            &self.config.connection_name,
            self.config.credentials_path.as_deref(),
        )
        .await?;

        let js = jetstream::new(client.clone());
        self.ensure_stream(&js).await?;

        *self.client.write().await = Some(client);
        *self.jetstream.write().await = Some(js);
        self.running.store(true, Ordering::SeqCst);

        info!(subject_prefix = %self.config.subject_prefix, "NATS dead letter sink started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(client) = self.client.read().await.as_ref() {
            client
                .flush()
                .await
                .map_err(|e| SyncError::nats_with_source("Failed to flush", e))?;
        }

        *self.jetstream.write().await = None;
        *self.client.write().await = None;

        info!(
            published = self.published.load(Ordering::Relaxed),
            "NATS dead letter sink stopped"
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for NatsDeadLetterSink {
    async fn health_check(&self) -> Result<()> {
        let client = self.client.read().await;
        match client.as_ref() {
            Some(c) if c.connection_state() == async_nats::connection::State::Connected => Ok(()),
            Some(_) => Err(SyncError::nats("Not connected")),
            None => Err(SyncError::nats("Client not initialized")),
        }
    }

    fn component_name(&self) -> &'static str {
        "nats_dead_letter_sink"
    }
}

#[async_trait]
impl DeadLetterSink for NatsDeadLetterSink {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<()> {
        let js = self.jetstream.read().await;
        let js = js
            .as_ref()
            .ok_or_else(|| SyncError::nats("JetStream not initialized"))?;

        let subject = self.subject_for(&letter);
        let payload = letter.envelope.to_bytes()?;

        let ack = js
            .publish_with_headers(subject.clone(), dead_letter_headers(&letter), payload)
            .await
            .map_err(|e| SyncError::nats_with_source("Dead letter publish failed", e))?;
        ack.await
            .map_err(|e| SyncError::nats_with_source("Dead letter ack failed", e))?;

        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(subject, attempts = letter.attempts, "Published dead letter");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "nats"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn letter(id: &str) -> DeadLetter {
        let envelope = Envelope::wrap(ChangeNotification::created(Item::new(id, 1, json!({}))), "test");
        DeadLetter::new(envelope, "handler failed\nstack", 6)
    }

    #[tokio::test]
    async fn test_queue_drops_oldest_when_full() {
        let queue = DeadLetterQueue::new(2);
        for id in ["a", "b", "c"] {
            queue.dead_letter(letter(id)).await.unwrap();
        }

        assert_eq!(queue.len().await, Some(2));
        assert_eq!(queue.dropped_count(), 1);
        let ids: Vec<_> = queue.peek(2).await.iter().map(|l| l.envelope.item_id().to_string()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        assert_eq!(queue.drain().await.len(), 2);
        assert!(queue.is_empty().await);
    }

    #[test]
    fn test_headers_carry_reason_and_attempts() {
        let headers = dead_letter_headers(&letter("a"));
        assert_eq!(headers.get(HEADER_REASON).map(|v| v.as_str()), Some("handler failed stack"));
        assert_eq!(headers.get(HEADER_ATTEMPTS).map(|v| v.as_str()), Some("6"));
    }

    #[test]
    fn test_subject_uses_dead_letter_prefix() {
        let sink = NatsDeadLetterSink::new(NatsDeadLetterSinkConfig::from(&ConsumerConfig::default()));
        assert_eq!(sink.subject_for(&letter("a")), "search.dead_letter.items.created");
        assert_eq!(sink.config.connection_name, "search-sync-dlq");
    }
}
