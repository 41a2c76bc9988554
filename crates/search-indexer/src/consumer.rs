//! Message sources for the event consumer
//!
//! - `NatsJetStreamSource`: durable JetStream pull consumer with explicit acks
//! - `ChannelSource`: in-process channel that records every ack decision

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind, Context};
use async_trait::async_trait;
use futures::StreamExt;
use search_sync_core::prelude::*;
use search_sync_core::{ConsumerConfig, ConsumerMetrics, DeliveryStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// NATS JetStream
// ============================================================================

/// NATS JetStream source configuration
#[derive(Debug, Clone)]
pub struct NatsJetStreamSourceConfig {
    /// NATS server URL
    pub url: String,
    /// Optional credentials file
    pub credentials_path: Option<String>,
    /// Stream name
    pub stream: String,
    /// Durable consumer name
    pub consumer: String,
    /// Subject prefix of change notifications
    pub subject_prefix: String,
    /// Max pending acknowledgements
    pub max_ack_pending: u64,
    /// Ack wait duration
    pub ack_wait: Duration,
    /// Messages per pull request
    pub batch_size: usize,
    /// Connection name
    pub connection_name: String,
}

impl Default for NatsJetStreamSourceConfig {
    fn default() -> Self {
        Self::from(&ConsumerConfig::default())
    }
}

impl From<&ConsumerConfig> for NatsJetStreamSourceConfig {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            url: config.nats.url.clone(),
            credentials_path: config.nats.credentials_path.clone(),
            stream: config.jetstream.stream.clone(),
            consumer: config.jetstream.consumer.clone(),
            subject_prefix: config.jetstream.subject_prefix.clone(),
            max_ack_pending: config.jetstream.max_ack_pending,
            ack_wait: config.jetstream.ack_wait,
            batch_size: config.jetstream.fetch_batch,
            connection_name: config.nats.connection_name.clone(),
        }
    }
}

/// Open a NATS connection with optional credentials
pub(crate) async fn connect(
    url: &str,
    connection_name: &str,
    credentials_path: Option<&str>,
) -> Result<async_nats::Client> {
    let options = match credentials_path {
        Some(path) => async_nats::ConnectOptions::with_credentials_file(path)
            .await
            .map_err(|e| SyncError::nats_with_source("Failed to read credentials", e))?,
        None => async_nats::ConnectOptions::new(),
    };

    options
        .name(connection_name)
        .connect(url)
        .await
        .map_err(|e| SyncError::nats_with_source("Failed to connect", e))
}

/// Ack handle for one JetStream message
struct JetStreamAck {
    message: jetstream::Message,
}

impl JetStreamAck {
    async fn send(&self, kind: AckKind, what: &str) -> Result<()> {
        self.message
            .ack_with(kind)
            .await
            .map_err(|e| SyncError::nats(format!("{} failed: {}", what, e)))
    }
}

#[async_trait]
impl AckHandle for JetStreamAck {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| SyncError::nats(format!("Ack failed: {}", e)))
    }

    async fn nack(&self, delay: Option<Duration>) -> Result<()> {
        self.send(AckKind::Nak(delay), "Nak").await
    }

    async fn in_progress(&self) -> Result<()> {
        self.send(AckKind::Progress, "Progress").await
    }

    async fn term(&self) -> Result<()> {
        self.send(AckKind::Term, "Term").await
    }
}

/// NATS JetStream message source
pub struct NatsJetStreamSource {
    config: NatsJetStreamSourceConfig,
    client: RwLock<Option<async_nats::Client>>,
    consumer: RwLock<Option<PullConsumer>>,
    metrics: ConsumerMetrics,
    running: Arc<AtomicBool>,
}

impl NatsJetStreamSource {
    /// Create new source
    pub fn new(config: NatsJetStreamSourceConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            consumer: RwLock::new(None),
            metrics: ConsumerMetrics::new("nats_jetstream_source"),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn filter_subject(&self) -> String {
        format!("{}.>", self.config.subject_prefix)
    }

    /// Get or create the stream that captures change notifications
    async fn ensure_stream(&self, js: &Context) -> Result<jetstream::stream::Stream> {
        if let Ok(stream) = js.get_stream(&self.config.stream).await {
            debug!(stream = %self.config.stream, "Stream exists");
            return Ok(stream);
        }

        let config = jetstream::stream::Config {
            name: self.config.stream.clone(),
            subjects: vec![self.filter_subject()],
            retention: jetstream::stream::RetentionPolicy::Limits,
            storage: jetstream::stream::StorageType::File,
            ..Default::default()
        };

        let stream = js
            .create_stream(config)
            .await
            .map_err(|e| SyncError::nats_with_source("Failed to create stream", e))?;

        info!(stream = %self.config.stream, "Created stream");
        Ok(stream)
    }

    /// Get or create the durable consumer
    async fn ensure_consumer(&self, js: &Context) -> Result<PullConsumer> {
        let stream = self.ensure_stream(js).await?;

        match stream.get_consumer(&self.config.consumer).await {
            Ok(consumer) => {
                debug!(consumer = %self.config.consumer, "Using existing consumer");
                Ok(consumer)
            }
            Err(_) => {
                let config = jetstream::consumer::pull::Config {
                    durable_name: Some(self.config.consumer.clone()),
                    filter_subject: self.filter_subject(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_ack_pending: self.config.max_ack_pending as i64,
                    ..Default::default()
                };

                let consumer = stream
                    .create_consumer(config)
                    .await
                    .map_err(|e| SyncError::nats_with_source("Failed to create consumer", e))?;

                info!(consumer = %self.config.consumer, "Created consumer");
                Ok(consumer)
            }
        }
    }
}

#[async_trait]
impl Lifecycle for NatsJetStreamSource {
    async fn start(&self) -> Result<()> {
        info!(url = %self.config.url, "Connecting to NATS");

        let client = connect(
            &self.config.url,
            &self.config.connection_name,
            self.config.credentials_path.as_deref(),
        )
        .await?;

        let js = jetstream::new(client.clone());
        let consumer = self.ensure_consumer(&js).await?;

        *self.client.write().await = Some(client);
        *self.consumer.write().await = Some(consumer);
        self.running.store(true, Ordering::SeqCst);

        info!(
            stream = %self.config.stream,
            consumer = %self.config.consumer,
            "NATS JetStream source started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        *self.consumer.write().await = None;
        *self.client.write().await = None;

        info!("NATS JetStream source stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for NatsJetStreamSource {
    async fn health_check(&self) -> Result<()> {
        let client = self.client.read().await;
        match client.as_ref() {
            Some(c) if c.connection_state() == async_nats::connection::State::Connected => Ok(()),
            Some(_) => Err(SyncError::nats("Not connected")),
            None => Err(SyncError::nats("Client not initialized")),
        }
    }

    fn component_name(&self) -> &'static str {
        "nats_jetstream_source"
    }
}

#[async_trait]
impl MessageSource for NatsJetStreamSource {
    async fn deliveries(&self) -> Result<DeliveryStream> {
        let consumer = self
            .consumer
            .read()
            .await
            .as_ref()
            .ok_or_else(|| SyncError::nats("Consumer not initialized"))?
            .clone();

        let batch_size = self.config.batch_size;
        let running = self.running.clone();
        let metrics = self.metrics.clone();

        let stream = async_stream::stream! {
            while running.load(Ordering::SeqCst) {
                let batch = consumer
                    .batch()
                    .max_messages(batch_size)
                    .expires(Duration::from_secs(5))
                    .messages()
                    .await;

                let mut messages = match batch {
                    Ok(messages) => messages,
                    Err(e) => {
                        error!(error = %e, "Error requesting batch");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                };

                while let Some(msg_result) = messages.next().await {
                    let msg = match msg_result {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(error = %e, "Error receiving message");
                            continue;
                        }
                    };

                    let delivered = msg
                        .info()
                        .map(|info| info.delivered.max(1) as u32)
                        .unwrap_or(1);

                    match Envelope::from_bytes(&msg.payload) {
                        Ok(envelope) => {
                            trace!(subject = %msg.subject, delivered, "Received message");
                            yield Ok(Delivery::new(envelope, delivered, Box::new(JetStreamAck { message: msg })));
                        }
                        Err(e) => {
                            // cannot succeed on redelivery
                            error!(subject = %msg.subject, error = %e, "Undecodable message, terminating");
                            metrics.record_poison();
                            if let Err(e) = msg.ack_with(AckKind::Term).await {
                                warn!(error = %e, "Failed to terminate message");
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

// ============================================================================
// Channel Source (for testing and embedding)
// ============================================================================

/// Acknowledgement decision recorded by `ChannelSource`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRecord {
    Ack,
    Nack(Option<Duration>),
    InProgress,
    Term,
}

type AckLog = Arc<Mutex<Vec<(uuid::Uuid, AckRecord)>>>;

struct ChannelAck {
    msg_id: uuid::Uuid,
    log: AckLog,
}

impl ChannelAck {
    async fn record(&self, record: AckRecord) -> Result<()> {
        self.log.lock().await.push((self.msg_id, record));
        Ok(())
    }
}

#[async_trait]
impl AckHandle for ChannelAck {
    async fn ack(&self) -> Result<()> {
        self.record(AckRecord::Ack).await
    }

    async fn nack(&self, delay: Option<Duration>) -> Result<()> {
        self.record(AckRecord::Nack(delay)).await
    }

    async fn in_progress(&self) -> Result<()> {
        self.record(AckRecord::InProgress).await
    }

    async fn term(&self) -> Result<()> {
        self.record(AckRecord::Term).await
    }
}

/// Sender half of a `ChannelSource`
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<(Envelope, u32)>,
}

impl ChannelPublisher {
    pub async fn publish(&self, envelope: Envelope) -> Result<()> {
        self.redeliver(envelope, 1).await
    }

    /// Publish as if the broker had already delivered the message `delivered - 1` times
    pub async fn redeliver(&self, envelope: Envelope, delivered: u32) -> Result<()> {
        self.tx
            .send((envelope, delivered.max(1)))
            .await
            .map_err(|_| SyncError::Internal("channel source closed".to_string()))
    }

    /// Wrap and publish a notification
    pub async fn notify(&self, notification: ChangeNotification) -> Result<()> {
        self.publish(Envelope::wrap(notification, "channel")).await
    }
}

/// In-process message source
///
/// The delivery stream ends once every `ChannelPublisher` is dropped.
pub struct ChannelSource {
    rx: Mutex<Option<mpsc::Receiver<(Envelope, u32)>>>,
    acks: AckLog,
    delivered: Arc<AtomicU32>,
    running: AtomicBool,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (Self, ChannelPublisher) {
        let (tx, rx) = mpsc::channel(capacity);
        let source = Self {
            rx: Mutex::new(Some(rx)),
            acks: Arc::new(Mutex::new(Vec::new())),
            delivered: Arc::new(AtomicU32::new(0)),
            running: AtomicBool::new(false),
        };
        (source, ChannelPublisher { tx })
    }

    /// Every ack decision so far, in order
    pub async fn acks(&self) -> Vec<(uuid::Uuid, AckRecord)> {
        self.acks.lock().await.clone()
    }

    /// Final decisions only (progress acks filtered out)
    pub async fn settled(&self) -> Vec<(uuid::Uuid, AckRecord)> {
        self.acks
            .lock()
            .await
            .iter()
            .filter(|(_, record)| *record != AckRecord::InProgress)
            .cloned()
            .collect()
    }

    pub fn delivered_count(&self) -> u32 {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Lifecycle for ChannelSource {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for ChannelSource {
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn component_name(&self) -> &'static str {
        "channel_source"
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn deliveries(&self) -> Result<DeliveryStream> {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| SyncError::Internal("channel source already consumed".to_string()))?;

        let acks = self.acks.clone();
        let delivered = self.delivered.clone();

        let stream = async_stream::stream! {
            while let Some((envelope, count)) = rx.recv().await {
                delivered.fetch_add(1, Ordering::SeqCst);
                let ack = ChannelAck {
                    msg_id: envelope.metadata.msg_id,
                    log: acks.clone(),
                };
                yield Ok(Delivery::new(envelope, count, Box::new(ack)));
            }
        };

        Ok(Box::pin(stream))
    }
}
