//! # Search Indexer
//!
//! Applies change notifications to the search index.
//!
//! ## Components
//!
//! - `NatsJetStreamSource` / `ChannelSource`: deliver notifications with ack handles
//! - `NotificationHandler`: applies one notification to an `IndexStore`
//! - `ElasticIndexStore`: Elasticsearch-backed index store
//! - `NatsDeadLetterSink` / `DeadLetterQueue`: where exhausted messages go
//! - `EventConsumer`: worker pool tying the above together
//!
//! ## Delivery guarantees
//!
//! - Notifications for the same item id are applied one at a time, in arrival order
//! - A failing notification is retried a bounded number of times, then dead-lettered;
//!   earlier broker deliveries count against that budget
//! - A delivery queued behind a busy worker keeps extending its ack deadline
//! - Nothing is acked before it has been applied or dead-lettered

pub mod consumer;
pub mod dlq;
pub mod elastic;
pub mod handler;

pub use consumer::*;
pub use dlq::*;
pub use elastic::*;
pub use handler::*;

use futures::StreamExt;
use search_sync_core::prelude::*;
use search_sync_core::{ConsumerConfig, ConsumerMetrics};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Consumer counters
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    processed: AtomicU64,
    failed_attempts: AtomicU64,
    dead_lettered: AtomicU64,
    nacked: AtomicU64,
}

/// Point-in-time copy of `ConsumerStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub failed_attempts: u64,
    pub dead_lettered: u64,
    pub nacked: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub queue: usize,
    /// How often a queued delivery extends its ack deadline
    pub heartbeat: Duration,
}

impl From<&ConsumerConfig> for WorkerPoolConfig {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            workers: config.workers,
            queue: config.worker_queue,
            heartbeat: config.jetstream.ack_wait / 2,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&ConsumerConfig::default())
    }
}

const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// Worker index for an item id
///
/// Every notification for one id lands on the same worker.
pub fn shard_for(item_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    item_id.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// State shared by all workers
struct WorkerContext {
    handler: Arc<dyn ChangeHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
    metrics: ConsumerMetrics,
    stats: Arc<ConsumerStats>,
    cancel: CancellationToken,
}

impl WorkerContext {
    async fn process(&self, envelope: Envelope, delivered: u32, ack: &dyn AckHandle) {
        let kind = envelope.notification.kind().as_subject_suffix();
        let msg_id = envelope.metadata.msg_id;
        let notification = &envelope.notification;
        let handler = self.handler.as_ref();
        let policy = self.policy.for_delivery(delivered);

        let result = policy
            .execute_to_completion(
                &self.cancel,
                |attempt| async move {
                    if attempt > 1 {
                        if let Err(e) = ack.in_progress().await {
                            warn!(error = %e, %msg_id, "Failed to extend ack deadline");
                        }
                    }
                    handler.handle(notification).await
                },
                |failed| {
                    self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    if failed.next_delay.is_some() {
                        self.metrics.record_retry(kind);
                    }
                    warn!(
                        %msg_id,
                        id = notification.item_id(),
                        kind,
                        attempt = failed.attempt,
                        delivered,
                        error = %failed.error,
                        "Notification handler failed"
                    );
                },
            )
            .await;

        match result {
            Ok(outcome) => {
                if let Err(e) = ack.ack().await {
                    warn!(error = %e, %msg_id, "Failed to ack message");
                }
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                debug!(%msg_id, kind, outcome = outcome.as_str(), "Notification applied");
            }
            Err(SyncError::RetryExhausted { attempts, message }) => {
                let id = envelope.item_id().to_string();
                let letter = DeadLetter::new(envelope, message, attempts);
                match self.dead_letters.dead_letter(letter).await {
                    Ok(()) => {
                        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                        self.metrics.record_dead_lettered(kind);
                        if let Some(size) = self.dead_letters.len().await {
                            self.metrics.set_dead_letter_size(size);
                        }
                        error!(
                            %msg_id,
                            id,
                            kind,
                            attempts,
                            sink = self.dead_letters.name(),
                            "Notification dead-lettered"
                        );
                        if let Err(e) = ack.term().await {
                            warn!(error = %e, %msg_id, "Failed to terminate message");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, %msg_id, id, "Dead letter sink failed, returning message to broker");
                        self.nack(ack, Some(self.policy.interval)).await;
                    }
                }
            }
            Err(e) => {
                debug!(%msg_id, reason = %e, "Returning unfinished message to broker");
                self.nack(ack, None).await;
            }
        }
    }

    async fn nack(&self, ack: &dyn AckHandle, delay: Option<Duration>) {
        self.stats.nacked.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = ack.nack(delay).await {
            warn!(error = %e, "Failed to nack message");
        }
    }
}

/// Periodic `in_progress` for a delivery that waits behind others; stops on drop
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn spawn(ack: Arc<dyn AckHandle>, every: Duration, msg_id: Uuid) -> Self {
        Self(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                ticker.tick().await;
                match ack.in_progress().await {
                    Ok(()) => trace!(%msg_id, "Extended ack deadline of queued message"),
                    Err(e) => warn!(error = %e, %msg_id, "Failed to extend ack deadline of queued message"),
                }
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A delivery waiting in a worker queue
struct Queued {
    envelope: Envelope,
    delivered: u32,
    ack: Arc<dyn AckHandle>,
    heartbeat: Heartbeat,
}

impl Queued {
    fn new(delivery: Delivery, heartbeat: Duration) -> Self {
        let Delivery {
            envelope,
            delivered,
            ack,
        } = delivery;
        let ack: Arc<dyn AckHandle> = Arc::from(ack);
        let heartbeat = Heartbeat::spawn(ack.clone(), heartbeat, envelope.metadata.msg_id);
        Self {
            envelope,
            delivered,
            ack,
            heartbeat,
        }
    }
}

async fn worker_loop(worker: usize, mut rx: mpsc::Receiver<Queued>, ctx: Arc<WorkerContext>) {
    while let Some(queued) = rx.recv().await {
        let Queued {
            envelope,
            delivered,
            ack,
            heartbeat,
        } = queued;
        drop(heartbeat);
        ctx.process(envelope, delivered, ack.as_ref()).await;
    }
    debug!(worker, "Worker drained");
}

/// Main consumer orchestrator
pub struct EventConsumer {
    source: Arc<dyn MessageSource>,
    handler: Arc<dyn ChangeHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: RetryPolicy,
    pool: WorkerPoolConfig,
    metrics: ConsumerMetrics,
    stats: Arc<ConsumerStats>,
    running: AtomicBool,
}

impl EventConsumer {
    /// Create new consumer with default redelivery policy and pool size
    pub fn new(
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn ChangeHandler>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            source,
            handler,
            dead_letters,
            policy: RetryPolicy::message_redelivery(),
            pool: WorkerPoolConfig::default(),
            metrics: ConsumerMetrics::new("event_consumer"),
            stats: Arc::new(ConsumerStats::default()),
            running: AtomicBool::new(false),
        }
    }

    /// Builder: apply pool size and redelivery policy from config
    pub fn with_config(self, config: &ConsumerConfig) -> Self {
        self.with_policy(RetryPolicy::from(&config.redelivery))
            .with_pool(WorkerPoolConfig::from(config))
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = WorkerPoolConfig {
            workers: pool.workers.max(1),
            queue: pool.queue.max(1),
            heartbeat: pool.heartbeat.max(MIN_HEARTBEAT),
        };
        self
    }

    /// Connect the source so the broker retains notifications from now on
    ///
    /// Does nothing if the source is already running; `run` calls it too.
    pub async fn start_source(&self) -> Result<()> {
        if self.source.is_running() {
            return Ok(());
        }
        self.source.start().await
    }

    /// Run until the source ends or `cancel` fires
    ///
    /// On cancellation the consumer stops pulling, lets every worker finish
    /// the handler call it is in, returns queued deliveries to the broker and
    /// stops the source.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            workers = self.pool.workers,
            queue = self.pool.queue,
            max_attempts = ?self.policy.max_attempts(),
            source = self.source.component_name(),
            "Starting event consumer"
        );

        self.start_source().await?;
        let mut stream = match self.source.deliveries().await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(stop) = self.source.stop().await {
                    warn!(error = %stop, "Failed to stop source");
                }
                return Err(e);
            }
        };
        self.running.store(true, Ordering::SeqCst);

        let ctx = Arc::new(WorkerContext {
            handler: self.handler.clone(),
            dead_letters: self.dead_letters.clone(),
            policy: self.policy,
            metrics: self.metrics.clone(),
            stats: self.stats.clone(),
            cancel: cancel.clone(),
        });

        let mut senders = Vec::with_capacity(self.pool.workers);
        let mut workers = Vec::with_capacity(self.pool.workers);
        for worker in 0..self.pool.workers {
            let (tx, rx) = mpsc::channel(self.pool.queue);
            senders.push(tx);
            workers.push(tokio::spawn(worker_loop(worker, rx, ctx.clone())));
        }

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutdown requested, draining workers");
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!(error = %e, "Error in delivery stream");
                        continue;
                    }
                    None => {
                        info!("Delivery stream ended");
                        break;
                    }
                },
            };

            self.stats.received.fetch_add(1, Ordering::Relaxed);
            let shard = shard_for(delivery.envelope.item_id(), self.pool.workers);

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = senders[shard].reserve() => permit.ok(),
            };

            match permit {
                Some(permit) => permit.send(Queued::new(delivery, self.pool.heartbeat)),
                None => {
                    ctx.nack(delivery.ack.as_ref(), None).await;
                    break;
                }
            }
        }

        drop(stream);
        drop(senders);
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.source.stop().await?;

        let stats = self.stats.snapshot();
        info!(
            received = stats.received,
            processed = stats.processed,
            dead_lettered = stats.dead_lettered,
            nacked = stats.nacked,
            "Event consumer stopped"
        );
        Ok(())
    }

    /// Check if running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shared counters, readable while the consumer runs
    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Get processed count
    pub fn processed_count(&self) -> u64 {
        self.stats.processed.load(Ordering::Relaxed)
    }

    /// Get dead-lettered count
    pub fn dead_lettered_count(&self) -> u64 {
        self.stats.dead_lettered.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use search_sync_core::MemoryIndexStore;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Fails the first `failures` calls, then applies to the inner handler
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
        inner: NotificationHandler,
    }

    impl FlakyHandler {
        fn new(failures: u32, store: Arc<dyn IndexStore>) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                inner: NotificationHandler::new(store),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChangeHandler for FlakyHandler {
        async fn handle(&self, notification: &ChangeNotification) -> Result<HandleOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(SyncError::handler(format!("failure {}", call)));
            }
            self.inner.handle(notification).await
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl DeadLetterSink for BrokenSink {
        async fn dead_letter(&self, _letter: DeadLetter) -> Result<()> {
            Err(SyncError::nats("unreachable"))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn consumer(
        source: Arc<ChannelSource>,
        handler: Arc<dyn ChangeHandler>,
        sink: Arc<dyn DeadLetterSink>,
    ) -> EventConsumer {
        EventConsumer::new(source, handler, sink).with_pool(WorkerPoolConfig {
            workers: 4,
            queue: 8,
            ..WorkerPoolConfig::default()
        })
    }

    #[test]
    fn test_shard_is_stable_and_in_range() {
        for id in ["1", "42", "A1", "item-with-long-id"] {
            let shard = shard_for(id, 8);
            assert!(shard < 8);
            assert_eq!(shard, shard_for(id, 8));
        }
        assert_eq!(shard_for("anything", 0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_message_is_dead_lettered_after_six_calls() {
        let store = Arc::new(MemoryIndexStore::new());
        let handler = Arc::new(FlakyHandler::new(u32::MAX, store.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(10));
        let (source, publisher) = ChannelSource::new(4);
        let source = Arc::new(source);

        let envelope = Envelope::wrap(
            ChangeNotification::created(Item::new("1", 1, json!("Watch"))),
            "test",
        );
        let msg_id = envelope.metadata.msg_id;
        publisher.publish(envelope).await.unwrap();
        drop(publisher);

        let consumer = consumer(source.clone(), handler.clone(), dlq.clone());
        let start = tokio::time::Instant::now();
        consumer.run(CancellationToken::new()).await.unwrap();

        assert_eq!(handler.calls(), 6);
        assert!(start.elapsed() >= Duration::from_secs(25));
        assert_eq!(dlq.len().await, Some(1));
        let letter = &dlq.peek(1).await[0];
        assert_eq!(letter.attempts, 6);
        assert!(letter.reason.contains("failure 6"));

        assert_eq!(source.settled().await, vec![(msg_id, AckRecord::Term)]);
        let progress = source
            .acks()
            .await
            .iter()
            .filter(|(_, record)| *record == AckRecord::InProgress)
            .count();
        assert_eq!(progress, 5);

        let stats = consumer.stats().snapshot();
        assert_eq!(stats.failed_attempts, 6);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.processed, 0);
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_and_acks() {
        let store = Arc::new(MemoryIndexStore::new());
        let handler = Arc::new(FlakyHandler::new(2, store.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(10));
        let (source, publisher) = ChannelSource::new(4);
        let source = Arc::new(source);

        publisher
            .notify(ChangeNotification::updated(Item::new("7", 2, json!("Chair"))))
            .await
            .unwrap();
        drop(publisher);

        let consumer = consumer(source.clone(), handler.clone(), dlq.clone());
        consumer.run(CancellationToken::new()).await.unwrap();

        assert_eq!(handler.calls(), 3);
        assert_eq!(consumer.processed_count(), 1);
        assert_eq!(dlq.len().await, Some(0));
        assert_eq!(source.settled().await[0].1, AckRecord::Ack);
        assert_eq!(store.get("7").await.unwrap().unwrap().payload, json!("Chair"));
    }

    #[tokio::test]
    async fn test_same_id_notifications_apply_in_order() {
        let store = Arc::new(MemoryIndexStore::new());
        let handler = Arc::new(NotificationHandler::new(store.clone()));
        let (source, publisher) = ChannelSource::new(16);
        let source = Arc::new(source);

        publisher.notify(ChangeNotification::created(Item::new("42", 1, json!("a")))).await.unwrap();
        publisher.notify(ChangeNotification::created(Item::new("42", 1, json!("a")))).await.unwrap();
        publisher.notify(ChangeNotification::deleted("9")).await.unwrap();
        publisher.notify(ChangeNotification::created(Item::new("9", 1, json!("b")))).await.unwrap();
        publisher.notify(ChangeNotification::updated(Item::new("13", 1, json!("c")))).await.unwrap();
        publisher.notify(ChangeNotification::deleted("13")).await.unwrap();
        drop(publisher);

        let consumer = consumer(source.clone(), handler, Arc::new(DeadLetterQueue::new(10)));
        consumer.run(CancellationToken::new()).await.unwrap();

        assert_eq!(consumer.processed_count(), 6);
        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.get("42").await.unwrap().is_some());
        assert!(store.get("9").await.unwrap().is_some());
        assert!(store.get("13").await.unwrap().is_none());
        assert!(source.settled().await.iter().all(|(_, r)| *r == AckRecord::Ack));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retries_nacks_instead_of_dead_lettering() {
        let store = Arc::new(MemoryIndexStore::new());
        let handler = Arc::new(FlakyHandler::new(u32::MAX, store));
        let dlq = Arc::new(DeadLetterQueue::new(10));
        let (source, publisher) = ChannelSource::new(4);
        let source = Arc::new(source);

        publisher
            .notify(ChangeNotification::created(Item::new("1", 1, json!({}))))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let consumer = consumer(source.clone(), handler.clone(), dlq.clone());
        consumer.run(cancel).await.unwrap();

        assert_eq!(handler.calls(), 2);
        assert_eq!(dlq.len().await, Some(0));
        assert_eq!(source.settled().await.len(), 1);
        assert_eq!(source.settled().await[0].1, AckRecord::Nack(None));
        assert!(!consumer.is_running());
        drop(publisher);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_delivery_keeps_ack_deadline_alive() {
        let store = Arc::new(MemoryIndexStore::with_items(vec![Item::new("X", 1, json!("old"))]));
        // the first two notifications fail every attempt, the delete succeeds
        let handler = Arc::new(FlakyHandler::new(12, store.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(10));
        let (source, publisher) = ChannelSource::new(8);
        let source = Arc::new(source);

        let first = Envelope::wrap(ChangeNotification::created(Item::new("X", 2, json!("a"))), "test");
        let first_id = first.metadata.msg_id;
        let delete = Envelope::wrap(ChangeNotification::deleted("X"), "test");
        let delete_id = delete.metadata.msg_id;
        publisher.publish(first).await.unwrap();
        publisher
            .notify(ChangeNotification::updated(Item::new("X", 3, json!("b"))))
            .await
            .unwrap();
        publisher.publish(delete).await.unwrap();
        drop(publisher);

        let consumer = EventConsumer::new(source.clone(), handler.clone(), dlq.clone()).with_pool(
            WorkerPoolConfig {
                workers: 1,
                queue: 8,
                heartbeat: Duration::from_secs(15),
            },
        );
        consumer.run(CancellationToken::new()).await.unwrap();

        let acks = source.acks().await;
        let progress_for = |msg_id: Uuid| {
            acks.iter()
                .filter(|(id, record)| *id == msg_id && *record == AckRecord::InProgress)
                .count()
        };
        // waited 50s behind two exhausted messages; never 30s without a signal
        assert!(progress_for(delete_id) >= 3);
        assert_eq!(progress_for(first_id), 5);
        assert_eq!(
            acks.iter().filter(|(id, _)| *id == delete_id).last().map(|(_, r)| *r),
            Some(AckRecord::Ack)
        );

        assert_eq!(handler.calls(), 13);
        assert_eq!(dlq.len().await, Some(2));
        assert!(store.get("X").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_message_gets_remaining_budget() {
        let store = Arc::new(MemoryIndexStore::new());
        let handler = Arc::new(FlakyHandler::new(u32::MAX, store));
        let dlq = Arc::new(DeadLetterQueue::new(10));
        let (source, publisher) = ChannelSource::new(4);
        let source = Arc::new(source);

        let envelope = Envelope::wrap(ChangeNotification::deleted("5"), "test");
        publisher.redeliver(envelope, 4).await.unwrap();
        drop(publisher);

        let consumer = consumer(source.clone(), handler.clone(), dlq.clone());
        consumer.run(CancellationToken::new()).await.unwrap();

        assert_eq!(handler.calls(), 3);
        assert_eq!(dlq.peek(1).await[0].attempts, 3);
        assert_eq!(source.settled().await[0].1, AckRecord::Term);
    }

    #[tokio::test]
    async fn test_start_source_is_idempotent() {
        let (source, _publisher) = ChannelSource::new(1);
        let source = Arc::new(source);
        let store = Arc::new(MemoryIndexStore::new());
        let consumer = consumer(
            source.clone(),
            Arc::new(NotificationHandler::new(store)),
            Arc::new(DeadLetterQueue::new(1)),
        );

        consumer.start_source().await.unwrap();
        consumer.start_source().await.unwrap();
        assert!(source.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_returns_message_to_broker() {
        let store = Arc::new(MemoryIndexStore::new());
        let handler = Arc::new(FlakyHandler::new(u32::MAX, store));
        let (source, publisher) = ChannelSource::new(4);
        let source = Arc::new(source);

        publisher
            .notify(ChangeNotification::deleted("1"))
            .await
            .unwrap();
        drop(publisher);

        let consumer = consumer(source.clone(), handler, Arc::new(BrokenSink))
            .with_policy(RetryPolicy::bounded(1, Duration::from_secs(5)));
        consumer.run(CancellationToken::new()).await.unwrap();

        assert_eq!(
            source.settled().await[0].1,
            AckRecord::Nack(Some(Duration::from_secs(5)))
        );
        assert_eq!(consumer.dead_lettered_count(), 0);
    }
}
