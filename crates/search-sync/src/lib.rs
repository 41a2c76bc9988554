//! # Search Sync
//!
//! Keeps a search index converged with the upstream item service.
//!
//! ## Startup
//!
//! 1. Build the index store (`memory` or `elasticsearch`)
//! 2. Start the admin API; `/health/ready` answers 503 until the bootstrap is done
//! 3. Connect the index store, dead letter sink and message source, retrying
//!    until each one is up
//! 4. Bootstrap: load the index from upstream if it is empty
//! 5. Consume change notifications until shutdown
//!
//! The message source is connected before the bootstrap fetch, so the durable
//! JetStream consumer captures every notification published while the index
//! loads. The consumer only starts applying them once the bootstrap has
//! settled, so a bulk load can never overwrite changes applied from
//! notifications.
//!
//! ```bash
//! search-sync run --config /etc/search-sync/config.toml
//! ```

pub mod admin_api;

pub use admin_api::*;

use search_bootstrap::{BootstrapOutcome, BootstrapSynchronizer, UpstreamClient};
use search_indexer::{
    DeadLetterQueue, ElasticIndexStore, EventConsumer, NatsDeadLetterSink, NatsDeadLetterSinkConfig,
    NatsJetStreamSource, NatsJetStreamSourceConfig, NotificationHandler,
};
use search_sync_core::prelude::*;
use search_sync_core::{DeadLetterBackend, IndexBackend, MemoryIndexStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Wait between attempts to start a component
const START_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Start a component, retrying until it succeeds or `cancel` fires
async fn start_with_retry<F, Fut>(
    cancel: &CancellationToken,
    component: &str,
    mut start: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    RetryPolicy::unbounded(START_RETRY_INTERVAL)
        .execute(
            cancel,
            |_| start(),
            |failed| {
                warn!(
                    component,
                    attempt = failed.attempt,
                    error = %failed.error,
                    "Failed to start component, retrying"
                )
            },
        )
        .await?;
    info!(component, "Component started");
    Ok(())
}

/// Fully wired synchronizer
pub struct SyncEngine {
    store: Arc<dyn IndexStore>,
    health: SyncHealth,
    bootstrap: BootstrapSynchronizer,
    consumer: EventConsumer,
    dead_letters: Arc<dyn DeadLetterSink>,
    lifecycles: Vec<(&'static str, Arc<dyn Lifecycle>)>,
    admin_listen: Option<String>,
}

impl SyncEngine {
    /// Wire an engine from pre-built parts
    pub fn new(
        store: Arc<dyn IndexStore>,
        health: SyncHealth,
        bootstrap: BootstrapSynchronizer,
        consumer: EventConsumer,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            store,
            health,
            bootstrap,
            consumer,
            dead_letters,
            lifecycles: Vec::new(),
            admin_listen: None,
        }
    }

    /// Builder: serve the admin API on `listen`
    pub fn with_admin(mut self, listen: impl Into<String>) -> Self {
        self.admin_listen = Some(listen.into());
        self
    }

    /// Builder: component started before the bootstrap and stopped after the consumer drains
    pub fn with_lifecycle(mut self, name: &'static str, component: Arc<dyn Lifecycle>) -> Self {
        self.lifecycles.push((name, component));
        self
    }

    /// Build every component from configuration
    ///
    /// Nothing connects here; `run` starts the components.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        config.validate()?;

        let health = SyncHealth::new();
        let mut lifecycles: Vec<(&'static str, Arc<dyn Lifecycle>)> = Vec::new();

        let store: Arc<dyn IndexStore> = match config.index.backend {
            IndexBackend::Memory => {
                warn!("Using in-memory index store, contents are lost on restart");
                Arc::new(MemoryIndexStore::new())
            }
            IndexBackend::Elasticsearch => {
                let es = Arc::new(ElasticIndexStore::new(config.index.elasticsearch.clone())?);
                lifecycles.push((es.component_name(), es.clone()));
                es
            }
        };

        let dead_letters: Arc<dyn DeadLetterSink> = match config.consumer.dead_letter.backend {
            DeadLetterBackend::Memory => {
                Arc::new(DeadLetterQueue::new(config.consumer.dead_letter.max_size))
            }
            DeadLetterBackend::Nats => {
                let sink = Arc::new(NatsDeadLetterSink::new(NatsDeadLetterSinkConfig::from(
                    &config.consumer,
                )));
                lifecycles.push((sink.component_name(), sink.clone()));
                sink
            }
        };

        let upstream = UpstreamClient::from_config(&config.upstream, health.clone())?;
        let bootstrap = BootstrapSynchronizer::new(store.clone(), upstream, health.clone())
            .with_mode(config.bootstrap.mode);

        let source = Arc::new(NatsJetStreamSource::new(NatsJetStreamSourceConfig::from(
            &config.consumer,
        )));
        let handler = Arc::new(NotificationHandler::new(store.clone()));
        let consumer =
            EventConsumer::new(source, handler, dead_letters.clone()).with_config(&config.consumer);

        let mut engine = Self::new(store, health, bootstrap, consumer, dead_letters);
        engine.lifecycles = lifecycles;
        if config.admin.enabled {
            engine = engine.with_admin(config.admin.listen.clone());
        }
        Ok(engine)
    }

    pub fn health(&self) -> &SyncHealth {
        &self.health
    }

    pub fn store(&self) -> Arc<dyn IndexStore> {
        self.store.clone()
    }

    /// Start every component, then the message source
    ///
    /// Returns only once all are up, or with `Cancelled` on shutdown.
    async fn start_components(&self, cancel: &CancellationToken) -> Result<()> {
        for (name, component) in &self.lifecycles {
            start_with_retry(cancel, name, || component.start()).await?;
        }
        start_with_retry(cancel, "message_source", || self.consumer.start_source()).await
    }

    /// Run until `cancel` fires or the consumer stops
    ///
    /// Components that fail to start are retried until shutdown. Bootstrap
    /// failures are logged and never returned; a consumer failure is.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let admin = self.admin_listen.clone().map(|listen| {
            let state = AdminState {
                health: self.health.clone(),
                stats: self.consumer.stats(),
                store: self.store.clone(),
                dead_letters: self.dead_letters.clone(),
            };
            tokio::spawn(run_admin_server(listen, state, cancel.clone()))
        });

        let result = match self.start_components(&cancel).await {
            Ok(()) => {
                match self.bootstrap.run_guarded(&cancel).await {
                    Some(BootstrapOutcome::Loaded(count)) => info!(count, "Index loaded from upstream"),
                    Some(BootstrapOutcome::CaughtUp(count)) => {
                        info!(count, "Index caught up with upstream")
                    }
                    Some(BootstrapOutcome::Skipped) => info!("Index already populated"),
                    None => {}
                }
                // drains at once when already cancelled, stopping the source
                self.consumer.run(cancel.clone()).await
            }
            Err(e) if e.is_cancelled() => {
                info!("Shutdown requested before all components started");
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(ref e) = result {
            error!(error = %e, "Event consumer failed");
        }
        cancel.cancel();

        if let Some(handle) = admin {
            match handle.await {
                Ok(Err(e)) => error!(error = %e, "Admin API failed"),
                Err(e) => error!(error = %e, "Admin API task failed"),
                Ok(Ok(())) => {}
            }
        }

        for (name, component) in &self.lifecycles {
            if let Err(e) = component.stop().await {
                warn!(component = *name, error = %e, "Failed to stop component");
            }
        }

        info!(
            processed = self.consumer.processed_count(),
            dead_lettered = self.consumer.dead_lettered_count(),
            "Search sync stopped"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use search_bootstrap::MockUpstream;
    use search_indexer::{AckRecord, ChannelSource};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Records whether the message source was connected when the first fetch ran
    struct SourceAwareUpstream {
        inner: MockUpstream,
        source: Arc<ChannelSource>,
        source_running_at_fetch: AtomicBool,
    }

    #[async_trait]
    impl UpstreamSource for SourceAwareUpstream {
        async fn fetch_all(&self) -> Result<Vec<Item>> {
            if self.inner.calls() == 0 {
                self.source_running_at_fetch
                    .store(self.source.is_running(), Ordering::SeqCst);
            }
            self.inner.fetch_all().await
        }

        async fn fetch_since(&self, version: u64) -> Result<Vec<Item>> {
            self.inner.fetch_since(version).await
        }

        fn describe(&self) -> String {
            self.inner.describe()
        }
    }

    /// Fails to start `failures` times
    struct FlakyComponent {
        failures: u32,
        starts: AtomicU32,
        running: AtomicBool,
    }

    impl FlakyComponent {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                starts: AtomicU32::new(0),
                running: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Lifecycle for FlakyComponent {
        async fn start(&self) -> Result<()> {
            let start = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
            if start <= self.failures {
                return Err(SyncError::nats("connection refused"));
            }
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

    fn engine(
        store: Arc<MemoryIndexStore>,
        upstream: Arc<dyn UpstreamSource>,
        source: Arc<ChannelSource>,
    ) -> SyncEngine {
        let health = SyncHealth::new();
        let client = UpstreamClient::new(
            upstream,
            RetryPolicy::unbounded(Duration::from_secs(3)),
            health.clone(),
        );
        let bootstrap = BootstrapSynchronizer::new(store.clone(), client, health.clone());
        let dead_letters: Arc<dyn DeadLetterSink> = Arc::new(DeadLetterQueue::new(10));
        let consumer = EventConsumer::new(
            source,
            Arc::new(NotificationHandler::new(store.clone())),
            dead_letters.clone(),
        );
        SyncEngine::new(store, health, bootstrap, consumer, dead_letters)
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_then_notifications() {
        let store = Arc::new(MemoryIndexStore::new());
        let upstream = Arc::new(MockUpstream::new(vec![
            Item::new("A1", 1, json!("Watch")),
            Item::new("B2", 1, json!("Lamp")),
        ]));
        upstream.fail_not_found(2).await;
        let (source, publisher) = ChannelSource::new(8);
        let source = Arc::new(source);

        publisher
            .notify(ChangeNotification::updated(Item::new("A1", 2, json!("Watch v2"))))
            .await
            .unwrap();
        publisher.notify(ChangeNotification::deleted("B2")).await.unwrap();
        drop(publisher);

        let engine = engine(store.clone(), upstream, source.clone());
        let health = engine.health().clone();
        engine.run(CancellationToken::new()).await.unwrap();

        assert!(health.is_ready());
        assert_eq!(store.get("A1").await.unwrap().unwrap().payload, json!("Watch v2"));
        assert!(store.get("B2").await.unwrap().is_none());
        assert!(source.settled().await.iter().all(|(_, r)| *r == AckRecord::Ack));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_bootstrap_exits_cleanly() {
        let store = Arc::new(MemoryIndexStore::new());
        let upstream = Arc::new(MockUpstream::default());
        upstream.fail_not_found(1_000).await;
        let (source, _publisher) = ChannelSource::new(8);
        let source = Arc::new(source);

        let engine = engine(store.clone(), upstream, source.clone());
        let health = engine.health().clone();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            trigger.cancel();
        });

        engine.run(cancel).await.unwrap();

        assert_eq!(health.current(), BootstrapState::Cancelled);
        assert_eq!(source.delivered_count(), 0);
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_connected_before_first_fetch() {
        let store = Arc::new(MemoryIndexStore::new());
        let (source, publisher) = ChannelSource::new(8);
        let source = Arc::new(source);
        let upstream = Arc::new(SourceAwareUpstream {
            inner: MockUpstream::new(vec![Item::new("A1", 1, json!("Watch"))]),
            source: source.clone(),
            source_running_at_fetch: AtomicBool::new(false),
        });
        drop(publisher);

        let engine = engine(store.clone(), upstream.clone(), source.clone());
        engine.run(CancellationToken::new()).await.unwrap();

        assert_eq!(upstream.inner.calls(), 1);
        assert!(upstream.source_running_at_fetch.load(Ordering::SeqCst));
        assert!(!source.is_running());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_component_start_is_retried_until_it_comes_up() {
        let store = Arc::new(MemoryIndexStore::new());
        let upstream = Arc::new(MockUpstream::new(vec![Item::new("A1", 1, json!("Watch"))]));
        let (source, publisher) = ChannelSource::new(8);
        let source = Arc::new(source);
        drop(publisher);
        let component = Arc::new(FlakyComponent::new(2));

        let engine = engine(store.clone(), upstream.clone(), source)
            .with_lifecycle("flaky", component.clone());
        let health = engine.health().clone();
        let start = tokio::time::Instant::now();
        engine.run(CancellationToken::new()).await.unwrap();

        assert_eq!(component.starts.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_secs(6));
        assert!(!component.is_running());
        assert!(health.is_ready());
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_component_down_skips_bootstrap() {
        let store = Arc::new(MemoryIndexStore::new());
        let upstream = Arc::new(MockUpstream::new(vec![Item::new("A1", 1, json!("Watch"))]));
        let (source, _publisher) = ChannelSource::new(8);
        let source = Arc::new(source);

        let engine = engine(store.clone(), upstream.clone(), source.clone())
            .with_lifecycle("down", Arc::new(FlakyComponent::new(u32::MAX)));
        let health = engine.health().clone();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        engine.run(cancel).await.unwrap();

        assert_eq!(health.current(), BootstrapState::NotStarted);
        assert_eq!(upstream.calls(), 0);
        assert!(!source.is_running());
        assert!(store.is_empty().await.unwrap());
    }
}
