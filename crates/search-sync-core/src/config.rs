//! Configuration types for the search index synchronizer
//!
//! Uses the `config` crate for layered configuration from files and environment.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Root configuration for the whole service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Upstream (source-of-truth) service
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Startup bootstrap behaviour
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// Index store backend
    #[serde(default)]
    pub index: IndexConfig,

    /// Change notification consumer
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Admin API configuration
    #[serde(default)]
    pub admin: AdminApiConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Upstream Configuration
// ============================================================================

/// Upstream HTTP service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the upstream service
    #[serde(default = "default_upstream_url")]
    pub base_url: Url,

    /// Path of the "fetch all items" endpoint
    #[serde(default = "default_items_path")]
    pub items_path: String,

    /// Optional bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,

    /// Connection timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Request timeout
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Retry policy for the fetch (unbounded when `max_retries` is unset)
    #[serde(default = "default_upstream_retry")]
    pub retry: RetryConfig,

    /// Total wait after which a stuck fetch is escalated
    #[serde(with = "humantime_serde", default = "default_escalate_after")]
    pub escalate_after: Duration,
}

fn default_upstream_url() -> Url {
    Url::parse("http://localhost:7001").expect("static URL is valid")
}

fn default_items_path() -> String {
    "/api/items".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_upstream_retry() -> RetryConfig {
    RetryConfig {
        max_retries: None,
        interval: Duration::from_secs(3),
    }
}

fn default_escalate_after() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_url(),
            items_path: default_items_path(),
            bearer_token: None,
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            retry: default_upstream_retry(),
            escalate_after: default_escalate_after(),
        }
    }
}

/// Fixed-interval retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; unset means retry forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Wait between attempts
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

// ============================================================================
// Bootstrap Configuration
// ============================================================================

/// When the startup bootstrap talks to the upstream service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapMode {
    /// Full load only when the index is empty
    #[default]
    EmptyOnly,
    /// Full load when empty, otherwise fetch items newer than the index
    CatchUp,
}

/// Startup bootstrap configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub mode: BootstrapMode,
}

// ============================================================================
// Index Configuration
// ============================================================================

/// Index store backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexBackend {
    /// Process-local map (lost on restart, always bootstraps)
    #[default]
    Memory,
    /// Elasticsearch index behind an alias
    Elasticsearch,
}

/// Index store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default)]
    pub backend: IndexBackend,

    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,
}

/// Elasticsearch connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    /// Elasticsearch hosts
    #[serde(default = "default_es_hosts")]
    pub hosts: Vec<String>,

    /// Alias that readers query
    #[serde(default = "default_alias")]
    pub alias: String,

    /// Optional username for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Optional password for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Optional API key for authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Connection timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Request timeout
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Documents per `_bulk` request during bulk replace
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
}

fn default_es_hosts() -> Vec<String> {
    vec!["http://localhost:9200".to_string()]
}

fn default_alias() -> String {
    "items".to_string()
}

fn default_bulk_size() -> usize {
    1000
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            hosts: default_es_hosts(),
            alias: default_alias(),
            username: None,
            password: None,
            api_key: None,
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            bulk_size: default_bulk_size(),
        }
    }
}

// ============================================================================
// Consumer Configuration
// ============================================================================

/// NATS connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub url: String,

    /// Optional credentials file path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<String>,

    /// Connection name (for monitoring)
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_connection_name() -> String {
    "search-sync".to_string()
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            credentials_path: None,
            connection_name: default_connection_name(),
        }
    }
}

/// JetStream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JetStreamConfig {
    /// Stream name
    #[serde(default = "default_stream_name")]
    pub stream: String,

    /// Durable consumer name
    #[serde(default = "default_consumer_name")]
    pub consumer: String,

    /// Subject prefix of change notifications
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    /// Maximum pending acknowledgements
    #[serde(default = "default_max_ack_pending")]
    pub max_ack_pending: u64,

    /// Acknowledgement wait time
    #[serde(with = "humantime_serde", default = "default_ack_wait")]
    pub ack_wait: Duration,

    /// Messages requested per pull
    #[serde(default = "default_fetch_batch")]
    pub fetch_batch: usize,
}

fn default_stream_name() -> String {
    "ITEM_CHANGES".to_string()
}

fn default_consumer_name() -> String {
    "search-sync".to_string()
}

fn default_subject_prefix() -> String {
    "search.items".to_string()
}

fn default_max_ack_pending() -> u64 {
    1000
}

fn default_ack_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_fetch_batch() -> usize {
    100
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            stream: default_stream_name(),
            consumer: default_consumer_name(),
            subject_prefix: default_subject_prefix(),
            max_ack_pending: default_max_ack_pending(),
            ack_wait: default_ack_wait(),
            fetch_batch: default_fetch_batch(),
        }
    }
}

/// Event consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub nats: NatsConfig,

    #[serde(default)]
    pub jetstream: JetStreamConfig,

    /// Concurrent worker tasks applying notifications
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Queue depth per worker
    #[serde(default = "default_worker_queue")]
    pub worker_queue: usize,

    /// Redelivery policy for failing handlers
    #[serde(default = "default_redelivery")]
    pub redelivery: RetryConfig,

    /// Dead letter configuration
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
}

fn default_workers() -> usize {
    8
}

fn default_worker_queue() -> usize {
    64
}

fn default_redelivery() -> RetryConfig {
    RetryConfig {
        max_retries: Some(5),
        interval: Duration::from_secs(5),
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            nats: NatsConfig::default(),
            jetstream: JetStreamConfig::default(),
            workers: default_workers(),
            worker_queue: default_worker_queue(),
            redelivery: default_redelivery(),
            dead_letter: DeadLetterConfig::default(),
        }
    }
}

/// Dead letter sink selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterBackend {
    /// Bounded in-process queue
    Memory,
    /// Publish to a JetStream subject
    #[default]
    Nats,
}

/// Dead letter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    #[serde(default)]
    pub backend: DeadLetterBackend,

    /// Stream that captures dead-lettered messages
    #[serde(default = "default_dead_letter_stream")]
    pub stream: String,

    /// Subject prefix for dead-lettered messages
    #[serde(default = "default_dead_letter_prefix")]
    pub subject_prefix: String,

    /// Capacity of the in-memory queue
    #[serde(default = "default_dead_letter_max_size")]
    pub max_size: usize,
}

fn default_dead_letter_stream() -> String {
    "ITEM_DEAD_LETTERS".to_string()
}

fn default_dead_letter_prefix() -> String {
    "search.dead_letter.items".to_string()
}

fn default_dead_letter_max_size() -> usize {
    10_000
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            backend: DeadLetterBackend::default(),
            stream: default_dead_letter_stream(),
            subject_prefix: default_dead_letter_prefix(),
            max_size: default_dead_letter_max_size(),
        }
    }
}

// ============================================================================
// Admin / Observability Configuration
// ============================================================================

/// Admin API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminApiConfig {
    /// Enable admin API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

fn default_admin_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for AdminApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_admin_listen(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl SyncConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default values
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // Add config file if specified
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Add environment variables with prefix SEARCH_SYNC_
        builder = builder.add_source(
            config::Environment::with_prefix("SEARCH_SYNC")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let consumer = &self.consumer;
        if consumer.workers == 0 {
            return Err(SyncError::config("consumer.workers must be at least 1"));
        }
        if consumer.worker_queue == 0 {
            return Err(SyncError::config("consumer.worker_queue must be at least 1"));
        }
        if consumer.jetstream.subject_prefix.trim().is_empty() {
            return Err(SyncError::config("consumer.jetstream.subject_prefix is empty"));
        }
        if consumer.dead_letter.subject_prefix.trim().is_empty() {
            return Err(SyncError::config("consumer.dead_letter.subject_prefix is empty"));
        }
        if consumer.dead_letter.subject_prefix.starts_with(&format!(
            "{}.",
            consumer.jetstream.subject_prefix
        )) && consumer.dead_letter.backend == DeadLetterBackend::Nats
        {
            // would be consumed again by the same filter
            return Err(SyncError::config(
                "dead letter subjects must not fall under the consumed subject prefix",
            ));
        }
        if consumer.dead_letter.backend == DeadLetterBackend::Nats
            && consumer.dead_letter.stream == consumer.jetstream.stream
        {
            return Err(SyncError::config(
                "consumer.dead_letter.stream must differ from consumer.jetstream.stream",
            ));
        }
        if consumer.redelivery.max_retries.is_none() {
            return Err(SyncError::config("consumer.redelivery.max_retries must be set"));
        }
        if consumer.jetstream.ack_wait <= consumer.redelivery.interval {
            return Err(SyncError::config(
                "consumer.jetstream.ack_wait must exceed the redelivery interval",
            ));
        }
        if self.index.backend == IndexBackend::Elasticsearch {
            let es = &self.index.elasticsearch;
            if es.hosts.is_empty() {
                return Err(SyncError::config("index.elasticsearch.hosts is empty"));
            }
            if es.bulk_size == 0 {
                return Err(SyncError::config("index.elasticsearch.bulk_size must be at least 1"));
            }
        }
        Ok(())
    }
}
