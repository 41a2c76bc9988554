//! Upstream service client
//!
//! `HttpUpstream` makes exactly one request per call and classifies failures.
//! `UpstreamClient` wraps any `UpstreamSource` with the unbounded fixed-interval
//! retry: it only returns once the upstream answered or shutdown was requested.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use search_sync_core::prelude::*;
use search_sync_core::{BootstrapMetrics, UpstreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

// ============================================================================
// HTTP Upstream
// ============================================================================

/// HTTP upstream configuration
#[derive(Debug, Clone)]
pub struct HttpUpstreamConfig {
    pub base_url: Url,
    pub items_path: String,
    pub bearer_token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpUpstreamConfig {
    fn default() -> Self {
        UpstreamConfig::default().into()
    }
}

impl From<UpstreamConfig> for HttpUpstreamConfig {
    fn from(config: UpstreamConfig) -> Self {
        Self {
            base_url: config.base_url,
            items_path: config.items_path,
            bearer_token: config.bearer_token,
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
        }
    }
}

/// Upstream service reached over HTTP
pub struct HttpUpstream {
    client: Client,
    endpoint: Url,
    config: HttpUpstreamConfig,
}

impl HttpUpstream {
    /// Create new upstream client
    pub fn new(config: HttpUpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::upstream_with_source("Failed to create client", e))?;

        let endpoint = config
            .base_url
            .join(&config.items_path)
            .map_err(|e| SyncError::config(format!("Invalid items path: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    /// Build request with authentication
    fn build_request(&self, since: Option<u64>) -> reqwest::RequestBuilder {
        let mut req = self.client.get(self.endpoint.clone());

        if let Some(version) = since {
            req = req.query(&[("since", version)]);
        }
        if let Some(ref token) = self.config.bearer_token {
            req = req.bearer_auth(token);
        }

        req.header("Accept", "application/json")
    }

    async fn fetch(&self, since: Option<u64>) -> Result<Vec<Item>> {
        let resp = self.build_request(since).send().await.map_err(|e| {
            if e.is_builder() {
                SyncError::upstream(UpstreamFailure::Permanent, format!("Invalid request: {}", e))
            } else {
                SyncError::upstream_with_source("Request failed", e)
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::upstream_status(
                status.as_u16(),
                format!("GET {} returned {} {}", self.endpoint, status, truncate(&body, 256)),
            ));
        }

        // A truncated or garbled body is treated like a dropped connection
        let items: Vec<Item> = resp
            .json()
            .await
            .map_err(|e| SyncError::upstream_with_source("Failed to decode items", e))?;

        trace!(count = items.len(), since, "Fetched items from upstream");
        Ok(items)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl UpstreamSource for HttpUpstream {
    async fn fetch_all(&self) -> Result<Vec<Item>> {
        self.fetch(None).await
    }

    async fn fetch_since(&self, version: u64) -> Result<Vec<Item>> {
        self.fetch(Some(version)).await
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

#[async_trait]
impl HealthCheck for HttpUpstream {
    async fn health_check(&self) -> Result<()> {
        let resp = self
            .build_request(None)
            .send()
            .await
            .map_err(|e| SyncError::upstream_with_source("Health check failed", e))?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(SyncError::upstream_status(404, "Items not provisioned")),
            s => Err(SyncError::upstream_status(s.as_u16(), "Upstream unhealthy")),
        }
    }

    fn component_name(&self) -> &'static str {
        "http_upstream"
    }
}

// ============================================================================
// Retrying Client
// ============================================================================

/// Retrying wrapper around an upstream source
///
/// Treats "not ready" (404), transient and permanent failures alike: every
/// one is retried at a flat interval. The only way out besides success is
/// the cancellation token.
pub struct UpstreamClient {
    source: Arc<dyn UpstreamSource>,
    policy: RetryPolicy,
    escalate_after: Duration,
    health: SyncHealth,
    metrics: BootstrapMetrics,
}

impl UpstreamClient {
    pub fn new(source: Arc<dyn UpstreamSource>, policy: RetryPolicy, health: SyncHealth) -> Self {
        Self {
            source,
            policy,
            escalate_after: Duration::from_secs(5 * 60),
            health,
            metrics: BootstrapMetrics::new("upstream_client"),
        }
    }

    /// Build from the upstream section of the service config
    pub fn from_config(config: &UpstreamConfig, health: SyncHealth) -> Result<Self> {
        let source = HttpUpstream::new(config.clone().into())?;
        Ok(Self::new(Arc::new(source), RetryPolicy::from(&config.retry), health)
            .with_escalate_after(config.escalate_after))
    }

    /// Builder: total wait after which a stuck fetch is escalated
    pub fn with_escalate_after(mut self, escalate_after: Duration) -> Self {
        self.escalate_after = escalate_after;
        self
    }

    /// Fetch every item, retrying until success or cancellation
    pub async fn fetch_all(&self, cancel: &CancellationToken) -> Result<Vec<Item>> {
        self.fetch_with_retry(cancel, None).await
    }

    /// Fetch items newer than `version`, retrying until success or cancellation
    pub async fn fetch_since(&self, cancel: &CancellationToken, version: u64) -> Result<Vec<Item>> {
        self.fetch_with_retry(cancel, Some(version)).await
    }

    async fn fetch_with_retry(
        &self,
        cancel: &CancellationToken,
        since: Option<u64>,
    ) -> Result<Vec<Item>> {
        let endpoint = self.source.describe();
        let mut escalated = false;

        info!(endpoint = %endpoint, since, "Fetching items from upstream");

        let items = self
            .policy
            .execute(
                cancel,
                |attempt| {
                    let source = self.source.clone();
                    async move {
                        debug!(attempt, "Upstream fetch attempt");
                        match since {
                            Some(version) => source.fetch_since(version).await,
                            None => source.fetch_all().await,
                        }
                    }
                },
                |failed| {
                    self.health.record_fetch_attempt(failed.attempt);
                    let class = failed
                        .error
                        .upstream_failure()
                        .unwrap_or(UpstreamFailure::Transient);
                    self.metrics.record_fetch_failure(class.as_str());
                    log_failure(&endpoint, class, failed);

                    if !escalated && failed.elapsed >= self.escalate_after {
                        escalated = true;
                        self.health.set_stalled(true);
                        self.metrics.record_escalation();
                        error!(
                            endpoint = %endpoint,
                            attempts = failed.attempt,
                            waited_secs = failed.elapsed.as_secs(),
                            last_error = %failed.error,
                            "Upstream fetch has not succeeded within the escalation window"
                        );
                    }
                },
            )
            .await?;

        self.health.set_stalled(false);
        info!(endpoint = %endpoint, count = items.len(), "Fetched items from upstream");
        Ok(items)
    }
}

fn log_failure(endpoint: &str, class: UpstreamFailure, failed: &RetryAttempt<'_>) {
    let retry_in_ms = failed.next_delay.map(|d| d.as_millis() as u64);
    match class {
        UpstreamFailure::NotReady => info!(
            endpoint,
            attempt = failed.attempt,
            retry_in_ms,
            "Upstream items not available yet"
        ),
        UpstreamFailure::Transient => warn!(
            endpoint,
            attempt = failed.attempt,
            retry_in_ms,
            error = %failed.error,
            "Upstream fetch failed"
        ),
        UpstreamFailure::Permanent => error!(
            endpoint,
            attempt = failed.attempt,
            retry_in_ms,
            error = %failed.error,
            "Upstream rejected the request, retrying anyway"
        ),
    }
}

// ============================================================================
// Mock Upstream (for testing)
// ============================================================================

/// Scripted upstream for testing
///
/// Pops one scripted response per call; once the script runs out every call
/// returns the final item set.
pub struct MockUpstream {
    script: Mutex<VecDeque<Result<Vec<Item>>>>,
    items: Mutex<Vec<Item>>,
    calls: AtomicU32,
    since_calls: AtomicU32,
    last_since: Mutex<Option<u64>>,
    healthy: AtomicBool,
}

impl MockUpstream {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            items: Mutex::new(items),
            calls: AtomicU32::new(0),
            since_calls: AtomicU32::new(0),
            last_since: Mutex::new(None),
            healthy: AtomicBool::new(true),
        }
    }

    /// Queue `count` "not found" responses before the item set is served
    pub async fn fail_not_found(&self, count: usize) {
        let mut script = self.script.lock().await;
        for _ in 0..count {
            script.push_back(Err(SyncError::upstream_status(404, "not found")));
        }
    }

    /// Queue an arbitrary response
    pub async fn push_response(&self, response: Result<Vec<Item>>) {
        self.script.lock().await.push_back(response);
    }

    /// Number of `fetch_all` calls
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `fetch_since` calls
    pub fn since_calls(&self) -> u32 {
        self.since_calls.load(Ordering::SeqCst)
    }

    pub async fn last_since(&self) -> Option<u64> {
        *self.last_since.lock().await
    }

    async fn next(&self) -> Result<Vec<Item>> {
        if let Some(response) = self.script.lock().await.pop_front() {
            return response;
        }
        Ok(self.items.lock().await.clone())
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl UpstreamSource for MockUpstream {
    async fn fetch_all(&self) -> Result<Vec<Item>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.next().await
    }

    async fn fetch_since(&self, version: u64) -> Result<Vec<Item>> {
        self.since_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_since.lock().await = Some(version);
        let items = self.next().await?;
        Ok(items.into_iter().filter(|i| i.version > version).collect())
    }

    fn describe(&self) -> String {
        "mock://upstream".to_string()
    }
}

#[async_trait]
impl HealthCheck for MockUpstream {
    async fn health_check(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::upstream(UpstreamFailure::Transient, "mock unhealthy"))
        }
    }

    fn component_name(&self) -> &'static str {
        "mock_upstream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_config(server: &MockServer) -> HttpUpstreamConfig {
        HttpUpstreamConfig {
            base_url: Url::parse(&server.uri()).unwrap(),
            items_path: "/api/items".to_string(),
            bearer_token: None,
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_http_fetch_all_decodes_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/items"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"id": "A1", "version": 2, "payload": "Watch"}])),
            )
            .mount(&server)
            .await;

        let upstream = HttpUpstream::new(http_config(&server)).unwrap();
        let items = upstream.fetch_all().await.unwrap();

        assert_eq!(items, vec![Item::new("A1", 2, json!("Watch"))]);
    }

    #[tokio::test]
    async fn test_http_classifies_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/items"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/items"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/items"))
            .respond_with(ResponseTemplate::new(400))
            .with_priority(3)
            .mount(&server)
            .await;

        let upstream = HttpUpstream::new(http_config(&server)).unwrap();

        let classes: Vec<_> = [
            upstream.fetch_all().await,
            upstream.fetch_all().await,
            upstream.fetch_all().await,
        ]
        .into_iter()
        .map(|r| r.unwrap_err().upstream_failure())
        .collect();

        assert_eq!(
            classes,
            vec![
                Some(UpstreamFailure::NotReady),
                Some(UpstreamFailure::Transient),
                Some(UpstreamFailure::Permanent),
            ]
        );
    }

    #[tokio::test]
    async fn test_http_garbled_body_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&server)
            .await;

        let upstream = HttpUpstream::new(http_config(&server)).unwrap();
        let err = upstream.fetch_all().await.unwrap_err();
        assert_eq!(err.upstream_failure(), Some(UpstreamFailure::Transient));
    }

    #[tokio::test]
    async fn test_http_fetch_since_sends_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/items"))
            .and(query_param("since", "17"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let upstream = HttpUpstream::new(http_config(&server)).unwrap();
        assert!(upstream.fetch_since(17).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_retries_over_http_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/items"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(3)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/items"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": "A1", "payload": "Watch"}])),
            )
            .mount(&server)
            .await;

        let interval = Duration::from_millis(20);
        let upstream = Arc::new(HttpUpstream::new(http_config(&server)).unwrap());
        let client = UpstreamClient::new(upstream, RetryPolicy::unbounded(interval), SyncHealth::new());

        let start = std::time::Instant::now();
        let items = client.fetch_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "A1");
        assert!(start.elapsed() >= interval * 3);
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_retries_permanent_errors_too() {
        let mock = Arc::new(MockUpstream::new(vec![Item::new("1", 1, json!({}))]));
        mock.push_response(Err(SyncError::upstream_status(400, "bad request"))).await;
        mock.push_response(Err(SyncError::upstream_status(500, "boom"))).await;

        let client = UpstreamClient::new(
            mock.clone(),
            RetryPolicy::unbounded(Duration::from_secs(3)),
            SyncHealth::new(),
        );

        let items = client.fetch_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_escalates_after_window() {
        let mock = Arc::new(MockUpstream::new(vec![]));
        mock.fail_not_found(5).await;
        let health = SyncHealth::new();

        let client = UpstreamClient::new(
            mock.clone(),
            RetryPolicy::unbounded(Duration::from_secs(3)),
            health.clone(),
        )
        .with_escalate_after(Duration::from_secs(6));

        let cancel = CancellationToken::new();
        let observed = {
            let health = health.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                health.is_stalled()
            })
        };

        client.fetch_all(&cancel).await.unwrap();
        assert!(observed.await.unwrap());
        assert!(!health.is_stalled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_stops_on_cancel() {
        let mock = Arc::new(MockUpstream::new(vec![]));
        mock.fail_not_found(1_000).await;

        let client = UpstreamClient::new(
            mock.clone(),
            RetryPolicy::unbounded(Duration::from_secs(3)),
            SyncHealth::new(),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });

        let err = client.fetch_all(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(mock.calls() >= 10);
    }
}
