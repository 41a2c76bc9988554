//! Elasticsearch index store
//!
//! Readers query an alias. Single-item writes go through the alias using
//! external versioning, so Elasticsearch itself rejects stale versions.
//! `bulk_replace` builds a fresh index and swaps the alias in one request,
//! so readers see either the old set or the new one.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use search_sync_core::prelude::*;
use search_sync_core::{dedupe_latest, ElasticsearchConfig};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Elasticsearch-backed index store
pub struct ElasticIndexStore {
    client: Client,
    hosts: Vec<Url>,
    config: ElasticsearchConfig,
    host_index: AtomicUsize,
    running: AtomicBool,
}

impl ElasticIndexStore {
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::index_with_source("Failed to create client", e))?;

        let hosts = config
            .hosts
            .iter()
            .map(|h| {
                Url::parse(h)
                    .map_err(|e| SyncError::config(format!("Invalid Elasticsearch host {}: {}", h, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        if hosts.is_empty() {
            return Err(SyncError::config("At least one Elasticsearch host is required"));
        }

        Ok(Self {
            client,
            hosts,
            config,
            host_index: AtomicUsize::new(0),
            running: AtomicBool::new(false),
        })
    }

    pub fn alias(&self) -> &str {
        &self.config.alias
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let idx = self.host_index.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        let mut url = self.hosts[idx].clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::config("Elasticsearch host cannot be a base URL"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<reqwest::RequestBuilder> {
        let mut req = self.client.request(method, self.url(segments)?);

        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("ApiKey {}", api_key));
        } else if let (Some(ref user), Some(ref pass)) = (&self.config.username, &self.config.password) {
            req = req.basic_auth(user, Some(pass));
        }

        Ok(req)
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        req.send()
            .await
            .map_err(|e| SyncError::index_with_source(format!("{} request failed", what), e))
    }

    async fn expect_success(resp: reqwest::Response, what: &str) -> Result<Value> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::index(format!("{} failed: {} {}", what, status, body)));
        }
        resp.json()
            .await
            .map_err(|e| SyncError::index_with_source(format!("Failed to parse {} response", what), e))
    }

    fn new_index_name(&self) -> String {
        format!("{}-{}", self.config.alias, Utc::now().format("%Y%m%d%H%M%S%3f"))
    }

    fn index_body(&self, with_alias: bool) -> Value {
        let mut body = json!({
            "mappings": {
                "properties": {
                    "id": { "type": "keyword" },
                    "version": { "type": "long" },
                    "updated_at": { "type": "date" }
                }
            }
        });
        if with_alias {
            let mut aliases = serde_json::Map::new();
            aliases.insert(self.config.alias.clone(), json!({}));
            body["aliases"] = Value::Object(aliases);
        }
        body
    }

    async fn create_index(&self, name: &str, with_alias: bool) -> Result<()> {
        let req = self
            .request(Method::PUT, &[name])?
            .json(&self.index_body(with_alias));
        let resp = self.send(req, "Create index").await?;
        Self::expect_success(resp, "Create index").await?;
        debug!(index = name, with_alias, "Created index");
        Ok(())
    }

    /// Indices currently behind the alias
    async fn alias_targets(&self) -> Result<Vec<String>> {
        let req = self.request(Method::GET, &["_alias", &self.config.alias])?;
        let resp = self.send(req, "Get alias").await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body = Self::expect_success(resp, "Get alias").await?;
        Ok(body
            .as_object()
            .map(|indices| indices.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Create an empty index behind the alias if the alias does not exist yet
    pub async fn ensure_alias(&self) -> Result<()> {
        if !self.alias_targets().await?.is_empty() {
            return Ok(());
        }
        let index = self.new_index_name();
        self.create_index(&index, true).await?;
        info!(alias = %self.config.alias, index = %index, "Created index behind alias");
        Ok(())
    }

    async fn write_bulk(&self, index: &str, items: &[Item]) -> Result<()> {
        let mut body = String::new();
        for item in items {
            body.push_str(&serde_json::to_string(&bulk_action(item))?);
            body.push('\n');
            body.push_str(&serde_json::to_string(item)?);
            body.push('\n');
        }

        let req = self
            .request(Method::POST, &[index, "_bulk"])?
            .header("Content-Type", "application/x-ndjson")
            .body(body);
        let resp = self.send(req, "Bulk").await?;
        let result = Self::expect_success(resp, "Bulk").await?;

        if result["errors"].as_bool().unwrap_or(false) {
            let first = result["items"]
                .as_array()
                .and_then(|items| {
                    items.iter().find_map(|item| {
                        let op = item.as_object()?.values().next()?;
                        let error = op.get("error")?;
                        Some(format!(
                            "{}: {}",
                            op["_id"].as_str().unwrap_or("unknown"),
                            error["reason"].as_str().unwrap_or("unknown")
                        ))
                    })
                })
                .unwrap_or_else(|| "unknown".to_string());
            return Err(SyncError::index(format!("Bulk load rejected documents, first: {}", first)));
        }

        trace!(index, count = items.len(), "Bulk chunk written");
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        let req = self.request(Method::DELETE, &[index])?;
        let resp = self.send(req, "Delete index").await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::expect_success(resp, "Delete index").await?;
        Ok(())
    }

    async fn load_new_index(&self, index: &str, items: &[Item]) -> Result<()> {
        self.create_index(index, false).await?;
        for chunk in items.chunks(self.config.bulk_size.max(1)) {
            self.write_bulk(index, chunk).await?;
        }
        let req = self.request(Method::POST, &[index, "_refresh"])?;
        let resp = self.send(req, "Refresh").await?;
        Self::expect_success(resp, "Refresh").await?;
        Ok(())
    }

    async fn swap_alias(&self, new_index: &str, old: &[String]) -> Result<()> {
        let mut actions: Vec<Value> = old
            .iter()
            .map(|index| json!({ "remove": { "index": index, "alias": self.config.alias } }))
            .collect();
        actions.push(json!({ "add": { "index": new_index, "alias": self.config.alias } }));

        let req = self
            .request(Method::POST, &["_aliases"])?
            .json(&json!({ "actions": actions }));
        let resp = self.send(req, "Alias swap").await?;
        Self::expect_success(resp, "Alias swap").await?;
        Ok(())
    }
}

/// Bulk `index` action carrying the item version as an external version
///
/// Documents loaded in bulk must hold the same version that later upserts
/// compare against with `external_gte`.
fn bulk_action(item: &Item) -> Value {
    json!({
        "index": {
            "_id": item.id,
            "version": item.version,
            "version_type": "external_gte",
        }
    })
}

#[async_trait]
impl IndexStore for ElasticIndexStore {
    async fn upsert(&self, item: Item) -> Result<UpsertOutcome> {
        if item.id.is_empty() {
            return Err(SyncError::index("Item id must not be empty"));
        }

        let req = self
            .request(Method::PUT, &[&self.config.alias, "_doc", &item.id])?
            .query(&[("version_type", "external_gte")])
            .query(&[("version", item.version)])
            .json(&item);
        let resp = self.send(req, "Upsert").await?;

        if resp.status() == StatusCode::CONFLICT {
            trace!(id = %item.id, version = item.version, "Stored version is newer");
            return Ok(UpsertOutcome::Stale);
        }

        let body = Self::expect_success(resp, "Upsert").await?;
        match body["result"].as_str() {
            Some("created") => Ok(UpsertOutcome::Inserted),
            _ => Ok(UpsertOutcome::Replaced),
        }
    }

    async fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        let req = self.request(Method::DELETE, &[&self.config.alias, "_doc", id])?;
        let resp = self.send(req, "Delete").await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::Absent);
        }
        Self::expect_success(resp, "Delete").await?;
        Ok(DeleteOutcome::Removed)
    }

    async fn bulk_replace(&self, items: Vec<Item>) -> Result<usize> {
        let start = Instant::now();
        let items: Vec<Item> = dedupe_latest(items).into_values().collect();
        let new_index = self.new_index_name();
        let old = self.alias_targets().await?;

        if let Err(e) = self.load_new_index(&new_index, &items).await {
            if let Err(cleanup) = self.delete_index(&new_index).await {
                warn!(index = %new_index, error = %cleanup, "Failed to remove partial index");
            }
            return Err(e);
        }

        self.swap_alias(&new_index, &old).await?;

        for index in &old {
            if let Err(e) = self.delete_index(index).await {
                warn!(index = %index, error = %e, "Failed to delete replaced index");
            }
        }

        info!(
            alias = %self.config.alias,
            index = %new_index,
            replaced = ?old,
            count = items.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Bulk replace completed"
        );
        Ok(items.len())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.count().await? == 0)
    }

    async fn get(&self, id: &str) -> Result<Option<Item>> {
        let req = self.request(Method::GET, &[&self.config.alias, "_doc", id])?;
        let resp = self.send(req, "Get").await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let mut body = Self::expect_success(resp, "Get").await?;
        if !body["found"].as_bool().unwrap_or(false) {
            return Ok(None);
        }
        let source = body.get_mut("_source").map(Value::take).unwrap_or(Value::Null);
        let item = serde_json::from_value(source)?;
        Ok(Some(item))
    }

    async fn count(&self) -> Result<usize> {
        let req = self.request(Method::GET, &[&self.config.alias, "_count"])?;
        let resp = self.send(req, "Count").await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let body = Self::expect_success(resp, "Count").await?;
        Ok(body["count"].as_u64().unwrap_or(0) as usize)
    }

    async fn latest_version(&self) -> Result<Option<u64>> {
        let req = self
            .request(Method::POST, &[&self.config.alias, "_search"])?
            .json(&json!({
                "size": 0,
                "aggs": { "max_version": { "max": { "field": "version" } } }
            }));
        let resp = self.send(req, "Latest version").await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::expect_success(resp, "Latest version").await?;
        Ok(body["aggregations"]["max_version"]["value"]
            .as_f64()
            .map(|v| v as u64))
    }

    fn name(&self) -> &'static str {
        "elasticsearch"
    }
}

#[async_trait]
impl Lifecycle for ElasticIndexStore {
    async fn start(&self) -> Result<()> {
        self.health_check().await?;
        self.ensure_alias().await?;
        self.running.store(true, Ordering::SeqCst);
        info!(alias = %self.config.alias, hosts = self.hosts.len(), "Elasticsearch index store started");
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
impl HealthCheck for ElasticIndexStore {
    async fn health_check(&self) -> Result<()> {
        let req = self.request(Method::GET, &["_cluster", "health"])?;
        let resp = self.send(req, "Health check").await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SyncError::index(format!("Cluster unhealthy: {}", resp.status())))
        }
    }

    fn component_name(&self) -> &'static str {
        "elastic_index_store"
    }
}
