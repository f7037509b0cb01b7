use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::config::IndexSettings;
use crate::error::{IndexerError, Result, WriteErrorKind};
use crate::index::{FieldMatch, FieldPatch, SearchIndex};
use crate::models::{IndexedTransaction, TransactionId};

/// Client for an Elasticsearch-compatible document index.
///
/// Requests rotate across the configured nodes. Transport failures, timeouts,
/// throttling, 5xx and version conflicts are retriable; any other rejection is
/// permanent.
#[derive(Debug)]
pub struct ElasticIndex {
    client: Client,
    nodes: Vec<String>,
    cursor: AtomicUsize,
    username: Option<String>,
    password: Option<String>,
    refresh_on_write: bool,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(rename = "_source")]
    source: Value,
}

#[derive(Debug, Deserialize)]
struct UpdateByQueryResponse {
    #[serde(default)]
    updated: u64,
    #[serde(default)]
    failures: Vec<Value>,
}

impl ElasticIndex {
    pub fn new(settings: &IndexSettings) -> Result<Self> {
        if settings.urls.is_empty() {
            return Err(IndexerError::Config("no index endpoint configured".into()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| IndexerError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            nodes: settings
                .urls
                .iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            cursor: AtomicUsize::new(0),
            username: settings.username.clone(),
            password: settings.password.clone(),
            refresh_on_write: settings.refresh_on_write,
        })
    }

    fn next_node(&self) -> &str {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        &self.nodes[n % self.nodes.len()]
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.next_node(), path);
        let builder = self.client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    async fn send(&self, operation: &'static str, builder: RequestBuilder) -> Result<Response> {
        builder
            .send()
            .await
            .map_err(|e| IndexerError::retriable(operation, format!("request failed: {}", e)))
    }

    fn write_refresh(&self) -> &'static [(&'static str, &'static str)] {
        if self.refresh_on_write {
            &[("refresh", "wait_for")]
        } else {
            &[]
        }
    }
}

/// Classifies a rejected request.
pub fn classify_status(status: StatusCode, body: &str) -> WriteErrorKind {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::CONFLICT
        || body.contains("version_conflict_engine_exception")
    {
        WriteErrorKind::Retriable
    } else {
        WriteErrorKind::Permanent
    }
}

async fn ensure_success(operation: &'static str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} - {}", status, body);
    Err(match classify_status(status, &body) {
        WriteErrorKind::Retriable => IndexerError::retriable(operation, message),
        WriteErrorKind::Permanent => IndexerError::permanent(operation, message),
    })
}

/// Painless source assigning every patched field from `params`.
pub fn painless_assignments(patch: &FieldPatch) -> String {
    patch
        .fields()
        .map(|field| format!("ctx._source.{0} = params.{0};", field))
        .collect::<Vec<_>>()
        .join(" ")
}

fn collection_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "id": { "type": "long" },
                "account_id": { "type": "long" },
                "category_id": { "type": "long" },
                "category_name": { "type": "keyword" },
                "type": { "type": "keyword" },
                "description": { "type": "text" },
                "name": { "type": "text" },
                "category_logo_hash_id": { "type": "keyword" },
                "category_logo": { "type": "keyword", "index": false },
                "sum": { "type": "double" },
                "currency_id": { "type": "long" },
                "account_type": { "type": "keyword" },
                "created_at": { "type": "date" },
                "date": { "type": "date", "format": "strict_date_optional_time||yyyy-MM-dd" },
                "status": { "type": "keyword" }
            }
        }
    })
}

#[async_trait]
impl SearchIndex for ElasticIndex {
    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        let response = self
            .send("ensure_collection", self.request(Method::HEAD, collection))
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return ensure_success("ensure_collection", response).await.map(|_| ());
        }

        let response = self
            .send(
                "ensure_collection",
                self.request(Method::PUT, collection)
                    .json(&collection_mapping()),
            )
            .await?;
        let status = response.status();
        if status.is_success() {
            tracing::info!(collection, "Created index collection");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if body.contains("resource_already_exists_exception") {
            return Ok(());
        }
        Err(IndexerError::permanent(
            "ensure_collection",
            format!("{} - {}", status, body),
        ))
    }

    async fn put_document(
        &self,
        collection: &str,
        id: TransactionId,
        document: &IndexedTransaction,
    ) -> Result<()> {
        let path = format!("{}/_doc/{}", collection, id);
        let response = self
            .send(
                "put_document",
                self.request(Method::PUT, &path)
                    .query(self.write_refresh())
                    .json(document),
            )
            .await?;
        ensure_success("put_document", response).await?;
        Ok(())
    }

    async fn patch_document(
        &self,
        collection: &str,
        id: TransactionId,
        patch: &FieldPatch,
        upsert: &IndexedTransaction,
    ) -> Result<()> {
        let path = format!("{}/_update/{}", collection, id);
        let body = json!({ "doc": patch, "upsert": upsert });
        let response = self
            .send(
                "patch_document",
                self.request(Method::POST, &path)
                    .query(self.write_refresh())
                    .json(&body),
            )
            .await?;
        ensure_success("patch_document", response).await?;
        Ok(())
    }

    async fn update_by_query(
        &self,
        collection: &str,
        query: &FieldMatch,
        patch: &FieldPatch,
    ) -> Result<u64> {
        let path = format!("{}/_update_by_query", collection);
        let mut term = Map::new();
        term.insert(query.field.clone(), query.value.clone());
        let body = json!({
            "query": { "term": term },
            "script": {
                "lang": "painless",
                "source": painless_assignments(patch),
                "params": patch,
            }
        });
        let refresh: &[(&str, &str)] = if self.refresh_on_write {
            &[("refresh", "true")]
        } else {
            &[]
        };

        let response = self
            .send(
                "update_by_query",
                self.request(Method::POST, &path).query(refresh).json(&body),
            )
            .await?;
        let response = ensure_success("update_by_query", response).await?;
        let result: UpdateByQueryResponse = response.json().await.map_err(|e| {
            IndexerError::retriable("update_by_query", format!("unreadable response: {}", e))
        })?;

        if let Some(failure) = result.failures.first() {
            let text = failure.to_string();
            let kind = if text.contains("version_conflict_engine_exception") {
                WriteErrorKind::Retriable
            } else {
                WriteErrorKind::Permanent
            };
            let message = format!("{} failure(s), first: {}", result.failures.len(), text);
            return Err(match kind {
                WriteErrorKind::Retriable => IndexerError::retriable("update_by_query", message),
                WriteErrorKind::Permanent => IndexerError::permanent("update_by_query", message),
            });
        }

        Ok(result.updated)
    }

    async fn refresh(&self, collection: &str) -> Result<()> {
        let path = format!("{}/_refresh", collection);
        let response = self
            .send("refresh", self.request(Method::POST, &path))
            .await?;
        ensure_success("refresh", response).await?;
        Ok(())
    }

    async fn get_document(
        &self,
        collection: &str,
        id: TransactionId,
    ) -> Result<Option<IndexedTransaction>> {
        let path = format!("{}/_doc/{}", collection, id);
        let response = self
            .send("get_document", self.request(Method::GET, &path))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success("get_document", response).await?;
        let body: GetResponse = response.json().await.map_err(|e| {
            IndexerError::retriable("get_document", format!("unreadable response: {}", e))
        })?;
        serde_json::from_value(body.source)
            .map(Some)
            .map_err(|e| IndexerError::permanent("get_document", format!("unexpected document: {}", e)))
    }
}
