//! Per-user-namespace vector store for episode similarity retrieval.
//!
//! Three operations: embed-and-upsert, similarity query, delete. Callers
//! treat every failure as empty/none — episode persistence never depends
//! on vector availability.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Metadata keeps a bounded excerpt of the embedded text.
const METADATA_TEXT_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("vector store not configured")]
    NotConfigured,
}

pub type Result<T> = std::result::Result<T, VectorError>;

/// Namespace isolating one user's vectors: `user_{external_id}`.
pub fn namespace(external_id: &str) -> String {
    format!("user_{external_id}")
}

/// Vector id for an episode row.
pub fn episode_vector_id(episode_id: i64) -> String {
    format!("ep_{episode_id}")
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Embed `text` and upsert it under the episode's vector id.
    /// Upserting an existing id replaces the stored vector.
    async fn upsert(
        &self,
        namespace: &str,
        episode_id: i64,
        text: &str,
        metadata: &Value,
    ) -> Result<String>;

    /// Top-k episode ids by similarity, descending score.
    async fn query(&self, namespace: &str, text: &str, top_k: usize) -> Result<Vec<i64>>;

    async fn delete(&self, namespace: &str, episode_id: i64) -> Result<()>;
}

/// REST client for a hosted vector index with a server-side embedding
/// endpoint (Pinecone-style API surface).
pub struct HttpVectorStore {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    embed_model: String,
}

impl HttpVectorStore {
    pub fn new(api_key: String, base_url: String, embed_model: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            api_key,
            base_url,
            embed_model,
        }
    }

    fn configured(&self) -> Result<()> {
        if self.api_key.is_empty() || self.base_url.is_empty() {
            return Err(VectorError::NotConfigured);
        }
        Ok(())
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header("Api-Key", &self.api_key)
            .json(body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status >= 400 {
            let message = resp.text().await.unwrap_or_default();
            return Err(VectorError::Api { status, message });
        }
        Ok(resp.json().await?)
    }

    async fn embed(&self, text: &str, input_type: &str) -> Result<Vec<f64>> {
        let body = self
            .post(
                "/embed",
                &json!({
                    "model": self.embed_model,
                    "inputs": [{"text": text}],
                    "parameters": {"input_type": input_type},
                }),
            )
            .await?;
        let values = body["data"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|entry| entry["values"].as_array())
            .ok_or_else(|| VectorError::Parse("missing embedding values".to_string()))?;
        Ok(values.iter().filter_map(Value::as_f64).collect())
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn upsert(
        &self,
        namespace: &str,
        episode_id: i64,
        text: &str,
        metadata: &Value,
    ) -> Result<String> {
        self.configured()?;
        let vector_id = episode_vector_id(episode_id);
        let values = self.embed(text, "passage").await?;

        let mut metadata = metadata.clone();
        if let Some(map) = metadata.as_object_mut() {
            map.insert("episode_id".to_string(), json!(episode_id));
            let excerpt: String = text.chars().take(METADATA_TEXT_LIMIT).collect();
            map.insert("text".to_string(), json!(excerpt));
        }

        self.post(
            "/vectors/upsert",
            &json!({
                "namespace": namespace,
                "vectors": [{"id": vector_id, "values": values, "metadata": metadata}],
            }),
        )
        .await?;
        debug!(namespace, episode_id, "vector upserted");
        Ok(vector_id)
    }

    async fn query(&self, namespace: &str, text: &str, top_k: usize) -> Result<Vec<i64>> {
        self.configured()?;
        let values = self.embed(text, "query").await?;
        let body = self
            .post(
                "/query",
                &json!({
                    "namespace": namespace,
                    "vector": values,
                    "topK": top_k,
                    "includeMetadata": true,
                }),
            )
            .await?;
        let ids = body["matches"]
            .as_array()
            .map(|matches| {
                matches
                    .iter()
                    .filter_map(|m| m["metadata"]["episode_id"].as_i64())
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }

    async fn delete(&self, namespace: &str, episode_id: i64) -> Result<()> {
        self.configured()?;
        self.post(
            "/vectors/delete",
            &json!({
                "namespace": namespace,
                "ids": [episode_vector_id(episode_id)],
            }),
        )
        .await?;
        debug!(namespace, episode_id, "vector deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_and_vector_id_forms() {
        assert_eq!(namespace("812345"), "user_812345");
        assert_eq!(episode_vector_id(42), "ep_42");
    }

    #[tokio::test]
    async fn unconfigured_store_errors_cleanly() {
        let store = HttpVectorStore::new(String::new(), String::new(), "model".to_string());
        assert!(matches!(
            store.query("user_1", "query", 3).await,
            Err(VectorError::NotConfigured)
        ));
    }
}
