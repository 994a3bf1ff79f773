//! Bilingual web search for the collector's third tier and the patrol's
//! deferred-trigger evaluation.
//!
//! One query in the user's language and one translated counterpart run
//! concurrently; results are merged, URL-deduplicated, sorted by score,
//! and the top 8 formatted into a prompt-ready block.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::Result;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESULTS_PER_QUERY: usize = 5;
const MAX_FORMATTED: usize = 8;
pub const NO_RESULTS: &str = "검색 결과 없음";

/// Search capability the engine consumes. Failure surfaces as `None`.
#[async_trait]
pub trait SearchSource: Send + Sync {
    async fn search(&self, query: &str, language: &str) -> Option<String>;
}

pub struct WebSearchSource {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl WebSearchSource {
    pub fn new(api_key: Option<String>, base_url: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            api_key,
            base_url,
        }
    }

    async fn search_one(&self, query: &str) -> Result<Vec<Value>> {
        let Some(key) = &self.api_key else {
            return Ok(Vec::new());
        };
        let body: Value = self
            .http
            .post(format!("{}/search", self.base_url))
            .json(&json!({
                "api_key": key,
                "query": query,
                "search_depth": "advanced",
                "max_results": MAX_RESULTS_PER_QUERY,
            }))
            .send()
            .await?
            .json()
            .await?;
        Ok(body["results"].as_array().cloned().unwrap_or_default())
    }
}

#[async_trait]
impl SearchSource for WebSearchSource {
    async fn search(&self, query: &str, language: &str) -> Option<String> {
        if self.api_key.is_none() {
            debug!("search API key not set, skipping web search");
            return None;
        }
        let queries = bilingual_queries(query, language);
        let mut all_results: Vec<Vec<Value>> = Vec::with_capacity(queries.len());
        for q in &queries {
            match self.search_one(q).await {
                Ok(results) => all_results.push(results),
                Err(e) => {
                    warn!(query = %q, error = %e, "web search failed");
                    all_results.push(Vec::new());
                }
            }
        }
        Some(merge_and_format(all_results))
    }
}

/// Symbols are uppercase 2–6 letter tokens minus common English words.
pub fn extract_symbols(query: &str) -> Vec<String> {
    let noise: HashSet<&str> = [
        "WHY", "THE", "HOW", "WHAT", "WHEN", "AND", "FOR", "ARE", "BUT", "NOT",
    ]
    .into();
    let upper = query.to_uppercase();
    let mut seen = HashSet::new();
    let mut symbols = Vec::new();
    for token in upper.split(|c: char| !c.is_ascii_alphabetic()) {
        if token.len() >= 2
            && token.len() <= 6
            && !noise.contains(token)
            && seen.insert(token.to_string())
        {
            symbols.push(token.to_string());
        }
    }
    symbols
}

/// The original query plus one in the other language.
pub fn bilingual_queries(query: &str, language: &str) -> Vec<String> {
    let mut queries = vec![query.to_string()];
    let symbols = extract_symbols(query);
    let symbol_str = symbols.join(" ");

    if language == "ko" {
        if symbol_str.is_empty() {
            queries.push(format!("crypto {query} analysis"));
        } else {
            queries.push(format!("{symbol_str} crypto price analysis why"));
        }
    } else if symbol_str.is_empty() {
        queries.push(format!("암호화폐 {query} 분석"));
    } else {
        queries.push(format!("{symbol_str} 코인 분석 이유"));
    }
    queries
}

/// Merge result lists, dropping duplicate URLs, then format the top hits
/// by descending relevance score.
pub fn merge_and_format(result_sets: Vec<Vec<Value>>) -> String {
    let mut seen_urls = HashSet::new();
    let mut merged: Vec<Value> = Vec::new();
    for set in result_sets {
        for item in set {
            let url = item["url"].as_str().unwrap_or("").to_string();
            if seen_urls.insert(url) {
                merged.push(item);
            }
        }
    }
    if merged.is_empty() {
        return NO_RESULTS.to_string();
    }

    merged.sort_by(|a, b| {
        let sa = a["score"].as_f64().unwrap_or(0.0);
        let sb = b["score"].as_f64().unwrap_or(0.0);
        sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut lines = Vec::new();
    for (i, item) in merged.iter().take(MAX_FORMATTED).enumerate() {
        let title = item["title"].as_str().unwrap_or("제목 없음");
        let content: String = item["content"].as_str().unwrap_or("").chars().take(500).collect();
        let url = item["url"].as_str().unwrap_or("");
        lines.push(format!("[{}] {title}\n{content}\n출처: {url}", i + 1));
    }
    lines.join("\n\n")
}
