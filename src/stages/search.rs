//! Search tool feeding the research stage.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::SearchSection;

const RESULT_LIMIT: usize = 3;

#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<String>>;
}

pub fn search_client(section: &SearchSection, http: &reqwest::Client) -> Arc<dyn SearchClient> {
    match (&section.endpoint, &section.api_key) {
        (Some(endpoint), Some(api_key)) if section.is_live() => Arc::new(HttpSearchClient {
            http: http.clone(),
            endpoint: endpoint.clone(),
            api_key: api_key.clone(),
        }),
        _ => Arc::new(DemoSearch),
    }
}

pub struct HttpSearchClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(&self, query: &str) -> Result<Vec<String>> {
        let body: Value = self
            .http
            .get(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .query(&[("q", query), ("limit", &RESULT_LIMIT.to_string())])
            .send()
            .await
            .context("Failed to send search request")?
            .error_for_status()
            .context("Search endpoint returned error status")?
            .json()
            .await
            .context("Failed to parse search response")?;

        Ok(snippets_from(&body))
    }
}

/// Pull snippet text out of a search response body.
///
/// Results are read from `results`, falling back to `data`. Each item
/// contributes its `summary`, else its `title`, else its raw JSON.
pub fn snippets_from(body: &Value) -> Vec<String> {
    let items = body
        .get("results")
        .filter(|v| !v.is_null())
        .or_else(|| body.get("data"))
        .cloned()
        .unwrap_or(Value::Array(Vec::new()));

    match items {
        Value::Array(items) => items
            .iter()
            .take(RESULT_LIMIT)
            .map(|item| {
                ["summary", "title"]
                    .iter()
                    .find_map(|key| item.get(key).and_then(Value::as_str))
                    .map(str::to_string)
                    .unwrap_or_else(|| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
            })
            .collect(),
        other => vec![other.to_string()],
    }
}

/// Offline snippets used when no search credentials are configured.
pub struct DemoSearch;

#[async_trait]
impl SearchClient for DemoSearch {
    async fn search(&self, query: &str) -> Result<Vec<String>> {
        Ok(vec![
            format!("[search demo] Top finding for {}", query),
            format!("[search demo] Counterpoint for {}", query),
        ])
    }
}
