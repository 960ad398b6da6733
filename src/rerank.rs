//! HTTP rerank client (Cohere/Jina/TEI-style `/rerank` endpoints).
//!
//! Request: `{ model, query, documents, top_n }`.
//! Response: `{ results: [{ index, relevance_score }] }`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::cmp::Ordering;

use crate::config::RerankConfig;
use crate::error::PortError;
use crate::http;
use crate::traits::{RankedIndex, RerankPort};

const SERVICE: &str = "rerank";

pub struct RerankClient {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl RerankClient {
    pub fn new(config: &RerankConfig) -> Result<Self, PortError> {
        Ok(Self {
            client: http::client(SERVICE, config.timeout_secs)?,
            url: config.url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl RerankPort for RerankClient {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<RankedIndex>, PortError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "model": self.model,
            "query": query,
            "documents": documents,
            "top_n": documents.len(),
        });

        let response = http::send_with_retry(SERVICE, 1, || {
            let req = self.client.post(&self.url).json(&body);
            match &self.api_key {
                Some(key) => req.bearer_auth(key),
                None => req,
            }
        })
        .await?;
        let json = http::json_body(SERVICE, response).await?;
        parse_results(&json, documents.len())
    }
}

/// Parse and sort rerank results, dropping out-of-range indices.
fn parse_results(json: &Value, count: usize) -> Result<Vec<RankedIndex>, PortError> {
    let results = json
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| PortError::malformed(SERVICE, "missing results array"))?;

    let mut ranked: Vec<RankedIndex> = results
        .iter()
        .filter_map(|r| {
            let index = r.get("index")?.as_u64()? as usize;
            let relevance = r
                .get("relevance_score")
                .or_else(|| r.get("score"))
                .and_then(|s| s.as_f64())
                .unwrap_or(0.0);
            (index < count).then_some(RankedIndex { index, relevance })
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_and_drops_invalid_indices() {
        let json = json!({"results": [
            {"index": 0, "relevance_score": 0.2},
            {"index": 5, "relevance_score": 0.99},
            {"index": 1, "relevance_score": 0.8},
            {"relevance_score": 0.5}
        ]});
        let ranked = parse_results(&json, 2).unwrap();
        let order: Vec<usize> = ranked.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn missing_results_is_malformed() {
        assert!(matches!(
            parse_results(&json!({"data": []}), 3),
            Err(PortError::Malformed { .. })
        ));
    }
}
