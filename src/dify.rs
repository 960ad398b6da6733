//! Dify knowledge-base adapter.
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | search | `POST {endpoint}/v1/datasets/{id}/retrieve` |
//! | list files | `GET {endpoint}/v1/datasets/{id}/documents?page=&limit=` |
//! | enable built-in metadata | `GET …/metadata`, `POST …/metadata/built-in/enable` |
//!
//! Document-name filtering relies on Dify's built-in `document_name`
//! metadata field, which is disabled on new datasets. The adapter enables
//! it once per dataset before the first filtered search.

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RetrievalConfig;
use crate::error::PortError;
use crate::http;
use crate::models::{ChunkHit, SearchRequest};
use crate::traits::RetrievalPort;

const SERVICE: &str = "retrieval";
/// Dify's own default when `top_k` is not positive.
const DEFAULT_TOP_K: usize = 20;
const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 100;

pub struct DifyBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    backend_reranking: bool,
    reranking_provider: String,
    reranking_model: String,
    metadata_ready: Mutex<HashSet<String>>,
}

impl DifyBackend {
    pub fn new(config: &RetrievalConfig) -> Result<Self, PortError> {
        Ok(Self {
            client: http::client(SERVICE, config.timeout_secs)?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            backend_reranking: config.backend_reranking,
            reranking_provider: config.reranking_provider.clone(),
            reranking_model: config.reranking_model.clone(),
            metadata_ready: Mutex::new(HashSet::new()),
        })
    }

    fn url(&self, dataset: &str, path: &str) -> String {
        format!("{}/v1/datasets/{}{}", self.endpoint, dataset, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    fn retrieval_payload(&self, request: &SearchRequest) -> Value {
        let top_k = if request.top_k == 0 {
            DEFAULT_TOP_K
        } else {
            request.top_k
        };
        let mut model = json!({
            "search_method": request.method.as_str(),
            "reranking_enable": self.backend_reranking,
            "reranking_model": {
                "reranking_provider_name": self.reranking_provider,
                "reranking_model_name": self.reranking_model,
            },
            "top_k": top_k,
            "score_threshold_enabled": false,
        });
        if let Some(filter) = request.document_name.as_deref().and_then(document_filter) {
            model["metadata_filtering_conditions"] = filter;
        }
        json!({ "query": request.query, "retrieval_model": model })
    }

    /// Enable built-in metadata once per dataset. Failure only costs
    /// filtering precision, so it is logged and ignored.
    async fn ensure_metadata(&self, dataset: &str) {
        if self.metadata_ready.lock().await.contains(dataset) {
            return;
        }
        match self.enable_metadata(dataset).await {
            Ok(()) => {
                self.metadata_ready.lock().await.insert(dataset.to_string());
            }
            Err(e) => warn!(dataset, error = %e, "could not enable built-in metadata"),
        }
    }

    async fn enable_metadata(&self, dataset: &str) -> Result<(), PortError> {
        let url = self.url(dataset, "/metadata");
        let response =
            http::send_with_retry(SERVICE, 0, || self.authorize(self.client.get(&url))).await?;
        let status = http::json_body(SERVICE, response).await?;
        if status
            .get("built_in_field_enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return Ok(());
        }
        let url = self.url(dataset, "/metadata/built-in/enable");
        http::send_with_retry(SERVICE, 0, || self.authorize(self.client.post(&url))).await?;
        info!(dataset, "enabled built-in metadata");
        Ok(())
    }
}

#[async_trait]
impl RetrievalPort for DifyBackend {
    fn name(&self) -> &str {
        "dify"
    }

    async fn search(
        &self,
        resource_id: &str,
        request: &SearchRequest,
    ) -> Result<Vec<ChunkHit>, PortError> {
        if request.document_name.as_deref().and_then(document_filter).is_some() {
            self.ensure_metadata(resource_id).await;
        }
        let url = self.url(resource_id, "/retrieve");
        let body = self.retrieval_payload(request);
        let response = http::send_with_retry(SERVICE, 2, || {
            self.authorize(self.client.post(&url).json(&body))
        })
        .await?;
        let json = http::json_body(SERVICE, response).await?;
        let hits = parse_records(&json)?;
        debug!(dataset = resource_id, hits = hits.len(), "dify search");
        Ok(hits)
    }

    async fn list_files(&self, resource_id: &str) -> Result<Vec<String>, PortError> {
        let mut names = Vec::new();
        for page in 1..=MAX_PAGES {
            let url = format!(
                "{}?page={}&limit={}",
                self.url(resource_id, "/documents"),
                page,
                PAGE_SIZE
            );
            let response =
                http::send_with_retry(SERVICE, 2, || self.authorize(self.client.get(&url))).await?;
            let json = http::json_body(SERVICE, response).await?;
            let data = json
                .get("data")
                .and_then(|d| d.as_array())
                .ok_or_else(|| PortError::malformed(SERVICE, "documents response has no data array"))?;
            names.extend(
                data.iter()
                    .filter_map(|d| d.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string),
            );
            let more = json
                .get("has_more")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !more || data.is_empty() {
                break;
            }
        }
        Ok(names)
    }
}

/// Metadata filter for a document name; blank names give no filter.
pub fn document_filter(name: &str) -> Option<Value> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some(json!({
        "logical_operator": "and",
        "conditions": [{
            "name": "document_name",
            "comparison_operator": "is",
            "value": name,
        }]
    }))
}

/// Normalise Dify `records` into chunk hits, skipping unusable records.
fn parse_records(json: &Value) -> Result<Vec<ChunkHit>, PortError> {
    let records = json
        .get("records")
        .and_then(|r| r.as_array())
        .ok_or_else(|| PortError::malformed(SERVICE, "retrieve response has no records array"))?;

    let mut hits = Vec::with_capacity(records.len());
    for record in records {
        match parse_record(record) {
            Some(hit) => hits.push(hit),
            None => debug!("skipping unusable retrieval record"),
        }
    }
    Ok(hits)
}

fn parse_record(record: &Value) -> Option<ChunkHit> {
    let segment = record.get("segment")?;
    let content = segment.get("content")?.as_str()?.trim();
    if content.is_empty() {
        return None;
    }
    let document = segment.get("document");
    let str_at = |v: Option<&Value>, key: &str| {
        v.and_then(|v| v.get(key))
            .and_then(|s| s.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let metadata_name = document
        .and_then(|d| d.get("doc_metadata"))
        .and_then(|m| m.get("document_name"))
        .and_then(|n| n.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let file_name = metadata_name.or_else(|| str_at(document, "name"));
    let file_id = str_at(Some(segment), "document_id")
        .or_else(|| str_at(document, "id"))
        .or_else(|| file_name.clone())?;
    let file_name = file_name.unwrap_or_else(|| file_id.clone());

    let chunk_id = str_at(Some(segment), "id").unwrap_or_else(|| {
        let mut hasher = Sha256::new();
        hasher.update(file_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    });

    Some(ChunkHit {
        file_id,
        file_name,
        chunk_id,
        content: content.to_string(),
        score: record.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0),
        position: segment
            .get("position")
            .and_then(|p| p.as_u64())
            .map(|p| p as u32),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchMethod;

    fn backend() -> DifyBackend {
        DifyBackend::new(&RetrievalConfig {
            backend: "dify".into(),
            endpoint: "https://dify.example.com/".into(),
            timeout_secs: 5,
            backend_reranking: false,
            reranking_provider: "cohere".into(),
            reranking_model: "rerank-v2".into(),
            api_key: Some("k".into()),
        })
        .unwrap()
    }

    #[test]
    fn url_trims_trailing_slash() {
        assert_eq!(
            backend().url("ds1", "/retrieve"),
            "https://dify.example.com/v1/datasets/ds1/retrieve"
        );
    }

    #[test]
    fn payload_shape() {
        let req = SearchRequest {
            query: "fees".into(),
            method: SearchMethod::KeywordSearch,
            top_k: 0,
            document_name: Some("terms.pdf".into()),
        };
        let body = backend().retrieval_payload(&req);
        assert_eq!(body["query"], "fees");
        let model = &body["retrieval_model"];
        assert_eq!(model["search_method"], "keyword_search");
        assert_eq!(model["top_k"], 20);
        assert_eq!(model["reranking_model"]["reranking_model_name"], "rerank-v2");
        assert_eq!(
            model["metadata_filtering_conditions"]["conditions"][0]["value"],
            "terms.pdf"
        );
    }

    #[test]
    fn blank_document_name_has_no_filter() {
        assert!(document_filter("   ").is_none());
        let req = SearchRequest {
            query: "q".into(),
            method: SearchMethod::HybridSearch,
            top_k: 5,
            document_name: Some(" ".into()),
        };
        let body = backend().retrieval_payload(&req);
        assert!(body["retrieval_model"].get("metadata_filtering_conditions").is_none());
    }

    #[test]
    fn records_normalised_and_bad_ones_skipped() {
        let json = json!({"records": [
            {"segment": {"id": "s1", "content": "alpha", "position": 3, "document_id": "d1",
                         "document": {"id": "d1", "name": "a.pdf", "doc_metadata": {"document_name": "A.pdf"}}},
             "score": 0.91},
            {"segment": {"content": "   ", "document_id": "d2"}, "score": 0.5},
            {"segment": {"content": "beta", "document": {"name": "b.md"}}},
            {"score": 0.3},
            "garbage"
        ]});
        let hits = parse_records(&json).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].file_id, "d1");
        assert_eq!(hits[0].file_name, "A.pdf");
        assert_eq!(hits[0].chunk_id, "s1");
        assert_eq!(hits[0].position, Some(3));
        assert_eq!(hits[1].file_id, "b.md");
        assert_eq!(hits[1].chunk_id.len(), 16);
        assert_eq!(hits[1].score, 0.0);
    }

    #[test]
    fn missing_records_is_malformed() {
        assert!(matches!(
            parse_records(&json!({"error": "x"})),
            Err(PortError::Malformed { .. })
        ));
    }
}
