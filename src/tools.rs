//! Built-in tools.
//!
//! | Tool | Purpose |
//! |------|---------|
//! | `assistant` | Full answer pipeline ([`Pipeline::process`](crate::pipeline::Pipeline::process)) |
//! | `file_discover` | Query understanding + file discovery, with optional recall evaluation |
//! | `file_lister` | Every file name in a resource |
//! | `keyword_generator` | Alternative keyword sets for a query |
//! | `retriever` | Raw chunk search |
//!
//! Parameter validation errors use the phrases `must not be empty` and
//! `invalid` so the server maps them to `400 bad_request`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::PipelineError;
use crate::models::{
    ProcessingConfig, ReflectionMode, RequestOptions, ResultStatus, SearchMethod, SearchRequest,
};
use crate::pipeline::deadline::Deadline;
use crate::pipeline::{discovery, generation, query, reflection};
use crate::traits::{Tool, ToolContext};

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    let v = params[key].as_str().unwrap_or("").trim();
    if v.is_empty() {
        anyhow::bail!("{} must not be empty", key);
    }
    Ok(v)
}

fn optional_str(params: &Value, key: &str) -> Option<String> {
    params[key]
        .as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn optional_usize(params: &Value, key: &str) -> Result<Option<usize>> {
    match &params[key] {
        Value::Null => Ok(None),
        v => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| anyhow::anyhow!("invalid {}: expected a non-negative integer", key)),
    }
}

fn parse_enum<T: std::str::FromStr<Err = String>>(params: &Value, key: &str) -> Result<Option<T>> {
    match optional_str(params, key) {
        Some(s) => s.parse::<T>().map(Some).map_err(|e| anyhow::anyhow!(e)),
        None => Ok(None),
    }
}

/// Read the request options shared by `assistant` and `file_discover`.
fn request_options(params: &Value) -> Result<RequestOptions> {
    let threshold = match &params["reflection_threshold"] {
        Value::Null => None,
        v => Some(
            v.as_f64()
                .ok_or_else(|| anyhow::anyhow!("invalid reflection_threshold: expected a number"))?,
        ),
    };
    Ok(RequestOptions {
        search_method: parse_enum::<SearchMethod>(params, "search_method")?,
        top_k_recall: optional_usize(params, "top_k_recall")?,
        top_k_return: optional_usize(params, "top_k_return")?,
        reflection_mode: parse_enum::<ReflectionMode>(params, "reflection_mode")?,
        reflection_threshold: threshold,
        max_reflection_iterations: optional_usize(params, "max_reflection_iterations")?
            .map(|n| {
                u32::try_from(n)
                    .map_err(|_| anyhow::anyhow!("invalid max_reflection_iterations: {} is out of range", n))
            })
            .transpose()?,
        enable_query_rewriting: params["enable_query_rewriting"].as_bool(),
        custom_instructions: optional_str(params, "custom_instructions"),
        document_name: optional_str(params, "document_name"),
    })
}

fn processing_config(ctx: &ToolContext, params: &Value) -> Result<ProcessingConfig> {
    let resource_id = required_str(params, "resource_id")?;
    let options = request_options(params)?;
    ctx.services().processing_config(resource_id, &options)
}

fn common_properties() -> Value {
    json!({
        "resource_id": { "type": "string", "description": "Knowledge-base resource (dataset) id" },
        "search_method": {
            "type": "string",
            "enum": [
                "hybrid_search", "semantic_search", "keyword_search", "full_text_search",
                "hybrid", "semantic", "vector_search", "keyword", "full_text"
            ]
        },
        "top_k_recall": { "type": "integer", "description": "Chunks retrieved per sub-query" },
        "top_k_return": { "type": "integer", "description": "Files kept after ranking" },
        "document_name": { "type": "string", "description": "Restrict search to one document" },
        "enable_query_rewriting": { "type": "boolean" }
    })
}

// ═══════════════════════════════════════════════════════════════════════
// assistant
// ═══════════════════════════════════════════════════════════════════════

pub struct AssistantTool;

#[async_trait]
impl Tool for AssistantTool {
    fn name(&self) -> &str {
        "assistant"
    }

    fn description(&self) -> &str {
        "Answer a question from a knowledge base with citations"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        let mut props = common_properties();
        props["query"] = json!({ "type": "string", "description": "Question to answer" });
        props["reflection_mode"] = json!({
            "type": "string",
            "enum": ["off", "standard", "comprehensive", "none", "disabled"]
        });
        props["reflection_threshold"] = json!({ "type": "number", "minimum": 0.0, "maximum": 1.0 });
        props["max_reflection_iterations"] = json!({ "type": "integer", "minimum": 0, "maximum": 5 });
        props["custom_instructions"] = json!({ "type": "string" });
        json!({
            "type": "object",
            "properties": props,
            "required": ["resource_id", "query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = required_str(&params, "query")?;
        let config = processing_config(ctx, &params)?;

        let result = match ctx.services().pipeline().process(query, &config).await {
            Ok(r) => r,
            Err(PipelineError::InvalidConfig(msg)) => anyhow::bail!("invalid request: {}", msg),
            Err(e) => return Err(e.into()),
        };

        if result.timed_out && result.status == ResultStatus::NoAnswer {
            return Ok(json!({ "error": "Request timeout", "status": "timeout" }));
        }

        let mut value = serde_json::to_value(&result)?;
        value["user_feedback"] = json!(reflection::user_feedback(&result.reflection));
        Ok(value)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// file_discover
// ═══════════════════════════════════════════════════════════════════════

pub struct FileDiscoverTool;

#[derive(Serialize)]
struct DiscoveredFile {
    file_id: String,
    file_name: String,
    score: f64,
    chunks: usize,
}

#[async_trait]
impl Tool for FileDiscoverTool {
    fn name(&self) -> &str {
        "file_discover"
    }

    fn description(&self) -> &str {
        "Find the files in a knowledge base most relevant to a query"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        let mut props = common_properties();
        props["query"] = json!({ "type": "string" });
        props["expected_files"] = json!({
            "type": "array",
            "items": { "type": "string" },
            "description": "Known relevant file names; adds a recall report"
        });
        props["include_statistics"] = json!({ "type": "boolean", "default": false });
        json!({
            "type": "object",
            "properties": props,
            "required": ["resource_id", "query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query_text = required_str(&params, "query")?;
        let config = processing_config(ctx, &params)?;
        let pipeline = ctx.services().pipeline();
        let deadline = Deadline::after(config.request_timeout);

        let plan = query::understand(pipeline.llm(), query_text, &config, &deadline).await;
        let found = discovery::discover(
            pipeline.retrieval(),
            pipeline.llm(),
            query_text,
            &plan.sub_queries,
            &config,
            &deadline,
        )
        .await?;

        let files: Vec<DiscoveredFile> = found
            .files
            .iter()
            .map(|f| DiscoveredFile {
                file_id: f.file_id.clone(),
                file_name: f.file_name.clone(),
                score: f.score,
                chunks: f.chunks.len(),
            })
            .collect();
        let mut out = json!({
            "files": files,
            "sub_queries": plan.sub_queries,
            "expanded": found.expanded,
            "timed_out": found.timed_out,
        });

        let names: Vec<String> = found.files.iter().map(|f| f.file_name.clone()).collect();
        if let Some(expected) = params["expected_files"].as_array() {
            let expected: Vec<String> = expected
                .iter()
                .filter_map(|e| e.as_str())
                .map(str::to_string)
                .collect();
            out["recall"] = serde_json::to_value(discovery::evaluate_recall(&names, &expected))?;
        }
        if params["include_statistics"].as_bool().unwrap_or(false) {
            let total = pipeline
                .retrieval()
                .list_files(&config.resource_id)
                .await
                .context("failed to list files for statistics")?
                .len();
            out["statistics"] =
                serde_json::to_value(discovery::discovery_statistics(&found.files, total))?;
        }
        Ok(out)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// file_lister
// ═══════════════════════════════════════════════════════════════════════

pub struct FileListerTool;

#[async_trait]
impl Tool for FileListerTool {
    fn name(&self) -> &str {
        "file_lister"
    }

    fn description(&self) -> &str {
        "List every file in a knowledge base"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "resource_id": { "type": "string", "description": "Knowledge-base resource (dataset) id" }
            },
            "required": ["resource_id"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let resource_id = required_str(&params, "resource_id")?;
        let files = ctx
            .services()
            .pipeline()
            .retrieval()
            .list_files(resource_id)
            .await?;
        Ok(json!({ "total": files.len(), "files": files }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// keyword_generator
// ═══════════════════════════════════════════════════════════════════════

pub struct KeywordGeneratorTool;

#[async_trait]
impl Tool for KeywordGeneratorTool {
    fn name(&self) -> &str {
        "keyword_generator"
    }

    fn description(&self) -> &str {
        "Generate alternative keyword sets for searching a question"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "max_sets": { "type": "integer", "default": 5, "minimum": 1, "maximum": 10 }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = required_str(&params, "query")?;
        let max_sets = optional_usize(&params, "max_sets")?.unwrap_or(5).clamp(1, 10);
        let sets =
            generation::keyword_sets(ctx.services().pipeline().llm(), query, None, max_sets)
                .await?;
        Ok(json!({ "keyword_sets": sets }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// retriever
// ═══════════════════════════════════════════════════════════════════════

pub struct RetrieverTool;

#[async_trait]
impl Tool for RetrieverTool {
    fn name(&self) -> &str {
        "retriever"
    }

    fn description(&self) -> &str {
        "Search a knowledge base and return raw chunks"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        let mut props = common_properties();
        props["query"] = json!({ "type": "string" });
        props["top_k"] = json!({ "type": "integer", "description": "Chunks to return; defaults to top_k_return" });
        json!({
            "type": "object",
            "properties": props,
            "required": ["resource_id", "query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = required_str(&params, "query")?;
        let config = processing_config(ctx, &params)?;
        let top_k = optional_usize(&params, "top_k")?.unwrap_or(config.top_k_return);
        let request = SearchRequest::new(query, &config, top_k);
        let chunks = ctx
            .services()
            .pipeline()
            .retrieval()
            .search(&config.resource_id, &request)
            .await?;
        Ok(json!({ "total": chunks.len(), "chunks": chunks }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Parameter validation
// ═══════════════════════════════════════════════════════════════════════

/// Serializable tool description for `GET /tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub builtin: bool,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
}

impl ToolInfo {
    pub fn of(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            builtin: tool.is_builtin(),
            parameters: tool.parameters_schema(),
        }
    }
}

/// Check `params` against a tool schema: required keys, primitive types,
/// and enums. Missing optional keys with a `default` are filled in.
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value> {
    let given = match params {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => anyhow::bail!("invalid parameters: expected an object, got {}", type_name(other)),
    };
    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    for field in &required {
        if given.get(*field).map_or(true, Value::is_null) {
            anyhow::bail!("missing required parameter: {}", field);
        }
    }

    let mut result = given.clone();
    for (name, prop) in &properties {
        match given.get(name) {
            Some(Value::Null) | None => {
                if let Some(default) = prop.get("default") {
                    result.insert(name.clone(), default.clone());
                }
            }
            Some(value) => {
                if let Some(expected) = prop.get("type").and_then(|t| t.as_str()) {
                    let ok = match expected {
                        "string" => value.is_string(),
                        "integer" => value.is_i64() || value.is_u64(),
                        "number" => value.is_number(),
                        "boolean" => value.is_boolean(),
                        "array" => value.is_array(),
                        "object" => value.is_object(),
                        _ => true,
                    };
                    if !ok {
                        anyhow::bail!(
                            "invalid parameter '{}': expected {}, got {}",
                            name,
                            expected,
                            type_name(value)
                        );
                    }
                }
                if let Some(allowed) = prop.get("enum").and_then(|e| e.as_array()) {
                    if !allowed.contains(value) {
                        let names: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
                        anyhow::bail!(
                            "invalid parameter '{}': must be one of [{}], got {}",
                            name,
                            names.join(", "),
                            value
                        );
                    }
                }
            }
        }
    }
    Ok(Value::Object(result))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_fills_defaults_and_checks_types() {
        let schema = KeywordGeneratorTool.parameters_schema();
        let out = validate_params(&schema, &json!({"query": "fees"})).unwrap();
        assert_eq!(out["max_sets"], 5);

        let err = validate_params(&schema, &json!({"query": 3})).unwrap_err();
        assert!(err.to_string().contains("invalid parameter 'query'"));

        let err = validate_params(&schema, &json!({})).unwrap_err();
        assert!(err.to_string().contains("missing required parameter: query"));
    }

    #[test]
    fn validate_checks_enums() {
        let schema = AssistantTool.parameters_schema();
        let err = validate_params(
            &schema,
            &json!({"resource_id": "kb", "query": "q", "reflection_mode": "always"}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be one of"));
    }

    #[test]
    fn request_options_parse() {
        let opts = request_options(&json!({
            "search_method": "semantic_search",
            "top_k_return": 4,
            "reflection_mode": "off",
            "reflection_threshold": 0.5,
            "max_reflection_iterations": 1,
            "document_name": "  "
        }))
        .unwrap();
        assert_eq!(opts.search_method, Some(SearchMethod::SemanticSearch));
        assert_eq!(opts.top_k_return, Some(4));
        assert_eq!(opts.reflection_mode, Some(ReflectionMode::Off));
        assert_eq!(opts.max_reflection_iterations, Some(1));
        assert_eq!(opts.document_name, None);

        assert!(request_options(&json!({"top_k_return": -1})).is_err());
        assert!(request_options(&json!({"search_method": "fuzzy"})).is_err());
    }

    #[test]
    fn oversized_iteration_count_is_rejected() {
        let err = request_options(&json!({"max_reflection_iterations": 4294967298u64})).unwrap_err();
        assert!(err.to_string().contains("invalid max_reflection_iterations"));
    }

    #[test]
    fn schema_accepts_mode_aliases() {
        let schema = AssistantTool.parameters_schema();
        let params = json!({
            "resource_id": "kb",
            "query": "q",
            "search_method": "hybrid",
            "reflection_mode": "none"
        });
        let checked = validate_params(&schema, &params).unwrap();
        let opts = request_options(&checked).unwrap();
        assert_eq!(opts.search_method, Some(SearchMethod::HybridSearch));
        assert_eq!(opts.reflection_mode, Some(ReflectionMode::Off));

        let discover = FileDiscoverTool.parameters_schema();
        let params = json!({"resource_id": "kb", "query": "q", "search_method": "semantic"});
        assert!(validate_params(&discover, &params).is_ok());
    }
}
