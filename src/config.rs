//! Configuration loading.
//!
//! The TOML file names services and request defaults; credentials are never
//! read from it. Secrets come from the environment only:
//!
//! | Variable | Used by |
//! |----------|---------|
//! | `RETRIEVAL_API_KEY` | retrieval backend (`[retrieval]`) |
//! | `LLM_API_TOKEN` | language model (`[llm]`) |
//! | `RERANK_API_KEY` | rerank service (`[rerank]`) |
//!
//! Non-secret values can be overridden from the environment as well
//! (`RETRIEVAL_ENDPOINT`, `LLM_API_URL`, `LLM_MODEL`, `RERANK_URL`,
//! `RERANK_MODEL`), which is how container deployments usually configure
//! the server.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::models::{ReflectionMode, SearchMethod};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub retrieval: RetrievalConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub rerank: Option<RerankConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
    /// Ask the backend to rerank its own results before returning them.
    #[serde(default)]
    pub backend_reranking: bool,
    #[serde(default = "default_reranking_provider")]
    pub reranking_provider: String,
    #[serde(default = "default_reranking_model")]
    pub reranking_model: String,
    /// Populated from `RETRIEVAL_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_backend() -> String {
    "dify".to_string()
}
fn default_retrieval_timeout() -> u64 {
    30
}
fn default_reranking_provider() -> String {
    "cohere".to_string()
}
fn default_reranking_model() -> String {
    "rerank-multilingual-v2.0".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Populated from `LLM_API_TOKEN`.
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_max_tokens() -> u32 {
    1024
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
    /// Populated from `RERANK_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<String>,
}

/// Request defaults. Every field can be overridden per request through
/// [`RequestOptions`](crate::models::RequestOptions).
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default)]
    pub search_method: SearchMethod,
    #[serde(default = "default_top_k_recall")]
    pub top_k_recall: usize,
    #[serde(default = "default_top_k_return")]
    pub top_k_return: usize,
    #[serde(default)]
    pub reflection_mode: ReflectionMode,
    #[serde(default = "default_threshold")]
    pub reflection_threshold: f64,
    #[serde(default = "default_max_reflection_iterations")]
    pub max_reflection_iterations: u32,
    #[serde(default)]
    pub enable_query_rewriting: bool,
    /// Consult the discovery quality gate in `standard` reflection mode too.
    #[serde(default)]
    pub quality_gate_in_standard: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_true")]
    pub use_content_booster: bool,
    #[serde(default = "default_max_boost_keywords")]
    pub max_boost_keywords: usize,
    #[serde(default = "default_boost_top_k")]
    pub boost_top_k: usize,
    #[serde(default = "default_max_chunks_per_file")]
    pub max_chunks_per_file: usize,
    #[serde(default = "default_expansion_factor")]
    pub expansion_factor: usize,
    #[serde(default = "default_threshold")]
    pub quality_gate_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            search_method: SearchMethod::default(),
            top_k_recall: default_top_k_recall(),
            top_k_return: default_top_k_return(),
            reflection_mode: ReflectionMode::default(),
            reflection_threshold: default_threshold(),
            max_reflection_iterations: default_max_reflection_iterations(),
            enable_query_rewriting: false,
            quality_gate_in_standard: false,
            request_timeout_secs: default_request_timeout(),
            max_workers: default_max_workers(),
            use_content_booster: true,
            max_boost_keywords: default_max_boost_keywords(),
            boost_top_k: default_boost_top_k(),
            max_chunks_per_file: default_max_chunks_per_file(),
            expansion_factor: default_expansion_factor(),
            quality_gate_threshold: default_threshold(),
        }
    }
}

fn default_top_k_recall() -> usize {
    100
}
fn default_top_k_return() -> usize {
    20
}
fn default_threshold() -> f64 {
    0.70
}
fn default_max_reflection_iterations() -> u32 {
    2
}
fn default_request_timeout() -> u64 {
    120
}
fn default_max_workers() -> usize {
    8
}
fn default_true() -> bool {
    true
}
fn default_max_boost_keywords() -> usize {
    3
}
fn default_boost_top_k() -> usize {
    5
}
fn default_max_chunks_per_file() -> usize {
    10
}
fn default_expansion_factor() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// One-line description of the configured services with credentials masked.
    pub fn masked_summary(&self) -> String {
        let mask = |k: &Option<String>| if k.is_some() { "***" } else { "<unset>" };
        let rerank = match &self.rerank {
            Some(r) => format!("{} ({}) key={}", r.url, r.model, mask(&r.api_key)),
            None => "disabled".to_string(),
        };
        format!(
            "retrieval={} {} key={}; llm={} ({}) key={}; rerank={}",
            self.retrieval.backend,
            self.retrieval.endpoint,
            mask(&self.retrieval.api_key),
            self.llm.url,
            self.llm.model,
            mask(&self.llm.api_key),
            rerank
        )
    }
}

/// Read, apply environment overrides, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content, |key| std::env::var(key).ok())
}

/// Parse config text. `env` resolves environment variables; tests pass a map.
pub fn parse_config<F>(content: &str, env: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = non_empty("RETRIEVAL_ENDPOINT") {
        config.retrieval.endpoint = v;
    }
    if let Some(v) = non_empty("LLM_API_URL") {
        config.llm.url = v;
    }
    if let Some(v) = non_empty("LLM_MODEL") {
        config.llm.model = v;
    }
    config.retrieval.api_key = non_empty("RETRIEVAL_API_KEY");
    config.llm.api_key = non_empty("LLM_API_TOKEN");

    match (non_empty("RERANK_URL"), config.rerank.as_mut()) {
        (Some(url), Some(rerank)) => rerank.url = url,
        (Some(url), None) => {
            config.rerank = Some(RerankConfig {
                url,
                model: String::new(),
                timeout_secs: default_retrieval_timeout(),
                api_key: None,
            })
        }
        _ => {}
    }
    if let Some(rerank) = config.rerank.as_mut() {
        if let Some(model) = non_empty("RERANK_MODEL") {
            rerank.model = model;
        }
        rerank.api_key = non_empty("RERANK_API_KEY");
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.retrieval.backend.as_str() {
        "dify" => {}
        other => anyhow::bail!("Unknown retrieval backend: '{}'. Must be dify.", other),
    }
    check_url("retrieval.endpoint", &config.retrieval.endpoint)?;
    check_url("llm.url", &config.llm.url)?;
    check_value("llm.model", &config.llm.model)?;

    if !(0.0..=2.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
    }
    if config.llm.max_tokens == 0 {
        anyhow::bail!("llm.max_tokens must be > 0");
    }

    if let Some(rerank) = &config.rerank {
        check_url("rerank.url", &rerank.url)?;
        check_value("rerank.model", &rerank.model)?;
    }

    let p = &config.pipeline;
    if p.top_k_return < 1 {
        anyhow::bail!("pipeline.top_k_return must be >= 1");
    }
    if p.top_k_recall < p.top_k_return {
        anyhow::bail!("pipeline.top_k_recall must be >= pipeline.top_k_return");
    }
    if !(0.0..=1.0).contains(&p.reflection_threshold) {
        anyhow::bail!("pipeline.reflection_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&p.quality_gate_threshold) {
        anyhow::bail!("pipeline.quality_gate_threshold must be in [0.0, 1.0]");
    }
    if p.max_reflection_iterations > crate::models::MAX_REFLECTION_ITERATIONS {
        anyhow::bail!(
            "pipeline.max_reflection_iterations must be <= {}",
            crate::models::MAX_REFLECTION_ITERATIONS
        );
    }
    if p.max_workers == 0 {
        anyhow::bail!("pipeline.max_workers must be > 0");
    }
    if p.expansion_factor < 1 {
        anyhow::bail!("pipeline.expansion_factor must be >= 1");
    }
    if p.request_timeout_secs == 0 {
        anyhow::bail!("pipeline.request_timeout_secs must be > 0");
    }

    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    Ok(())
}

fn check_value(field: &str, value: &str) -> Result<()> {
    let v = value.trim();
    if v.is_empty() {
        anyhow::bail!("{} must be set", field);
    }
    if (v.starts_with('<') && v.ends_with('>')) || v.to_lowercase().starts_with("your-") {
        anyhow::bail!("{} still holds a placeholder value: '{}'", field, v);
    }
    Ok(())
}

fn check_url(field: &str, value: &str) -> Result<()> {
    check_value(field, value)?;
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        anyhow::bail!("{} must start with http:// or https://", field);
    }
    Ok(())
}
