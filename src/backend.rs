//! Service wiring.
//!
//! The retrieval backend is chosen once, from `[retrieval].backend`, and
//! handed to the pipeline as a [`RetrievalPort`] trait object. Nothing
//! inside the pipeline knows which backend it is talking to.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::{Config, RetrievalConfig};
use crate::dify::DifyBackend;
use crate::llm::LlmClient;
use crate::models::{ProcessingConfig, RequestOptions};
use crate::pipeline::Pipeline;
use crate::rerank::RerankClient;
use crate::traits::{LanguageModelPort, RerankPort, RetrievalPort};

/// Construct the retrieval backend named in the config.
pub fn create_backend(config: &RetrievalConfig) -> Result<Arc<dyn RetrievalPort>> {
    match config.backend.as_str() {
        "dify" => Ok(Arc::new(
            DifyBackend::new(config).context("Failed to create Dify backend")?,
        )),
        other => anyhow::bail!("Unknown retrieval backend: '{}'", other),
    }
}

/// Everything a request needs: config plus the constructed ports.
pub struct Services {
    config: Arc<Config>,
    pipeline: Pipeline,
}

impl Services {
    /// Build real HTTP clients from the configuration.
    pub fn from_config(config: Config) -> Result<Self> {
        let retrieval = create_backend(&config.retrieval)?;
        let llm: Arc<dyn LanguageModelPort> =
            Arc::new(LlmClient::new(&config.llm).context("Failed to create LLM client")?);
        let reranker: Option<Arc<dyn RerankPort>> = match &config.rerank {
            Some(r) => Some(Arc::new(
                RerankClient::new(r).context("Failed to create rerank client")?,
            )),
            None => None,
        };
        Ok(Self::with_ports(config, retrieval, llm, reranker))
    }

    /// Assemble services from already-built ports.
    pub fn with_ports(
        config: Config,
        retrieval: Arc<dyn RetrievalPort>,
        llm: Arc<dyn LanguageModelPort>,
        reranker: Option<Arc<dyn RerankPort>>,
    ) -> Self {
        let mut pipeline = Pipeline::new(retrieval, llm);
        if let Some(r) = reranker {
            pipeline = pipeline.with_reranker(r);
        }
        Self {
            config: Arc::new(config),
            pipeline,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Resolve and validate a per-request configuration.
    pub fn processing_config(
        &self,
        resource_id: &str,
        options: &RequestOptions,
    ) -> Result<ProcessingConfig> {
        let cfg = ProcessingConfig::from_defaults(resource_id, &self.config.pipeline, options);
        cfg.validate()?;
        Ok(cfg)
    }
}
