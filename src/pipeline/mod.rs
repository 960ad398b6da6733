//! The answer orchestration pipeline.
//!
//! [`Pipeline::process`] is the single entry point. It sequences the
//! stages and owns per-request state:
//!
//! ```text
//! query ─▶ understand ─▶ discover ─▶ generate (direct ∥ advanced)
//!                                        │
//!                 DatasetResult ◀─ reflect ◀─ synthesize
//! ```
//!
//! | Outcome | Returned as |
//! |---------|-------------|
//! | invalid configuration | `Err(PipelineError::InvalidConfig)` before any external call |
//! | retrieval down during discovery | `Err(PipelineError::BackendUnavailable)` |
//! | no files / no candidates / empty merge | `Ok` with status `no_answer`, reflection skipped |
//! | threshold met or reflection off | `Ok` with status `passed` |
//! | iteration cap reached | `Ok` with status `exhausted` |
//!
//! One deadline (`request_timeout`) covers the whole request. Stages that
//! are cut short contribute whatever finished, and the result is flagged
//! `timed_out`.

pub mod deadline;
pub mod discovery;
pub mod generation;
pub mod query;
pub mod reflection;
pub mod synthesis;

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{DatasetResult, ProcessingConfig};
use crate::traits::{LanguageModelPort, RerankPort, RetrievalPort};
use deadline::Deadline;

/// Stateless orchestrator over the three ports.
///
/// Cheap to clone; concurrent `process` calls share nothing but the port
/// handles.
#[derive(Clone)]
pub struct Pipeline {
    retrieval: Arc<dyn RetrievalPort>,
    llm: Arc<dyn LanguageModelPort>,
    reranker: Option<Arc<dyn RerankPort>>,
}

impl Pipeline {
    pub fn new(retrieval: Arc<dyn RetrievalPort>, llm: Arc<dyn LanguageModelPort>) -> Self {
        Self {
            retrieval,
            llm,
            reranker: None,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn RerankPort>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn retrieval(&self) -> &dyn RetrievalPort {
        self.retrieval.as_ref()
    }

    pub fn llm(&self) -> &dyn LanguageModelPort {
        self.llm.as_ref()
    }

    /// Answer `query` against `config.resource_id`.
    pub async fn process(
        &self,
        query: &str,
        config: &ProcessingConfig,
    ) -> Result<DatasetResult, PipelineError> {
        config.validate()?;
        let query = query.trim();
        if query.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "query must not be empty".to_string(),
            ));
        }

        let span = info_span!(
            "process",
            request_id = %Uuid::new_v4(),
            resource_id = %config.resource_id
        );
        self.run(query, config).instrument(span).await
    }

    async fn run(
        &self,
        query: &str,
        config: &ProcessingConfig,
    ) -> Result<DatasetResult, PipelineError> {
        let deadline = Deadline::after(config.request_timeout);
        let llm = self.llm.as_ref();
        let retrieval = self.retrieval.as_ref();

        info!(
            mode = config.reflection_mode.as_str(),
            method = config.search_method.as_str(),
            "processing query"
        );

        let plan = query::understand(llm, query, config, &deadline).await;

        let mut found =
            discovery::discover(retrieval, llm, query, &plan.sub_queries, config, &deadline)
                .await?;
        let mut sub_queries = plan.sub_queries.clone();
        if found.files.is_empty() && !deadline.expired() {
            if let Some(relaxed) = &plan.relaxed_query {
                info!(query = %relaxed, "no files found, retrying with relaxed query");
                let retry = vec![relaxed.clone()];
                found =
                    discovery::discover(retrieval, llm, query, &retry, config, &deadline).await?;
                sub_queries = retry;
            }
        }
        let mut timed_out = found.timed_out;

        let mut result = DatasetResult::no_answer(config, query, sub_queries);
        if found.files.is_empty() {
            info!("no files discovered");
            result.timed_out = timed_out || deadline.expired();
            return Ok(result);
        }
        result.files = found.files.iter().map(|f| f.file_name.clone()).collect();

        let generated = generation::generate(
            retrieval,
            llm,
            query,
            &plan.search_query,
            &found.files,
            config,
            &deadline,
        )
        .await?;
        timed_out |= generated.timed_out;
        result.candidates_considered = generated.candidates.len();
        if generated.candidates.is_empty() {
            info!("no candidate answers");
            result.timed_out = timed_out;
            return Ok(result);
        }

        let merged = synthesis::synthesize(
            llm,
            self.reranker.as_deref(),
            query,
            generated.candidates,
            config.custom_instructions.as_deref(),
            &deadline,
        )
        .await;
        timed_out |= merged.timed_out;
        if merged.answer.trim().is_empty() {
            warn!("synthesis produced no answer");
            result.timed_out = timed_out;
            return Ok(result);
        }

        let reflected = reflection::reflect(
            llm,
            query,
            &merged.answer,
            &merged.citations,
            config,
            &deadline,
        )
        .await;
        timed_out |= reflected.timed_out;

        result.answer = reflected.answer;
        result.citations = merged.citations;
        result.reflection = reflected.meta;
        result.status = reflected.status;
        result.timed_out = timed_out;
        result.completed_at = Utc::now();

        info!(
            status = ?result.status,
            citations = result.citations.len(),
            timed_out,
            "request complete"
        );
        Ok(result)
    }
}
