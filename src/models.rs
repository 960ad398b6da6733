//! Core data types shared across the pipeline.
//!
//! Data flows through these types in order:
//!
//! ```text
//! SearchRequest ──▶ RetrievalPort ──▶ ChunkHit ──group──▶ FileHit
//!                                                          │
//!                       CandidateAnswer (direct | advanced) ◀┘
//!                                  │ synthesis + reflection
//!                                  ▼
//!                            DatasetResult
//! ```
//!
//! Everything produced by a stage is immutable once built; stages hand
//! values forward rather than mutating shared state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::error::PipelineError;

/// Hard ceiling for `max_reflection_iterations`.
pub const MAX_REFLECTION_ITERATIONS: u32 = 5;

/// Upper bound on sub-queries emitted by query understanding.
pub const MAX_SUB_QUERIES: usize = 5;

// ═══════════════════════════════════════════════════════════════════════
// Options
// ═══════════════════════════════════════════════════════════════════════

/// Retrieval strategy understood by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    #[default]
    HybridSearch,
    #[serde(alias = "vector_search")]
    SemanticSearch,
    KeywordSearch,
    FullTextSearch,
}

impl SearchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMethod::HybridSearch => "hybrid_search",
            SearchMethod::SemanticSearch => "semantic_search",
            SearchMethod::KeywordSearch => "keyword_search",
            SearchMethod::FullTextSearch => "full_text_search",
        }
    }
}

impl fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hybrid_search" | "hybrid" => Ok(SearchMethod::HybridSearch),
            "semantic_search" | "vector_search" | "semantic" => Ok(SearchMethod::SemanticSearch),
            "keyword_search" | "keyword" => Ok(SearchMethod::KeywordSearch),
            "full_text_search" | "full_text" => Ok(SearchMethod::FullTextSearch),
            other => Err(format!(
                "invalid search method '{}': expected hybrid_search, semantic_search, keyword_search or full_text_search",
                other
            )),
        }
    }
}

/// How much quality control runs after synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionMode {
    Off,
    #[default]
    Standard,
    Comprehensive,
}

impl ReflectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReflectionMode::Off => "off",
            ReflectionMode::Standard => "standard",
            ReflectionMode::Comprehensive => "comprehensive",
        }
    }
}

impl FromStr for ReflectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" | "disabled" => Ok(ReflectionMode::Off),
            "standard" => Ok(ReflectionMode::Standard),
            "comprehensive" => Ok(ReflectionMode::Comprehensive),
            other => Err(format!(
                "invalid reflection mode '{}': expected off, standard or comprehensive",
                other
            )),
        }
    }
}

/// Per-request overrides. `None` means "use the configured default".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestOptions {
    pub search_method: Option<SearchMethod>,
    pub top_k_recall: Option<usize>,
    pub top_k_return: Option<usize>,
    pub reflection_mode: Option<ReflectionMode>,
    pub reflection_threshold: Option<f64>,
    pub max_reflection_iterations: Option<u32>,
    pub enable_query_rewriting: Option<bool>,
    pub custom_instructions: Option<String>,
    pub document_name: Option<String>,
}

/// Immutable configuration of one `process` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingConfig {
    pub resource_id: String,
    pub search_method: SearchMethod,
    pub top_k_recall: usize,
    pub top_k_return: usize,
    pub reflection_mode: ReflectionMode,
    pub reflection_threshold: f64,
    pub max_reflection_iterations: u32,
    pub enable_query_rewriting: bool,
    pub custom_instructions: Option<String>,
    pub document_name: Option<String>,
    pub quality_gate_in_standard: bool,
    pub quality_gate_threshold: f64,
    pub expansion_factor: usize,
    pub request_timeout: Duration,
    pub max_workers: usize,
    pub use_content_booster: bool,
    pub max_boost_keywords: usize,
    pub boost_top_k: usize,
    pub max_chunks_per_file: usize,
}

impl ProcessingConfig {
    /// Resolve request options against configured defaults.
    ///
    /// Blank `custom_instructions` / `document_name` are treated as unset.
    pub fn from_defaults(
        resource_id: &str,
        defaults: &PipelineConfig,
        options: &RequestOptions,
    ) -> Self {
        let non_blank = |v: &Option<String>| {
            v.as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            resource_id: resource_id.trim().to_string(),
            search_method: options.search_method.unwrap_or(defaults.search_method),
            top_k_recall: options.top_k_recall.unwrap_or(defaults.top_k_recall),
            top_k_return: options.top_k_return.unwrap_or(defaults.top_k_return),
            reflection_mode: options.reflection_mode.unwrap_or(defaults.reflection_mode),
            reflection_threshold: options
                .reflection_threshold
                .unwrap_or(defaults.reflection_threshold),
            max_reflection_iterations: options
                .max_reflection_iterations
                .unwrap_or(defaults.max_reflection_iterations),
            enable_query_rewriting: options
                .enable_query_rewriting
                .unwrap_or(defaults.enable_query_rewriting),
            custom_instructions: non_blank(&options.custom_instructions),
            document_name: non_blank(&options.document_name),
            quality_gate_in_standard: defaults.quality_gate_in_standard,
            quality_gate_threshold: defaults.quality_gate_threshold,
            expansion_factor: defaults.expansion_factor.max(1),
            request_timeout: Duration::from_secs(defaults.request_timeout_secs),
            max_workers: defaults.max_workers.max(1),
            use_content_booster: defaults.use_content_booster,
            max_boost_keywords: defaults.max_boost_keywords,
            boost_top_k: defaults.boost_top_k,
            max_chunks_per_file: defaults.max_chunks_per_file.max(1),
        }
    }

    /// Built from [`PipelineConfig::default`]; convenient in tests and tools.
    pub fn for_resource(resource_id: &str) -> Self {
        Self::from_defaults(
            resource_id,
            &PipelineConfig::default(),
            &RequestOptions::default(),
        )
    }

    /// Reject configurations that would violate pipeline bounds.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));
        if self.resource_id.is_empty() {
            return invalid("resource_id must not be empty".to_string());
        }
        if self.top_k_return < 1 {
            return invalid("top_k_return must be >= 1".to_string());
        }
        if self.top_k_recall < self.top_k_return {
            return invalid(format!(
                "top_k_recall ({}) must be >= top_k_return ({})",
                self.top_k_recall, self.top_k_return
            ));
        }
        if !(0.0..=1.0).contains(&self.reflection_threshold) {
            return invalid(format!(
                "reflection_threshold ({}) must be in [0.0, 1.0]",
                self.reflection_threshold
            ));
        }
        if self.max_reflection_iterations > MAX_REFLECTION_ITERATIONS {
            return invalid(format!(
                "max_reflection_iterations ({}) must be <= {}",
                self.max_reflection_iterations, MAX_REFLECTION_ITERATIONS
            ));
        }
        Ok(())
    }

    /// Whether file discovery should consult the quality gate.
    pub fn quality_gate_enabled(&self) -> bool {
        match self.reflection_mode {
            ReflectionMode::Comprehensive => true,
            ReflectionMode::Standard => self.quality_gate_in_standard,
            ReflectionMode::Off => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Retrieval
// ═══════════════════════════════════════════════════════════════════════

/// One call to the retrieval port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    pub query: String,
    pub method: SearchMethod,
    pub top_k: usize,
    /// Restrict results to the document with this name.
    pub document_name: Option<String>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, config: &ProcessingConfig, top_k: usize) -> Self {
        Self {
            query: query.into(),
            method: config.search_method,
            top_k,
            document_name: config.document_name.clone(),
        }
    }

    pub fn in_document(mut self, document_name: impl Into<String>) -> Self {
        self.document_name = Some(document_name.into());
        self
    }
}

/// A retrieved span of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkHit {
    pub file_id: String,
    pub file_name: String,
    pub chunk_id: String,
    pub content: String,
    pub score: f64,
    #[serde(default)]
    pub position: Option<u32>,
}

impl ChunkHit {
    pub fn citation(&self) -> Citation {
        Citation {
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
            chunk_id: self.chunk_id.clone(),
        }
    }
}

/// Chunks sharing one file id, best first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileHit {
    pub file_id: String,
    pub file_name: String,
    pub chunks: Vec<ChunkHit>,
    /// Maximum chunk score observed for this file.
    pub score: f64,
    /// Index of the earliest sub-query that surfaced this file.
    pub first_seen: usize,
}

// ═══════════════════════════════════════════════════════════════════════
// Answers
// ═══════════════════════════════════════════════════════════════════════

/// Reference to a retrieved chunk. Identity is `(file_id, chunk_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Citation {
    pub file_id: String,
    pub file_name: String,
    pub chunk_id: String,
}

impl Citation {
    pub fn key(&self) -> (&str, &str) {
        (&self.file_id, &self.chunk_id)
    }
}

/// Collapse citations to the same file+chunk, keeping first appearance order.
pub fn dedup_citations<'a, I>(citations: I) -> Vec<Citation>
where
    I: IntoIterator<Item = &'a Citation>,
{
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut out = Vec::new();
    for c in citations {
        if seen.insert((c.file_id.clone(), c.chunk_id.clone())) {
            out.push(c.clone());
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Direct,
    Advanced,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateAnswer {
    pub answer: String,
    pub confidence: f64,
    pub citations: Vec<Citation>,
    pub provenance: Provenance,
    /// File the answer was extracted from (advanced candidates only).
    pub source_file: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// Reflection
// ═══════════════════════════════════════════════════════════════════════

/// Composite weights: completeness, accuracy, relevance, clarity, confidence.
pub const REFLECTION_WEIGHTS: [f64; 5] = [0.30, 0.30, 0.20, 0.10, 0.10];

/// Dimension names in weight order.
pub const REFLECTION_DIMENSIONS: [&str; 5] = [
    "completeness",
    "accuracy",
    "relevance",
    "clarity",
    "confidence",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReflectionScore {
    pub completeness: f64,
    pub accuracy: f64,
    pub relevance: f64,
    pub clarity: f64,
    pub confidence: f64,
    pub feedback: String,
    pub suggestions: Vec<String>,
}

impl ReflectionScore {
    pub fn dimensions(&self) -> [f64; 5] {
        [
            self.completeness,
            self.accuracy,
            self.relevance,
            self.clarity,
            self.confidence,
        ]
    }

    /// Weighted sum of the five dimensions, recomputed on every call.
    pub fn composite(&self) -> f64 {
        self.dimensions()
            .iter()
            .zip(REFLECTION_WEIGHTS.iter())
            .map(|(s, w)| s * w)
            .sum()
    }

    /// Dimensions ordered from lowest to highest score.
    pub fn weakest(&self) -> Vec<(&'static str, f64)> {
        let mut dims: Vec<(&'static str, f64)> = REFLECTION_DIMENSIONS
            .iter()
            .copied()
            .zip(self.dimensions())
            .collect();
        dims.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        dims
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub composite: f64,
    pub passed: bool,
    /// Evaluator feedback, truncated to 200 characters.
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReflectionReport {
    pub total_attempts: u32,
    pub final_score: f64,
    /// Final minus first composite; present only with two or more evaluations.
    pub improvement: Option<f64>,
    pub history: Vec<AttemptRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReflectionMeta {
    pub mode: ReflectionMode,
    /// Whether the loop ran at all.
    pub skipped: bool,
    /// Composite of the returned answer; `None` when never evaluated.
    pub composite: Option<f64>,
    pub scores: Option<ReflectionScore>,
    pub threshold: f64,
    /// Refinements applied to the returned answer.
    pub iterations: u32,
    pub evaluations: u32,
    pub passed: bool,
    pub report: Option<ReflectionReport>,
    /// Error that stopped the loop early, if any.
    pub error: Option<String>,
}

impl ReflectionMeta {
    /// Metadata for a result that never entered the reflection loop.
    pub fn skipped(mode: ReflectionMode, threshold: f64) -> Self {
        Self {
            mode,
            skipped: true,
            composite: None,
            scores: None,
            threshold,
            iterations: 0,
            evaluations: 0,
            passed: false,
            report: None,
            error: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Result
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Threshold met, or reflection disabled.
    Passed,
    /// Iteration cap reached below threshold. Still a usable answer.
    Exhausted,
    /// Nothing relevant was found.
    NoAnswer,
}

/// Final answer for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetResult {
    pub resource_id: String,
    pub query: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub sub_queries: Vec<String>,
    /// Names of discovered files, best first.
    pub files: Vec<String>,
    pub candidates_considered: usize,
    pub reflection: ReflectionMeta,
    pub status: ResultStatus,
    /// The request deadline passed; the answer is built from partial results.
    pub timed_out: bool,
    /// Wall-clock completion time. Not part of the result's identity.
    pub completed_at: DateTime<Utc>,
}

impl DatasetResult {
    /// A well-formed empty result.
    pub fn no_answer(config: &ProcessingConfig, query: &str, sub_queries: Vec<String>) -> Self {
        Self {
            resource_id: config.resource_id.clone(),
            query: query.to_string(),
            answer: String::new(),
            citations: Vec::new(),
            sub_queries,
            files: Vec::new(),
            candidates_considered: 0,
            reflection: ReflectionMeta::skipped(
                config.reflection_mode,
                config.reflection_threshold,
            ),
            status: ResultStatus::NoAnswer,
            timed_out: false,
            completed_at: Utc::now(),
        }
    }

    pub fn has_answer(&self) -> bool {
        !self.answer.trim().is_empty()
    }

    /// Equality ignoring `completed_at`.
    pub fn same_outcome(&self, other: &DatasetResult) -> bool {
        let mut a = self.clone();
        a.completed_at = other.completed_at;
        &a == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(v: [f64; 5]) -> ReflectionScore {
        ReflectionScore {
            completeness: v[0],
            accuracy: v[1],
            relevance: v[2],
            clarity: v[3],
            confidence: v[4],
            feedback: String::new(),
            suggestions: vec![],
        }
    }

    #[test]
    fn composite_uses_fixed_weights() {
        assert!((score([1.0; 5]).composite() - 1.0).abs() < 1e-9);
        assert!((score([1.0, 0.0, 0.0, 0.0, 0.0]).composite() - 0.30).abs() < 1e-9);
        assert!((score([0.0, 0.0, 1.0, 0.0, 0.0]).composite() - 0.20).abs() < 1e-9);
        assert!((score([0.5; 5]).composite() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn weakest_orders_ascending() {
        let s = score([0.9, 0.2, 0.8, 0.5, 0.7]);
        let weakest = s.weakest();
        assert_eq!(weakest[0].0, "accuracy");
        assert_eq!(weakest[1].0, "clarity");
    }

    #[test]
    fn dedup_keeps_first_appearance() {
        let c = |f: &str, k: &str| Citation {
            file_id: f.into(),
            file_name: format!("{}.md", f),
            chunk_id: k.into(),
        };
        let list = vec![c("a", "1"), c("b", "1"), c("a", "1"), c("a", "2")];
        let out = dedup_citations(&list);
        assert_eq!(out, vec![c("a", "1"), c("b", "1"), c("a", "2")]);
    }

    #[test]
    fn validate_rejects_bad_bounds() {
        let mut cfg = ProcessingConfig::for_resource("kb");
        assert!(cfg.validate().is_ok());

        cfg.top_k_recall = 5;
        cfg.top_k_return = 10;
        assert!(matches!(cfg.validate(), Err(PipelineError::InvalidConfig(_))));

        let mut cfg = ProcessingConfig::for_resource("kb");
        cfg.reflection_threshold = -0.1;
        assert!(cfg.validate().is_err());

        let mut cfg = ProcessingConfig::for_resource("kb");
        cfg.max_reflection_iterations = 6;
        assert!(cfg.validate().is_err());

        assert!(ProcessingConfig::for_resource("  ").validate().is_err());
    }

    #[test]
    fn options_override_defaults() {
        let opts = RequestOptions {
            top_k_return: Some(3),
            reflection_mode: Some(ReflectionMode::Off),
            document_name: Some("   ".into()),
            ..Default::default()
        };
        let cfg = ProcessingConfig::from_defaults("kb", &PipelineConfig::default(), &opts);
        assert_eq!(cfg.top_k_return, 3);
        assert_eq!(cfg.top_k_recall, 100);
        assert_eq!(cfg.reflection_mode, ReflectionMode::Off);
        assert_eq!(cfg.document_name, None);
    }

    #[test]
    fn parse_enums() {
        assert_eq!("vector_search".parse(), Ok(SearchMethod::SemanticSearch));
        assert_eq!("FULL_TEXT_SEARCH".parse(), Ok(SearchMethod::FullTextSearch));
        assert!("fuzzy".parse::<SearchMethod>().is_err());
        assert_eq!("comprehensive".parse(), Ok(ReflectionMode::Comprehensive));
        assert!("maybe".parse::<ReflectionMode>().is_err());
    }

    #[test]
    fn gate_enabled_by_mode() {
        let mut cfg = ProcessingConfig::for_resource("kb");
        assert!(!cfg.quality_gate_enabled());
        cfg.quality_gate_in_standard = true;
        assert!(cfg.quality_gate_enabled());
        cfg.reflection_mode = ReflectionMode::Comprehensive;
        cfg.quality_gate_in_standard = false;
        assert!(cfg.quality_gate_enabled());
    }
}
