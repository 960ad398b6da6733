//! File discovery: recall-biased retrieval per sub-query, merged by file
//! and trimmed for precision, with an optional quality-gated retry.
//!
//! Retrieval failures are fatal here. An empty file set must mean
//! "nothing matched", never "the backend was down".

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::deadline::{collect_until, Deadline};
use crate::error::{PipelineError, PortError};
use crate::models::{ChunkHit, FileHit, ProcessingConfig, SearchRequest};
use crate::parse::{bool_field, extract_json, string_list, text_field, unit_score};
use crate::prompts;
use crate::traits::{CompletionOptions, LanguageModelPort, RetrievalPort};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discovery {
    pub files: Vec<FileHit>,
    pub gate: Option<GateVerdict>,
    /// The quality gate widened recall and the retry replaced the first pass.
    pub expanded: bool,
    pub timed_out: bool,
}

/// Find the files most likely to answer `query`.
pub async fn discover(
    retrieval: &dyn RetrievalPort,
    llm: &dyn LanguageModelPort,
    query: &str,
    sub_queries: &[String],
    config: &ProcessingConfig,
    deadline: &Deadline,
) -> Result<Discovery, PipelineError> {
    let (hits, mut timed_out) =
        search_round(retrieval, sub_queries, config, config.top_k_recall, deadline).await?;
    let mut files = merge_file_hits(&hits, config.top_k_return, config.max_chunks_per_file);
    info!(
        sub_queries = sub_queries.len(),
        files = files.len(),
        "discovery pass complete"
    );

    let mut gate = None;
    let mut expanded = false;
    if config.quality_gate_enabled() && !files.is_empty() && !timed_out {
        match assess_coverage(llm, query, &files, deadline).await {
            Ok(verdict) => {
                if verdict.needs_expansion(config.quality_gate_threshold) {
                    let widened = config.top_k_recall.saturating_mul(config.expansion_factor);
                    info!(
                        mean = verdict.mean(),
                        top_k_recall = widened,
                        "quality gate judged file set insufficient, expanding"
                    );
                    let (more_hits, late) =
                        search_round(retrieval, sub_queries, config, widened, deadline).await?;
                    timed_out |= late;
                    let more =
                        merge_file_hits(&more_hits, config.top_k_return, config.max_chunks_per_file);
                    if !more.is_empty() {
                        files = more;
                        expanded = true;
                    }
                }
                gate = Some(verdict);
            }
            Err(e) => warn!(error = %e, "quality gate failed, keeping file set"),
        }
    }

    Ok(Discovery {
        files,
        gate,
        expanded,
        timed_out,
    })
}

/// One retrieval per sub-query. Returns hits tagged with the sub-query
/// index, plus whether the deadline cut the round short.
async fn search_round(
    retrieval: &dyn RetrievalPort,
    sub_queries: &[String],
    config: &ProcessingConfig,
    top_k: usize,
    deadline: &Deadline,
) -> Result<(Vec<(usize, Vec<ChunkHit>)>, bool), PipelineError> {
    let requests: Vec<SearchRequest> = sub_queries
        .iter()
        .map(|q| SearchRequest::new(q.clone(), config, top_k))
        .collect();
    let mut tasks = Vec::with_capacity(requests.len());
    for req in &requests {
        tasks.push(retrieval.search(&config.resource_id, req));
    }
    let collected = collect_until(deadline, config.max_workers, tasks).await;
    if collected.timed_out {
        warn!(
            completed = collected.items.len(),
            total = sub_queries.len(),
            "deadline reached during discovery, using completed searches"
        );
    }

    let mut hits = Vec::with_capacity(collected.items.len());
    for (idx, result) in collected.items {
        match result {
            Ok(chunks) => {
                debug!(sub_query = idx, chunks = chunks.len(), "search complete");
                hits.push((idx, chunks));
            }
            Err(e) => {
                tracing::error!(error = %e, sub_query = idx, "retrieval failed during discovery");
                return Err(e.into());
            }
        }
    }
    Ok((hits, collected.timed_out))
}

/// Group chunk hits by file, score each file by its best chunk, and keep
/// the top `limit` files.
///
/// Ordering is a pure function of the input: descending score, then the
/// earliest sub-query index that surfaced the file, then file id.
/// Non-finite scores count as zero.
pub fn merge_file_hits(
    hits: &[(usize, Vec<ChunkHit>)],
    limit: usize,
    max_chunks_per_file: usize,
) -> Vec<FileHit> {
    let mut by_file: HashMap<&str, FileHit> = HashMap::new();

    for (query_idx, chunks) in hits {
        for chunk in chunks {
            let score = if chunk.score.is_finite() {
                chunk.score
            } else {
                0.0
            };
            let entry = by_file
                .entry(chunk.file_id.as_str())
                .or_insert_with(|| FileHit {
                    file_id: chunk.file_id.clone(),
                    file_name: chunk.file_name.clone(),
                    chunks: Vec::new(),
                    score,
                    first_seen: *query_idx,
                });
            if score > entry.score {
                entry.score = score;
            }
            entry.first_seen = entry.first_seen.min(*query_idx);
            let mut c = chunk.clone();
            c.score = score;
            entry.chunks.push(c);
        }
    }

    let mut files: Vec<FileHit> = by_file
        .into_values()
        .map(|mut f| {
            f.chunks.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.chunk_id.cmp(&b.chunk_id))
            });
            let mut seen = HashSet::new();
            f.chunks.retain(|c| seen.insert(c.chunk_id.clone()));
            f.chunks.truncate(max_chunks_per_file.max(1));
            f
        })
        .collect();

    files.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(a.first_seen.cmp(&b.first_seen))
            .then_with(|| a.file_id.cmp(&b.file_id))
    });
    files.truncate(limit);
    files
}

// ═══════════════════════════════════════════════════════════════════════
// Quality gate
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateVerdict {
    pub completeness: f64,
    pub relevance: f64,
    pub coverage: f64,
    pub estimated_recall: f64,
    pub should_expand_search: bool,
    pub feedback: String,
    pub missing_aspects: Vec<String>,
}

impl GateVerdict {
    pub fn mean(&self) -> f64 {
        (self.completeness + self.relevance + self.coverage + self.estimated_recall) / 4.0
    }

    pub fn needs_expansion(&self, threshold: f64) -> bool {
        self.should_expand_search || self.mean() < threshold
    }
}

/// Ask the model whether `files` plausibly cover `query`.
pub async fn assess_coverage(
    llm: &dyn LanguageModelPort,
    query: &str,
    files: &[FileHit],
    deadline: &Deadline,
) -> Result<GateVerdict, PortError> {
    let prompt = prompts::quality_gate(query, files);
    let text = deadline
        .run(llm.complete(&prompt, &CompletionOptions::default()))
        .await
        .ok_or_else(|| PortError::timeout("llm"))??;
    parse_verdict(&text)
}

fn parse_verdict(text: &str) -> Result<GateVerdict, PortError> {
    let v = extract_json(text)
        .ok_or_else(|| PortError::malformed("llm", "quality gate returned no JSON"))?;
    let scores = ["completeness", "relevance", "coverage", "estimated_recall"]
        .map(|k| unit_score(&v, k));
    if scores.iter().all(|s| s.is_none()) && bool_field(&v, "should_expand_search").is_none() {
        return Err(PortError::malformed("llm", "quality gate verdict has no scores"));
    }
    let [completeness, relevance, coverage, estimated_recall] = scores.map(|s| s.unwrap_or(0.0));
    Ok(GateVerdict {
        completeness,
        relevance,
        coverage,
        estimated_recall,
        should_expand_search: bool_field(&v, "should_expand_search").unwrap_or(false),
        feedback: text_field(&v, "feedback").unwrap_or_default(),
        missing_aspects: string_list(&v, "missing_aspects"),
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Evaluation
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallStatus {
    High,
    Medium,
    Low,
}

/// Discovered file names compared against a known-relevant set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecallReport {
    pub recall: f64,
    pub precision: f64,
    pub f1: f64,
    pub found_relevant: usize,
    pub total_relevant: usize,
    pub total_discovered: usize,
    pub missed_files: Vec<String>,
    pub false_positives: Vec<String>,
    pub status: RecallStatus,
}

/// Compare discovered file names with `expected` (case-insensitive).
pub fn evaluate_recall(discovered: &[String], expected: &[String]) -> RecallReport {
    let norm = |s: &String| s.trim().to_lowercase();
    let found: HashSet<String> = discovered.iter().map(norm).collect();
    let wanted: HashSet<String> = expected.iter().map(norm).collect();

    let found_relevant = wanted.intersection(&found).count();
    let missed_files: Vec<String> = expected
        .iter()
        .filter(|e| !found.contains(&norm(e)))
        .cloned()
        .collect();
    let false_positives: Vec<String> = discovered
        .iter()
        .filter(|d| !wanted.contains(&norm(d)))
        .cloned()
        .collect();

    let recall = if wanted.is_empty() {
        1.0
    } else {
        found_relevant as f64 / wanted.len() as f64
    };
    let precision = if found.is_empty() {
        0.0
    } else {
        found_relevant as f64 / found.len() as f64
    };
    let f1 = if recall + precision > 0.0 {
        2.0 * recall * precision / (recall + precision)
    } else {
        0.0
    };
    let status = if recall >= 0.8 {
        RecallStatus::High
    } else if recall >= 0.5 {
        RecallStatus::Medium
    } else {
        RecallStatus::Low
    };

    RecallReport {
        recall,
        precision,
        f1,
        found_relevant,
        total_relevant: wanted.len(),
        total_discovered: found.len(),
        missed_files,
        false_positives,
        status,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryStats {
    pub total_files: usize,
    pub discovered: usize,
    pub coverage_ratio: f64,
    pub avg_score: f64,
    pub max_score: f64,
    pub min_score: f64,
    pub score_variance: f64,
    /// Few files found in a large resource, or weak scores overall.
    pub potential_low_recall: bool,
}

/// Summary statistics of a discovery result against the resource size.
pub fn discovery_statistics(files: &[FileHit], total_files: usize) -> DiscoveryStats {
    let n = files.len();
    let scores: Vec<f64> = files.iter().map(|f| f.score).collect();
    let (avg, max, min, var) = if n == 0 {
        (0.0, 0.0, 0.0, 0.0)
    } else {
        let avg = scores.iter().sum::<f64>() / n as f64;
        let max = scores.iter().cloned().fold(f64::MIN, f64::max);
        let min = scores.iter().cloned().fold(f64::MAX, f64::min);
        let var = scores.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / n as f64;
        (avg, max, min, var)
    };
    let coverage_ratio = if total_files == 0 {
        0.0
    } else {
        n as f64 / total_files as f64
    };
    DiscoveryStats {
        total_files,
        discovered: n,
        coverage_ratio,
        avg_score: avg,
        max_score: max,
        min_score: min,
        score_variance: var,
        potential_low_recall: (n < 3 && total_files > 10) || (n > 0 && avg < 0.3),
    }
}
