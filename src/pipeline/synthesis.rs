//! Answer synthesis: optional rerank, then one merged answer with
//! deduplicated citations.
//!
//! Citations in the output are always drawn from the input candidates.
//! The merge call sees them as labels `[1]..[n]` (first-appearance order)
//! and can only select among those labels.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::deadline::Deadline;
use crate::error::PortError;
use crate::models::{dedup_citations, CandidateAnswer, Citation, Provenance};
use crate::parse::{extract_json, label_list, text_field};
use crate::prompts::{self, MergeInput};
use crate::traits::{CompletionOptions, LanguageModelPort, RerankPort};

/// Candidates kept by the deterministic fallback merge.
const FALLBACK_TOP_N: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeKind {
    Empty,
    Single,
    Model,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Synthesis {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub candidates_considered: usize,
    pub merged_by: MergeKind,
    pub reranked: bool,
    pub timed_out: bool,
}

impl Synthesis {
    fn empty(considered: usize) -> Self {
        Self {
            answer: String::new(),
            citations: Vec::new(),
            candidates_considered: considered,
            merged_by: MergeKind::Empty,
            reranked: false,
            timed_out: false,
        }
    }
}

/// Merge `candidates` into one answer for `query`.
pub async fn synthesize(
    llm: &dyn LanguageModelPort,
    reranker: Option<&dyn RerankPort>,
    query: &str,
    candidates: Vec<CandidateAnswer>,
    custom_instructions: Option<&str>,
    deadline: &Deadline,
) -> Synthesis {
    let considered = candidates.len();
    let candidates: Vec<CandidateAnswer> = candidates
        .into_iter()
        .filter(|c| !c.answer.trim().is_empty())
        .collect();
    if candidates.is_empty() {
        return Synthesis::empty(considered);
    }

    let (ordered, reranked) = match reranker {
        Some(r) if candidates.len() >= 2 => rerank(r, query, candidates, deadline).await,
        _ => (candidates, false),
    };

    if ordered.len() == 1 {
        let only = &ordered[0];
        return Synthesis {
            answer: only.answer.trim().to_string(),
            citations: dedup_citations(&only.citations),
            candidates_considered: considered,
            merged_by: MergeKind::Single,
            reranked,
            timed_out: false,
        };
    }

    let all_citations = dedup_citations(ordered.iter().flat_map(|c| c.citations.iter()));
    let merged = deadline
        .run(merge_with_model(
            llm,
            query,
            &ordered,
            &all_citations,
            custom_instructions,
        ))
        .await;

    let (answer, citations, merged_by, timed_out) = match merged {
        Some(Ok(Some((answer, citations)))) => (answer, citations, MergeKind::Model, false),
        Some(Ok(None)) => {
            warn!("merge produced an empty answer, using fallback merge");
            let (a, c) = fallback(&ordered);
            (a, c, MergeKind::Fallback, false)
        }
        Some(Err(e)) => {
            warn!(error = %e, "merge call failed, using fallback merge");
            let (a, c) = fallback(&ordered);
            (a, c, MergeKind::Fallback, false)
        }
        None => {
            warn!("deadline reached during merge, using fallback merge");
            let (a, c) = fallback(&ordered);
            (a, c, MergeKind::Fallback, true)
        }
    };

    info!(
        candidates = ordered.len(),
        citations = citations.len(),
        merged_by = ?merged_by,
        "synthesis complete"
    );

    Synthesis {
        answer,
        citations,
        candidates_considered: considered,
        merged_by,
        reranked,
        timed_out,
    }
}

/// Reorder by rerank relevance. Any failure or an empty response keeps
/// generation order.
async fn rerank(
    reranker: &dyn RerankPort,
    query: &str,
    candidates: Vec<CandidateAnswer>,
    deadline: &Deadline,
) -> (Vec<CandidateAnswer>, bool) {
    let documents: Vec<String> = candidates.iter().map(|c| c.answer.clone()).collect();
    let ranked = match deadline.run(reranker.rerank(query, &documents)).await {
        Some(Ok(ranked)) => ranked,
        Some(Err(e)) => {
            warn!(error = %e, "rerank failed, keeping generation order");
            return (candidates, false);
        }
        None => {
            warn!("rerank timed out, keeping generation order");
            return (candidates, false);
        }
    };

    let mut seen = HashSet::new();
    let order: Vec<usize> = ranked
        .iter()
        .map(|r| r.index)
        .filter(|i| *i < candidates.len() && seen.insert(*i))
        .collect();
    if order.is_empty() {
        debug!("rerank returned no usable indices, keeping generation order");
        return (candidates, false);
    }

    let mut slots: Vec<Option<CandidateAnswer>> = candidates.into_iter().map(Some).collect();
    let reordered = order.iter().filter_map(|i| slots[*i].take()).collect();
    (reordered, true)
}

type Merged = Option<(String, Vec<Citation>)>;

async fn merge_with_model(
    llm: &dyn LanguageModelPort,
    query: &str,
    candidates: &[CandidateAnswer],
    citations: &[Citation],
    custom_instructions: Option<&str>,
) -> Result<Merged, PortError> {
    let inputs: Vec<MergeInput<'_>> = candidates
        .iter()
        .map(|c| MergeInput {
            answer: &c.answer,
            source: c.source_file.as_deref(),
            labels: labels_for(c, citations),
        })
        .collect();
    let prompt = prompts::merge_answers(query, &inputs, citations, custom_instructions);
    let text = llm.complete(&prompt, &CompletionOptions::default()).await?;

    let (answer, labels) = match extract_json(&text) {
        Some(v) if v.is_object() => (
            text_field(&v, "answer").unwrap_or_default(),
            label_list(&v, "citations"),
        ),
        _ => (text.trim().to_string(), Vec::new()),
    };
    if answer.is_empty() {
        return Ok(None);
    }

    let mut picked: Vec<usize> = labels
        .into_iter()
        .filter(|l| *l >= 1 && *l <= citations.len())
        .collect();
    picked.sort_unstable();
    picked.dedup();
    let selected = if picked.is_empty() {
        citations.to_vec()
    } else {
        picked.iter().map(|l| citations[l - 1].clone()).collect()
    };
    Ok(Some((answer, selected)))
}

fn labels_for(candidate: &CandidateAnswer, citations: &[Citation]) -> Vec<usize> {
    let mut labels: Vec<usize> = candidate
        .citations
        .iter()
        .filter_map(|c| citations.iter().position(|g| g.key() == c.key()))
        .map(|i| i + 1)
        .collect();
    labels.dedup();
    labels
}

/// Deterministic merge of the top distinct candidates.
fn fallback(candidates: &[CandidateAnswer]) -> (String, Vec<Citation>) {
    let mut seen: HashSet<String> = HashSet::new();
    let top: Vec<&CandidateAnswer> = candidates
        .iter()
        .filter(|c| seen.insert(c.answer.trim().to_lowercase()))
        .take(FALLBACK_TOP_N)
        .collect();

    let answer = top
        .iter()
        .map(|c| match (c.provenance, c.source_file.as_deref()) {
            (Provenance::Advanced, Some(file)) => format!("**{}**: {}", file, c.answer.trim()),
            _ => c.answer.trim().to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let citations = dedup_citations(top.iter().flat_map(|c| c.citations.iter()));
    (answer, citations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cite(file: &str, chunk: &str) -> Citation {
        Citation {
            file_id: file.into(),
            file_name: format!("{}.md", file),
            chunk_id: chunk.into(),
        }
    }

    fn candidate(answer: &str, citations: Vec<Citation>) -> CandidateAnswer {
        CandidateAnswer {
            answer: answer.into(),
            confidence: 0.8,
            citations,
            provenance: Provenance::Advanced,
            source_file: Some("doc.md".into()),
        }
    }

    #[test]
    fn labels_follow_global_order() {
        let global = vec![cite("a", "1"), cite("b", "1"), cite("c", "1")];
        let c = candidate("x", vec![cite("c", "1"), cite("a", "1")]);
        assert_eq!(labels_for(&c, &global), vec![3, 1]);
    }

    #[test]
    fn fallback_dedups_and_limits() {
        let cands = vec![
            candidate("Alpha", vec![cite("a", "1")]),
            candidate("alpha", vec![cite("b", "1")]),
            candidate("Beta", vec![cite("a", "1")]),
            candidate("Gamma", vec![cite("c", "1")]),
            candidate("Delta", vec![cite("d", "1")]),
        ];
        let (answer, citations) = fallback(&cands);
        assert_eq!(
            answer,
            "**doc.md**: Alpha\n\n**doc.md**: Beta\n\n**doc.md**: Gamma"
        );
        assert_eq!(citations, vec![cite("a", "1"), cite("c", "1")]);
    }
}
