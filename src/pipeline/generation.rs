//! Answer generation.
//!
//! Two independent strategies run concurrently over the discovered files:
//!
//! | Strategy | Retrieval | Model calls | Output |
//! |----------|-----------|-------------|--------|
//! | direct | one whole-query search | one extraction | at most one candidate |
//! | advanced | discovered chunks, plus boost searches scoped to the file | keywords + extraction per file | up to one candidate per file |
//!
//! Per-branch failures are logged and excluded. Only when every branch
//! failed because a service was unreachable does the request fail.

use futures::future::{join_all, BoxFuture};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::deadline::{collect_until, Deadline};
use crate::error::{PipelineError, PortError};
use crate::models::{
    CandidateAnswer, ChunkHit, FileHit, ProcessingConfig, Provenance, SearchRequest,
};
use crate::parse::{extract_json, label_list, text_field, unit_score};
use crate::prompts;
use crate::traits::{CompletionOptions, LanguageModelPort, RetrievalPort};

/// Confidence used when the query has no usable keywords.
const NEUTRAL_CONFIDENCE: f64 = 0.5;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "what", "which", "who", "whom", "when", "where",
    "why", "how", "does", "did", "this", "that", "these", "those", "with", "from", "into", "about",
    "there", "their", "have", "has", "had", "can", "could", "should", "would", "will", "shall",
    "any", "all", "list", "tell", "give", "please", "our", "your", "its", "not", "but", "per",
];

pub struct Generation {
    /// Direct candidate first, then advanced candidates in file rank order.
    pub candidates: Vec<CandidateAnswer>,
    pub timed_out: bool,
}

/// Run both strategies and collect surviving candidates.
pub async fn generate(
    retrieval: &dyn RetrievalPort,
    llm: &dyn LanguageModelPort,
    query: &str,
    search_query: &str,
    files: &[FileHit],
    config: &ProcessingConfig,
    deadline: &Deadline,
) -> Result<Generation, PipelineError> {
    let direct = deadline.run(direct_answer(retrieval, llm, query, search_query, config));
    let advanced = advanced_answers(retrieval, llm, query, files, config, deadline);
    let (direct, advanced) = tokio::join!(direct, advanced);

    let mut candidates = Vec::new();
    let mut failures: Vec<PortError> = Vec::new();
    let mut completed = advanced.completed;
    let mut timed_out = advanced.timed_out;

    match direct {
        Some(Ok(Some(c))) => {
            completed += 1;
            candidates.push(c);
        }
        Some(Ok(None)) => completed += 1,
        Some(Err(e)) => {
            completed += 1;
            warn!(error = %e, "direct answer failed");
            failures.push(e);
        }
        None => {
            warn!("deadline reached during direct answer");
            timed_out = true;
        }
    }
    candidates.extend(advanced.candidates);
    failures.extend(advanced.failures);

    info!(
        candidates = candidates.len(),
        failures = failures.len(),
        timed_out,
        "answer generation complete"
    );

    if candidates.is_empty()
        && !timed_out
        && !failures.is_empty()
        && failures.len() == completed
        && failures.iter().all(|e| e.is_unreachable())
    {
        return Err(failures.swap_remove(0).into());
    }

    Ok(Generation {
        candidates,
        timed_out,
    })
}

/// Whole-query retrieval followed by one extraction.
pub async fn direct_answer(
    retrieval: &dyn RetrievalPort,
    llm: &dyn LanguageModelPort,
    query: &str,
    search_query: &str,
    config: &ProcessingConfig,
) -> Result<Option<CandidateAnswer>, PortError> {
    let request = SearchRequest::new(search_query, config, config.top_k_return);
    let chunks = retrieval.search(&config.resource_id, &request).await?;
    debug!(chunks = chunks.len(), "direct retrieval complete");
    if chunks.is_empty() {
        return Ok(None);
    }
    extract_answer(
        llm,
        query,
        &chunks,
        Provenance::Direct,
        None,
        config.custom_instructions.as_deref(),
    )
    .await
}

struct AdvancedOutcome {
    candidates: Vec<CandidateAnswer>,
    failures: Vec<PortError>,
    completed: usize,
    timed_out: bool,
}

async fn advanced_answers(
    retrieval: &dyn RetrievalPort,
    llm: &dyn LanguageModelPort,
    query: &str,
    files: &[FileHit],
    config: &ProcessingConfig,
    deadline: &Deadline,
) -> AdvancedOutcome {
    let mut tasks: Vec<BoxFuture<'_, Result<Option<CandidateAnswer>, PortError>>> = Vec::new();
    for file in files.iter().take(config.top_k_return) {
        tasks.push(Box::pin(answer_from_file(retrieval, llm, query, file, config)));
    }
    let collected = collect_until(deadline, config.max_workers, tasks).await;
    if collected.timed_out {
        warn!(
            completed = collected.items.len(),
            "deadline reached during per-file extraction"
        );
    }

    let mut outcome = AdvancedOutcome {
        candidates: Vec::new(),
        failures: Vec::new(),
        completed: collected.items.len(),
        timed_out: collected.timed_out,
    };
    for (idx, result) in collected.items {
        match result {
            Ok(Some(c)) => outcome.candidates.push(c),
            Ok(None) => debug!(file = %files[idx].file_name, "no answer in file"),
            Err(e) => {
                warn!(file = %files[idx].file_name, error = %e, "per-file extraction failed, excluding");
                outcome.failures.push(e);
            }
        }
    }
    outcome
}

async fn answer_from_file(
    retrieval: &dyn RetrievalPort,
    llm: &dyn LanguageModelPort,
    query: &str,
    file: &FileHit,
    config: &ProcessingConfig,
) -> Result<Option<CandidateAnswer>, PortError> {
    let mut chunks = file.chunks.clone();

    if config.use_content_booster && config.max_boost_keywords > 0 {
        match keyword_sets(llm, query, Some(&file.file_name), config.max_boost_keywords).await {
            Ok(sets) => {
                let requests: Vec<SearchRequest> = sets
                    .iter()
                    .map(|set| {
                        SearchRequest::new(set.join(" "), config, config.boost_top_k)
                            .in_document(file.file_name.clone())
                    })
                    .collect();
                let results = join_all(
                    requests
                        .iter()
                        .map(|r| retrieval.search(&config.resource_id, r)),
                )
                .await;
                for result in results {
                    match result {
                        Ok(hits) => {
                            chunks.extend(hits.into_iter().filter(|h| h.file_id == file.file_id))
                        }
                        Err(e) => warn!(file = %file.file_name, error = %e, "boost search failed"),
                    }
                }
                chunks = best_unique_chunks(chunks, config.max_chunks_per_file);
            }
            Err(e) => warn!(file = %file.file_name, error = %e, "content booster failed"),
        }
    }

    extract_answer(
        llm,
        query,
        &chunks,
        Provenance::Advanced,
        Some(&file.file_name),
        config.custom_instructions.as_deref(),
    )
    .await
}

fn best_unique_chunks(mut chunks: Vec<ChunkHit>, limit: usize) -> Vec<ChunkHit> {
    chunks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    let mut seen = HashSet::new();
    chunks.retain(|c| seen.insert(c.chunk_id.clone()));
    chunks.truncate(limit.max(1));
    chunks
}

/// Ask the model for alternative keyword sets for `query`.
pub async fn keyword_sets(
    llm: &dyn LanguageModelPort,
    query: &str,
    file_name: Option<&str>,
    max_sets: usize,
) -> Result<Vec<Vec<String>>, PortError> {
    let text = llm
        .complete(
            &prompts::keyword_sets(query, file_name, max_sets),
            &CompletionOptions::default(),
        )
        .await?;
    let v = extract_json(&text)
        .ok_or_else(|| PortError::malformed("llm", "keyword generation returned no JSON"))?;
    let raw = v
        .get("keyword_sets")
        .or_else(|| v.get("keywords"))
        .and_then(|k| k.as_array())
        .cloned()
        .or_else(|| v.as_array().cloned())
        .unwrap_or_default();

    let mut sets: Vec<Vec<String>> = Vec::new();
    for entry in raw {
        let set: Vec<String> = match entry {
            serde_json::Value::Array(terms) => terms
                .iter()
                .filter_map(|t| t.as_str())
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            serde_json::Value::String(s) => s.split_whitespace().map(str::to_string).collect(),
            _ => Vec::new(),
        };
        if !set.is_empty() && !sets.contains(&set) {
            sets.push(set);
        }
    }
    sets.truncate(max_sets);
    Ok(sets)
}

/// Extract one answer from numbered chunks.
///
/// Returns `Ok(None)` for empty, "N/A", or zero-confidence answers.
/// Citations only ever point into `chunks`.
pub async fn extract_answer(
    llm: &dyn LanguageModelPort,
    query: &str,
    chunks: &[ChunkHit],
    provenance: Provenance,
    source_file: Option<&str>,
    custom_instructions: Option<&str>,
) -> Result<Option<CandidateAnswer>, PortError> {
    if chunks.is_empty() {
        return Ok(None);
    }
    let prompt = prompts::extract_answer(query, chunks, custom_instructions);
    let text = llm.complete(&prompt, &CompletionOptions::default()).await?;
    Ok(parse_extraction(
        &text,
        query,
        chunks,
        provenance,
        source_file,
    ))
}

fn parse_extraction(
    text: &str,
    query: &str,
    chunks: &[ChunkHit],
    provenance: Provenance,
    source_file: Option<&str>,
) -> Option<CandidateAnswer> {
    let (answer, labels, reported) = match extract_json(text) {
        Some(v) if v.is_object() => (
            text_field(&v, "answer").unwrap_or_default(),
            label_list(&v, "citations"),
            unit_score(&v, "confidence"),
        ),
        _ => (text.trim().to_string(), Vec::new(), None),
    };
    if is_empty_answer(&answer) {
        return None;
    }

    let mut seen = HashSet::new();
    let mut cited: Vec<&ChunkHit> = labels
        .iter()
        .filter(|l| **l >= 1 && **l <= chunks.len())
        .filter(|l| seen.insert(**l))
        .map(|l| &chunks[l - 1])
        .collect();
    if cited.is_empty() {
        cited = chunks.iter().collect();
    }

    let confidence = reported.unwrap_or_else(|| keyword_coverage(query, &cited));
    if confidence <= 0.0 {
        return None;
    }

    Some(CandidateAnswer {
        answer,
        confidence,
        citations: cited.iter().map(|c| c.citation()).collect(),
        provenance,
        source_file: source_file.map(str::to_string),
    })
}

fn is_empty_answer(answer: &str) -> bool {
    let a = answer
        .trim()
        .trim_end_matches('.')
        .to_lowercase();
    a.is_empty() || a == "n/a" || a == "na" || a == "none" || a == "no answer"
}

/// Fraction of the query's keywords present in the cited chunks.
pub fn keyword_coverage(query: &str, chunks: &[&ChunkHit]) -> f64 {
    let keywords = query_keywords(query);
    if keywords.is_empty() {
        return NEUTRAL_CONFIDENCE;
    }
    let text: String = chunks
        .iter()
        .map(|c| c.content.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    let found = keywords.iter().filter(|k| text.contains(k.as_str())).count();
    found as f64 / keywords.len() as f64
}

fn query_keywords(query: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3 && !STOP_WORDS.contains(w))
    {
        let w = word.to_string();
        if !out.contains(&w) {
            out.push(w);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, content: &str) -> ChunkHit {
        ChunkHit {
            file_id: "f1".into(),
            file_name: "policy.md".into(),
            chunk_id: id.into(),
            content: content.into(),
            score: 0.8,
            position: Some(0),
        }
    }

    #[test]
    fn citations_resolve_only_to_given_chunks() {
        let chunks = vec![chunk("c1", "refund in 30 days"), chunk("c2", "shipping")];
        let c = parse_extraction(
            r#"{"answer": "30 days", "confidence": 0.9, "citations": [1, 7, 1, 0]}"#,
            "refund window",
            &chunks,
            Provenance::Direct,
            None,
        )
        .unwrap();
        assert_eq!(c.citations.len(), 1);
        assert_eq!(c.citations[0].chunk_id, "c1");
        assert_eq!(c.confidence, 0.9);
    }

    #[test]
    fn missing_confidence_uses_keyword_coverage() {
        let chunks = vec![chunk("c1", "The refund window is thirty days")];
        let c = parse_extraction(
            r#"{"answer": "Thirty days", "citations": [1]}"#,
            "What is the refund deadline?",
            &chunks,
            Provenance::Advanced,
            Some("policy.md"),
        )
        .unwrap();
        // keywords: refund, deadline -> only refund found
        assert!((c.confidence - 0.5).abs() < 1e-9);
        assert_eq!(c.source_file.as_deref(), Some("policy.md"));
    }

    #[test]
    fn empty_and_zero_confidence_discarded() {
        let chunks = vec![chunk("c1", "unrelated")];
        assert!(parse_extraction(r#"{"answer": "N/A"}"#, "q", &chunks, Provenance::Direct, None).is_none());
        assert!(parse_extraction(r#"{"answer": ""}"#, "q", &chunks, Provenance::Direct, None).is_none());
        assert!(parse_extraction(
            r#"{"answer": "x", "confidence": 0}"#,
            "q",
            &chunks,
            Provenance::Direct,
            None
        )
        .is_none());
        assert!(parse_extraction(
            r#"{"answer": "x", "citations": [1]}"#,
            "budget forecast",
            &chunks,
            Provenance::Direct,
            None
        )
        .is_none());
    }

    #[test]
    fn plain_text_answer_cites_all_chunks() {
        let chunks = vec![chunk("c1", "alpha beta"), chunk("c2", "gamma")];
        let c = parse_extraction("Alpha is beta.", "alpha", &chunks, Provenance::Direct, None).unwrap();
        assert_eq!(c.citations.len(), 2);
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn keywords_skip_stop_words() {
        assert_eq!(
            query_keywords("What is the refund policy for refund requests?"),
            vec!["refund", "policy", "requests"]
        );
        assert_eq!(keyword_coverage("is it?", &[]), NEUTRAL_CONFIDENCE);
    }

    #[test]
    fn best_unique_chunks_dedups() {
        let mut a = chunk("c1", "x");
        a.score = 0.2;
        let mut b = chunk("c1", "x");
        b.score = 0.9;
        let c = chunk("c2", "y");
        let out = best_unique_chunks(vec![a, b, c], 5);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chunk_id, "c1");
        assert_eq!(out[0].score, 0.9);
    }
}
