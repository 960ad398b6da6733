//! Prompt templates.
//!
//! Every prompt opens with a `Task: <name>` line so that logs, mocks and
//! model-side routing can tell the calls apart. All prompts ask for a
//! single JSON object; [`crate::parse::extract_json`] tolerates the usual
//! deviations (code fences, surrounding prose).

use crate::models::{Citation, ChunkHit, FileHit, ReflectionScore};

pub const TASK_REWRITE: &str = "rewrite_query";
pub const TASK_INTENT: &str = "extract_intent";
pub const TASK_QUALITY_GATE: &str = "assess_file_coverage";
pub const TASK_KEYWORDS: &str = "generate_keywords";
pub const TASK_EXTRACT: &str = "extract_answer";
pub const TASK_MERGE: &str = "merge_answers";
pub const TASK_EVALUATE: &str = "evaluate_answer";
pub const TASK_REFINE: &str = "refine_answer";

/// Character budget for a single chunk inside a prompt.
const CHUNK_CHARS: usize = 2_000;

fn header(task: &str) -> String {
    format!("Task: {}\n\n", task)
}

fn clip(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn instructions_block(custom: Option<&str>) -> String {
    match custom {
        Some(c) if !c.trim().is_empty() => format!("\nAdditional instructions:\n{}\n", c.trim()),
        _ => String::new(),
    }
}

pub fn rewrite_query(query: &str) -> String {
    format!(
        "{}You improve search queries for a document knowledge base.\n\
         Decide whether the query should be left alone, expanded with synonyms and \
         related terms, or relaxed by removing overly specific constraints.\n\n\
         Query: {}\n\n\
         Respond with JSON only:\n\
         {{\"strategy\": \"no_change\" | \"expansion\" | \"relaxation\", \
         \"expanded_query\": \"...\", \"relaxed_query\": \"...\", \"confidence\": 0.0-1.0}}",
        header(TASK_REWRITE),
        query
    )
}

pub fn extract_intent(query: &str) -> String {
    format!(
        "{}Analyse the user question below.\n\
         1. State the underlying intent in one sentence.\n\
         2. If the question bundles several independent questions, list each one \
         as a standalone search question (at most 5). Otherwise return an empty list.\n\
         3. Optionally give a clearer version of the question as `updated_query`.\n\n\
         Question: {}\n\n\
         Respond with JSON only:\n\
         {{\"intent\": \"...\", \"updated_query\": \"...\", \"sub_questions\": [\"...\"]}}",
        header(TASK_INTENT),
        query
    )
}

pub fn quality_gate(query: &str, files: &[FileHit]) -> String {
    let mut listing = String::new();
    for (i, f) in files.iter().enumerate() {
        let preview = f
            .chunks
            .first()
            .map(|c| clip(&c.content, 200).replace('\n', " "))
            .unwrap_or_default();
        listing.push_str(&format!(
            "{}. {} (score {:.3}): {}\n",
            i + 1,
            f.file_name,
            f.score,
            preview
        ));
    }
    format!(
        "{}Judge whether the files found so far are likely to contain everything \
         needed to answer the question.\n\n\
         Question: {}\n\nFiles found:\n{}\n\
         Respond with JSON only:\n\
         {{\"completeness\": 0.0-1.0, \"relevance\": 0.0-1.0, \"coverage\": 0.0-1.0, \
         \"estimated_recall\": 0.0-1.0, \"should_expand_search\": true|false, \
         \"feedback\": \"...\", \"missing_aspects\": [\"...\"]}}",
        header(TASK_QUALITY_GATE),
        query,
        listing
    )
}

pub fn keyword_sets(query: &str, file_name: Option<&str>, max_sets: usize) -> String {
    let scope = match file_name {
        Some(name) => format!("The search will run inside the document \"{}\".\n", name),
        None => String::new(),
    };
    format!(
        "{}Produce up to {} alternative keyword sets for finding passages that answer \
         the question. Each set is a short space-separated list of search terms.\n{}\n\
         Question: {}\n\n\
         Respond with JSON only:\n\
         {{\"keyword_sets\": [[\"term\", \"term\"], [\"term\"]]}}",
        header(TASK_KEYWORDS),
        max_sets,
        scope,
        query
    )
}

pub fn extract_answer(query: &str, chunks: &[ChunkHit], custom: Option<&str>) -> String {
    let mut context = String::new();
    for (i, c) in chunks.iter().enumerate() {
        context.push_str(&format!(
            "[{}] ({})\n{}\n\n",
            i + 1,
            c.file_name,
            clip(&c.content, CHUNK_CHARS)
        ));
    }
    format!(
        "{}Answer the question using only the numbered passages. Cite the passages \
         you used by number. If the passages do not contain the answer, reply with \
         answer \"N/A\".\n{}\n\
         Question: {}\n\nPassages:\n{}\
         Respond with JSON only:\n\
         {{\"answer\": \"...\", \"confidence\": 0.0-1.0, \"citations\": [1, 2]}}",
        header(TASK_EXTRACT),
        instructions_block(custom),
        query,
        context
    )
}

/// One candidate as shown to the merge call: its text and the global
/// citation labels it carries.
pub struct MergeInput<'a> {
    pub answer: &'a str,
    pub source: Option<&'a str>,
    pub labels: Vec<usize>,
}

pub fn merge_answers(
    query: &str,
    candidates: &[MergeInput<'_>],
    citations: &[Citation],
    custom: Option<&str>,
) -> String {
    let mut body = String::new();
    for (i, c) in candidates.iter().enumerate() {
        let labels: Vec<String> = c.labels.iter().map(|l| format!("[{}]", l)).collect();
        let source = c.source.map(|s| format!(" from {}", s)).unwrap_or_default();
        body.push_str(&format!(
            "Candidate {}{} (sources {}):\n{}\n\n",
            i + 1,
            source,
            labels.join(" "),
            c.answer
        ));
    }
    let mut sources = String::new();
    for (i, c) in citations.iter().enumerate() {
        sources.push_str(&format!("[{}] {} / {}\n", i + 1, c.file_name, c.chunk_id));
    }
    format!(
        "{}Merge the candidate answers into one consolidated answer. Remove \
         duplication, keep every distinct fact, prefer earlier candidates when they \
         conflict, and cite sources by their labels.\n{}\n\
         Question: {}\n\n{}Sources:\n{}\n\
         Respond with JSON only:\n\
         {{\"answer\": \"...\", \"citations\": [1, 2]}}",
        header(TASK_MERGE),
        instructions_block(custom),
        query,
        body,
        sources
    )
}

pub fn evaluate_answer(query: &str, answer: &str, citations: &[Citation]) -> String {
    let sources: Vec<&str> = citations.iter().map(|c| c.file_name.as_str()).collect();
    format!(
        "{}Rate the answer to the question on five dimensions, each from 0.0 to 1.0:\n\
         completeness, accuracy, relevance, clarity, confidence.\n\n\
         Question: {}\n\nAnswer:\n{}\n\nCited sources: {}\n\n\
         Respond with JSON only:\n\
         {{\"completeness\": 0.0, \"accuracy\": 0.0, \"relevance\": 0.0, \"clarity\": 0.0, \
         \"confidence\": 0.0, \"feedback\": \"...\", \"suggestions\": [\"...\"]}}",
        header(TASK_EVALUATE),
        query,
        answer,
        if sources.is_empty() {
            "none".to_string()
        } else {
            sources.join(", ")
        }
    )
}

pub fn refine_answer(
    query: &str,
    answer: &str,
    score: &ReflectionScore,
    custom: Option<&str>,
) -> String {
    let weakest = score.weakest();
    let focus: Vec<String> = weakest
        .iter()
        .take(2)
        .map(|(name, value)| format!("{} ({:.2})", name, value))
        .collect();
    let all: Vec<String> = weakest
        .iter()
        .map(|(name, value)| format!("{}={:.2}", name, value))
        .collect();
    let suggestions = if score.suggestions.is_empty() {
        String::new()
    } else {
        format!("Suggestions:\n- {}\n", score.suggestions.join("\n- "))
    };
    format!(
        "{}Revise the answer to improve its weakest dimensions: {}.\n\
         Do not introduce facts that are not in the original answer.\n{}\n\
         Question: {}\n\nCurrent answer:\n{}\n\n\
         Scores: {}\nFeedback: {}\n{}\n\
         Respond with JSON only:\n{{\"answer\": \"...\"}}",
        header(TASK_REFINE),
        focus.join(", "),
        instructions_block(custom),
        query,
        answer,
        all.join(", "),
        score.feedback,
        suggestions
    )
}
