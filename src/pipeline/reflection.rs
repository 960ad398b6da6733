//! Reflection: score the answer, refine while below threshold, stop at
//! the iteration cap.
//!
//! ```text
//! NOT_STARTED ─▶ EVALUATING ─┬─▶ PASSED      (composite ≥ threshold)
//!                   ▲        ├─▶ EXHAUSTED   (iteration == max)
//!                   │        └─▶ REFINING
//!                   └────────────────┘  (iteration += 1)
//! ```
//!
//! At most `max_reflection_iterations + 1` evaluations run. Errors and
//! deadline expiry stop the loop early and return the last *evaluated*
//! answer; they never fail the request.

use tracing::{debug, info, warn};

use super::deadline::Deadline;
use crate::error::PortError;
use crate::models::{
    AttemptRecord, Citation, ProcessingConfig, ReflectionMeta, ReflectionMode, ReflectionReport,
    ReflectionScore, ResultStatus,
};
use crate::parse::{extract_json, string_list, text_field, unit_score};
use crate::prompts;
use crate::traits::{CompletionOptions, LanguageModelPort};

/// Dimensions below this are called out in user feedback.
const FEEDBACK_FLOOR: f64 = 0.7;
const FEEDBACK_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionOutcome {
    pub answer: String,
    pub meta: ReflectionMeta,
    pub status: ResultStatus,
    pub timed_out: bool,
}

/// Run the reflection loop over `answer`.
pub async fn reflect(
    llm: &dyn LanguageModelPort,
    query: &str,
    answer: &str,
    citations: &[Citation],
    config: &ProcessingConfig,
    deadline: &Deadline,
) -> ReflectionOutcome {
    if config.reflection_mode == ReflectionMode::Off {
        let mut meta = ReflectionMeta::skipped(ReflectionMode::Off, config.reflection_threshold);
        meta.passed = true;
        return ReflectionOutcome {
            answer: answer.to_string(),
            meta,
            status: ResultStatus::Passed,
            timed_out: false,
        };
    }

    let threshold = config.reflection_threshold;
    let max = config.max_reflection_iterations;

    let mut candidate = answer.to_string();
    let mut iteration: u32 = 0;
    let mut history: Vec<AttemptRecord> = Vec::new();
    let mut last: Option<(String, ReflectionScore, u32)> = None;
    let mut error: Option<String> = None;
    let mut timed_out = false;
    let mut passed = false;

    loop {
        let score = match deadline
            .run(evaluate(llm, query, &candidate, citations))
            .await
        {
            Some(Ok(score)) => score,
            Some(Err(e)) => {
                warn!(error = %e, iteration, "evaluation failed, stopping reflection");
                error = Some(e.to_string());
                break;
            }
            None => {
                warn!(iteration, "deadline reached during evaluation");
                timed_out = true;
                break;
            }
        };

        let composite = score.composite();
        let met = composite >= threshold;
        debug!(iteration, composite, threshold, "answer evaluated");
        history.push(AttemptRecord {
            attempt: history.len() as u32 + 1,
            composite,
            passed: met,
            feedback: clip(&score.feedback, FEEDBACK_CHARS),
        });
        last = Some((candidate.clone(), score.clone(), iteration));

        if met {
            passed = true;
            break;
        }
        if iteration >= max {
            break;
        }

        let step = deadline
            .run(refine(
                llm,
                query,
                &candidate,
                &score,
                config.custom_instructions.as_deref(),
            ))
            .await;
        match step {
            Some(Ok(revised)) => {
                candidate = revised;
                iteration += 1;
            }
            Some(Err(e)) => {
                warn!(error = %e, iteration, "refinement failed, keeping last evaluated answer");
                error = Some(e.to_string());
                break;
            }
            None => {
                warn!(iteration, "deadline reached during refinement");
                timed_out = true;
                break;
            }
        }
    }

    let evaluations = history.len() as u32;
    let report = build_report(&history);
    let (answer, scores, iterations) = match last {
        Some((a, s, i)) => (a, Some(s), i),
        None => (answer.to_string(), None, 0),
    };
    let composite = scores.as_ref().map(|s| s.composite());
    let status = if passed {
        ResultStatus::Passed
    } else {
        ResultStatus::Exhausted
    };

    info!(
        evaluations,
        iterations,
        composite = composite.unwrap_or(0.0),
        ?status,
        "reflection complete"
    );

    ReflectionOutcome {
        answer,
        meta: ReflectionMeta {
            mode: config.reflection_mode,
            skipped: false,
            composite,
            scores,
            threshold,
            iterations,
            evaluations,
            passed,
            report,
            error,
        },
        status,
        timed_out,
    }
}

/// Score `answer` on the five reflection dimensions.
pub async fn evaluate(
    llm: &dyn LanguageModelPort,
    query: &str,
    answer: &str,
    citations: &[Citation],
) -> Result<ReflectionScore, PortError> {
    let prompt = prompts::evaluate_answer(query, answer, citations);
    let text = llm.complete(&prompt, &CompletionOptions::default()).await?;
    parse_score(&text)
}

fn parse_score(text: &str) -> Result<ReflectionScore, PortError> {
    let v = extract_json(text)
        .ok_or_else(|| PortError::malformed("llm", "evaluation returned no JSON"))?;
    let dim = |key: &str| {
        unit_score(&v, key)
            .ok_or_else(|| PortError::malformed("llm", format!("evaluation is missing '{}'", key)))
    };
    Ok(ReflectionScore {
        completeness: dim("completeness")?,
        accuracy: dim("accuracy")?,
        relevance: dim("relevance")?,
        clarity: dim("clarity")?,
        confidence: dim("confidence")?,
        feedback: text_field(&v, "feedback").unwrap_or_default(),
        suggestions: string_list(&v, "suggestions"),
    })
}

/// Ask for a revision of `answer` that addresses its weakest dimensions.
pub async fn refine(
    llm: &dyn LanguageModelPort,
    query: &str,
    answer: &str,
    score: &ReflectionScore,
    custom_instructions: Option<&str>,
) -> Result<String, PortError> {
    let prompt = prompts::refine_answer(query, answer, score, custom_instructions);
    let text = llm.complete(&prompt, &CompletionOptions::default()).await?;
    let revised = match extract_json(&text) {
        Some(v) if v.is_object() => text_field(&v, "answer").unwrap_or_default(),
        _ => text.trim().to_string(),
    };
    if revised.is_empty() {
        return Err(PortError::malformed("llm", "refinement returned an empty answer"));
    }
    Ok(revised)
}

fn build_report(history: &[AttemptRecord]) -> Option<ReflectionReport> {
    let first = history.first()?;
    let last = history.last()?;
    Some(ReflectionReport {
        total_attempts: history.len() as u32,
        final_score: last.composite,
        improvement: (history.len() > 1).then(|| last.composite - first.composite),
        history: history.to_vec(),
    })
}

/// Short human-readable verdict for a reflection result.
pub fn user_feedback(meta: &ReflectionMeta) -> String {
    if meta.skipped {
        return "Quality review was not performed.".to_string();
    }
    let Some(scores) = &meta.scores else {
        return "Quality review could not be completed.".to_string();
    };
    let composite = scores.composite();
    if meta.passed {
        return format!("Answer quality is acceptable (score {:.2}).", composite);
    }
    let weak: Vec<String> = scores
        .weakest()
        .into_iter()
        .filter(|(_, v)| *v < FEEDBACK_FLOOR)
        .map(|(name, _)| capitalize(name))
        .collect();
    if weak.is_empty() {
        format!("Answer is below the quality threshold (score {:.2}).", composite)
    } else {
        format!(
            "Answer may need improvement in: {} (score {:.2}).",
            weak.join(", "),
            composite
        )
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn clip(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scores every answer with a fixed composite, or fails refinement.
    struct Grader {
        score: f64,
        refine_fails: bool,
        evaluations: AtomicUsize,
    }

    impl Grader {
        fn new(score: f64) -> Self {
            Self {
                score,
                refine_fails: false,
                evaluations: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LanguageModelPort for Grader {
        async fn complete(&self, prompt: &str, _: &CompletionOptions) -> Result<String, PortError> {
            if prompt.starts_with("Task: evaluate_answer") {
                let n = self.evaluations.fetch_add(1, Ordering::SeqCst);
                let s = self.score;
                Ok(format!(
                    r#"{{"completeness": {s}, "accuracy": {s}, "relevance": {s}, "clarity": {s}, "confidence": {s}, "feedback": "round {n}"}}"#
                ))
            } else if self.refine_fails {
                Err(PortError::unavailable("llm", "down"))
            } else {
                Ok(r#"{"answer": "revised"}"#.to_string())
            }
        }
    }

    fn config(mode: ReflectionMode, threshold: f64, max: u32) -> ProcessingConfig {
        let mut cfg = ProcessingConfig::for_resource("kb");
        cfg.reflection_mode = mode;
        cfg.reflection_threshold = threshold;
        cfg.max_reflection_iterations = max;
        cfg
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn passes_on_first_evaluation() {
        let llm = Grader::new(0.9);
        let out = reflect(&llm, "q", "a", &[], &config(ReflectionMode::Standard, 0.7, 2), &deadline()).await;
        assert_eq!(out.status, ResultStatus::Passed);
        assert_eq!(out.meta.evaluations, 1);
        assert_eq!(out.meta.iterations, 0);
        assert_eq!(out.answer, "a");
        let report = out.meta.report.unwrap();
        assert_eq!(report.total_attempts, 1);
        assert_eq!(report.improvement, None);
    }

    #[tokio::test]
    async fn exhausts_after_max_plus_one_evaluations() {
        let llm = Grader::new(0.5);
        let out = reflect(&llm, "q", "a", &[], &config(ReflectionMode::Standard, 0.9, 2), &deadline()).await;
        assert_eq!(out.status, ResultStatus::Exhausted);
        assert_eq!(llm.evaluations.load(Ordering::SeqCst), 3);
        assert_eq!(out.meta.iterations, 2);
        assert_eq!(out.answer, "revised");
        assert_eq!(out.meta.report.unwrap().improvement, Some(0.0));
    }

    #[tokio::test]
    async fn zero_iterations_evaluates_once() {
        let llm = Grader::new(0.1);
        let out = reflect(&llm, "q", "a", &[], &config(ReflectionMode::Standard, 0.9, 0), &deadline()).await;
        assert_eq!(out.status, ResultStatus::Exhausted);
        assert_eq!(out.meta.evaluations, 1);
    }

    #[tokio::test]
    async fn refine_failure_keeps_last_evaluated_answer() {
        let mut llm = Grader::new(0.2);
        llm.refine_fails = true;
        let out = reflect(&llm, "q", "original", &[], &config(ReflectionMode::Standard, 0.9, 3), &deadline()).await;
        assert_eq!(out.answer, "original");
        assert_eq!(out.status, ResultStatus::Exhausted);
        assert!(out.meta.error.unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn off_mode_skips_scoring() {
        let llm = Grader::new(0.0);
        let out = reflect(&llm, "q", "a", &[], &config(ReflectionMode::Off, 0.9, 2), &deadline()).await;
        assert_eq!(out.status, ResultStatus::Passed);
        assert_eq!(out.meta.composite, None);
        assert_eq!(out.meta.iterations, 0);
        assert_eq!(llm.evaluations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn feedback_names_weak_dimensions() {
        let scores = ReflectionScore {
            completeness: 0.3,
            accuracy: 0.9,
            relevance: 0.6,
            clarity: 0.9,
            confidence: 0.9,
            feedback: String::new(),
            suggestions: vec![],
        };
        let mut meta = ReflectionMeta::skipped(ReflectionMode::Standard, 0.9);
        meta.skipped = false;
        meta.scores = Some(scores);
        let text = user_feedback(&meta);
        assert!(text.starts_with("Answer may need improvement in: Completeness, Relevance"));
    }

    #[test]
    fn malformed_evaluation_rejected() {
        assert!(parse_score(r#"{"completeness": 0.5}"#).is_err());
        assert!(parse_score("great answer").is_err());
    }
}
