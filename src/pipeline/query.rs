//! Query understanding: optional rewriting, intent extraction, and
//! decomposition into search-ready sub-queries.
//!
//! Nothing here is fatal. A failed or timed-out model call leaves the
//! query as it was.

use serde::Serialize;
use tracing::{debug, warn};

use super::deadline::Deadline;
use crate::models::{ProcessingConfig, MAX_SUB_QUERIES};
use crate::parse::{extract_json, string_list, text_field};
use crate::prompts;
use crate::traits::{CompletionOptions, LanguageModelPort};

/// Rewritten queries shorter than this are ignored.
const MIN_QUERY_CHARS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteStrategy {
    NoChange,
    Expansion,
    Relaxation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intent {
    pub summary: Option<String>,
    pub updated_query: Option<String>,
    pub sub_questions: Vec<String>,
    /// The question asks for an exhaustive listing; never decomposed.
    pub completeness: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub sub_queries: Vec<String>,
    pub intent: Intent,
    pub strategy: RewriteStrategy,
    /// Query used for whole-query retrieval (direct answers).
    pub search_query: String,
    /// Looser variant kept for a second discovery attempt.
    pub relaxed_query: Option<String>,
}

/// Build the sub-queries for `query`.
pub async fn understand(
    llm: &dyn LanguageModelPort,
    query: &str,
    config: &ProcessingConfig,
    deadline: &Deadline,
) -> QueryPlan {
    let query = query.trim();
    let options = CompletionOptions::default();

    let mut working = query.to_string();
    let mut strategy = RewriteStrategy::NoChange;
    let mut relaxed_query = None;

    if config.enable_query_rewriting {
        match deadline
            .run(llm.complete(&prompts::rewrite_query(query), &options))
            .await
        {
            Some(Ok(text)) => {
                let rewrite = parse_rewrite(&text);
                strategy = rewrite.strategy;
                if let Some(chosen) = rewrite.chosen(query) {
                    working = chosen;
                }
                relaxed_query = rewrite.relaxed.filter(|r| r != &working);
                debug!(?strategy, query = %working, "query rewritten");
            }
            Some(Err(e)) => warn!(error = %e, "query rewriting failed, using original query"),
            None => warn!("query rewriting timed out, using original query"),
        }
    }

    let completeness = is_completeness_query(query);
    let intent = match deadline
        .run(llm.complete(&prompts::extract_intent(&working), &options))
        .await
    {
        Some(Ok(text)) => parse_intent(&text, completeness),
        Some(Err(e)) => {
            warn!(error = %e, "intent extraction failed, using query as-is");
            Intent::fallback(completeness)
        }
        None => {
            warn!("intent extraction timed out, using query as-is");
            Intent::fallback(completeness)
        }
    };

    if let Some(updated) = &intent.updated_query {
        working = updated.clone();
    }

    let sub_queries = if !intent.completeness && intent.sub_questions.len() > 1 {
        intent.sub_questions.clone()
    } else {
        vec![working.clone()]
    };

    QueryPlan {
        sub_queries,
        intent,
        strategy,
        search_query: working,
        relaxed_query,
    }
}

struct Rewrite {
    strategy: RewriteStrategy,
    expanded: Option<String>,
    relaxed: Option<String>,
}

impl Rewrite {
    fn chosen(&self, original: &str) -> Option<String> {
        let pick = match self.strategy {
            RewriteStrategy::NoChange => return None,
            RewriteStrategy::Expansion => self.expanded.clone(),
            RewriteStrategy::Relaxation => self.relaxed.clone(),
        };
        pick.filter(|q| q.chars().count() >= MIN_QUERY_CHARS && q != original)
    }
}

fn parse_rewrite(text: &str) -> Rewrite {
    let Some(v) = extract_json(text) else {
        return Rewrite {
            strategy: RewriteStrategy::NoChange,
            expanded: None,
            relaxed: None,
        };
    };
    let strategy = match text_field(&v, "strategy")
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "expansion" | "expand" => RewriteStrategy::Expansion,
        "relaxation" | "relax" => RewriteStrategy::Relaxation,
        _ => RewriteStrategy::NoChange,
    };
    let usable = |s: Option<String>| s.filter(|q| q.chars().count() >= MIN_QUERY_CHARS);
    Rewrite {
        strategy,
        expanded: usable(text_field(&v, "expanded_query")),
        relaxed: usable(text_field(&v, "relaxed_query")),
    }
}

impl Intent {
    fn fallback(completeness: bool) -> Self {
        Self {
            summary: None,
            updated_query: None,
            sub_questions: Vec::new(),
            completeness,
        }
    }
}

fn parse_intent(text: &str, completeness: bool) -> Intent {
    let Some(v) = extract_json(text) else {
        warn!("intent extraction returned no JSON, using query as-is");
        return Intent::fallback(completeness);
    };

    let updated_query = text_field(&v, "updated_query").filter(|q| {
        let ok = q.chars().count() >= MIN_QUERY_CHARS;
        if !ok {
            warn!(updated = %q, "updated query too short, ignoring");
        }
        ok
    });

    let mut sub_questions: Vec<String> = Vec::new();
    for q in string_list(&v, "sub_questions") {
        if q.chars().count() >= MIN_QUERY_CHARS && !sub_questions.contains(&q) {
            sub_questions.push(q);
        }
    }
    sub_questions.truncate(MAX_SUB_QUERIES);

    Intent {
        summary: text_field(&v, "intent"),
        updated_query,
        sub_questions,
        completeness,
    }
}

/// Queries asking for an exhaustive answer ("list all ...") must be
/// searched as one question.
pub fn is_completeness_query(query: &str) -> bool {
    let q = format!(" {} ", query.to_lowercase());
    const MARKERS: [&str; 7] = [
        " all ",
        " every ",
        " complete list",
        " full list",
        " entire ",
        " exhaustive",
        " list of ",
    ];
    MARKERS.iter().any(|m| q.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortError;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Canned {
        rewrite: Result<String, PortError>,
        intent: Result<String, PortError>,
    }

    #[async_trait]
    impl LanguageModelPort for Canned {
        async fn complete(&self, prompt: &str, _: &CompletionOptions) -> Result<String, PortError> {
            if prompt.starts_with("Task: rewrite_query") {
                self.rewrite.clone()
            } else {
                self.intent.clone()
            }
        }
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn decomposes_independent_questions() {
        let llm = Canned {
            rewrite: Ok(String::new()),
            intent: Ok(r#"{"intent": "two facts", "sub_questions": ["What is the fee?", "Who signs?", "What is the fee?"]}"#.into()),
        };
        let cfg = ProcessingConfig::for_resource("kb");
        let plan = understand(&llm, "What is the fee and who signs?", &cfg, &deadline()).await;
        assert_eq!(plan.sub_queries, vec!["What is the fee?", "Who signs?"]);
        assert_eq!(plan.strategy, RewriteStrategy::NoChange);
    }

    #[tokio::test]
    async fn completeness_query_is_not_decomposed() {
        let llm = Canned {
            rewrite: Ok(String::new()),
            intent: Ok(r#"{"sub_questions": ["term a", "term b"]}"#.into()),
        };
        let cfg = ProcessingConfig::for_resource("kb");
        let plan = understand(&llm, "List all defined terms", &cfg, &deadline()).await;
        assert_eq!(plan.sub_queries, vec!["List all defined terms"]);
        assert!(plan.intent.completeness);
    }

    #[tokio::test]
    async fn failures_fall_back_to_original() {
        let llm = Canned {
            rewrite: Err(PortError::timeout("llm")),
            intent: Err(PortError::unavailable("llm", "down")),
        };
        let mut cfg = ProcessingConfig::for_resource("kb");
        cfg.enable_query_rewriting = true;
        let plan = understand(&llm, "  refund policy  ", &cfg, &deadline()).await;
        assert_eq!(plan.sub_queries, vec!["refund policy"]);
        assert_eq!(plan.search_query, "refund policy");
        assert_eq!(plan.relaxed_query, None);
    }

    #[tokio::test]
    async fn expansion_rewrite_is_used_and_relaxed_kept() {
        let llm = Canned {
            rewrite: Ok(r#"{"strategy": "expansion", "expanded_query": "refund return policy money back", "relaxed_query": "refund"}"#.into()),
            intent: Ok(r#"{"updated_query": "ok", "sub_questions": []}"#.into()),
        };
        let mut cfg = ProcessingConfig::for_resource("kb");
        cfg.enable_query_rewriting = true;
        let plan = understand(&llm, "refund policy", &cfg, &deadline()).await;
        assert_eq!(plan.sub_queries, vec!["refund return policy money back"]);
        assert_eq!(plan.relaxed_query.as_deref(), Some("refund"));
        assert_eq!(plan.strategy, RewriteStrategy::Expansion);
    }

    #[tokio::test]
    async fn rewriting_disabled_skips_call() {
        let llm = Canned {
            rewrite: Ok(r#"{"strategy": "relaxation", "relaxed_query": "something else"}"#.into()),
            intent: Ok("not json at all".into()),
        };
        let cfg = ProcessingConfig::for_resource("kb");
        let plan = understand(&llm, "exact clause 4.2", &cfg, &deadline()).await;
        assert_eq!(plan.sub_queries, vec!["exact clause 4.2"]);
    }

    #[test]
    fn completeness_markers() {
        assert!(is_completeness_query("List all terms"));
        assert!(is_completeness_query("give me every deadline"));
        assert!(!is_completeness_query("what is the allowance"));
        assert!(!is_completeness_query("What is the fee?"));
    }
}
