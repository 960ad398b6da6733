//! In-memory ports shared by the integration tests.
//!
//! `ScriptedModel` routes on the `Task: <name>` line every prompt opens
//! with, and counts calls per task.

#![allow(dead_code)]

use async_trait::async_trait;
use kb_assist::error::PortError;
use kb_assist::models::{ChunkHit, SearchRequest};
use kb_assist::traits::{
    CompletionOptions, LanguageModelPort, RankedIndex, RerankPort, RetrievalPort,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn chunk(file: &str, id: &str, content: &str, score: f64) -> ChunkHit {
    ChunkHit {
        file_id: format!("id-{}", file),
        file_name: file.to_string(),
        chunk_id: id.to_string(),
        content: content.to_string(),
        score,
        position: None,
    }
}

// ─── Retrieval ──────────────────────────────────────────────────────

type Responder = dyn Fn(&SearchRequest) -> Result<Vec<ChunkHit>, PortError> + Send + Sync;

pub struct MockRetrieval {
    respond: Box<Responder>,
    files: Vec<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<SearchRequest>>,
}

impl MockRetrieval {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&SearchRequest) -> Result<Vec<ChunkHit>, PortError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            files: Vec::new(),
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every search returns `chunks` (restricted to the requested
    /// document, if any), capped at `top_k`.
    pub fn with_chunks(chunks: Vec<ChunkHit>) -> Self {
        let mut files: Vec<String> = Vec::new();
        for c in &chunks {
            if !files.contains(&c.file_name) {
                files.push(c.file_name.clone());
            }
        }
        let mut mock = Self::new(move |req: &SearchRequest| {
            Ok(chunks
                .iter()
                .filter(|c| {
                    req.document_name
                        .as_deref()
                        .map_or(true, |d| d == c.file_name)
                })
                .take(req.top_k)
                .cloned()
                .collect())
        });
        mock.files = files;
        mock
    }

    pub fn empty() -> Self {
        Self::new(|_| Ok(Vec::new()))
    }

    pub fn failing(err: PortError) -> Self {
        Self::new(move |_| Err(err.clone()))
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SearchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RetrievalPort for MockRetrieval {
    fn name(&self) -> &str {
        "mock"
    }

    async fn search(
        &self,
        _resource_id: &str,
        request: &SearchRequest,
    ) -> Result<Vec<ChunkHit>, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        (self.respond)(request)
    }

    async fn list_files(&self, _resource_id: &str) -> Result<Vec<String>, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.files.clone())
    }
}

// ─── Language model ─────────────────────────────────────────────────

type Reply = dyn Fn(&str, usize) -> Result<String, PortError> + Send + Sync;

pub struct ScriptedModel {
    replies: HashMap<String, Arc<Reply>>,
    delays: HashMap<String, Duration>,
    counts: Mutex<HashMap<String, usize>>,
}

pub fn task_of(prompt: &str) -> &str {
    prompt
        .lines()
        .next()
        .and_then(|l| l.strip_prefix("Task: "))
        .unwrap_or("")
        .trim()
}

pub const GOOD_SCORES: &str = r#"{"completeness": 0.9, "accuracy": 0.9, "relevance": 0.9, "clarity": 0.9, "confidence": 0.9, "feedback": "good"}"#;
pub const MEDIOCRE_SCORES: &str = r#"{"completeness": 0.5, "accuracy": 0.5, "relevance": 0.5, "clarity": 0.5, "confidence": 0.5, "feedback": "thin"}"#;

impl ScriptedModel {
    /// No scripted tasks; every call fails as malformed.
    pub fn bare() -> Self {
        Self {
            replies: HashMap::new(),
            delays: HashMap::new(),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Plausible replies for every task.
    pub fn standard() -> Self {
        Self::bare()
            .text("extract_intent", r#"{"intent": "lookup", "sub_questions": []}"#)
            .text("generate_keywords", r#"{"keyword_sets": []}"#)
            .text(
                "extract_answer",
                r#"{"answer": "The fee is 10 EUR.", "citations": [1], "confidence": 0.9}"#,
            )
            .text(
                "merge_answers",
                r#"{"answer": "The fee is 10 EUR per month.", "citations": [1]}"#,
            )
            .text("evaluate_answer", GOOD_SCORES)
            .text("refine_answer", r#"{"answer": "Refined: the fee is 10 EUR."}"#)
            .text(
                "assess_file_coverage",
                r#"{"completeness": 0.9, "relevance": 0.9, "coverage": 0.9, "estimated_recall": 0.9, "should_expand_search": false}"#,
            )
    }

    pub fn on<F>(mut self, task: &str, reply: F) -> Self
    where
        F: Fn(&str, usize) -> Result<String, PortError> + Send + Sync + 'static,
    {
        self.replies.insert(task.to_string(), Arc::new(reply));
        self
    }

    pub fn text(self, task: &str, reply: &str) -> Self {
        let reply = reply.to_string();
        self.on(task, move |_, _| Ok(reply.clone()))
    }

    pub fn fail(self, task: &str, err: PortError) -> Self {
        self.on(task, move |_, _| Err(err.clone()))
    }

    pub fn slow(mut self, task: &str, delay: Duration) -> Self {
        self.delays.insert(task.to_string(), delay);
        self
    }

    pub fn count(&self, task: &str) -> usize {
        self.counts.lock().unwrap().get(task).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl LanguageModelPort for ScriptedModel {
    async fn complete(
        &self,
        prompt: &str,
        _options: &CompletionOptions,
    ) -> Result<String, PortError> {
        let task = task_of(prompt).to_string();
        let n = {
            let mut counts = self.counts.lock().unwrap();
            let entry = counts.entry(task.clone()).or_insert(0);
            *entry += 1;
            *entry - 1
        };
        if let Some(d) = self.delays.get(&task) {
            tokio::time::sleep(*d).await;
        }
        match self.replies.get(&task) {
            Some(reply) => reply(prompt, n),
            None => Err(PortError::malformed("llm", format!("unscripted task {}", task))),
        }
    }
}

// ─── Reranker ───────────────────────────────────────────────────────

pub struct MockReranker {
    result: Result<Vec<RankedIndex>, PortError>,
    calls: AtomicUsize,
}

impl MockReranker {
    /// Return the given order, most relevant first.
    pub fn ordering(order: &[usize]) -> Self {
        let n = order.len() as f64;
        Self {
            result: Ok(order
                .iter()
                .enumerate()
                .map(|(rank, index)| RankedIndex {
                    index: *index,
                    relevance: (n - rank as f64) / n,
                })
                .collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: PortError) -> Self {
        Self {
            result: Err(err),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RerankPort for MockReranker {
    async fn rerank(
        &self,
        _query: &str,
        _documents: &[String],
    ) -> Result<Vec<RankedIndex>, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}
