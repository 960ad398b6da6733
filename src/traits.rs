//! Extension seams.
//!
//! The pipeline talks to the outside world through three ports, and the
//! server exposes the pipeline through tools. Each seam is a trait object
//! so backends and tools can be swapped at construction time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              ToolRegistry                │
//! │  assistant · file_discover · file_lister │
//! │  keyword_generator · retriever · custom  │
//! └──────────────┬───────────────────────────┘
//!                ▼ ToolContext (Services)
//! ┌──────────────────────────────────────────┐
//! │                Pipeline                  │
//! └───────┬──────────────┬──────────────┬────┘
//!         ▼              ▼              ▼
//!   RetrievalPort  LanguageModelPort  RerankPort (optional)
//! ```
//!
//! Ports return [`PortError`] so the pipeline can tell "backend
//! unavailable" apart from "zero results" (an empty `Ok` vector) and a
//! model timeout apart from a malformed response.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::backend::Services;
use crate::error::PortError;
use crate::models::{ChunkHit, SearchRequest};

// ═══════════════════════════════════════════════════════════════════════
// Ports
// ═══════════════════════════════════════════════════════════════════════

/// A knowledge-base search backend.
#[async_trait]
pub trait RetrievalPort: Send + Sync {
    /// Backend identifier used in logs and errors (e.g. `"dify"`).
    fn name(&self) -> &str;

    /// Return chunks ranked by relevance, best first.
    ///
    /// An empty vector means nothing matched; unreachable backends must
    /// return [`PortError::Unavailable`] instead.
    async fn search(
        &self,
        resource_id: &str,
        request: &SearchRequest,
    ) -> std::result::Result<Vec<ChunkHit>, PortError>;

    /// Names of every file in the resource.
    async fn list_files(&self, resource_id: &str) -> std::result::Result<Vec<String>, PortError>;
}

/// Per-call generation options. `None` fields use the client's defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOptions {
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A text-completion model.
///
/// Retries belong to implementations; callers treat every error as final.
#[async_trait]
pub trait LanguageModelPort: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> std::result::Result<String, PortError>;
}

/// One entry of a rerank response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedIndex {
    /// Index into the candidate list passed to [`RerankPort::rerank`].
    pub index: usize,
    pub relevance: f64,
}

/// A relevance reranker.
#[async_trait]
pub trait RerankPort: Send + Sync {
    /// Return a relevance-ordered subset of `documents`, by index.
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
    ) -> std::result::Result<Vec<RankedIndex>, PortError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// A tool that agents can discover and call.
///
/// Tools are registered at server startup and exposed via
/// `GET /tools/list`, `POST /tools/{name}`, and the MCP endpoint.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use serde_json::{json, Value};
/// use kb_assist::traits::{Tool, ToolContext};
///
/// pub struct PingTool;
///
/// #[async_trait]
/// impl Tool for PingTool {
///     fn name(&self) -> &str { "ping" }
///     fn description(&self) -> &str { "Reply with pong" }
///
///     fn parameters_schema(&self) -> Value {
///         json!({ "type": "object", "properties": {} })
///     }
///
///     async fn execute(&self, _params: Value, _ctx: &ToolContext) -> Result<Value> {
///         Ok(json!({ "reply": "pong" }))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Route name (`POST /tools/{name}`), lowercase with underscores.
    fn name(&self) -> &str;

    /// One-line description for agent discovery.
    fn description(&self) -> &str;

    /// Whether this tool ships with the crate. Defaults to `false`.
    fn is_builtin(&self) -> bool {
        false
    }

    /// JSON Schema of the parameters object.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool. `params` is always a JSON object.
    ///
    /// The returned value is wrapped in `{ "result": ... }` by the HTTP
    /// server.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// Access to the configured services during tool execution.
///
/// Created by the server (or MCP bridge) for each invocation.
pub struct ToolContext {
    services: Arc<Services>,
}

impl ToolContext {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registry of tools, looked up by name.
///
/// # Example
///
/// ```rust
/// use kb_assist::traits::ToolRegistry;
///
/// let tools = ToolRegistry::with_builtins();
/// assert!(tools.find("assistant").is_some());
/// ```
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty tool registry.
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Create a registry pre-loaded with the built-in tools.
    pub fn with_builtins() -> Self {
        use crate::tools::{
            AssistantTool, FileDiscoverTool, FileListerTool, KeywordGeneratorTool, RetrieverTool,
        };

        let mut registry = Self::new();
        registry.register(Box::new(AssistantTool));
        registry.register(Box::new(FileDiscoverTool));
        registry.register(Box::new(FileListerTool));
        registry.register(Box::new(KeywordGeneratorTool));
        registry.register(Box::new(RetrieverTool));
        registry
    }

    /// Register a tool. A later tool with the same name is shadowed by the
    /// earlier one in [`find`](ToolRegistry::find).
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
