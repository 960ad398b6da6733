//! # kb-assist
//!
//! A question-answering assistant over a remote knowledge base.
//!
//! A question goes through query understanding, file discovery, answer
//! generation, synthesis and a reflection loop. Each stage talks to the
//! outside world only through three ports: retrieval, a language model and
//! an optional reranker. The result is a cited answer plus quality metadata.
//!
//! ## Architecture
//!
//! ```text
//!               ┌──────────────────── Pipeline ─────────────────────┐
//! question ───▶ │ understand ▶ discover ▶ generate ▶ synthesize ▶   │ ───▶ DatasetResult
//!               │                                       reflect     │
//!               └───────┬──────────────────┬──────────────┬─────────┘
//!                       ▼                  ▼              ▼
//!                 RetrievalPort    LanguageModelPort   RerankPort
//!                   (Dify)        (chat completions)   (rerank API)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kba ask <dataset-id> "How do I rotate the signing keys?"
//! kba discover <dataset-id> "deployment runbooks" --expect deploy.md
//! kba serve mcp
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Request, evidence and result types |
//! | [`error`] | Port and pipeline error types |
//! | [`traits`] | Port traits, tool trait and registry |
//! | [`pipeline`] | The answer pipeline and its stages |
//! | [`prompts`] | Prompt templates for every model task |
//! | [`parse`] | Lenient parsing of model output |
//! | [`dify`] | Dify retrieval adapter |
//! | [`llm`] | OpenAI-compatible chat completion adapter |
//! | [`rerank`] | Rerank API adapter |
//! | [`http`] | Shared HTTP client and retry helper |
//! | [`backend`] | Wiring config into ports |
//! | [`tools`] | Built-in tools |
//! | [`server`] | HTTP tool server |
//! | [`mcp`] | MCP bridge |
//! | [`commands`] | CLI command implementations |
//! | [`logging`] | Tracing subscriber setup |

pub mod backend;
pub mod commands;
pub mod config;
pub mod dify;
pub mod error;
pub mod http;
pub mod llm;
pub mod logging;
pub mod mcp;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod prompts;
pub mod rerank;
pub mod server;
pub mod tools;
pub mod traits;
