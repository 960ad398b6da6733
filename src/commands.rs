//! CLI command implementations.
//!
//! Each command runs the matching built-in tool through the registry, so
//! the CLI, the HTTP server and MCP clients all see the same behaviour.
//! With `--json` the tool output is printed as-is; otherwise it is
//! rendered as aligned plain text.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::backend::Services;
use crate::tools::validate_params;
use crate::traits::{ToolContext, ToolRegistry};

/// Flags shared by `ask`, `discover` and `search`.
#[derive(Debug, Default, Clone)]
pub struct QueryFlags {
    pub search_method: Option<String>,
    pub top_k_recall: Option<usize>,
    pub top_k_return: Option<usize>,
    pub document: Option<String>,
    pub rewrite: bool,
}

impl QueryFlags {
    fn apply(&self, params: &mut Value) {
        if let Some(m) = &self.search_method {
            params["search_method"] = json!(m);
        }
        if let Some(k) = self.top_k_recall {
            params["top_k_recall"] = json!(k);
        }
        if let Some(k) = self.top_k_return {
            params["top_k_return"] = json!(k);
        }
        if let Some(d) = &self.document {
            params["document_name"] = json!(d);
        }
        if self.rewrite {
            params["enable_query_rewriting"] = json!(true);
        }
    }
}

/// Validate `params` against the tool's schema and execute it.
pub async fn run_tool(services: Arc<Services>, name: &str, params: Value) -> Result<Value> {
    let registry = ToolRegistry::with_builtins();
    let Some(tool) = registry.find(name) else {
        bail!("no tool registered with name: {}", name);
    };
    let params = validate_params(&tool.parameters_schema(), &params)?;
    let ctx = ToolContext::new(services);
    tool.execute(params, &ctx).await
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// kba ask
// ═══════════════════════════════════════════════════════════════════════

pub struct AskArgs {
    pub resource: String,
    pub query: String,
    pub flags: QueryFlags,
    pub reflection_mode: Option<String>,
    pub threshold: Option<f64>,
    pub max_iterations: Option<u32>,
    pub instructions: Option<String>,
    pub json: bool,
}

pub async fn run_ask(services: Arc<Services>, args: AskArgs) -> Result<()> {
    let mut params = json!({ "resource_id": args.resource, "query": args.query });
    args.flags.apply(&mut params);
    if let Some(m) = &args.reflection_mode {
        params["reflection_mode"] = json!(m);
    }
    if let Some(t) = args.threshold {
        params["reflection_threshold"] = json!(t);
    }
    if let Some(n) = args.max_iterations {
        params["max_reflection_iterations"] = json!(n);
    }
    if let Some(i) = &args.instructions {
        params["custom_instructions"] = json!(i);
    }

    let out = run_tool(services, "assistant", params).await?;
    if args.json {
        return print_json(&out);
    }

    if out["status"] == "timeout" {
        println!("Request timed out before an answer was produced.");
        return Ok(());
    }
    let answer = out["answer"].as_str().unwrap_or("");
    if answer.is_empty() {
        println!("No answer found.");
        return Ok(());
    }

    println!("{}", answer);
    if let Some(citations) = out["citations"].as_array().filter(|c| !c.is_empty()) {
        println!();
        println!("Sources:");
        for (i, c) in citations.iter().enumerate() {
            println!(
                "  [{}] {}  ({})",
                i + 1,
                c["file_name"].as_str().unwrap_or("?"),
                c["chunk_id"].as_str().unwrap_or("?")
            );
        }
    }
    println!();
    let score = out["reflection"]["composite"]
        .as_f64()
        .map(|s| format!("{:.2}", s))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<10} {:<10} {:<10} {}",
        "STATUS", "SCORE", "ATTEMPTS", "CANDIDATES"
    );
    println!(
        "{:<10} {:<10} {:<10} {}",
        out["status"].as_str().unwrap_or("?"),
        score,
        out["reflection"]["evaluations"].as_u64().unwrap_or(0),
        out["candidates_considered"].as_u64().unwrap_or(0)
    );
    if let Some(fb) = out["user_feedback"].as_str() {
        println!("{}", fb);
    }
    if out["timed_out"].as_bool().unwrap_or(false) {
        println!("(partial result: request deadline reached)");
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// kba discover
// ═══════════════════════════════════════════════════════════════════════

pub async fn run_discover(
    services: Arc<Services>,
    resource: &str,
    query: &str,
    flags: &QueryFlags,
    expect: Vec<String>,
    stats: bool,
    json_out: bool,
) -> Result<()> {
    let mut params = json!({ "resource_id": resource, "query": query });
    flags.apply(&mut params);
    if !expect.is_empty() {
        params["expected_files"] = json!(expect);
    }
    if stats {
        params["include_statistics"] = json!(true);
    }

    let out = run_tool(services, "file_discover", params).await?;
    if json_out {
        return print_json(&out);
    }

    let files = out["files"].as_array().cloned().unwrap_or_default();
    if files.is_empty() {
        println!("No files found.");
    } else {
        println!("{:<4} {:<8} {:<7} FILE", "#", "SCORE", "CHUNKS");
        for (i, f) in files.iter().enumerate() {
            println!(
                "{:<4} {:<8.4} {:<7} {}",
                i + 1,
                f["score"].as_f64().unwrap_or(0.0),
                f["chunks"].as_u64().unwrap_or(0),
                f["file_name"].as_str().unwrap_or("?")
            );
        }
    }
    if out["expanded"].as_bool().unwrap_or(false) {
        println!("(search expanded after coverage check)");
    }
    if let Some(recall) = out.get("recall") {
        println!(
            "\nRecall: {:.0}% ({}), missing: {}",
            recall["recall"].as_f64().unwrap_or(0.0) * 100.0,
            recall["status"].as_str().unwrap_or("?"),
            recall["missed_files"]
                .as_array()
                .map(|m| m
                    .iter()
                    .filter_map(|v| v.as_str())
                    .collect::<Vec<_>>()
                    .join(", "))
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "none".to_string())
        );
    }
    if let Some(s) = out.get("statistics") {
        println!(
            "Coverage: {}/{} files ({:.1}%)",
            s["discovered"].as_u64().unwrap_or(0),
            s["total_files"].as_u64().unwrap_or(0),
            s["coverage_ratio"].as_f64().unwrap_or(0.0) * 100.0
        );
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// kba files / search / keywords
// ═══════════════════════════════════════════════════════════════════════

pub async fn run_files(services: Arc<Services>, resource: &str, json_out: bool) -> Result<()> {
    let out = run_tool(services, "file_lister", json!({ "resource_id": resource })).await?;
    if json_out {
        return print_json(&out);
    }
    for name in out["files"].as_array().into_iter().flatten() {
        println!("{}", name.as_str().unwrap_or("?"));
    }
    println!("\n{} file(s)", out["total"].as_u64().unwrap_or(0));
    Ok(())
}

pub async fn run_search(
    services: Arc<Services>,
    resource: &str,
    query: &str,
    flags: &QueryFlags,
    top_k: Option<usize>,
    json_out: bool,
) -> Result<()> {
    let mut params = json!({ "resource_id": resource, "query": query });
    flags.apply(&mut params);
    if let Some(k) = top_k {
        params["top_k"] = json!(k);
    }
    let out = run_tool(services, "retriever", params).await?;
    if json_out {
        return print_json(&out);
    }

    let chunks = out["chunks"].as_array().cloned().unwrap_or_default();
    if chunks.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, c) in chunks.iter().enumerate() {
        println!(
            "{}. [{:.4}] {}",
            i + 1,
            c["score"].as_f64().unwrap_or(0.0),
            c["file_name"].as_str().unwrap_or("?")
        );
        println!("    {}", snippet(c["content"].as_str().unwrap_or(""), 160));
    }
    Ok(())
}

pub async fn run_keywords(
    services: Arc<Services>,
    query: &str,
    max_sets: Option<usize>,
    json_out: bool,
) -> Result<()> {
    let mut params = json!({ "query": query });
    if let Some(n) = max_sets {
        params["max_sets"] = json!(n);
    }
    let out = run_tool(services, "keyword_generator", params).await?;
    if json_out {
        return print_json(&out);
    }
    for set in out["keyword_sets"].as_array().into_iter().flatten() {
        let words: Vec<&str> = set
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|w| w.as_str())
            .collect();
        println!("- {}", words.join(", "));
    }
    Ok(())
}

/// First `max` characters on one line.
fn snippet(text: &str, max: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max).collect();
        format!("{}...", cut)
    }
}
