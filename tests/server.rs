//! HTTP server integration: the router served on an ephemeral port with
//! in-memory ports behind it.

mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::{chunk, MockRetrieval, ScriptedModel};
use kb_assist::backend::Services;
use kb_assist::config::parse_config;
use kb_assist::error::PortError;
use kb_assist::server::build_router;
use kb_assist::traits::{RetrievalPort, Tool, ToolContext, ToolRegistry};
use serde_json::{json, Value};
use std::sync::Arc;

const CONFIG: &str = r#"
[retrieval]
endpoint = "https://kb.example.com"

[llm]
url = "https://llm.example.com/v1"
model = "test-model"
"#;

/// Reports which backend the tool context is wired to.
struct BackendNameTool;

#[async_trait]
impl Tool for BackendNameTool {
    fn name(&self) -> &str {
        "backend_name"
    }

    fn description(&self) -> &str {
        "Name of the configured retrieval backend"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        Ok(json!({ "backend": ctx.services().pipeline().retrieval().name() }))
    }
}

async fn serve(retrieval: Arc<dyn RetrievalPort>, tools: ToolRegistry) -> String {
    let config = parse_config(CONFIG, |_| None).unwrap();
    let llm = Arc::new(ScriptedModel::standard());
    let services = Arc::new(Services::with_ports(config, retrieval, llm, None));
    let app = build_router(services, Arc::new(tools));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn healthy_backend() -> Arc<dyn RetrievalPort> {
    Arc::new(MockRetrieval::with_chunks(vec![
        chunk("fees.md", "c1", "The monthly fee is 10 EUR.", 0.9),
        chunk("terms.md", "c2", "Cancel with thirty days notice.", 0.5),
    ]))
}

#[tokio::test]
async fn health_reports_version() {
    let base = serve(healthy_backend(), ToolRegistry::with_builtins()).await;
    let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn lists_builtin_and_custom_tools() {
    let mut tools = ToolRegistry::with_builtins();
    tools.register(Box::new(BackendNameTool));
    let base = serve(healthy_backend(), tools).await;

    let body: Value = reqwest::get(format!("{}/tools/list", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        vec![
            "assistant",
            "file_discover",
            "file_lister",
            "keyword_generator",
            "retriever",
            "backend_name"
        ]
    );
    let custom = &body["tools"][5];
    assert_eq!(custom["builtin"], false);
    assert!(custom["parameters"].is_object());
}

#[tokio::test]
async fn assistant_answers_with_citations() {
    let base = serve(healthy_backend(), ToolRegistry::with_builtins()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/tools/assistant", base))
        .json(&json!({ "resource_id": "kb-1", "query": "What is the fee?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    let result = &body["result"];
    assert_eq!(result["status"], "passed");
    assert!(!result["answer"].as_str().unwrap().is_empty());
    assert!(!result["citations"].as_array().unwrap().is_empty());
    assert!(result["user_feedback"].as_str().unwrap().contains("acceptable"));
}

#[tokio::test]
async fn custom_tool_sees_services() {
    let mut tools = ToolRegistry::with_builtins();
    tools.register(Box::new(BackendNameTool));
    let base = serve(healthy_backend(), tools).await;

    let body: Value = reqwest::Client::new()
        .post(format!("{}/tools/backend_name", base))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["result"]["backend"], "mock");
}

#[tokio::test]
async fn file_lister_counts_files() {
    let base = serve(healthy_backend(), ToolRegistry::with_builtins()).await;
    let body: Value = reqwest::Client::new()
        .post(format!("{}/tools/file_lister", base))
        .json(&json!({ "resource_id": "kb-1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["result"]["total"], 2);
}

#[tokio::test]
async fn unknown_tool_is_404() {
    let base = serve(healthy_backend(), ToolRegistry::with_builtins()).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/tools/nonexistent", base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn missing_or_mistyped_parameters_are_400() {
    let base = serve(healthy_backend(), ToolRegistry::with_builtins()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/tools/assistant", base))
        .json(&json!({ "resource_id": "kb-1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("query"));

    let resp = client
        .post(format!("{}/tools/assistant", base))
        .json(&json!({ "resource_id": "kb-1", "query": "q?", "top_k_return": "ten" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/tools/assistant", base))
        .json(&json!({ "resource_id": "kb-1", "query": "q?", "top_k_recall": 1, "top_k_return": 5 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn backend_outage_is_503() {
    let down: Arc<dyn RetrievalPort> = Arc::new(MockRetrieval::failing(PortError::unavailable(
        "retrieval",
        "connection refused",
    )));
    let base = serve(down, ToolRegistry::with_builtins()).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/tools/assistant", base))
        .json(&json!({ "resource_id": "kb-1", "query": "What is the fee?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "backend_unavailable");
}
