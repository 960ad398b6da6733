//! HTTP tool server.
//!
//! Every built-in tool is served through one dispatch route, and the same
//! registry backs the MCP endpoint.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/tools/list` | List all registered tools with schemas |
//! | `POST` | `/tools/{name}` | Call a tool by name |
//! | `*`    | `/mcp` | MCP streamable-HTTP (JSON-RPC) endpoint |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `tool_error` (500), `backend_unavailable` (503).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::backend::Services;
use crate::config::Config;
use crate::mcp::McpBridge;
use crate::tools::{validate_params, ToolInfo};
use crate::traits::{ToolContext, ToolRegistry};

/// Shared state passed to every handler.
#[derive(Clone)]
struct AppState {
    services: Arc<Services>,
    tools: Arc<ToolRegistry>,
}

/// Start the server on `[server].bind` with the built-in tools.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let services = Arc::new(Services::from_config(config)?);
    run_server_with_tools(services, Arc::new(ToolRegistry::with_builtins())).await
}

/// Start the server with an explicit service set and tool registry.
pub async fn run_server_with_tools(
    services: Arc<Services>,
    tools: Arc<ToolRegistry>,
) -> anyhow::Result<()> {
    let bind_addr = services.config().server.bind.clone();
    info!(summary = %services.config().masked_summary(), "services configured");
    for t in tools.tools() {
        info!(tool = t.name(), "registered tool");
    }

    let app = build_router(services, tools);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router. Split from [`run_server_with_tools`] so tests can
/// serve it on an ephemeral port.
pub fn build_router(services: Arc<Services>, tools: Arc<ToolRegistry>) -> Router {
    let bridge = McpBridge::new(services.clone(), tools.clone());
    let mcp = StreamableHttpService::new(
        move || Ok(bridge.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .nest_service("/mcp", mcp)
        .layer(cors)
        .with_state(AppState { services, tools })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code,
        message: message.into(),
    }
}

/// Map a tool failure to an HTTP status by its message, so tools can
/// signal client errors without a custom error type.
fn classify_tool_error(tool_name: &str, err: anyhow::Error) -> AppError {
    let msg = format!("{:#}", err);
    let message = format!("{}: {}", tool_name, msg);

    if msg.contains("not found") {
        app_error(StatusCode::NOT_FOUND, "not_found", message)
    } else if msg.contains("must not be empty")
        || msg.contains("invalid")
        || msg.contains("missing required")
    {
        app_error(StatusCode::BAD_REQUEST, "bad_request", message)
    } else if msg.contains("timed out") {
        app_error(StatusCode::REQUEST_TIMEOUT, "timeout", message)
    } else if msg.contains("unavailable") {
        app_error(StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable", message)
    } else {
        app_error(StatusCode::INTERNAL_SERVER_ERROR, "tool_error", message)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    let tools = state
        .tools
        .tools()
        .iter()
        .map(|t| ToolInfo::of(t.as_ref()))
        .collect();
    Json(ToolListResponse { tools })
}

// ============ POST /tools/{name} ============

/// Dispatch a tool call. `404` for unknown tools, `400` for parameter
/// errors, otherwise whatever [`classify_tool_error`] decides.
async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tool = state.tools.find(&name).ok_or_else(|| {
        app_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no tool registered with name: {}", name),
        )
    })?;

    let params = validate_params(&tool.parameters_schema(), &params)
        .map_err(|e| app_error(StatusCode::BAD_REQUEST, "bad_request", e.to_string()))?;

    let ctx = ToolContext::new(state.services.clone());
    let result = tool
        .execute(params, &ctx)
        .await
        .map_err(|e| classify_tool_error(&name, e))?;

    Ok(Json(serde_json::json!({ "result": result })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let c = |m: &str| classify_tool_error("t", anyhow::anyhow!(m.to_string())).status;
        assert_eq!(c("query must not be empty"), StatusCode::BAD_REQUEST);
        assert_eq!(c("invalid config: top_k_recall"), StatusCode::BAD_REQUEST);
        assert_eq!(c("document not found"), StatusCode::NOT_FOUND);
        assert_eq!(c("llm request timed out"), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            c("backend unavailable: retrieval: refused"),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(c("boom"), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
