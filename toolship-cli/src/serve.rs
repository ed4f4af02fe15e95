//! HTTP adapter built on axum.
//!
//! One request maps to exactly one `run_tool` call. Tool failures are still
//! `200 OK` with `succeeded: false` in the body; only requests toolship
//! could not act on get an error status.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use toolship_core::error::{CatalogError, ExecError};
use toolship_core::{Target, ToolOptions, Toolship, ToolshipError};
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
struct AppState {
    toolship: Arc<Toolship>,
    shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    target: Target,
    #[serde(default)]
    options: ToolOptions,
}

/// Build the router with the catalog and run routes.
fn router(toolship: Arc<Toolship>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/tools", get(list_tools))
        .route("/v1/tools/{tool}/{operation}", post(run_tool))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { toolship, shutdown })
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_tools(State(state): State<AppState>) -> impl IntoResponse {
    let tools: Vec<_> = state.toolship.catalog().tools().collect();
    Json(serde_json::json!({ "tools": tools }))
}

async fn run_tool(
    State(state): State<AppState>,
    Path((tool, operation)): Path<(String, String)>,
    Json(request): Json<RunRequest>,
) -> Response {
    // Each request gets its own token so server shutdown cancels it.
    let cancel = state.shutdown.child_token();
    match state
        .toolship
        .run_tool(&tool, &operation, &request.target, &request.options, &cancel)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &ToolshipError) -> Response {
    let status = match err {
        ToolshipError::Catalog(CatalogError::UnknownTool { .. })
        | ToolshipError::Catalog(CatalogError::UnknownOperation { .. }) => StatusCode::NOT_FOUND,
        ToolshipError::Catalog(_)
        | ToolshipError::Option(_)
        | ToolshipError::Exec(ExecError::TargetNotFound { .. })
        | ToolshipError::Exec(ExecError::InvalidTarget { .. }) => StatusCode::BAD_REQUEST,
        ToolshipError::Exec(ExecError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

/// Serve until `shutdown` is cancelled.
pub async fn run(
    toolship: Toolship,
    bind: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(Arc::new(toolship), shutdown.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "Serving toolship API");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use toolship_core::ToolshipConfig;
    use toolship_core::runtime::scripted::{Response as Scripted, ScriptedRuntime};
    use tower::ServiceExt;

    fn app(runtime: ScriptedRuntime) -> Router {
        let toolship = Toolship::new(Arc::new(runtime), ToolshipConfig::default());
        router(Arc::new(toolship), CancellationToken::new())
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = ServiceExt::<Request<Body>>::oneshot(app, req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1_000_000)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_tools() {
        let req = Request::builder().uri("/v1/tools").body(Body::empty()).unwrap();
        let (status, json) = send(app(ScriptedRuntime::new()), req).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = json["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"checkov"));
        assert!(names.contains(&"openinfraquote"));
    }

    #[tokio::test]
    async fn test_run_returns_result_envelope() {
        let dir = TempDir::new().unwrap();
        let runtime = ScriptedRuntime::new().on(
            "bridgecrew/checkov:latest",
            &["checkov"],
            Scripted::exit(1, "{\"summary\":{\"failed\":2}}", ""),
        );
        let body = serde_json::json!({
            "target": { "kind": "local_directory", "path": dir.path() },
            "options": { "framework": "terraform", "compact": true }
        });
        let (status, json) = send(app(runtime), post_json("/v1/tools/checkov/scan", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["succeeded"], true);
        assert_eq!(json["classification"], "findings_tolerated");
        assert_eq!(json["exit_code"], 1);
    }

    #[tokio::test]
    async fn test_tool_failure_is_not_an_http_error() {
        let dir = TempDir::new().unwrap();
        let runtime = ScriptedRuntime::new().on(
            "aquasec/trivy:latest",
            &["trivy"],
            Scripted::exit(2, "", "FATAL database download failed"),
        );
        let body =
            serde_json::json!({ "target": { "kind": "local_directory", "path": dir.path() } });
        let (status, json) = send(app(runtime), post_json("/v1/tools/trivy/fs", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["succeeded"], false);
        assert!(json["stderr"].as_str().unwrap().contains("database download failed"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let body =
            serde_json::json!({ "target": { "kind": "container_image", "reference": "alpine" } });
        let (status, json) =
            send(app(ScriptedRuntime::new()), post_json("/v1/tools/nmap/scan", body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("nmap"));
    }

    #[tokio::test]
    async fn test_missing_target_is_bad_request() {
        let body =
            serde_json::json!({ "target": { "kind": "local_directory", "path": "/no/such/dir" } });
        let (status, _) =
            send(app(ScriptedRuntime::new()), post_json("/v1/tools/semgrep/scan", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
