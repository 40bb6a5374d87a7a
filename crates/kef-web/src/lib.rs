//! Axum JSON control surface for the importer.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use kef_core::FailedImport;
use kef_sync::{ImportConfig, ImportError, ImportService, SchedulerStatus};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "kef-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ImportService>,
    pub default_interval: Duration,
}

impl AppState {
    pub fn new(service: Arc<ImportService>, default_interval: Duration) -> Self {
        Self {
            service,
            default_interval,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CursorRequest {
    row: u32,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    scheduler: SchedulerStatus,
    cursor: u32,
    pending_failures: usize,
}

#[derive(Debug, Serialize)]
struct FailuresResponse {
    total: usize,
    failures: Vec<FailedImport>,
}

/// Maps [`ImportError`] onto status codes with an `{"error": ...}` body.
struct ApiError(ImportError);

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ImportError::Validation(_) => StatusCode::BAD_REQUEST,
            ImportError::UnknownFailure(_) => StatusCode::NOT_FOUND,
            ImportError::Transport(_) => StatusCode::BAD_GATEWAY,
            ImportError::Persistence(_) | ImportError::Scheduler(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %self.0, "import api request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(ImportError::Validation(message.into()))
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/import/status", get(status_handler))
        .route("/api/import/start", post(start_handler))
        .route("/api/import/stop", post(stop_handler))
        .route("/api/import/run", post(run_handler))
        .route(
            "/api/import/failures",
            get(list_failures_handler).delete(purge_all_handler),
        )
        .route("/api/import/failures/retry", post(retry_all_handler))
        .route("/api/import/failures/{row}/retry", post(retry_handler))
        .route("/api/import/failures/{row}", axum::routing::delete(purge_handler))
        .route("/api/import/cursor", put(cursor_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("KEF_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = ImportConfig::from_env();
    let service = Arc::new(kef_sync::build_service(&config).await?);
    if config.scheduler_enabled {
        service.start(config.poll_interval()).await?;
    }

    let state = AppState::new(service.clone(), config.poll_interval());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "import api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await?;

    service.stop().await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> ApiResult<StatusResponse> {
    let scheduler = state.service.status().await;
    let cursor = state.service.cursor().await?;
    let pending_failures = state.service.list_failures().await?.len();
    Ok(Json(StatusResponse {
        scheduler,
        cursor,
        pending_failures,
    }))
}

async fn start_handler(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<SchedulerStatus> {
    let request: StartRequest = if body.is_empty() {
        StartRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| bad_request(format!("invalid body: {err}")))?
    };
    let interval = request
        .interval_secs
        .map(Duration::from_secs)
        .unwrap_or(state.default_interval);
    Ok(Json(state.service.start(interval).await?))
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> ApiResult<SchedulerStatus> {
    Ok(Json(state.service.stop().await?))
}

async fn run_handler(State(state): State<Arc<AppState>>) -> ApiResult<kef_core::CycleReport> {
    Ok(Json(state.service.run_once().await?))
}

async fn list_failures_handler(State(state): State<Arc<AppState>>) -> ApiResult<FailuresResponse> {
    let failures = state.service.list_failures().await?;
    Ok(Json(FailuresResponse {
        total: failures.len(),
        failures,
    }))
}

async fn purge_all_handler(State(state): State<Arc<AppState>>) -> ApiResult<serde_json::Value> {
    let removed = state.service.purge_all_failures().await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn retry_all_handler(State(state): State<Arc<AppState>>) -> ApiResult<kef_sync::RetryAllSummary> {
    Ok(Json(state.service.retry_all_failures().await?))
}

async fn retry_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(row): AxumPath<u32>,
) -> ApiResult<kef_sync::RetryOutcome> {
    Ok(Json(state.service.retry_failure(row).await?))
}

async fn purge_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(row): AxumPath<u32>,
) -> ApiResult<serde_json::Value> {
    state.service.purge_failure(row).await?;
    Ok(Json(serde_json::json!({ "removed": row })))
}

async fn cursor_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<serde_json::Value> {
    let request: CursorRequest =
        serde_json::from_slice(&body).map_err(|err| bad_request(format!("invalid body: {err}")))?;
    let cursor = state.service.set_cursor(request.row).await?;
    Ok(Json(serde_json::json!({ "cursor": cursor })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use kef_adapters::{CsvFileSheetReader, ScoreVocabulary};
    use kef_storage::{ImportStateStore, LocalResponseStore};
    use kef_sync::ImportPipeline;
    use std::path::Path;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let fixture = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/sample-sheet/responses.csv");
        let state = Arc::new(ImportStateStore::in_memory());
        let pipeline = ImportPipeline::new(
            Arc::new(CsvFileSheetReader::new(fixture)),
            Arc::new(LocalResponseStore::in_memory()),
            state.clone(),
            state,
        )
        .with_vocabulary(ScoreVocabulary::default());
        let service = Arc::new(ImportService::new(Arc::new(pipeline)));
        app(AppState::new(service, Duration::from_secs(300)))
    }

    fn request(method: &str, uri: &str, body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_health_and_status() {
        let app = test_app();
        let health = app.clone().oneshot(request("GET", "/health", "")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let status = app
            .oneshot(request("GET", "/api/import/status", ""))
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        let json = json_body(status).await;
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["cursor"], 1);
        assert_eq!(json["pending_failures"], 0);
    }

    #[tokio::test]
    async fn handler_smoke_run_then_list_failures() {
        let app = test_app();
        let run = app
            .clone()
            .oneshot(request("POST", "/api/import/run", ""))
            .await
            .unwrap();
        assert_eq!(run.status(), StatusCode::OK);
        let report = json_body(run).await;
        assert_eq!(report["imported"], 4);
        assert_eq!(report["new_cursor"], 7);

        let failures = app
            .clone()
            .oneshot(request("GET", "/api/import/failures", ""))
            .await
            .unwrap();
        let json = json_body(failures).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["failures"][0]["row_number"], 4);
        assert_eq!(json["failures"][0]["reason"]["error"]["kind"], "unknown_response_text");

        let retry = app
            .clone()
            .oneshot(request("POST", "/api/import/failures/4/retry", ""))
            .await
            .unwrap();
        assert_eq!(retry.status(), StatusCode::OK);
        assert_eq!(json_body(retry).await["status"], "still_failing");

        let purge = app
            .clone()
            .oneshot(request("DELETE", "/api/import/failures/4", ""))
            .await
            .unwrap();
        assert_eq!(purge.status(), StatusCode::OK);

        let missing = app
            .oneshot(request("DELETE", "/api/import/failures/4", ""))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert!(json_body(missing).await["error"].as_str().unwrap().contains("row 4"));
    }

    #[tokio::test]
    async fn handler_smoke_validation_errors() {
        let app = test_app();
        let cursor = app
            .clone()
            .oneshot(request("PUT", "/api/import/cursor", r#"{"row":0}"#))
            .await
            .unwrap();
        assert_eq!(cursor.status(), StatusCode::BAD_REQUEST);

        let start = app
            .clone()
            .oneshot(request("POST", "/api/import/start", r#"{"interval_secs":0}"#))
            .await
            .unwrap();
        assert_eq!(start.status(), StatusCode::BAD_REQUEST);

        let ok = app
            .oneshot(request("PUT", "/api/import/cursor", r#"{"row":5}"#))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(json_body(ok).await["cursor"], 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_smoke_start_and_stop() {
        let app = test_app();
        let start = app
            .clone()
            .oneshot(request("POST", "/api/import/start", ""))
            .await
            .unwrap();
        assert_eq!(start.status(), StatusCode::OK);
        let json = json_body(start).await;
        assert_eq!(json["state"], "running");
        assert_eq!(json["interval_secs"], 300);

        let stop = app
            .oneshot(request("POST", "/api/import/stop", ""))
            .await
            .unwrap();
        assert_eq!(json_body(stop).await["state"], "stopped");
    }
}
