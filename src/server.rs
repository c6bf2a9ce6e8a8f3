//! HTTP/SSE server (`SPEC_FULL.md` §4, `serve` subcommand) binding the
//! planner and executor behind a small REST surface: `POST /plan` streams
//! planner progress as Server-Sent Events, `POST /run` executes a pipeline
//! to completion and returns its results, `GET /health` reports readiness.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::AgentFlowError;
use crate::executor::Doer;
use crate::planner::{Planner, PlannerEvent};
use crate::store::{RunRecord, Store, StoreError};
use crate::types::{NodeResult, PipelineJson, PlannerStatus};

/// Shared state handed to every route handler.
pub struct AppState {
    /// Decomposes intents into pipelines.
    pub planner: Planner,
    /// Runs a pipeline's DAG to completion.
    pub doer: Doer,
    /// Pipeline/run/memory storage, used to look up a saved pipeline by id.
    pub store: Arc<Store>,
}

/// Build the application [`Router`] over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/plan", post(plan))
        .route("/run", post(run))
        .route("/pipelines", post(save_pipeline).get(list_pipelines))
        .route("/pipelines/:id", get(get_pipeline).delete(delete_pipeline))
        .route("/runs/:id", get(get_run))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Thin wrapper so [`AgentFlowError`] can be returned directly from handlers.
struct ApiError(AgentFlowError);

impl From<AgentFlowError> for ApiError {
    fn from(err: AgentFlowError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentFlowError::NotFound(_) | AgentFlowError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            AgentFlowError::Validation(_) | AgentFlowError::Execution(_) => StatusCode::BAD_REQUEST,
            AgentFlowError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AgentFlowError::Cancelled => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!(error = %self.0, "request failed");
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Body of `POST /plan`.
#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    /// Natural-language goal to decompose into a pipeline.
    pub intent: String,
}

/// `POST /plan` — streams [`PlannerEvent`]s as SSE while the planner works,
/// finishing with a `done` event carrying the produced [`PipelineJson`] or a
/// `failed` event carrying the error message.
async fn plan(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PlanRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = unbounded_channel::<PlannerEvent>();

    tokio::spawn(async move {
        let result = state.planner.plan(&request.intent, &tx).await;
        let final_event = match result {
            Ok(pipeline) => PlannerEvent {
                status: PlannerStatus::Done,
                message: serde_json::to_string(&pipeline).unwrap_or_else(|_| "{}".to_owned()),
            },
            Err(err) => PlannerEvent {
                status: PlannerStatus::Failed,
                message: err.to_string(),
            },
        };
        let _ = tx.send(final_event);
    });

    let stream = UnboundedReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_owned());
        Ok(Event::default().event("planner").data(data))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Body of `POST /run`.
#[derive(Debug, Deserialize)]
pub struct RunRequest {
    /// Pipeline to execute.
    pub pipeline: PipelineJson,
    /// Id of the user the run executes on behalf of.
    pub user_id: String,
    /// Opaque per-user facts, as loaded by the caller.
    #[serde(default)]
    pub user: Value,
    /// Initial inputs injected into trigger-category nodes.
    #[serde(default)]
    pub trigger_data: Value,
}

/// Response of `POST /run`.
#[derive(Debug, Serialize)]
pub struct RunResponse {
    /// Fresh identifier assigned to this run.
    pub run_id: String,
    /// `"completed"` or `"failed"`, mirroring [`crate::store::RunStatus`].
    pub status: &'static str,
    /// Per-node results keyed by node id.
    pub results: std::collections::HashMap<String, NodeResult>,
}

/// `POST /run` — executes `pipeline` to completion and returns every node's
/// result. The run is not cancellable from this endpoint; cancellation is
/// reserved for future use by long-running clients that hold the
/// connection open.
async fn run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let outcome = state
        .doer
        .run(
            &request.pipeline,
            &request.user_id,
            request.user,
            request.trigger_data,
            CancellationToken::new(),
        )
        .await
        .map_err(AgentFlowError::from)?;

    let status = match outcome.status {
        crate::store::RunStatus::Completed => "completed",
        crate::store::RunStatus::Failed => "failed",
        crate::store::RunStatus::Running => "running",
    };

    Ok(Json(RunResponse {
        run_id: outcome.run_id,
        status,
        results: outcome.state.results,
    }))
}

/// Body of `POST /pipelines`.
#[derive(Debug, Deserialize)]
pub struct SavePipelineRequest {
    /// Pipeline to persist.
    pub pipeline: PipelineJson,
    /// Owning user id.
    pub user_id: String,
}

/// `POST /pipelines` — insert or overwrite a saved pipeline.
async fn save_pipeline(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SavePipelineRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .save_pipeline(&request.pipeline, &request.user_id)
        .await
        .map_err(AgentFlowError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /pipelines/:id` — fetch a saved pipeline by id.
async fn get_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PipelineJson>, ApiError> {
    let pipeline = state.store.get_pipeline(&id).await.map_err(AgentFlowError::from)?;
    Ok(Json(pipeline))
}

/// Query parameters for `GET /pipelines`.
#[derive(Debug, Deserialize)]
pub struct ListPipelinesQuery {
    /// User id to list saved pipelines for.
    pub user_id: String,
}

/// `GET /pipelines?user_id=...` — list every pipeline saved for a user.
async fn list_pipelines(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListPipelinesQuery>,
) -> Result<Json<Vec<PipelineJson>>, ApiError> {
    let pipelines = state
        .store
        .list_pipelines_by_user(&query.user_id)
        .await
        .map_err(AgentFlowError::from)?;
    Ok(Json(pipelines))
}

/// `DELETE /pipelines/:id` — delete a saved pipeline. No-op if absent.
async fn delete_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_pipeline(&id).await.map_err(AgentFlowError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

/// A run record projected for JSON transport (`RunRecord` embeds
/// [`crate::types::RunState`], which carries no `Serialize` impl of its own).
#[derive(Debug, Serialize)]
pub struct RunRecordResponse {
    /// Run identifier.
    pub run_id: String,
    /// Pipeline this run executed.
    pub pipeline_id: String,
    /// User the run was performed for.
    pub user_id: String,
    /// `"running"`, `"completed"`, or `"failed"`.
    pub status: &'static str,
    /// Per-node results keyed by node id.
    pub results: std::collections::HashMap<String, NodeResult>,
    /// RFC 3339 start timestamp.
    pub started_at: String,
    /// RFC 3339 completion timestamp, absent while still running.
    pub completed_at: Option<String>,
}

impl From<RunRecord> for RunRecordResponse {
    fn from(record: RunRecord) -> Self {
        let status = match record.status {
            crate::store::RunStatus::Running => "running",
            crate::store::RunStatus::Completed => "completed",
            crate::store::RunStatus::Failed => "failed",
        };
        Self {
            run_id: record.run_id,
            pipeline_id: record.pipeline_id,
            user_id: record.user_id,
            status,
            results: record.state.results,
            started_at: record.started_at.to_rfc3339(),
            completed_at: record.completed_at.map(|ts| ts.to_rfc3339()),
        }
    }
}

/// `GET /runs/:id` — fetch a run's terminal state.
async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunRecordResponse>, ApiError> {
    let record = state.store.get_run(&id).await.map_err(AgentFlowError::from)?;
    Ok(Json(record.into()))
}
