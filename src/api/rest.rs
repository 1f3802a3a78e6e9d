//! REST surface for laneforge (spec.md §6, restricted to the saga client
//! surface): submit a saga against a registered definition, inspect status,
//! list, trigger manual compensation, and watch a saga until it reaches a
//! terminal state.

use crate::cancel::CancelToken;
use crate::core::lane_manager::LaneManager;
use crate::core::orchestrator::SagaOrchestrator;
use crate::core::saga::SagaInstance;
use crate::core::saga_store::{SagaFilter, SagaStore};
use crate::errors::{EngineError, RpcCode};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<SagaOrchestrator>,
    pub saga_store: Arc<SagaStore>,
    pub lane_manager: Arc<LaneManager>,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match self.code() {
            RpcCode::InvalidArgument => axum::http::StatusCode::BAD_REQUEST,
            RpcCode::NotFound => axum::http::StatusCode::NOT_FOUND,
            RpcCode::FailedPrecondition => axum::http::StatusCode::CONFLICT,
            RpcCode::Unavailable => axum::http::StatusCode::SERVICE_UNAVAILABLE,
            RpcCode::Canceled => axum::http::StatusCode::from_u16(499).unwrap(),
            RpcCode::Internal => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct SubmitSagaRequest {
    /// Client-supplied instance id; a fresh uuid is assigned if omitted.
    saga_id: Option<String>,
    definition_id: String,
    input: serde_json::Value,
}

#[derive(Serialize)]
struct SubmitSagaResponse {
    saga_id: String,
}

async fn submit_saga(
    State(state): State<ApiState>,
    Json(req): Json<SubmitSagaRequest>,
) -> Result<Json<SubmitSagaResponse>, EngineError> {
    if state.orchestrator.definition(&req.definition_id).is_none() {
        return Err(EngineError::NotFound(format!("saga definition {}", req.definition_id)));
    }
    let orchestrator = state.orchestrator.clone();
    let saga_id = req.saga_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let definition_id = req.definition_id;
    let input = req.input;
    let response_id = saga_id.clone();
    tokio::spawn(async move {
        let cancel = CancelToken::new();
        if let Err(e) = orchestrator.execute(&saga_id, &definition_id, input, &cancel).await {
            tracing::warn!(saga_id = %saga_id, error = %e, "saga execution ended with an error");
        }
    });
    Ok(Json(SubmitSagaResponse { saga_id: response_id }))
}

async fn get_saga_status(
    State(state): State<ApiState>,
    Path(saga_id): Path<String>,
) -> Result<Json<SagaInstance>, EngineError> {
    match state.orchestrator.get(&saga_id) {
        Some(instance) => Ok(Json(instance)),
        None => match state.saga_store.get(&saga_id)? {
            Some(instance) => Ok(Json(instance)),
            None => Err(EngineError::NotFound(format!("saga {saga_id}"))),
        },
    }
}

#[derive(Deserialize, Default)]
struct ListSagasQuery {
    state: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_sagas(
    State(state): State<ApiState>,
    Query(query): Query<ListSagasQuery>,
) -> Result<Json<Vec<SagaInstance>>, EngineError> {
    let filter = SagaFilter {
        state: query
            .state
            .as_deref()
            .map(parse_state)
            .transpose()?,
        limit: query.limit.unwrap_or(0),
        offset: query.offset.unwrap_or(0),
    };
    Ok(Json(state.saga_store.list(&filter)?))
}

fn parse_state(raw: &str) -> Result<crate::core::saga::SagaState, EngineError> {
    use crate::core::saga::SagaState::*;
    match raw {
        "created" => Ok(Created),
        "running" => Ok(Running),
        "completed" => Ok(Completed),
        "compensating" => Ok(Compensating),
        "pending_compensation" => Ok(PendingCompensation),
        "recovering" => Ok(Recovering),
        "compensated" => Ok(Compensated),
        "compensation_failed" => Ok(CompensationFailed),
        other => Err(EngineError::InvalidArgument(format!("unknown saga state {other}"))),
    }
}

#[derive(Deserialize, Default)]
struct CancelSagaRequest {
    #[serde(default)]
    force: bool,
}

async fn cancel_saga(
    State(state): State<ApiState>,
    Path(saga_id): Path<String>,
    Json(req): Json<CancelSagaRequest>,
) -> Result<axum::http::StatusCode, EngineError> {
    state.orchestrator.cancel(&saga_id, req.force)?;
    Ok(axum::http::StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct CompensateSagaRequest {
    reason: String,
}

async fn compensate_saga(
    State(state): State<ApiState>,
    Path(saga_id): Path<String>,
    Json(req): Json<CompensateSagaRequest>,
) -> Result<axum::http::StatusCode, EngineError> {
    state.orchestrator.trigger_compensation(&saga_id, &req.reason).await?;
    Ok(axum::http::StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct WatchSagaQuery {
    poll_interval_ms: Option<u64>,
}

async fn watch_saga(
    State(state): State<ApiState>,
    Path(saga_id): Path<String>,
    Query(query): Query<WatchSagaQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, EngineError> {
    if state.orchestrator.get(&saga_id).is_none() && state.saga_store.get(&saga_id)?.is_none() {
        return Err(EngineError::NotFound(format!("saga {saga_id}")));
    }
    let interval = Duration::from_millis(query.poll_interval_ms.unwrap_or(500).max(50));
    let orchestrator = state.orchestrator.clone();
    let saga_store = state.saga_store.clone();

    let events = stream::unfold(false, move |done| {
        let orchestrator = orchestrator.clone();
        let saga_store = saga_store.clone();
        let saga_id = saga_id.clone();
        async move {
            if done {
                return None;
            }
            tokio::time::sleep(interval).await;
            let instance = orchestrator
                .get(&saga_id)
                .or_else(|| saga_store.get(&saga_id).ok().flatten());
            let Some(instance) = instance else {
                return None;
            };
            let terminal = instance.state.is_terminal();
            let event = Event::default().json_data(&instance).unwrap_or_else(|_| Event::default());
            Some((Ok(event), terminal))
        }
    });

    Ok(Sse::new(events))
}

async fn lane_stats(State(state): State<ApiState>) -> Json<Vec<crate::core::lane::LaneStatsSnapshot>> {
    Json(state.lane_manager.stats())
}

pub fn create_rest_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/sagas", post(submit_saga).get(list_sagas))
        .route("/api/v1/sagas/:saga_id", get(get_saga_status))
        .route("/api/v1/sagas/:saga_id/cancel", post(cancel_saga))
        .route("/api/v1/sagas/:saga_id/compensate", post(compensate_saga))
        .route("/api/v1/sagas/:saga_id/watch", get(watch_saga))
        .route("/api/v1/lanes/stats", get(lane_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
