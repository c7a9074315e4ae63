use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::jobs::{JobQueue, QueueName, TriggerSource};
use crate::provider::EmailProvider;
use crate::scheduler::{Scheduler, TriggerError};
use crate::store::CampaignStore;
use crate::template::TemplateEngine;

pub mod models;

use models::{
    AutomationFilter, ErrorBody, FailedJobItem, FailedJobsResponse, HealthResponse,
    PreviewRequest, PreviewResponse, QueueStatusResponse, RetryAllResponse, RetryResponse,
    RunDetail, TriggerResponse,
};

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Scheduler,
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn CampaignStore>,
    pub provider: Arc<dyn EmailProvider>,
    pub templates: TemplateEngine,
    /// Set by the scheduler loop while it is ticking.
    pub scheduler_running: Arc<AtomicBool>,
    pub scheduler_enabled: bool,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/trigger/:id", post(trigger))
        .route("/health", get(health))
        .route("/quota", get(quota))
        // Queue introspection
        .route("/queue/status", get(queue_status))
        .route("/queue/failed", get(list_failed))
        .route("/queue/retry/:job_id", post(retry_job))
        .route("/queue/retry-all", post(retry_all))
        .route("/runs/:id", get(get_run))
        .route("/templates/preview", post(preview_template))
        .with_state(state)
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn fail(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody::new(msg)))
}

fn internal_err(e: anyhow::Error) -> ApiError {
    error!(error = %e, "request failed");
    fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub async fn trigger(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let automation_id: i64 = id
        .parse()
        .map_err(|_| fail(StatusCode::BAD_REQUEST, "Invalid automation ID"))?;

    info!(automation_id, "manual trigger received");
    match state
        .scheduler
        .trigger_manual(automation_id, TriggerSource::Api)
        .await
    {
        Ok(receipt) => Ok(Json(TriggerResponse {
            success: true,
            run_id: receipt.run_id,
            job_id: receipt.job_id,
        })),
        Err(e @ TriggerError::ConfigNotFound(_)) => Err(fail(StatusCode::NOT_FOUND, e.to_string())),
        Err(TriggerError::Infra(e)) => Err(internal_err(e)),
    }
}

pub async fn health(State(state): State<ApiState>) -> Response {
    let queue_connected = state.queue.ping().await.is_ok();
    let scheduler_running = state.scheduler_running.load(Ordering::SeqCst);
    let healthy = queue_connected && (scheduler_running || !state.scheduler_enabled);

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" },
            scheduler_running,
            queue_connected,
        }),
    )
        .into_response()
}

pub async fn quota(State(state): State<ApiState>) -> Response {
    match state.provider.quota().await {
        Ok(q) => (StatusCode::OK, Json(q)).into_response(),
        Err(e) => {
            error!(provider = state.provider.name(), error = %e, "quota lookup failed");
            fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn queue_status(State(state): State<ApiState>) -> Result<Json<QueueStatusResponse>, ApiError> {
    let send = state.queue.counts(QueueName::Send).await.map_err(internal_err)?;
    let run_queue = state.queue.counts(QueueName::Run).await.map_err(internal_err)?;
    Ok(Json(QueueStatusResponse { send, run_queue }))
}

pub async fn list_failed(
    State(state): State<ApiState>,
    Query(filter): Query<AutomationFilter>,
) -> Result<Json<FailedJobsResponse>, ApiError> {
    let jobs: Vec<FailedJobItem> = state
        .queue
        .list_failed(QueueName::Send, filter.automation_id)
        .await
        .map_err(internal_err)?
        .into_iter()
        .map(FailedJobItem::from)
        .collect();

    Ok(Json(FailedJobsResponse {
        count: jobs.len(),
        jobs,
    }))
}

pub async fn retry_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<RetryResponse>, ApiError> {
    let job_id: Uuid = job_id
        .parse()
        .map_err(|_| fail(StatusCode::BAD_REQUEST, "Invalid job ID"))?;

    if !state.queue.retry_failed(job_id).await.map_err(internal_err)? {
        return Err(fail(StatusCode::NOT_FOUND, "job not found in the failed set"));
    }
    info!(%job_id, "failed job re-submitted");
    Ok(Json(RetryResponse {
        success: true,
        job_id,
    }))
}

pub async fn retry_all(
    State(state): State<ApiState>,
    Query(filter): Query<AutomationFilter>,
) -> Result<Json<RetryAllResponse>, ApiError> {
    let retried = state
        .queue
        .retry_all_failed(QueueName::Send, filter.automation_id)
        .await
        .map_err(internal_err)?;

    info!(retried, automation_id = ?filter.automation_id, "failed jobs re-submitted");
    Ok(Json(RetryAllResponse {
        success: true,
        retried,
    }))
}

pub async fn get_run(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<RunDetail>, ApiError> {
    let run_id: Uuid = id
        .parse()
        .map_err(|_| fail(StatusCode::BAD_REQUEST, "Invalid run ID"))?;

    let run = state
        .store
        .get_run(run_id)
        .await
        .map_err(internal_err)?
        .ok_or_else(|| fail(StatusCode::NOT_FOUND, "run not found"))?;
    let records = state
        .store
        .list_send_records(run_id)
        .await
        .map_err(internal_err)?;

    Ok(Json(RunDetail { run, records }))
}

pub async fn preview_template(
    State(state): State<ApiState>,
    Json(body): Json<PreviewRequest>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let rendered = state
        .templates
        .preview(&body.template, body.data.as_ref())
        .map_err(|e| fail(StatusCode::BAD_REQUEST, e.to_string()))?;
    let variables = state
        .templates
        .extract_variables(&body.template)
        .into_iter()
        .collect();

    Ok(Json(PreviewResponse { rendered, variables }))
}
