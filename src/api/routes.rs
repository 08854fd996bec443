//! API route definitions.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::state::AppState;
use super::ApiError;
use crate::plan::JobPayload;
use crate::queue::CancelOutcome;
use crate::quota::ResourceKind;
use crate::usage::Metric;

type ApiResult<T> = Result<T, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", post(submit_run))
        .route("/runs/{run_id}", get(get_run).delete(cancel_run))
        .route("/runs/{run_id}/logs", get(run_logs))
        .route(
            "/usage/{tenant_id}/{metric}",
            get(usage_stats).post(record_usage),
        )
        .route("/quota/{tenant_id}/admission/{kind}", post(check_admission))
        .route("/events", get(events))
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let engines = state.engines.stats().await;
    let queue = state.pipeline.jobs().counts()?;
    Ok(Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "engines": engines,
            "queue": queue,
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }
    })))
}

#[derive(Deserialize)]
struct SubmitRequest {
    payload: JobPayload,
    #[serde(default)]
    priority: i64,
}

async fn submit_run(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let handle = state.pipeline.submit(req.payload, req.priority).await?;
    let status = if handle.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(json!({ "data": handle }))))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let view = state.pipeline.status(&run_id)?;
    if view.is_empty() {
        return Err(ApiError::NotFound(format!("run '{run_id}'")));
    }
    Ok(Json(json!({ "data": view })))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let outcome = state.pipeline.cancel(&run_id)?;
    if outcome == CancelOutcome::NotFound {
        return Err(ApiError::NotFound(format!("run '{run_id}'")));
    }
    Ok(Json(json!({ "data": { "runId": run_id, "outcome": outcome } })))
}

async fn run_logs(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if state.pipeline.run(&run_id)?.is_none() {
        return Err(ApiError::NotFound(format!("run '{run_id}'")));
    }
    let logs = state.pipeline.runs().logs(&run_id)?;
    Ok(Json(json!({ "data": logs, "meta": { "total": logs.len() } })))
}

fn parse_metric(raw: &str) -> ApiResult<Metric> {
    raw.parse()
        .map_err(|e: anyhow::Error| ApiError::Invalid(e.to_string()))
}

async fn usage_stats(
    State(state): State<AppState>,
    Path((tenant_id, metric)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let metric = parse_metric(&metric)?;
    let stats = state.meter.stats(&tenant_id, metric).await?;
    Ok(Json(json!({ "data": stats })))
}

#[derive(Deserialize)]
struct UsageIncrement {
    amount: i64,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn record_usage(
    State(state): State<AppState>,
    Path((tenant_id, metric)): Path<(String, String)>,
    Json(req): Json<UsageIncrement>,
) -> ApiResult<Json<Value>> {
    let metric = parse_metric(&metric)?;
    let current = state
        .meter
        .increment(&tenant_id, metric, req.amount, req.metadata.as_ref())
        .await?;
    Ok(Json(json!({
        "data": { "metric": metric, "current": current, "recorded": current.is_some() }
    })))
}

async fn check_admission(
    State(state): State<AppState>,
    Path((tenant_id, kind)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let kind: ResourceKind = kind
        .parse()
        .map_err(|e: anyhow::Error| ApiError::Invalid(e.to_string()))?;
    let admission = state.pipeline.quota().check_admission(&tenant_id, kind)?;
    Ok(Json(json!({ "data": admission })))
}

#[derive(Deserialize)]
struct EventFilter {
    run_id: Option<String>,
}

async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.pipeline.events().subscribe();
    debug!(run_id = ?filter.run_id, "event stream opened");

    let stream = stream::unfold((rx, filter.run_id), |(mut rx, run_id)| async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            };
            if run_id.as_deref().is_some_and(|id| event.run_id() != Some(id)) {
                continue;
            }
            match Event::default().event(event.name()).json_data(&event) {
                Ok(sse) => return Some((Ok(sse), (rx, run_id))),
                Err(e) => warn!(error = %e, "failed to encode event"),
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
