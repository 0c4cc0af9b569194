//! Push-delivery surface.
//!
//! `POST /events` accepts one event object or an array of them. Skips return
//! 200 so the platform does not redeliver expected traffic; the first
//! pipeline error aborts the request with 500 and leaves redelivery to the
//! platform's retry policy.

use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json, Router, routing::get, routing::post};
use kvrep_core::{RawEvent, ReplicationOutcome};
use serde_json::{Value, json};
use tracing::{Instrument, error, info};

use crate::error::{AppError, attach_correlation};
use crate::state::AppState;
use crate::telemetry::{CorrelationId, correlation_layer, request_span};

const VALIDATION_EVENT_TYPE: &str = "Microsoft.EventGrid.SubscriptionValidationEvent";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/events", post(receive_events))
        .layer(middleware::from_fn(correlation_layer))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn receive_events(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Json(payload): Json<Value>,
) -> Result<Response, AppError> {
    let span = request_span("http.events", &correlation.0);
    async move {
        let events = decode_batch(payload)?;

        // subscription validation handshake never enters the pipeline
        if let Some(code) = validation_code(&events) {
            info!("answering subscription validation handshake");
            return Ok(
                (StatusCode::OK, Json(json!({ "validationResponse": code }))).into_response()
            );
        }

        let mut replicated = 0usize;
        let mut skipped = 0usize;
        for event in &events {
            match state.replicator.handle(event).await {
                Ok(ReplicationOutcome::Replicated { .. }) => replicated += 1,
                Ok(ReplicationOutcome::Skipped(_)) => skipped += 1,
                Err(err) => {
                    error!(error = %err, "replication failed");
                    return Err(AppError::from(err));
                }
            }
        }

        Ok((
            StatusCode::OK,
            Json(json!({
                "received": events.len(),
                "replicated": replicated,
                "skipped": skipped,
            })),
        )
            .into_response())
    }
    .instrument(span)
    .await
    .map_err(|err| attach_correlation(err, &correlation))
}

/// Push deliveries are either a bare event object or a batch array.
fn decode_batch(payload: Value) -> Result<Vec<RawEvent>, AppError> {
    let raw_values = match payload {
        Value::Array(values) => values,
        other => vec![other],
    };
    raw_values
        .into_iter()
        .map(|value| {
            serde_json::from_value(value)
                .map_err(|err| AppError::bad_request(format!("undecodable event: {err}")))
        })
        .collect()
}

fn validation_code(events: &[RawEvent]) -> Option<&str> {
    events.iter().find_map(|event| {
        if event.event_type.as_deref() != Some(VALIDATION_EVENT_TYPE) {
            return None;
        }
        event
            .data
            .as_ref()
            .and_then(|data| data.validation_code.as_deref())
    })
}
