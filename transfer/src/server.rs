//! HTTP ingress.
//!
//! | Method | Path         | Response                                    |
//! |--------|--------------|---------------------------------------------|
//! | POST   | `/transfers` | 202 accepted, 400 bad request, 500 on publish failure |
//! | GET    | `/health`    | 200 `{"status":"ok"}`                       |
//!
//! `POST /transfers` answers 400 with `{"code":"BAD_REQUEST","message":...}`
//! when:
//!
//! - `fromAccount`, `toAccount` or `amount` is missing, empty, zero or
//!   `false`; every such field is listed: `Missing required fields: amount`
//! - `amount` is present but negative or not a number:
//!   `Field 'amount' must be a positive number, got -5`
//! - the body is not a JSON object

use crate::codec::EventFields;
use crate::initiator::{InitiateError, TransferAccepted, TransferInitiator};
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use saga_web::handlers::health_check;
use saga_web::{AppError, CorrelationId, WebResult, correlation_id_layer};
use serde_json::{Map, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

impl From<InitiateError> for AppError {
    fn from(err: InitiateError) -> Self {
        match err {
            InitiateError::Validation(e) => Self::bad_request(e.to_string()),
            InitiateError::Encode(e) => Self::internal("Failed to encode event").with_source(e),
            InitiateError::Publish(e) => Self::from(e),
        }
    }
}

/// Build the ingress router.
#[must_use]
pub fn router(initiator: TransferInitiator) -> Router {
    Router::new()
        .route("/transfers", post(create_transfer))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(correlation_id_layer())
        .with_state(initiator)
}

/// Start a transfer.
///
/// Any JSON object is accepted by the extractor; the fields are checked by
/// the initiator so that every missing field is reported at once.
async fn create_transfer(
    State(initiator): State<TransferInitiator>,
    correlation_id: CorrelationId,
    body: Result<Json<Map<String, Value>>, JsonRejection>,
) -> WebResult<(StatusCode, Json<TransferAccepted>)> {
    let Json(body) = body?;

    let accepted = initiator.initiate(&EventFields::from_map(body)).await?;
    info!(
        correlation_id = %correlation_id,
        transfer_id = %accepted.transfer_id,
        "Transfer accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}
