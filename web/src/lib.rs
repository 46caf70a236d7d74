//! Axum integration for the transfer saga's HTTP ingress.
//!
//! This crate holds the HTTP plumbing that is independent of the transfer
//! domain:
//!
//! - [`AppError`]: one error type for every handler, rendered as
//!   `{"code": ..., "message": ...}`
//! - [`correlation_id_layer`]: correlation id tracking and per-request spans
//! - [`CorrelationId`]: extractor for the request's correlation id
//! - [`handlers::health_check`]: liveness endpoint
//!
//! # Example
//!
//! ```ignore
//! use saga_web::{AppError, CorrelationId, correlation_id_layer, handlers::health_check};
//! use axum::{Router, routing::{get, post}, Json};
//!
//! async fn create(
//!     correlation_id: CorrelationId,
//!     Json(request): Json<CreateRequest>,
//! ) -> Result<Json<CreateResponse>, AppError> {
//!     let response = service.create(request).await?;
//!     Ok(Json(response))
//! }
//!
//! let app = Router::new()
//!     .route("/health", get(health_check))
//!     .route("/things", post(create))
//!     .layer(correlation_id_layer());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;

// Re-export key types for convenience
pub use error::AppError;
pub use extractors::CorrelationId;
pub use middleware::{CORRELATION_ID_HEADER, correlation_id_layer};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
