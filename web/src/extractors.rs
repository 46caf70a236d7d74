//! Custom Axum extractors.
//!
//! - [`CorrelationId`]: the request's correlation id, as assigned by
//!   [`correlation_id_layer`](crate::middleware::correlation_id_layer)
//!
//! # Examples
//!
//! ```ignore
//! use saga_web::CorrelationId;
//!
//! async fn handler(correlation_id: CorrelationId) -> String {
//!     tracing::info!(correlation_id = %correlation_id, "Processing request");
//!     format!("Request ID: {correlation_id}")
//! }
//! ```

use crate::middleware::CORRELATION_ID_HEADER;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use std::fmt;
use uuid::Uuid;

/// Longest correlation id accepted from a client.
const MAX_CORRELATION_ID_LEN: usize = 128;

/// Correlation id for request tracing.
///
/// Clients may send their own id in `X-Correlation-ID`; any non-empty,
/// visible-ASCII value of up to 128 characters is kept as is. Otherwise a
/// UUID v4 is generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh correlation id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a client-supplied value if it is usable as a correlation id.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let usable = !value.is_empty()
            && value.len() <= MAX_CORRELATION_ID_LEN
            && value.bytes().all(|b| b.is_ascii_graphic());
        usable.then(|| Self(value.to_string()))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the id from request headers, generating one if absent or unusable.
    #[must_use]
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        headers
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse)
            .unwrap_or_else(Self::generate)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CorrelationId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // The middleware's id wins so logs and the response header agree
        if let Some(id) = parts.extensions.get::<Self>() {
            return Ok(id.clone());
        }
        Ok(Self::from_headers(&parts.headers))
    }
}
