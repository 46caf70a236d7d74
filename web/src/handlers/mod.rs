//! HTTP request handlers shared by every service.

pub mod health;

pub use health::{HealthResponse, health_check};
