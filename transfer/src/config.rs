//! Configuration management for the transfer saga.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Unlike a missing variable, an unparseable one is an error: the process
//! refuses to start rather than silently running with a default.

use crate::error::ConfigurationError;
use crate::ledger::DEFAULT_SUCCESS_RATE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// RedPanda/Kafka configuration
    pub redpanda: RedpandaConfig,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Saga behaviour
    pub saga: SagaConfig,
}

/// RedPanda/Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedpandaConfig {
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Topic carrying every saga event
    pub topic: String,
    /// Prefix of the per-role consumer groups (`{prefix}-{role}`)
    pub consumer_group_prefix: String,
    /// Where a new consumer group starts: `earliest` or `latest`
    pub auto_offset_reset: String,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
}

/// Saga behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaConfig {
    /// Largest batch handed to a role at once
    pub batch_max_size: usize,
    /// Probability that a simulated step succeeds
    pub step_success_rate: f64,
    /// Which ledger backs the processors and compensators
    pub ledger_mode: LedgerMode,
    /// Seconds to wait before a consumer resubscribes
    pub consumer_retry_delay: u64,
}

/// Ledger backing the saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerMode {
    /// Weighted coin, no balances
    Simulated,
    /// Real balances in process memory
    InMemory,
}

impl FromStr for LedgerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simulated" => Ok(Self::Simulated),
            "in-memory" => Ok(Self::InMemory),
            _ => Err("expected 'simulated' or 'in-memory'".to_string()),
        }
    }
}

impl fmt::Display for LedgerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simulated => "simulated",
            Self::InMemory => "in-memory",
        })
    }
}

impl ServerConfig {
    /// Address to bind the HTTP listener to.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Graceful shutdown timeout.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

impl SagaConfig {
    /// Delay before a consumer resubscribes.
    #[must_use]
    pub const fn consumer_retry_delay(&self) -> Duration {
        Duration::from_secs(self.consumer_retry_delay)
    }
}

impl RedpandaConfig {
    /// Consumer group of `role`.
    #[must_use]
    pub fn consumer_group(&self, role: &str) -> String {
        format!("{}-{role}", self.consumer_group_prefix)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redpanda: RedpandaConfig {
                brokers: "localhost:9092".to_string(),
                topic: "transfers".to_string(),
                consumer_group_prefix: "transfer-saga".to_string(),
                auto_offset_reset: "latest".to_string(),
            },
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                shutdown_timeout: 30,
            },
            saga: SagaConfig {
                batch_max_size: 100,
                step_success_rate: DEFAULT_SUCCESS_RATE,
                ledger_mode: LedgerMode::Simulated,
                consumer_retry_delay: 5,
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidValue`] when a variable is set
    /// but cannot be parsed or is out of range.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigurationError> {
        let defaults = Self::default();
        let text = |name: &str, default: String| lookup(name).unwrap_or(default);

        let config = Self {
            redpanda: RedpandaConfig {
                brokers: text("REDPANDA_BROKERS", defaults.redpanda.brokers),
                topic: text("SAGA_TOPIC", defaults.redpanda.topic),
                consumer_group_prefix: text(
                    "CONSUMER_GROUP_PREFIX",
                    defaults.redpanda.consumer_group_prefix,
                ),
                auto_offset_reset: text(
                    "REDPANDA_AUTO_OFFSET_RESET",
                    defaults.redpanda.auto_offset_reset,
                ),
            },
            server: ServerConfig {
                host: text("HOST", defaults.server.host),
                port: parsed(&lookup, "PORT", defaults.server.port)?,
                shutdown_timeout: parsed(
                    &lookup,
                    "SHUTDOWN_TIMEOUT_SECS",
                    defaults.server.shutdown_timeout,
                )?,
            },
            saga: SagaConfig {
                batch_max_size: parsed(&lookup, "BATCH_MAX_SIZE", defaults.saga.batch_max_size)?,
                step_success_rate: parsed(
                    &lookup,
                    "STEP_SUCCESS_RATE",
                    defaults.saga.step_success_rate,
                )?,
                ledger_mode: parsed(&lookup, "LEDGER_MODE", defaults.saga.ledger_mode)?,
                consumer_retry_delay: parsed(
                    &lookup,
                    "CONSUMER_RETRY_DELAY_SECS",
                    defaults.saga.consumer_retry_delay,
                )?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |name, value: String, reason: &str| ConfigurationError::InvalidValue {
            name,
            value,
            reason: reason.to_string(),
        };

        if self.redpanda.topic.trim().is_empty() {
            return Err(invalid("SAGA_TOPIC", self.redpanda.topic.clone(), "must not be empty"));
        }
        if !matches!(self.redpanda.auto_offset_reset.as_str(), "earliest" | "latest") {
            return Err(invalid(
                "REDPANDA_AUTO_OFFSET_RESET",
                self.redpanda.auto_offset_reset.clone(),
                "expected 'earliest' or 'latest'",
            ));
        }
        if self.saga.batch_max_size == 0 {
            return Err(invalid("BATCH_MAX_SIZE", "0".to_string(), "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.saga.step_success_rate) {
            return Err(invalid(
                "STEP_SUCCESS_RATE",
                self.saga.step_success_rate.to_string(),
                "must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigurationError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigurationError::InvalidValue {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> Result<Config, ConfigurationError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = from_vars(&[]).unwrap();
        assert_eq!(config.redpanda.brokers, "localhost:9092");
        assert_eq!(config.redpanda.topic, "transfers");
        assert_eq!(config.server.bind_address(), "0.0.0.0:3000");
        assert_eq!(config.saga.step_success_rate, 0.8);
        assert_eq!(config.saga.ledger_mode, LedgerMode::Simulated);
        assert_eq!(
            config.redpanda.consumer_group("deposit-processor"),
            "transfer-saga-deposit-processor"
        );
    }

    #[test]
    fn variables_override_defaults() {
        let config = from_vars(&[
            ("PORT", "8080"),
            ("LEDGER_MODE", "in-memory"),
            ("BATCH_MAX_SIZE", "10"),
            ("STEP_SUCCESS_RATE", "1.0"),
        ])
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.saga.ledger_mode, LedgerMode::InMemory);
        assert_eq!(config.saga.batch_max_size, 10);
        assert_eq!(config.saga.step_success_rate, 1.0);
    }

    #[test]
    fn unparseable_values_are_errors() {
        let err = from_vars(&[("PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { name: "PORT", .. }));

        let err = from_vars(&[("LEDGER_MODE", "postgres")]).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { name: "LEDGER_MODE", .. }));
    }

    #[test]
    fn out_of_range_values_are_errors() {
        assert!(from_vars(&[("STEP_SUCCESS_RATE", "1.5")]).is_err());
        assert!(from_vars(&[("BATCH_MAX_SIZE", "0")]).is_err());
        assert!(from_vars(&[("REDPANDA_AUTO_OFFSET_RESET", "never")]).is_err());
    }
}
