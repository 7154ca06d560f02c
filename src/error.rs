use thiserror::Error;

use crate::types::Direction;

/// Malformed or incomplete inbound alert. Terminal for that alert.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    #[error("unsupported timeframe `{0}` (expected 5m, 15m or 1h)")]
    UnsupportedTimeframe(String),
    #[error("only entry signals are routed, got `{0}`")]
    NotAnEntry(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskError {
    #[error("{cap} loss cap exceeded: losses {losses:.2} / cap {limit:.2}")]
    RiskCapExceeded {
        cap: &'static str,
        losses: f64,
        limit: f64,
    },
    #[error("sized volume {volume:.4} below minimum {min:.4} (remaining budget {budget:.2})")]
    BudgetExhausted { volume: f64, min: f64, budget: f64 },
    #[error("invalid risk tier: {0}")]
    RiskTierInvalid(String),
}

impl RiskError {
    /// Cap-style refusals (as opposed to configuration errors).
    pub fn is_cap_breach(&self) -> bool {
        matches!(self, RiskError::RiskCapExceeded { .. } | RiskError::BudgetExhausted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    /// Rate limited (retCode=10006 or HTTP 429). retry_after in seconds.
    #[error("rate limited (retry after {retry_after}s)")]
    RateLimit { retry_after: u64 },
    /// Transient error: network, timeout, HTTP 5xx, server overload.
    #[error("transient error: {0}")]
    Transient(String),
    /// Permanent error: invalid params, insufficient balance, HTTP 4xx.
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BrokerError::Permanent(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file encoding: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file parse: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything that can stop an alert or an entry request from taking effect.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Risk(#[from] RiskError),
    #[error("broker execution failed: {0}")]
    BrokerExecution(#[from] BrokerError),
    #[error("{symbol} already has an active {logic} group")]
    SlotOccupied { symbol: String, logic: String },
    #[error("entry {direction} not confirmed: {reason}")]
    EntryNotConfirmed { direction: Direction, reason: String },
    #[error("request expired before it could be processed")]
    RequestExpired,
}
