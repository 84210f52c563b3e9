//! Error taxonomy shared by the session layer, the API façade and the trading loop.
//!
//! Transport failures are classified once here so the retry runner and the
//! order-submission path agree on what is safe to repeat.

use std::fmt;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single request attempt against the broker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection could not be established, so the broker never saw the request.
    #[error("connection failed before the request was sent: {0}")]
    Connect(String),

    /// The request went out but the exchange broke off before a response.
    #[error("request interrupted after it was sent: {0}")]
    Interrupted(String),

    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("rate limited by broker")]
    RateLimited,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether a read may be repeated after this failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_)
                | TransportError::Connect(_)
                | TransportError::Interrupted(_)
                | TransportError::Server { .. }
                | TransportError::RateLimited
        )
    }

    /// Whether the broker cannot have acted on the request.
    ///
    /// Only these failures are retried for order submission. A timeout or a
    /// 5xx after sending may still have produced an order.
    pub fn is_pre_send(&self) -> bool {
        matches!(self, TransportError::Connect(_) | TransportError::RateLimited)
    }

    /// Classify an HTTP status with its response body.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => TransportError::Unauthorized(body),
            429 => TransportError::RateLimited,
            500..=599 => TransportError::Server { status, body },
            _ => TransportError::Client { status, body },
        }
    }

    /// Classify a reqwest failure.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_timeout() {
            TransportError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::from_status(status.as_u16(), err.to_string())
        } else {
            TransportError::Interrupted(err.to_string())
        }
    }
}

/// Authentication failures. Cloneable so a single refresh outcome can be
/// handed to every caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthenticationError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("credentials rejected: {0}")]
    CredentialsRejected(String),

    #[error("second factor required but no code is available")]
    SecondFactorRequired,

    #[error("second factor rejected: {0}")]
    SecondFactorRejected(String),

    #[error("session refresh failed after {attempts} attempt(s): {last_error}")]
    RefreshFailed {
        attempts: u32,
        last_error: TransportError,
    },

    #[error("login request failed after {attempts} attempt(s): {last_error}")]
    LoginFailed {
        attempts: u32,
        last_error: TransportError,
    },

    #[error("session invalidated by broker: {0}")]
    SessionInvalidated(String),
}

impl AuthenticationError {
    /// Fatal errors stop the trading loop until someone logs in again.
    /// Exhausted refresh or login retries are left for the next cycle.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AuthenticationError::RefreshFailed { .. } | AuthenticationError::LoginFailed { .. }
        )
    }
}

/// A state or arithmetic invariant that an operation would have broken.
/// Raised before any mutation takes place.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("budget would go negative: remaining {remaining}, requested {requested}")]
    InsufficientBudget { remaining: Decimal, requested: Decimal },

    #[error("budget cap exceeded: remaining {remaining} + committed {committed} > cap {cap}")]
    BudgetCapExceeded {
        remaining: Decimal,
        committed: Decimal,
        cap: Decimal,
    },

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("position {id} is {actual}, expected {expected}")]
    InvalidTransition {
        id: String,
        actual: String,
        expected: &'static str,
    },

    #[error("unknown position {0}")]
    UnknownPosition(String),

    #[error("instrument {0} already has an active position")]
    DuplicatePosition(String),
}

/// Every failure the trading loop can observe.
#[derive(Debug, Clone, Error)]
pub enum TradingError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error("transient network failure after {attempts} attempt(s): {source}")]
    TransientNetwork {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// An order submission failed in a way that may or may not have reached
    /// the broker. It is never retried; reconciliation resolves it.
    #[error("order outcome unknown: {0}")]
    AmbiguousOrder(TransportError),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error("remote API error: {0}")]
    Remote(TransportError),

    #[error("signal source error: {0}")]
    Signal(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl TradingError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TradingError::Authentication(_) => ErrorCategory::Authentication,
            TradingError::TransientNetwork { .. } | TradingError::AmbiguousOrder(_) => {
                ErrorCategory::TransientNetwork
            }
            TradingError::OrderRejected(_) => ErrorCategory::OrderRejected,
            TradingError::Invariant(_) => ErrorCategory::InvariantViolation,
            TradingError::Remote(_) => ErrorCategory::Remote,
            TradingError::Signal(_) => ErrorCategory::Signal,
            TradingError::Storage(_) => ErrorCategory::Storage,
        }
    }
}

/// Error category as shown in cycle reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    TransientNetwork,
    OrderRejected,
    InvariantViolation,
    Remote,
    Signal,
    Storage,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::TransientNetwork => "transient-network",
            ErrorCategory::OrderRejected => "order-rejected",
            ErrorCategory::InvariantViolation => "invariant-violation",
            ErrorCategory::Remote => "remote",
            ErrorCategory::Signal => "signal",
            ErrorCategory::Storage => "storage",
        };
        f.write_str(name)
    }
}
