use std::time::Duration;
use thiserror::Error;

use crate::session::{SessionEvent, SessionStatus};

/// Failures raised before any host is contacted. None of them are retried.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("exchange rate unavailable for token {token}: {source}")]
    RateUnavailable {
        token: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("pricing error: {0}")]
    PricingError(String),

    #[error("balance lookup failed for token {token}: {source}")]
    BalanceUnavailable {
        token: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },
}

/// Per-attempt failures. Every variant is retried by the shard's backoff loop.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("host id {host} is not a valid peer id: {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("remote call failed: {0}")]
    Transport(#[from] RpcError),

    #[error("host {host} does not support token {token}")]
    TokenUnsupported { host: String, token: String },

    #[error("contract signing failed: {0}")]
    Signing(#[source] anyhow::Error),

    #[error("host {host} did not acknowledge contract {contract_id} within {timeout:?}")]
    AckTimeout {
        host: String,
        contract_id: String,
        timeout: Duration,
    },

    #[error("contract {contract_id} rejected: {reason}")]
    Rejected { contract_id: String, reason: String },

    #[error("unexpected reply to {route}")]
    UnexpectedReply { route: &'static str },
}

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("request to {route} timed out after {timeout:?}")]
    Timeout {
        route: &'static str,
        timeout: Duration,
    },

    #[error("request to {route} failed: {reason}")]
    Failed { route: &'static str, reason: String },

    #[error("transport is shut down")]
    Shutdown,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session transition from {from:?} on {event}")]
    InvalidTransition {
        from: SessionStatus,
        event: SessionEvent,
    },

    #[error("shard index {index} out of range for {total} shards")]
    UnknownShard { index: usize, total: usize },

    #[error("session state lock poisoned")]
    Poisoned,
}

/// Terminal outcome of [`crate::backoff::retry`] when the operation never succeeded.
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("retry cancelled")]
    Cancelled,

    #[error("retry budget of {max_elapsed:?} exhausted after {attempts} attempts: {last}")]
    Exhausted {
        max_elapsed: Duration,
        attempts: u32,
        #[source]
        last: E,
    },
}

/// Failures that prevent an upload from starting. Once shards are spawned, failures surface on the session.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Preflight(#[from] PreflightError),

    #[error("expected {expected} contract shard indexes, got {actual}")]
    ShardIndexMismatch { expected: usize, actual: usize },
}

/// Settings rejected by [`crate::config::RenterConfig::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be between 1ms and {max:?}, got {value:?}")]
    DurationOutOfRange {
        field: &'static str,
        value: Duration,
        max: Duration,
    },

    #[error("invalid backoff policy: {0}")]
    Backoff(String),

    #[error("invalid listen address {addr}: {reason}")]
    Listen { addr: String, reason: String },
}
