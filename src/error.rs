//! Crate error type and the failure kinds recorded in dispositions.

use serde::Serialize;
use thiserror::Error;

use crate::rpc::RpcError;
use crate::schema::TypeError;

/// Everything the core can fail with.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad reference, malformed document, dependency cycle, ownership clash.
    #[error("configuration error: {0}")]
    Config(String),

    /// Schema mismatch, no matching overload, no such service on the object.
    #[error("binding error: {0}")]
    Binding(String),

    #[error("rpc failure: {0}")]
    Rpc(#[from] RpcError),

    #[error("schema type error: {0}")]
    Schema(#[from] TypeError),

    /// No completion event arrived for the last dispatched method in time.
    #[error("timed out waiting for {method}")]
    Timeout { method: String },

    /// A worker this one depends on failed for good.
    #[error("required worker {name} failed")]
    PreconditionPermanent { name: String },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Config(_) => FailureKind::Config,
            Error::Binding(_) | Error::Schema(_) => FailureKind::Binding,
            Error::Rpc(_) => FailureKind::Rpc,
            Error::Timeout { .. } => FailureKind::Timeout,
            Error::PreconditionPermanent { .. } => FailureKind::PreconditionPermanent,
            Error::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Coarse failure classification surfaced per worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Config,
    Binding,
    Rpc,
    Timeout,
    PreconditionPermanent,
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Config => "configuration-error",
            FailureKind::Binding => "binding-error",
            FailureKind::Rpc => "rpc-error",
            FailureKind::Timeout => "timeout",
            FailureKind::PreconditionPermanent => "precondition-permanent",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
