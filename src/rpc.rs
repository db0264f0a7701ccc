//! RPC client contract.
//!
//! The core never touches the bus transport directly. It issues a named
//! method on a named object with an argument document and receives either a
//! terminal reply, or an acknowledgement carrying the callback ids that will
//! complete the call later as bus signals.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Marshalled argument (and reply) document.
pub type ArgDoc = Value;

/// Outcome of a dispatched method call.
#[derive(Clone, Debug, PartialEq)]
pub enum CallReply {
    /// The reply document is the terminal result of the call.
    Completed(ArgDoc),
    /// The call was acknowledged; one completion event per callback id will
    /// arrive later on the bus.
    Pending { reply: ArgDoc, callbacks: Vec<Uuid> },
}

impl CallReply {
    pub fn is_pending(&self) -> bool {
        matches!(self, CallReply::Pending { .. })
    }
}

/// The error kinds the transport can report.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("no such object: {0}")]
    NoSuchObject(String),

    #[error("no such method: {service}.{method}")]
    NoSuchMethod { service: String, method: String },

    #[error("argument type mismatch: {0}")]
    ArgumentMismatch(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("remote error: {0}")]
    Remote(String),
}

/// Client side of the system bus, as consumed by the executor.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Issue `service.method(args)` on the object at `object_path`.
    async fn call(
        &self,
        object_path: &str,
        service: &str,
        method: &str,
        args: &ArgDoc,
    ) -> Result<CallReply, RpcError>;
}
