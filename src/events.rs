//! Event queue between the outside world and the scheduler.
//!
//! Bus signals and device-change notifications are enqueued by transports
//! through an [`EventSender`] and drained by the scheduler between passes.
//! Every delivered event advances the global event sequence the requirement
//! predicates key on.

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::inventory::DeviceEvent;
use crate::rpc::ArgDoc;

/// Completion indicator carried by a callback signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackResult {
    Success,
    Error(String),
}

/// One event delivered to the scheduler.
#[derive(Clone, Debug)]
pub enum SystemEvent {
    /// A bus signal completing one pending callback id.
    Callback {
        uuid: Uuid,
        result: CallbackResult,
        /// Completion document, e.g. the granted lease or a freshly minted
        /// object path.
        data: Option<ArgDoc>,
    },
    /// Device inventory delta.
    Device(DeviceEvent),
    /// External request to re-run the planner.
    Replan,
    /// Abort one worker: discard its pending callbacks and fail it.
    Cancel { worker: String },
    /// Abort every worker.
    Shutdown,
}

/// Cloneable handle transports use to inject events.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SystemEvent>,
}

impl EventSender {
    pub fn callback_completed(&self, uuid: Uuid, result: CallbackResult, data: Option<ArgDoc>) {
        self.send(SystemEvent::Callback { uuid, result, data });
    }

    pub fn device_event(&self, event: DeviceEvent) {
        self.send(SystemEvent::Device(event));
    }

    pub fn replan(&self) {
        self.send(SystemEvent::Replan);
    }

    pub fn cancel(&self, worker: &str) {
        self.send(SystemEvent::Cancel {
            worker: worker.to_string(),
        });
    }

    pub fn shutdown(&self) {
        self.send(SystemEvent::Shutdown);
    }

    fn send(&self, event: SystemEvent) {
        if self.tx.send(event).is_err() {
            debug!("scheduler gone; event dropped");
        }
    }
}

/// The queue pair: the sender half goes to transports, the receiver half to
/// the scheduler.
pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<SystemEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}
