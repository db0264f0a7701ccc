//! The worker: in-process representative of one managed interface or modem.

use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{DeviceKind, EdgePrecondition, InterfaceConfig};
use crate::error::FailureKind;
use crate::lease::Lease;
use crate::plan::Action;
use crate::state::{IfState, TargetRange};

/// Arena index of a worker; stable for the life of the graph.
pub type WorkerId = usize;

/// A worker represents either a network device or a modem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerKind {
    Netdev,
    Modem,
}

/// What a worker is currently blocked on, if anything.
#[derive(Clone, Debug)]
pub enum WaitState {
    Ready,
    /// Parked until every pending callback on the current action resolves or
    /// the deadline fires. The outstanding ids live on the action itself.
    Awaiting {
        deadline: Instant,
        last_method: String,
    },
    /// A requirement failed at this event sequence; retest after it advances.
    Requirement { seq: u64 },
    /// A child has not reached the range gating the named call.
    Child { child: WorkerId, call: String },
}

impl WaitState {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitState::Ready)
    }
}

/// Resolved device API slot: the instance pair once bound, and the factory
/// pair when the device had to be created.
#[derive(Clone, Debug, Default)]
pub struct DeviceApi {
    pub service: Option<String>,
    pub method: Option<String>,
    pub factory_service: Option<String>,
    pub factory_method: Option<String>,
}

/// Edge to a child worker, carrying the referencing subtree and the gates.
#[derive(Clone, Debug)]
pub struct Edge {
    pub child: WorkerId,
    pub config: crate::config::ConfigNode,
    pub preconditions: Vec<EdgePrecondition>,
}

/// Terminal failure record for the current plan.
#[derive(Clone, Debug)]
pub struct Failure {
    pub kind: FailureKind,
    pub last_call: Option<String>,
    pub detail: String,
}

/// The per-worker FSM block.
#[derive(Clone, Debug)]
pub struct Fsm {
    pub state: IfState,
    pub target: Option<TargetRange>,
    /// Copied action records for the current plan.
    pub plan: Vec<Action>,
    /// Index of the next action; equal to `plan.len()` when the plan is
    /// exhausted.
    pub next: usize,
    pub wait: WaitState,
}

impl Fsm {
    fn new(state: IfState) -> Self {
        Fsm {
            state,
            target: None,
            plan: Vec::new(),
            next: 0,
            wait: WaitState::Ready,
        }
    }

    pub fn next_action(&self) -> Option<&Action> {
        self.plan.get(self.next)
    }

    pub fn plan_exhausted(&self) -> bool {
        self.next >= self.plan.len()
    }
}

/// One managed interface or modem.
#[derive(Clone, Debug)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    /// Stable identity derived from configuration; random for discovered
    /// devices without configuration.
    pub uuid: Uuid,
    pub kind: WorkerKind,
    pub device_kind: DeviceKind,
    pub ifindex: Option<u32>,
    pub object_path: Option<String>,
    pub config: Option<InterfaceConfig>,
    pub device_api: DeviceApi,
    pub fsm: Fsm,

    /// Parents using this device as a shared lower.
    pub shared_users: u32,
    /// The single parent needing exclusive use, if any.
    pub exclusive_owner: Option<WorkerId>,
    pub parent: Option<WorkerId>,
    /// `1 + max(child depth)`; leaves at 0.
    pub depth: u32,
    pub children: Vec<Edge>,

    pub failed: Option<Failure>,
    pub done: bool,
    /// A failed bring-up is being unwound to `device-down`.
    pub teardown: bool,

    pub timeout_ms: u64,
    pub persist_on_error: bool,
    pub leases: Vec<Arc<Lease>>,
}

impl Worker {
    pub fn from_config(id: WorkerId, config: InterfaceConfig, state: IfState) -> Self {
        let kind = if config.kind == DeviceKind::Modem {
            WorkerKind::Modem
        } else {
            WorkerKind::Netdev
        };
        Worker {
            id,
            name: config.name.clone(),
            uuid: config.uuid,
            kind,
            device_kind: config.kind,
            ifindex: None,
            object_path: None,
            device_api: DeviceApi::default(),
            fsm: Fsm::new(state),
            shared_users: 0,
            exclusive_owner: None,
            parent: None,
            depth: 0,
            children: Vec::new(),
            failed: None,
            done: false,
            teardown: false,
            timeout_ms: config.timeout_ms().unwrap_or(crate::exec::DEFAULT_TIMEOUT_MS),
            persist_on_error: config.persist_on_error(),
            leases: Vec::new(),
            config: Some(config),
        }
    }

    /// A worker for a name that is referenced but neither configured nor
    /// discovered.
    pub fn placeholder(id: WorkerId, name: &str) -> Self {
        Worker {
            id,
            name: name.to_string(),
            uuid: Uuid::new_v4(),
            kind: WorkerKind::Netdev,
            device_kind: DeviceKind::Ethernet,
            ifindex: None,
            object_path: None,
            config: None,
            device_api: DeviceApi::default(),
            fsm: Fsm::new(IfState::None),
            shared_users: 0,
            exclusive_owner: None,
            parent: None,
            depth: 0,
            children: Vec::new(),
            failed: None,
            done: false,
            teardown: false,
            timeout_ms: crate::exec::DEFAULT_TIMEOUT_MS,
            persist_on_error: false,
            leases: Vec::new(),
        }
    }

    /// A worker for a device reported by discovery with no configuration.
    pub fn from_discovery(id: WorkerId, device: &crate::inventory::DeviceInfo) -> Self {
        let mut w = Worker::placeholder(id, &device.name);
        w.kind = if device.kind == DeviceKind::Modem {
            WorkerKind::Modem
        } else {
            WorkerKind::Netdev
        };
        w.device_kind = device.kind;
        w.ifindex = Some(device.ifindex);
        w.object_path = device.object_path.clone();
        w.fsm.state = device.reported_state();
        w
    }

    /// Terminal for the current plan (but the worker itself lives on).
    pub fn is_terminal(&self) -> bool {
        self.done || self.failed.is_some()
    }

    /// Record a shared claim by `parent`. Exclusive and shared use are
    /// mutually exclusive.
    pub fn claim_shared(&mut self, parent: WorkerId) -> Result<(), String> {
        if let Some(owner) = self.exclusive_owner {
            return Err(format!(
                "{} is exclusively owned by worker #{owner} and cannot be shared",
                self.name
            ));
        }
        self.shared_users += 1;
        if self.parent.is_none() {
            self.parent = Some(parent);
        }
        Ok(())
    }

    /// Record an exclusive claim by `parent`. A second claim of any kind is a
    /// fatal conflict.
    pub fn claim_exclusive(&mut self, parent: WorkerId) -> Result<(), String> {
        if let Some(owner) = self.exclusive_owner {
            return Err(format!(
                "{} is already exclusively owned by worker #{owner}",
                self.name
            ));
        }
        if self.shared_users > 0 {
            return Err(format!(
                "{} is shared by {} user(s) and cannot be owned exclusively",
                self.name, self.shared_users
            ));
        }
        self.exclusive_owner = Some(parent);
        self.parent = Some(parent);
        Ok(())
    }

    /// Release a claim previously made by `parent`.
    pub fn release_claim(&mut self, parent: WorkerId) {
        if self.exclusive_owner == Some(parent) {
            self.exclusive_owner = None;
        } else if self.shared_users > 0 {
            self.shared_users -= 1;
        }
        if self.parent == Some(parent) {
            self.parent = None;
        }
    }

    /// The device object was destroyed: collapse regardless of prior state.
    pub fn collapse(&mut self) {
        self.object_path = None;
        self.ifindex = None;
        self.fsm.state = IfState::DeviceDown;
        self.fsm.plan.clear();
        self.fsm.next = 0;
        self.fsm.wait = WaitState::Ready;
        self.leases.clear();
    }
}
