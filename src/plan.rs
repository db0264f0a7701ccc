//! Transition table, action records, and the planner.
//!
//! The lattice is total: a single static table declares every legal edge and
//! what binding it needs. Planning copies table edges into per-worker action
//! records so binding state never pollutes the template.

use serde_json::Value;
use uuid::Uuid;

use crate::lease::AddrFamily;
use crate::require::Requirement;
use crate::state::{IfState, TargetRange};

/// Abstract call names. Edge preconditions key on these.
pub mod call {
    pub const ENROLL: &str = "enroll";
    pub const NEW_DEVICE: &str = "newDevice";
    pub const DEVICE_UP: &str = "deviceUp";
    pub const FIREWALL_UP: &str = "firewallUp";
    pub const LINK_UP: &str = "linkUp";
    pub const AUTH_UP: &str = "authUp";
    pub const ADDRCONF_UP: &str = "addrconfUp";
    pub const ADDRCONF_DOWN: &str = "addrconfDown";
    pub const AUTH_DOWN: &str = "authDown";
    pub const LINK_DOWN: &str = "linkDown";
    pub const FIREWALL_DOWN: &str = "firewallDown";
    pub const DEVICE_DOWN: &str = "deviceDown";
    pub const DELETE_DEVICE: &str = "deleteDevice";
}

/// Upper bound on bindings one action may fan out into.
pub const ACTION_BINDINGS_MAX: usize = 32;

/// How an action binds, as a tagged variant carrying its binding data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    /// Pure bookkeeping edge out of `none`; never dispatches.
    Enroll,
    /// Materialise the device object through the kind's factory when absent.
    DeviceCreate,
    /// One instance call on an abstract service.
    Call {
        service: &'static str,
        method: &'static str,
    },
    /// Fan out one `requestLease` per address family in configuration.
    AddrconfUp,
    /// Drop every held lease, one call per family.
    AddrconfDown,
    /// Delete a virtual device object; physical devices are left alone.
    DeviceDelete,
}

/// One edge of the static transition table.
#[derive(Clone, Copy, Debug)]
pub struct TransitionDef {
    pub from: IfState,
    pub to: IfState,
    pub call: &'static str,
    pub kind: ActionKind,
    /// Permit overload resolution by signature probing. When false the
    /// method must declare exactly one signature.
    pub overloading: bool,
    /// Bind nothing when the call's configuration subtree is absent.
    pub skip_without_config: bool,
}

const fn def(
    from: IfState,
    to: IfState,
    call: &'static str,
    kind: ActionKind,
    overloading: bool,
    skip_without_config: bool,
) -> TransitionDef {
    TransitionDef {
        from,
        to,
        call,
        kind,
        overloading,
        skip_without_config,
    }
}

/// Every legal edge in the lattice, forward then reverse.
pub const TRANSITION_TABLE: &[TransitionDef] = &[
    // ── forward ──
    def(
        IfState::None,
        IfState::DeviceDown,
        call::ENROLL,
        ActionKind::Enroll,
        false,
        false,
    ),
    def(
        IfState::DeviceDown,
        IfState::DeviceExists,
        call::NEW_DEVICE,
        ActionKind::DeviceCreate,
        false,
        false,
    ),
    def(
        IfState::DeviceExists,
        IfState::DeviceUp,
        call::DEVICE_UP,
        ActionKind::Call {
            service: "device",
            method: "deviceUp",
        },
        true,
        false,
    ),
    def(
        IfState::DeviceUp,
        IfState::FirewallUp,
        call::FIREWALL_UP,
        ActionKind::Call {
            service: "firewall",
            method: "firewallUp",
        },
        true,
        false,
    ),
    def(
        IfState::FirewallUp,
        IfState::LinkUp,
        call::LINK_UP,
        ActionKind::Call {
            service: "link",
            method: "linkUp",
        },
        true,
        false,
    ),
    def(
        IfState::LinkUp,
        IfState::LinkAuthenticated,
        call::AUTH_UP,
        ActionKind::Call {
            service: "auth",
            method: "login",
        },
        true,
        true,
    ),
    def(
        IfState::LinkAuthenticated,
        IfState::AddrconfUp,
        call::ADDRCONF_UP,
        ActionKind::AddrconfUp,
        true,
        false,
    ),
    // ── reverse ──
    def(
        IfState::AddrconfUp,
        IfState::LinkAuthenticated,
        call::ADDRCONF_DOWN,
        ActionKind::AddrconfDown,
        true,
        false,
    ),
    def(
        IfState::LinkAuthenticated,
        IfState::LinkUp,
        call::AUTH_DOWN,
        ActionKind::Call {
            service: "auth",
            method: "logout",
        },
        true,
        true,
    ),
    def(
        IfState::LinkUp,
        IfState::FirewallUp,
        call::LINK_DOWN,
        ActionKind::Call {
            service: "link",
            method: "linkDown",
        },
        true,
        false,
    ),
    def(
        IfState::FirewallUp,
        IfState::DeviceUp,
        call::FIREWALL_DOWN,
        ActionKind::Call {
            service: "firewall",
            method: "firewallDown",
        },
        true,
        false,
    ),
    def(
        IfState::DeviceUp,
        IfState::DeviceExists,
        call::DEVICE_DOWN,
        ActionKind::Call {
            service: "device",
            method: "deviceDown",
        },
        true,
        false,
    ),
    def(
        IfState::DeviceExists,
        IfState::DeviceDown,
        call::DELETE_DEVICE,
        ActionKind::DeviceDelete,
        false,
        false,
    ),
];

/// A resolved call, ready to dispatch.
#[derive(Clone, Debug)]
pub struct Binding {
    pub service: String,
    pub method: String,
    pub args: Value,
    /// Dispatch on this object instead of the worker's device object
    /// (factory calls go to the server object).
    pub object_path: Option<String>,
    /// Short-circuit dispatch but still advance state.
    pub skip_call: bool,
    /// Family this binding serves, for addrconf fan-out.
    pub family: Option<AddrFamily>,
}

impl Binding {
    pub fn skipped(service: &str, method: &str) -> Self {
        Binding {
            service: service.to_string(),
            method: method.to_string(),
            args: Value::Null,
            object_path: None,
            skip_call: true,
            family: None,
        }
    }
}

/// Per-worker instantiation of one table edge.
#[derive(Clone, Debug)]
pub struct Action {
    pub from: IfState,
    pub to: IfState,
    pub call: &'static str,
    pub kind: ActionKind,
    pub overloading: bool,
    pub skip_without_config: bool,
    /// Resolved bindings; empty once bound means "advance without dispatch".
    pub bindings: Vec<Binding>,
    pub bound: bool,
    /// Object path the bindings were resolved against; a change forces
    /// rebinding.
    pub bound_for: Option<String>,
    /// Callback ids still outstanding for this action.
    pub pending: Vec<Uuid>,
    pub requirements: Vec<Requirement>,
}

impl Action {
    fn from_def(def: &TransitionDef) -> Self {
        Action {
            from: def.from,
            to: def.to,
            call: def.call,
            kind: def.kind,
            overloading: def.overloading,
            skip_without_config: def.skip_without_config,
            bindings: Vec::new(),
            bound: false,
            bound_for: None,
            pending: Vec::new(),
            requirements: Vec::new(),
        }
    }

    pub fn is_reverse(&self) -> bool {
        self.to < self.from
    }

    /// Invalidate bindings so the binder runs again on next dispatch.
    pub fn unbind(&mut self) {
        self.bound = false;
        self.bound_for = None;
        self.bindings.clear();
    }
}

fn forward_edge(from: IfState) -> Option<&'static TransitionDef> {
    TRANSITION_TABLE
        .iter()
        .find(|d| d.from == from && d.to > from)
}

fn reverse_edge(from: IfState) -> Option<&'static TransitionDef> {
    TRANSITION_TABLE
        .iter()
        .find(|d| d.from == from && d.to < from)
}

/// The unique monotone subpath from `current` into `target`.
///
/// Below the range: forward actions up to `target.min`. Above it: reverse
/// actions down to `target.max`. Inside it: an empty plan.
pub fn plan(current: IfState, target: TargetRange) -> Vec<Action> {
    let mut actions = Vec::new();
    let mut state = current;

    if current < target.min {
        while state < target.min {
            let Some(def) = forward_edge(state) else { break };
            actions.push(Action::from_def(def));
            state = def.to;
        }
    } else if current > target.max {
        while state > target.max {
            let Some(def) = reverse_edge(state) else { break };
            actions.push(Action::from_def(def));
            state = def.to;
        }
    }

    actions
}
