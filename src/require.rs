//! Requirement predicates.
//!
//! A transition may depend on boolean tests against the observable world.
//! Tests are lazy: each one remembers the global event sequence at which it
//! last ran, and is re-tested only after the sequence has advanced. The
//! world cannot have changed in between.

use tracing::debug;

use crate::config::ConfigNode;
use crate::error::Error;
use crate::inventory::Inventory;

/// Result of one requirement test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequirementOutcome {
    Met,
    /// Not satisfied now; retest after the event sequence advances.
    Pending,
    /// Can never be satisfied; fails the worker.
    Failed(String),
}

/// The extensible family of readiness tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequirementKind {
    /// A named device must be present in the inventory with its object
    /// exported on the bus.
    Reachable { device: String },
    /// A named modem must be registered (administratively up).
    ModemReady { device: String },
}

/// One requirement instance: the test, its data subtree, and the event
/// sequence it was last evaluated at.
#[derive(Clone, Debug)]
pub struct Requirement {
    pub kind: RequirementKind,
    /// The declaring subtree, kept for diagnostics.
    pub data: Option<ConfigNode>,
    event_seq: Option<u64>,
    last: RequirementOutcome,
}

impl Requirement {
    pub fn new(kind: RequirementKind) -> Self {
        Requirement {
            kind,
            data: None,
            event_seq: None,
            last: RequirementOutcome::Pending,
        }
    }

    /// Build a requirement from a `<require check="..."/>` declaration.
    pub fn from_config(owner: &str, node: &ConfigNode) -> Result<(String, Requirement), Error> {
        let call = node
            .attr("call")
            .ok_or_else(|| Error::Config(format!("{owner}: <require> without a call")))?
            .to_string();
        let check = node
            .attr("check")
            .ok_or_else(|| Error::Config(format!("{owner}: <require> without a check")))?;
        let device = || -> Result<String, Error> {
            node.attr("device")
                .map(str::to_string)
                .ok_or_else(|| Error::Config(format!("{owner}: {check} check needs a device")))
        };

        let kind = match check {
            "reachable" => RequirementKind::Reachable { device: device()? },
            "modem-ready" => RequirementKind::ModemReady { device: device()? },
            other => {
                return Err(Error::Config(format!(
                    "{owner}: unknown requirement check {other:?}"
                )))
            }
        };

        let mut req = Requirement::new(kind);
        req.data = Some(node.clone());
        Ok((call, req))
    }

    /// Evaluate against the world, reusing the memoized outcome while the
    /// event sequence has not advanced.
    pub fn evaluate(&mut self, event_seq: u64, inventory: &Inventory) -> RequirementOutcome {
        if self.event_seq == Some(event_seq) {
            return self.last.clone();
        }
        self.event_seq = Some(event_seq);
        self.last = self.test(inventory);
        debug!(requirement = ?self.kind, seq = event_seq, outcome = ?self.last, "requirement evaluated");
        self.last.clone()
    }

    fn test(&self, inventory: &Inventory) -> RequirementOutcome {
        match &self.kind {
            RequirementKind::Reachable { device } => match inventory.device(device) {
                Some(dev) if dev.object_path.is_some() => RequirementOutcome::Met,
                _ => RequirementOutcome::Pending,
            },
            RequirementKind::ModemReady { device } => match inventory.device(device) {
                Some(dev) if dev.kind == crate::config::DeviceKind::Modem => {
                    if dev.admin_up {
                        RequirementOutcome::Met
                    } else {
                        RequirementOutcome::Pending
                    }
                }
                Some(_) => RequirementOutcome::Failed(format!("{device} is not a modem")),
                None => RequirementOutcome::Pending,
            },
        }
    }

    #[cfg(test)]
    fn evaluation_count_seq(&self) -> Option<u64> {
        self.event_seq
    }
}
