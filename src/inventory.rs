//! Live device inventory read model.
//!
//! The lower-level discovery machinery is outside the core; what arrives here
//! is the observable device set and change notifications. The scheduler keeps
//! one snapshot, applies deltas between passes, and derives a reported
//! administrative state per device to seed and override worker state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::config::DeviceKind;
use crate::state::IfState;

/// One observable device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    /// Kernel interface index.
    pub ifindex: u32,
    /// Bus object path, once the device object is exported.
    pub object_path: Option<String>,
    pub kind: DeviceKind,
    /// Administratively up (IFF_UP).
    pub admin_up: bool,
    /// Carrier present.
    pub carrier: bool,
    /// Service names the device object advertises, in declaration order.
    pub services: Vec<String>,
}

impl DeviceInfo {
    /// The administrative state the observable substate maps to.
    ///
    /// A device without a bus object is merely known to exist as
    /// configuration; `device-exists` and above require addressability, which
    /// the worker establishes by passing through its create action.
    pub fn reported_state(&self) -> IfState {
        if self.object_path.is_none() {
            IfState::DeviceDown
        } else if self.carrier {
            IfState::LinkUp
        } else if self.admin_up {
            IfState::DeviceUp
        } else {
            IfState::DeviceDown
        }
    }
}

/// Inventory change notifications, as delivered to the event queue.
#[derive(Clone, Debug)]
pub enum DeviceEvent {
    Created(DeviceInfo),
    Deleted { name: String },
    LinkChanged {
        name: String,
        admin_up: bool,
        carrier: bool,
    },
}

/// Snapshot of the observable device set.
#[derive(Clone, Debug, Default)]
pub struct Inventory {
    devices: HashMap<String, DeviceInfo>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device: DeviceInfo) {
        self.devices.insert(device.name.clone(), device);
    }

    pub fn device(&self, name: &str) -> Option<&DeviceInfo> {
        self.devices.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Apply one change notification to the snapshot.
    pub fn apply(&mut self, event: &DeviceEvent) {
        match event {
            DeviceEvent::Created(info) => {
                debug!(device = %info.name, ifindex = info.ifindex, "device created");
                self.insert(info.clone());
            }
            DeviceEvent::Deleted { name } => {
                debug!(device = %name, "device deleted");
                self.devices.remove(name);
            }
            DeviceEvent::LinkChanged {
                name,
                admin_up,
                carrier,
            } => {
                if let Some(dev) = self.devices.get_mut(name) {
                    dev.admin_up = *admin_up;
                    dev.carrier = *carrier;
                } else {
                    debug!(device = %name, "link change for unknown device ignored");
                }
            }
        }
    }

    /// First advertised service on `name` matching an abstract identifier:
    /// an exact match, or a refinement like `auth.wpa` for abstract `auth`.
    pub fn resolve_service(&self, name: &str, abstract_id: &str) -> Option<String> {
        let dev = self.devices.get(name)?;
        dev.services
            .iter()
            .find(|s| {
                s.as_str() == abstract_id
                    || (s.len() > abstract_id.len()
                        && s.starts_with(abstract_id)
                        && s.as_bytes()[abstract_id.len()] == b'.')
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth(name: &str, admin_up: bool, carrier: bool) -> DeviceInfo {
        DeviceInfo {
            name: name.to_string(),
            ifindex: 2,
            object_path: Some(format!("/netsteer/device/{name}")),
            kind: DeviceKind::Ethernet,
            admin_up,
            carrier,
            services: vec![
                "device".into(),
                "firewall".into(),
                "link".into(),
                "auth.wpa".into(),
            ],
        }
    }

    #[test]
    fn reported_state_ladder() {
        assert_eq!(eth("e", false, false).reported_state(), IfState::DeviceDown);
        assert_eq!(eth("e", true, false).reported_state(), IfState::DeviceUp);
        assert_eq!(eth("e", true, true).reported_state(), IfState::LinkUp);

        let mut unexported = eth("e", true, true);
        unexported.object_path = None;
        assert_eq!(unexported.reported_state(), IfState::DeviceDown);
    }

    #[test]
    fn apply_create_change_delete() {
        let mut inv = Inventory::new();
        inv.apply(&DeviceEvent::Created(eth("eth0", false, false)));
        assert_eq!(inv.device("eth0").unwrap().reported_state(), IfState::DeviceDown);

        inv.apply(&DeviceEvent::LinkChanged {
            name: "eth0".into(),
            admin_up: true,
            carrier: true,
        });
        assert_eq!(inv.device("eth0").unwrap().reported_state(), IfState::LinkUp);

        inv.apply(&DeviceEvent::Deleted { name: "eth0".into() });
        assert!(inv.device("eth0").is_none());
    }

    #[test]
    fn service_resolution_prefers_declaration_order() {
        let mut inv = Inventory::new();
        inv.insert(eth("eth0", false, false));

        assert_eq!(inv.resolve_service("eth0", "link").as_deref(), Some("link"));
        assert_eq!(
            inv.resolve_service("eth0", "auth").as_deref(),
            Some("auth.wpa")
        );
        assert_eq!(inv.resolve_service("eth0", "addrconf.ipv4.dhcp"), None);
        // "auth.wpa" must not match abstract "auth.w"
        assert_eq!(inv.resolve_service("eth0", "auth.w"), None);
    }
}
