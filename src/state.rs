//! Administrative state lattice.
//!
//! The fixed, totally ordered set of per-interface administrative states.
//! There is no branching: for any (current, target) pair there is exactly one
//! monotone subpath, which the planner walks one adjacent edge at a time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Administrative state of one managed interface, in strictly increasing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IfState {
    /// Nothing but configuration is known; the device may not exist at all.
    None,
    /// The device is known (or can be created) but is not addressable yet.
    DeviceDown,
    /// The device object is addressable on the bus.
    DeviceExists,
    /// The kernel interface is administratively up.
    DeviceUp,
    /// Packet filtering for the interface is in place.
    FirewallUp,
    /// The link layer is up (carrier).
    LinkUp,
    /// Link-layer authentication has completed.
    LinkAuthenticated,
    /// Address configuration holds at least the configured leases.
    AddrconfUp,
}

impl IfState {
    /// All states, lattice order.
    pub const ALL: [IfState; 8] = [
        IfState::None,
        IfState::DeviceDown,
        IfState::DeviceExists,
        IfState::DeviceUp,
        IfState::FirewallUp,
        IfState::LinkUp,
        IfState::LinkAuthenticated,
        IfState::AddrconfUp,
    ];

    /// The next state up the lattice, if any.
    pub fn up(self) -> Option<IfState> {
        let i = self as usize;
        Self::ALL.get(i + 1).copied()
    }

    /// The next state down the lattice, if any.
    pub fn down(self) -> Option<IfState> {
        let i = self as usize;
        i.checked_sub(1).map(|i| Self::ALL[i])
    }

    /// True when the device object is addressable on the bus at this state.
    pub fn is_addressable(self) -> bool {
        self >= IfState::DeviceExists
    }

    pub fn name(self) -> &'static str {
        match self {
            IfState::None => "none",
            IfState::DeviceDown => "device-down",
            IfState::DeviceExists => "device-exists",
            IfState::DeviceUp => "device-up",
            IfState::FirewallUp => "firewall-up",
            IfState::LinkUp => "link-up",
            IfState::LinkAuthenticated => "link-authenticated",
            IfState::AddrconfUp => "addrconf-up",
        }
    }
}

impl fmt::Display for IfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IfState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IfState::ALL
            .iter()
            .copied()
            .find(|st| st.name() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

/// Parse failure for a state name from a configuration document.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown interface state {0:?}")]
pub struct UnknownState(pub String);

/// The target range `[min, max]` a worker is driven into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRange {
    pub min: IfState,
    pub max: IfState,
}

impl TargetRange {
    pub fn new(min: IfState, max: IfState) -> Self {
        Self { min, max }
    }

    /// A point target: exactly one acceptable state.
    pub fn exact(state: IfState) -> Self {
        Self { min: state, max: state }
    }

    /// Bring-up to at least `min`, anything above is fine too.
    pub fn at_least(min: IfState) -> Self {
        Self { min, max: IfState::AddrconfUp }
    }

    pub fn contains(&self, state: IfState) -> bool {
        self.min <= state && state <= self.max
    }

    /// Raise the lower bound, keeping the range well-formed.
    pub fn raise_min(&mut self, min: IfState) {
        if min > self.min {
            self.min = min;
        }
        if self.max < self.min {
            self.max = self.min;
        }
    }
}

impl fmt::Display for TargetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "[{}..{}]", self.min, self.max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_total_and_strict() {
        for pair in IfState::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn up_and_down_are_inverse() {
        for st in IfState::ALL {
            if let Some(next) = st.up() {
                assert_eq!(next.down(), Some(st));
            }
            if let Some(prev) = st.down() {
                assert_eq!(prev.up(), Some(st));
            }
        }
        assert_eq!(IfState::None.down(), None);
        assert_eq!(IfState::AddrconfUp.up(), None);
    }

    #[test]
    fn addressable_threshold() {
        assert!(!IfState::DeviceDown.is_addressable());
        assert!(IfState::DeviceExists.is_addressable());
        assert!(IfState::AddrconfUp.is_addressable());
    }

    #[test]
    fn state_names_round_trip() {
        for st in IfState::ALL {
            assert_eq!(st.name().parse::<IfState>().unwrap(), st);
        }
        assert!("device-upp".parse::<IfState>().is_err());
    }

    #[test]
    fn range_contains_and_raise() {
        let mut r = TargetRange::new(IfState::DeviceUp, IfState::LinkUp);
        assert!(r.contains(IfState::DeviceUp));
        assert!(r.contains(IfState::LinkUp));
        assert!(!r.contains(IfState::DeviceExists));

        r.raise_min(IfState::AddrconfUp);
        assert_eq!(r.min, IfState::AddrconfUp);
        assert_eq!(r.max, IfState::AddrconfUp);
    }
}
