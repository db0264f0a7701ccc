//! Per-family address-configuration leases.
//!
//! A lease is attached to a worker when its `addrconfUp` transition completes
//! and released when the transition is reversed. Leases are held behind `Arc`
//! so a snapshot handed to a progress consumer stays valid after release.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::rpc::ArgDoc;

/// Address family a lease (or an addrconf binding) applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrFamily {
    Ipv4,
    Ipv6,
}

impl AddrFamily {
    pub fn name(self) -> &'static str {
        match self {
            AddrFamily::Ipv4 => "ipv4",
            AddrFamily::Ipv6 => "ipv6",
        }
    }
}

impl fmt::Display for AddrFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AddrFamily {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipv4" => Ok(AddrFamily::Ipv4),
            "ipv6" => Ok(AddrFamily::Ipv6),
            _ => Err(()),
        }
    }
}

/// One route granted by a lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRoute {
    pub destination: String,
    pub gateway: String,
}

/// Address-configuration state for one family on one interface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lease {
    pub family: AddrFamily,
    /// Update sequence number assigned by the granting service.
    pub seqno: u64,
    /// Identity of the granting addrconf call.
    pub owner: Uuid,
    pub hostname: Option<String>,
    pub dns_servers: Vec<String>,
    pub nis_servers: Vec<String>,
    pub ntp_servers: Vec<String>,
    pub netbios_servers: Vec<String>,
    pub addresses: Vec<String>,
    pub routes: Vec<LeaseRoute>,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    /// Extract a lease from a completion document, if it carries one.
    ///
    /// The reply layout is `{"lease": {"family": "ipv4", ...}}`; anything the
    /// document does not carry stays empty.
    pub fn from_reply(doc: &ArgDoc) -> Option<Lease> {
        let lease = doc.get("lease")?;
        let family: AddrFamily = lease.get("family")?.as_str()?.parse().ok()?;

        let strings = |key: &str| -> Vec<String> {
            lease
                .get(key)
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|s| s.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };

        let routes = lease
            .get("routes")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|r| {
                        Some(LeaseRoute {
                            destination: r.get("destination")?.as_str()?.to_string(),
                            gateway: r.get("gateway")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Lease {
            family,
            seqno: lease.get("seqno").and_then(|v| v.as_u64()).unwrap_or(0),
            owner: lease
                .get("owner")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
                .unwrap_or_else(Uuid::new_v4),
            hostname: lease
                .get("hostname")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            dns_servers: strings("dns-servers"),
            nis_servers: strings("nis-servers"),
            ntp_servers: strings("ntp-servers"),
            netbios_servers: strings("netbios-servers"),
            addresses: strings("addresses"),
            routes,
            acquired_at: Utc::now(),
        })
    }
}
