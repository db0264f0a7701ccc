//! Interface configuration documents.
//!
//! Configuration arrives as XML, one document per named interface. The core
//! does not interpret the per-layer payloads; it navigates the tree to find
//! the device kind, lower-device references and transition gates, and hands
//! whole subtrees to the binder, which marshals them through the schema
//! engine.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

use crate::error::Error;
use crate::lease::AddrFamily;
use crate::state::IfState;

/// Namespace for configuration-derived worker identities.
const CONFIG_UUID_NS: Uuid = Uuid::from_u128(0x6f2d_9b41_c380_4a57_9e0c_2d5b_8f13_77a4);

/// Upper bound on per-edge transition gates, mirroring the document schema.
pub const EDGE_MAX_CALLS: usize = 8;

// ─── Generic node tree ────────────────────────────────────────

/// One element of a configuration document: name, attributes, text, children.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<ConfigNode>,
}

impl ConfigNode {
    pub fn new(name: impl Into<String>) -> Self {
        ConfigNode {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a document and return its root element.
    pub fn parse_str(xml: &str) -> Result<ConfigNode, Error> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<ConfigNode> = Vec::new();
        let mut root: Option<ConfigNode> = None;

        loop {
            match reader.read_event().map_err(bad_xml)? {
                Event::Start(e) => {
                    stack.push(node_from_element(e.name().as_ref(), e.attributes())?);
                }
                Event::Empty(e) => {
                    let node = node_from_element(e.name().as_ref(), e.attributes())?;
                    attach(&mut stack, &mut root, node)?;
                }
                Event::End(_) => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| Error::Config("unbalanced document".into()))?;
                    attach(&mut stack, &mut root, node)?;
                }
                Event::Text(t) => {
                    let text = t.unescape().map_err(bad_xml)?;
                    let text = text.trim();
                    if !text.is_empty() {
                        if let Some(top) = stack.last_mut() {
                            if !top.text.is_empty() {
                                top.text.push(' ');
                            }
                            top.text.push_str(text);
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(Error::Config("unbalanced document".into()));
        }
        root.ok_or_else(|| Error::Config("empty document".into()))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&ConfigNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ConfigNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text of a named child, if present and non-empty.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name)
            .map(|c| c.text.as_str())
            .filter(|t| !t.is_empty())
    }

    /// Stable byte rendering for content hashing.
    fn canonical_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        for (k, v) in &self.attrs {
            out.extend_from_slice(k.as_bytes());
            out.push(b'=');
            out.extend_from_slice(v.as_bytes());
            out.push(0);
        }
        out.extend_from_slice(self.text.as_bytes());
        out.push(b'{');
        for child in &self.children {
            child.canonical_bytes(out);
        }
        out.push(b'}');
    }
}

fn bad_xml(e: impl fmt::Display) -> Error {
    Error::Config(format!("malformed document: {e}"))
}

fn node_from_element(
    name: &[u8],
    attrs: quick_xml::events::attributes::Attributes<'_>,
) -> Result<ConfigNode, Error> {
    let mut node = ConfigNode::new(String::from_utf8_lossy(name).into_owned());
    for attr in attrs {
        let attr = attr.map_err(bad_xml)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(bad_xml)?.into_owned();
        node.attrs.push((key, value));
    }
    Ok(node)
}

fn attach(
    stack: &mut [ConfigNode],
    root: &mut Option<ConfigNode>,
    node: ConfigNode,
) -> Result<(), Error> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None if root.is_none() => *root = Some(node),
        None => return Err(Error::Config("multiple root elements".into())),
    }
    Ok(())
}

// ─── Device kinds ─────────────────────────────────────────────

/// The heterogeneous device kinds the manager drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Ethernet,
    Bridge,
    Bond,
    Vlan,
    Wireless,
    Modem,
    Tunnel,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 7] = [
        DeviceKind::Ethernet,
        DeviceKind::Bridge,
        DeviceKind::Bond,
        DeviceKind::Vlan,
        DeviceKind::Wireless,
        DeviceKind::Modem,
        DeviceKind::Tunnel,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Ethernet => "ethernet",
            DeviceKind::Bridge => "bridge",
            DeviceKind::Bond => "bond",
            DeviceKind::Vlan => "vlan",
            DeviceKind::Wireless => "wireless",
            DeviceKind::Modem => "modem",
            DeviceKind::Tunnel => "tunnel",
        }
    }

    /// Virtual devices are created and deleted through factory services;
    /// physical ones only ever exist by discovery.
    pub fn is_virtual(self) -> bool {
        matches!(
            self,
            DeviceKind::Bridge | DeviceKind::Bond | DeviceKind::Vlan | DeviceKind::Tunnel
        )
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Edge gates and lower references ──────────────────────────

/// Gate on a parent transition: before the parent may issue `call`, the
/// child's state must lie in `[min, max]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgePrecondition {
    pub call: String,
    pub min: IfState,
    pub max: IfState,
}

impl EdgePrecondition {
    pub fn new(call: impl Into<String>, min: IfState, max: IfState) -> Self {
        Self {
            call: call.into(),
            min,
            max,
        }
    }

    pub fn admits(&self, state: IfState) -> bool {
        self.min <= state && state <= self.max
    }
}

/// A reference from an interface document to a lower device, by name.
#[derive(Clone, Debug)]
pub struct LowerRef {
    pub name: String,
    /// Bond ports are claimed exclusively; bridge ports, vlan and tunnel
    /// bases are shared.
    pub exclusive: bool,
    /// The subtree that names the child; carried on the edge.
    pub node: ConfigNode,
    /// Explicit gates declared on the reference, overriding kind defaults.
    pub preconditions: Vec<EdgePrecondition>,
}

/// Per-family addrconf request declared in a document.
#[derive(Clone, Debug)]
pub struct AddrFamilyConf {
    pub family: AddrFamily,
    pub mode: String,
    pub enabled: bool,
    pub node: ConfigNode,
}

// ─── Interface documents ──────────────────────────────────────

/// One parsed `<interface>` document, plus the derived identity.
#[derive(Clone, Debug)]
pub struct InterfaceConfig {
    pub name: String,
    pub kind: DeviceKind,
    /// Stable identity: v5 UUID over the canonical content hash.
    pub uuid: Uuid,
    pub content_hash: [u8; 32],
    pub root: ConfigNode,
}

impl InterfaceConfig {
    pub fn parse(xml: &str) -> Result<InterfaceConfig, Error> {
        Self::from_node(ConfigNode::parse_str(xml)?)
    }

    pub fn from_node(root: ConfigNode) -> Result<InterfaceConfig, Error> {
        if root.name != "interface" {
            return Err(Error::Config(format!(
                "expected <interface>, got <{}>",
                root.name
            )));
        }
        let name = root
            .attr("name")
            .ok_or_else(|| Error::Config("<interface> without a name".into()))?
            .to_string();

        let kind = DeviceKind::ALL
            .iter()
            .copied()
            .find(|k| root.child(k.name()).is_some())
            .unwrap_or(DeviceKind::Ethernet);

        let mut canonical = Vec::new();
        root.canonical_bytes(&mut canonical);
        let content_hash: [u8; 32] = Sha256::digest(&canonical).into();
        let uuid = Uuid::new_v5(&CONFIG_UUID_NS, &content_hash);

        Ok(InterfaceConfig {
            name,
            kind,
            uuid,
            content_hash,
            root,
        })
    }

    /// Parse a document holding either one `<interface>` or an enclosing
    /// list element of them.
    pub fn load_all_str(xml: &str) -> Result<Vec<InterfaceConfig>, Error> {
        let root = ConfigNode::parse_str(xml)?;
        if root.name == "interface" {
            return Ok(vec![Self::from_node(root)?]);
        }
        root.children
            .into_iter()
            .filter(|c| c.name == "interface")
            .map(Self::from_node)
            .collect()
    }

    pub fn load_all_path(path: impl AsRef<Path>) -> Result<Vec<InterfaceConfig>, Error> {
        let path = path.as_ref();
        let xml = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::load_all_str(&xml)
    }

    /// The subtree describing the device itself (`<bridge>`, `<bond>`, …).
    pub fn device_node(&self) -> Option<&ConfigNode> {
        self.root.child(self.kind.name())
    }

    /// Lower-device references declared by this document, with any explicit
    /// per-reference gates.
    pub fn lower_refs(&self) -> Result<Vec<LowerRef>, Error> {
        let mut refs = Vec::new();
        match self.kind {
            DeviceKind::Bridge | DeviceKind::Bond => {
                let exclusive = self.kind == DeviceKind::Bond;
                if let Some(dev) = self.device_node() {
                    for port in dev.children_named("port") {
                        refs.push(self.lower_ref(port, "device", exclusive)?);
                    }
                }
            }
            DeviceKind::Vlan | DeviceKind::Tunnel => {
                if let Some(dev) = self.device_node() {
                    if dev.attr("device").is_some() {
                        refs.push(self.lower_ref(dev, "device", false)?);
                    }
                }
            }
            _ => {}
        }
        Ok(refs)
    }

    fn lower_ref(
        &self,
        node: &ConfigNode,
        attr: &str,
        exclusive: bool,
    ) -> Result<LowerRef, Error> {
        let name = node
            .attr(attr)
            .ok_or_else(|| {
                Error::Config(format!(
                    "{}: <{}> without a {attr} reference",
                    self.name, node.name
                ))
            })?
            .to_string();
        let preconditions = parse_preconditions(&self.name, node)?;
        Ok(LowerRef {
            name,
            exclusive,
            node: node.clone(),
            preconditions,
        })
    }

    /// Per-worker timeout override, milliseconds.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.root.child_text("timeout").and_then(|t| t.parse().ok())
    }

    /// Leave the interface where it is when a bring-up fails, instead of
    /// appending an automatic bring-down plan.
    pub fn persist_on_error(&self) -> bool {
        self.root.child("persist-on-error").is_some()
    }

    pub fn auth_node(&self) -> Option<&ConfigNode> {
        self.root.child("auth")
    }

    /// Address-configuration requests, one per family element under
    /// `<addrconf>`.
    pub fn addrconf_families(&self) -> Vec<AddrFamilyConf> {
        let Some(addrconf) = self.root.child("addrconf") else {
            return Vec::new();
        };
        addrconf
            .children
            .iter()
            .filter_map(|node| {
                let family: AddrFamily = node.name.parse().ok()?;
                Some(AddrFamilyConf {
                    family,
                    mode: node.attr("mode").unwrap_or("dhcp").to_string(),
                    enabled: node.attr("enabled") != Some("false"),
                    node: node.clone(),
                })
            })
            .collect()
    }

    /// Requirement declarations: `<require check="..." .../>` children of the
    /// interface element. (Under a lower reference, `<require call/min/max>`
    /// is an edge gate instead; see [`EdgePrecondition`].)
    pub fn require_nodes(&self) -> Vec<&ConfigNode> {
        self.root.children_named("require").collect()
    }

    /// The configuration subtree marshalled for a given abstract call.
    pub fn subtree_for_call(&self, call: &str) -> Option<&ConfigNode> {
        use crate::plan::call;
        match call {
            call::NEW_DEVICE | call::DEVICE_UP | call::DEVICE_DOWN | call::DELETE_DEVICE => {
                self.device_node()
            }
            call::LINK_UP | call::LINK_DOWN => self.root.child("link"),
            call::FIREWALL_UP | call::FIREWALL_DOWN => self.root.child("firewall"),
            call::AUTH_UP | call::AUTH_DOWN => self.auth_node(),
            _ => None,
        }
    }
}

fn parse_preconditions(owner: &str, node: &ConfigNode) -> Result<Vec<EdgePrecondition>, Error> {
    let mut out = Vec::new();
    for req in node.children_named("require") {
        let call = req
            .attr("call")
            .ok_or_else(|| Error::Config(format!("{owner}: <require> without a call")))?;
        let min = match req.attr("min") {
            Some(s) => parse_state(owner, s)?,
            None => IfState::None,
        };
        let max = match req.attr("max") {
            Some(s) => parse_state(owner, s)?,
            None => IfState::AddrconfUp,
        };
        out.push(EdgePrecondition::new(call, min, max));
    }
    if out.len() > EDGE_MAX_CALLS {
        return Err(Error::Config(format!(
            "{owner}: more than {EDGE_MAX_CALLS} transition gates on one reference"
        )));
    }
    Ok(out)
}

fn parse_state(owner: &str, s: &str) -> Result<IfState, Error> {
    s.parse()
        .map_err(|e| Error::Config(format!("{owner}: {e}")))
}
