//! End-to-end bring-up and bring-down scenarios against a scripted bus.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use netsteer::config::{ConfigNode, DeviceKind, InterfaceConfig};
use netsteer::error::FailureKind;
use netsteer::events::{CallbackResult, EventSender};
use netsteer::exec::Scheduler;
use netsteer::graph::WorkerGraph;
use netsteer::inventory::{DeviceEvent, DeviceInfo, Inventory};
use netsteer::report::{Disposition, ProgressEvent};
use netsteer::rpc::{ArgDoc, CallReply, RpcClient, RpcError};
use netsteer::schema::{ArgSpec, ArgType, MethodSignature, SchemaEngine, TypeError};
use netsteer::state::{IfState, TargetRange};

// ─── Fixture schema ───────────────────────────────────────────

struct FixtureSchema {
    sigs: HashMap<(String, String), Vec<MethodSignature>>,
}

impl FixtureSchema {
    fn standard() -> Self {
        let mut sigs: HashMap<(String, String), Vec<MethodSignature>> = HashMap::new();
        let mut declare = |service: &str, method: &str, args: Vec<ArgSpec>| {
            sigs.entry((service.to_string(), method.to_string()))
                .or_default()
                .push(MethodSignature {
                    service: service.to_string(),
                    method: method.to_string(),
                    args,
                });
        };
        let req = |name: &str, ty: ArgType| ArgSpec {
            name: name.to_string(),
            ty,
            required: true,
        };
        let opt = |name: &str, ty: ArgType| ArgSpec {
            name: name.to_string(),
            ty,
            required: false,
        };

        declare("device", "deviceUp", vec![opt("mtu", ArgType::Uint32)]);
        declare("device", "deviceDown", vec![]);
        declare("device", "deleteDevice", vec![]);
        declare("firewall", "firewallUp", vec![]);
        declare("firewall", "firewallDown", vec![]);
        declare("link", "linkUp", vec![opt("mtu", ArgType::Uint32)]);
        declare("link", "linkDown", vec![]);
        declare("auth.wpa", "login", vec![req("passphrase", ArgType::Str)]);
        declare("auth.wpa", "logout", vec![]);
        declare(
            "addrconf.ipv4.dhcp",
            "requestLease",
            vec![opt("hostname", ArgType::Str)],
        );
        declare("addrconf.ipv6.dhcp", "requestLease", vec![]);
        declare("factory.bridge", "newDevice", vec![req("name", ArgType::Str)]);
        declare("factory.bond", "newDevice", vec![req("name", ArgType::Str)]);
        declare(
            "factory.vlan",
            "newDevice",
            vec![req("name", ArgType::Str)],
        );
        FixtureSchema { sigs }
    }
}

impl SchemaEngine for FixtureSchema {
    fn signatures(&self, service: &str, method: &str) -> Vec<MethodSignature> {
        self.sigs
            .get(&(service.to_string(), method.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn check(&self, signature: &MethodSignature, config: &ConfigNode) -> Result<ArgDoc, TypeError> {
        let mut doc = serde_json::Map::new();
        for arg in &signature.args {
            let raw = config
                .attr(&arg.name)
                .map(str::to_string)
                .or_else(|| config.child_text(&arg.name).map(str::to_string));
            let Some(raw) = raw else {
                if arg.required {
                    return Err(TypeError {
                        signature: signature.describe(),
                        subject: config.name.clone(),
                        detail: format!("missing required argument {}", arg.name),
                    });
                }
                continue;
            };
            let value = match arg.ty {
                ArgType::Bool => json!(raw == "true"),
                ArgType::Uint32 => match raw.parse::<u32>() {
                    Ok(n) => json!(n),
                    Err(_) => {
                        return Err(TypeError {
                            signature: signature.describe(),
                            subject: config.name.clone(),
                            detail: format!("{} is not a uint32", arg.name),
                        })
                    }
                },
                _ => json!(raw),
            };
            doc.insert(arg.name.clone(), value);
        }
        Ok(ArgDoc::Object(doc))
    }
}

// ─── Scripted RPC client ──────────────────────────────────────

enum Script {
    Reply(Result<CallReply, RpcError>),
    /// Acknowledge with pending callback ids, then complete them through the
    /// event queue once the scheduler parks.
    AutoComplete {
        callbacks: Vec<Uuid>,
        data: Option<ArgDoc>,
    },
}

#[derive(Default)]
struct MockRpc {
    calls: Mutex<Vec<(String, String, String)>>,
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    events: OnceLock<EventSender>,
}

impl MockRpc {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, method: &str, reply: Result<CallReply, RpcError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(Script::Reply(reply));
    }

    fn script_auto_complete(&self, method: &str, callbacks: Vec<Uuid>, data: Option<ArgDoc>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(Script::AutoComplete { callbacks, data });
    }

    fn wire(&self, events: EventSender) {
        let _ = self.events.set(events);
    }

    /// `(path, method)` pairs in dispatch order.
    fn dispatches(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _s, m)| (p.clone(), m.clone()))
            .collect()
    }

    fn methods(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl RpcClient for MockRpc {
    async fn call(
        &self,
        object_path: &str,
        service: &str,
        method: &str,
        _args: &ArgDoc,
    ) -> Result<CallReply, RpcError> {
        self.calls.lock().unwrap().push((
            object_path.to_string(),
            service.to_string(),
            method.to_string(),
        ));
        let script = self.scripts.lock().unwrap().get_mut(method).and_then(VecDeque::pop_front);
        match script {
            None => Ok(CallReply::Completed(json!({}))),
            Some(Script::Reply(reply)) => reply,
            Some(Script::AutoComplete { callbacks, data }) => {
                let events = self.events.get().expect("event sender wired").clone();
                let ids = callbacks.clone();
                tokio::spawn(async move {
                    // Completion data rides on the final callback only.
                    let last = ids.len().saturating_sub(1);
                    for (i, id) in ids.into_iter().enumerate() {
                        let data = if i == last { data.clone() } else { None };
                        events.callback_completed(id, CallbackResult::Success, data);
                    }
                });
                Ok(CallReply::Pending {
                    reply: json!({}),
                    callbacks,
                })
            }
        }
    }
}

// ─── World building helpers ───────────────────────────────────

fn eth_device(name: &str) -> DeviceInfo {
    DeviceInfo {
        name: name.to_string(),
        ifindex: 2,
        object_path: Some(format!("/netsteer/device/{name}")),
        kind: DeviceKind::Ethernet,
        admin_up: false,
        carrier: false,
        services: vec![
            "device".into(),
            "firewall".into(),
            "link".into(),
            "addrconf.ipv4.dhcp".into(),
            "addrconf.ipv6.dhcp".into(),
        ],
    }
}

fn scheduler(xml: &str, devices: Vec<DeviceInfo>, rpc: Arc<MockRpc>) -> Scheduler {
    let configs = InterfaceConfig::load_all_str(xml).unwrap();
    let mut inventory = Inventory::new();
    for device in devices {
        inventory.insert(device);
    }
    let graph = WorkerGraph::build(configs, &inventory).unwrap();
    let schema = Arc::new(FixtureSchema::standard());
    let sched = Scheduler::new(graph, inventory, rpc.clone(), schema);
    rpc.wire(sched.event_sender());
    sched
}

fn disposition(summary: &netsteer::RunSummary, name: &str) -> Disposition {
    summary.report(name).unwrap().disposition.clone()
}

const ETH0_ADDRCONF: &str = r#"
    <interface name="eth0">
      <ethernet/>
      <addrconf><ipv4 mode="dhcp"/></addrconf>
    </interface>"#;

// ─── A1: single ethernet, absent to addrconf-up ───────────────

#[tokio::test]
async fn a1_single_ethernet_full_bring_up() {
    let rpc = MockRpc::new();
    let mut sched = scheduler(ETH0_ADDRCONF, vec![eth_device("eth0")], rpc.clone());
    let mut progress = sched.subscribe_progress();

    sched
        .set_target("eth0", TargetRange::at_least(IfState::AddrconfUp))
        .unwrap();
    let summary = sched.run().await;

    assert_eq!(disposition(&summary, "eth0"), Disposition::Done);
    assert_eq!(summary.report("eth0").unwrap().state, IfState::AddrconfUp);
    assert!(summary.all_done());

    // All four calls, in plan order; newDevice and login were skipped.
    assert_eq!(
        rpc.methods(),
        vec!["deviceUp", "firewallUp", "linkUp", "requestLease"]
    );

    // Monotonic progress: the observed states are exactly the planner's
    // subpath, no repeats, no skips.
    let mut reached = Vec::new();
    while let Ok(event) = progress.try_recv() {
        if let ProgressEvent::StateReached { state, .. } = event {
            reached.push(state);
        }
    }
    assert_eq!(
        reached,
        vec![
            IfState::DeviceExists,
            IfState::DeviceUp,
            IfState::FirewallUp,
            IfState::LinkUp,
            IfState::LinkAuthenticated,
            IfState::AddrconfUp,
        ]
    );
}

#[tokio::test]
async fn a1_lease_attached_from_completion() {
    let rpc = MockRpc::new();
    rpc.script(
        "requestLease",
        Ok(CallReply::Completed(json!({
            "lease": {
                "family": "ipv4",
                "seqno": 1,
                "addresses": ["192.0.2.10/24"],
            }
        }))),
    );
    let mut sched = scheduler(ETH0_ADDRCONF, vec![eth_device("eth0")], rpc.clone());
    sched
        .set_target("eth0", TargetRange::at_least(IfState::AddrconfUp))
        .unwrap();
    let summary = sched.run().await;

    assert!(summary.all_done());
    let eth0 = sched.graph().by_name("eth0").unwrap();
    let leases = &sched.graph()[eth0].leases;
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].addresses, vec!["192.0.2.10/24"]);
}

// ─── A2: vlan over ethernet ───────────────────────────────────

const VLAN_SET: &str = r#"
    <interfaces>
      <interface name="eth0"><ethernet/></interface>
      <interface name="vlan42"><vlan device="eth0" tag="42"/></interface>
    </interfaces>"#;

#[tokio::test]
async fn a2_vlan_waits_for_base_link_up() {
    let rpc = MockRpc::new();
    rpc.script(
        "newDevice",
        Ok(CallReply::Completed(
            json!({"object-path": "/netsteer/device/vlan42"}),
        )),
    );
    let mut sched = scheduler(VLAN_SET, vec![eth_device("eth0")], rpc.clone());
    sched
        .set_target("vlan42", TargetRange::at_least(IfState::LinkUp))
        .unwrap();
    let summary = sched.run().await;

    assert_eq!(disposition(&summary, "vlan42"), Disposition::Done);
    assert_eq!(disposition(&summary, "eth0"), Disposition::Done);
    assert_eq!(summary.report("eth0").unwrap().state, IfState::LinkUp);

    let dispatches = rpc.dispatches();
    let position = |path: &str, method: &str| {
        dispatches
            .iter()
            .position(|(p, m)| p == path && m == method)
            .unwrap_or_else(|| panic!("{method} on {path} never dispatched"))
    };
    // Precondition safety: the base reaches link-up before the vlan's own
    // linkUp goes out.
    assert!(
        position("/netsteer/device/eth0", "linkUp")
            < position("/netsteer/device/vlan42", "linkUp")
    );
}

#[tokio::test]
async fn a2_base_failure_cascades_to_vlan() {
    let rpc = MockRpc::new();
    // eth0's linkUp is the first linkUp dispatched and fails.
    rpc.script("linkUp", Err(RpcError::Remote("phy reset".into())));
    let mut sched = scheduler(VLAN_SET, vec![eth_device("eth0")], rpc.clone());
    sched
        .set_target("vlan42", TargetRange::at_least(IfState::LinkUp))
        .unwrap();
    let summary = sched.run().await;

    match disposition(&summary, "eth0") {
        Disposition::Failed { kind, last_call } => {
            assert_eq!(kind, FailureKind::Rpc);
            assert_eq!(last_call.as_deref(), Some("linkUp"));
        }
        other => panic!("eth0: {other:?}"),
    }
    match disposition(&summary, "vlan42") {
        Disposition::Failed { kind, .. } => {
            assert_eq!(kind, FailureKind::PreconditionPermanent)
        }
        other => panic!("vlan42: {other:?}"),
    }
    // The vlan never issued its own linkUp.
    assert!(!rpc
        .dispatches()
        .iter()
        .any(|(p, m)| p.contains("vlan42") && m == "linkUp"));
    // The failed bring-up unwound eth0 back below device-exists.
    assert_eq!(summary.report("eth0").unwrap().state, IfState::DeviceDown);
}

// ─── A3: bridge with two shared ports ─────────────────────────

const BRIDGE_SET: &str = r#"
    <interfaces>
      <interface name="eth0"><ethernet/></interface>
      <interface name="eth1"><ethernet/></interface>
      <interface name="br0">
        <bridge><port device="eth0"/><port device="eth1"/></bridge>
        <addrconf><ipv4 mode="dhcp"/></addrconf>
      </interface>
    </interfaces>"#;

#[tokio::test]
async fn a3_bridge_ports_gate_and_share() {
    let rpc = MockRpc::new();
    rpc.script(
        "newDevice",
        Ok(CallReply::Completed(
            json!({"object-path": "/netsteer/device/br0"}),
        )),
    );
    let mut sched = scheduler(
        BRIDGE_SET,
        vec![eth_device("eth0"), eth_device("eth1")],
        rpc.clone(),
    );
    sched
        .set_target("br0", TargetRange::at_least(IfState::AddrconfUp))
        .unwrap();
    let summary = sched.run().await;
    assert!(summary.all_done(), "{summary:?}");

    let dispatches = rpc.dispatches();
    let position = |path: &str, method: &str| {
        dispatches
            .iter()
            .position(|(p, m)| p == path && m == method)
            .unwrap_or_else(|| panic!("{method} on {path} never dispatched"))
    };
    let br0_up = position("/netsteer/device/br0", "deviceUp");
    assert!(position("/netsteer/device/eth0", "deviceUp") < br0_up);
    assert!(position("/netsteer/device/eth1", "deviceUp") < br0_up);

    // Both ports are shared by exactly one user.
    let graph = sched.graph();
    for port in ["eth0", "eth1"] {
        let id = graph.by_name(port).unwrap();
        assert_eq!(graph[id].shared_users, 1, "{port}");
        assert!(graph[id].exclusive_owner.is_none());
    }

    // Bringing the bridge down restores the share counts.
    sched
        .set_target("br0", TargetRange::exact(IfState::DeviceDown))
        .unwrap();
    let summary = sched.run().await;
    assert_eq!(disposition(&summary, "br0"), Disposition::Done);
    assert_eq!(summary.report("br0").unwrap().state, IfState::DeviceDown);

    let graph = sched.graph();
    for port in ["eth0", "eth1"] {
        let id = graph.by_name(port).unwrap();
        assert_eq!(graph[id].shared_users, 0, "{port}");
    }
}

// ─── A4: factory creation ─────────────────────────────────────

#[tokio::test]
async fn a4_factory_creates_object_then_binds_new_path() {
    let rpc = MockRpc::new();
    rpc.script(
        "newDevice",
        Ok(CallReply::Completed(
            json!({"object-path": "/netsteer/device/br0"}),
        )),
    );
    let mut sched = scheduler(
        r#"<interface name="br0"><bridge/></interface>"#,
        vec![],
        rpc.clone(),
    );
    sched
        .set_target("br0", TargetRange::at_least(IfState::DeviceUp))
        .unwrap();
    let summary = sched.run().await;
    assert_eq!(disposition(&summary, "br0"), Disposition::Done);

    let dispatches = rpc.dispatches();
    assert_eq!(
        dispatches[0],
        ("/netsteer/server".to_string(), "newDevice".to_string())
    );
    assert_eq!(
        dispatches[1],
        ("/netsteer/device/br0".to_string(), "deviceUp".to_string())
    );
}

// ─── A5: asynchronous callbacks, completion and timeout ───────

#[tokio::test]
async fn async_callbacks_resume_the_parked_worker() {
    let rpc = MockRpc::new();
    let cb = vec![Uuid::new_v4(), Uuid::new_v4()];
    rpc.script_auto_complete(
        "requestLease",
        cb.clone(),
        Some(json!({"lease": {"family": "ipv4", "seqno": 3}})),
    );
    let mut sched = scheduler(ETH0_ADDRCONF, vec![eth_device("eth0")], rpc.clone());
    sched
        .set_target("eth0", TargetRange::at_least(IfState::AddrconfUp))
        .unwrap();
    let summary = sched.run().await;

    assert_eq!(disposition(&summary, "eth0"), Disposition::Done);
    assert_eq!(summary.report("eth0").unwrap().state, IfState::AddrconfUp);
    let eth0 = sched.graph().by_name("eth0").unwrap();
    assert_eq!(sched.graph()[eth0].leases.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn a5_callback_timeout_fails_the_worker() {
    let rpc = MockRpc::new();
    let pending = Uuid::new_v4();
    rpc.script(
        "requestLease",
        Ok(CallReply::Pending {
            reply: json!({}),
            callbacks: vec![pending],
        }),
    );
    let mut sched = scheduler(ETH0_ADDRCONF, vec![eth_device("eth0")], rpc.clone());
    sched
        .set_target("eth0", TargetRange::at_least(IfState::AddrconfUp))
        .unwrap();
    let events = sched.event_sender();

    let started = tokio::time::Instant::now();
    let summary = sched.run().await;

    // The 20 s default timer fired (paused time auto-advances).
    assert!(started.elapsed() >= std::time::Duration::from_secs(20));
    match disposition(&summary, "eth0") {
        Disposition::Failed { kind, last_call } => {
            assert_eq!(kind, FailureKind::Timeout);
            assert_eq!(last_call.as_deref(), Some("addrconfUp"));
        }
        other => panic!("eth0: {other:?}"),
    }
    // The failed bring-up unwound back to device-down.
    assert_eq!(summary.report("eth0").unwrap().state, IfState::DeviceDown);

    // A late callback with the timed-out id is dropped without effect.
    events.callback_completed(pending, CallbackResult::Success, None);
    let summary = sched.run().await;
    match disposition(&summary, "eth0") {
        Disposition::Failed { kind, .. } => assert_eq!(kind, FailureKind::Timeout),
        other => panic!("eth0: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn per_worker_timeout_override() {
    let rpc = MockRpc::new();
    rpc.script(
        "requestLease",
        Ok(CallReply::Pending {
            reply: json!({}),
            callbacks: vec![Uuid::new_v4()],
        }),
    );
    let xml = r#"
        <interface name="eth0">
          <ethernet/>
          <addrconf><ipv4 mode="dhcp"/></addrconf>
          <timeout>500</timeout>
        </interface>"#;
    let mut sched = scheduler(xml, vec![eth_device("eth0")], rpc.clone());
    sched
        .set_target("eth0", TargetRange::at_least(IfState::AddrconfUp))
        .unwrap();

    let started = tokio::time::Instant::now();
    let summary = sched.run().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= std::time::Duration::from_millis(500));
    assert!(elapsed < std::time::Duration::from_secs(20));
    assert_eq!(summary.failed_count(), 1);
}

// ─── A6: bond exclusive conflict ──────────────────────────────

#[tokio::test]
async fn a6_exclusive_conflict_issues_no_rpc() {
    let xml = r#"
        <interfaces>
          <interface name="eth0"><ethernet/></interface>
          <interface name="bond0"><bond><port device="eth0"/></bond></interface>
          <interface name="bond1"><bond><port device="eth0"/></bond></interface>
        </interfaces>"#;
    let rpc = MockRpc::new();
    let mut sched = scheduler(xml, vec![eth_device("eth0")], rpc.clone());
    sched
        .set_target("bond0", TargetRange::at_least(IfState::DeviceUp))
        .unwrap();
    sched
        .set_target("bond1", TargetRange::at_least(IfState::DeviceUp))
        .unwrap();
    let summary = sched.run().await;

    for name in ["bond0", "bond1", "eth0"] {
        match disposition(&summary, name) {
            Disposition::Failed { kind, .. } => assert_eq!(kind, FailureKind::Config, "{name}"),
            other => panic!("{name}: {other:?}"),
        }
    }
    assert!(rpc.dispatches().is_empty());
}

// ─── Cancellation ─────────────────────────────────────────────

#[tokio::test]
async fn cancellation_discards_pending_callbacks() {
    let rpc = MockRpc::new();
    let pending = Uuid::new_v4();
    rpc.script(
        "requestLease",
        Ok(CallReply::Pending {
            reply: json!({}),
            callbacks: vec![pending],
        }),
    );
    let mut sched = scheduler(ETH0_ADDRCONF, vec![eth_device("eth0")], rpc.clone());
    sched
        .set_target("eth0", TargetRange::at_least(IfState::AddrconfUp))
        .unwrap();
    let events = sched.event_sender();

    let handle = tokio::spawn(async move {
        let summary = sched.run().await;
        (sched, summary)
    });
    // Let the scheduler dispatch and park, then abort the worker.
    tokio::task::yield_now().await;
    events.cancel("eth0");
    events.callback_completed(pending, CallbackResult::Success, None);
    let (_sched, summary) = handle.await.unwrap();

    match disposition(&summary, "eth0") {
        Disposition::Failed { kind, .. } => assert_eq!(kind, FailureKind::Cancelled),
        other => panic!("eth0: {other:?}"),
    }
    // No teardown calls went out after cancellation, and the late callback
    // resumed nothing.
    let methods = rpc.methods();
    assert_eq!(methods.iter().filter(|m| *m == "requestLease").count(), 1);
    assert!(!methods.iter().any(|m| m == "linkDown" || m == "deviceDown"));
}

// ─── Wireless: the auth edge dispatches when configured ───────

#[tokio::test]
async fn wireless_auth_dispatches_login() {
    let mut wlan0 = eth_device("wlan0");
    wlan0.kind = DeviceKind::Wireless;
    wlan0.services.push("auth.wpa".into());

    let xml = r#"
        <interface name="wlan0">
          <wireless/>
          <auth><passphrase>swordfish</passphrase></auth>
        </interface>"#;
    let rpc = MockRpc::new();
    let mut sched = scheduler(xml, vec![wlan0], rpc.clone());
    sched
        .set_target("wlan0", TargetRange::at_least(IfState::LinkAuthenticated))
        .unwrap();
    let summary = sched.run().await;

    assert_eq!(disposition(&summary, "wlan0"), Disposition::Done);
    assert_eq!(
        summary.report("wlan0").unwrap().state,
        IfState::LinkAuthenticated
    );
    assert_eq!(
        rpc.methods(),
        vec!["deviceUp", "firewallUp", "linkUp", "login"]
    );
}

// ─── persist-on-error suppresses the automatic bring-down ─────

#[tokio::test]
async fn persist_on_error_leaves_the_interface_where_it_failed() {
    let rpc = MockRpc::new();
    rpc.script("linkUp", Err(RpcError::Remote("phy reset".into())));
    let xml = r#"
        <interface name="eth0">
          <ethernet/>
          <persist-on-error/>
        </interface>"#;
    let mut sched = scheduler(xml, vec![eth_device("eth0")], rpc.clone());
    sched
        .set_target("eth0", TargetRange::at_least(IfState::LinkUp))
        .unwrap();
    let summary = sched.run().await;

    assert_eq!(summary.failed_count(), 1);
    // No unwind: the interface stays at firewall-up.
    assert_eq!(summary.report("eth0").unwrap().state, IfState::FirewallUp);
    assert!(!rpc.methods().iter().any(|m| m == "firewallDown" || m == "deviceDown"));
}

// ─── Device destruction collapses the worker ──────────────────

#[tokio::test]
async fn device_deletion_collapses_and_replans() {
    let rpc = MockRpc::new();
    let mut sched = scheduler(ETH0_ADDRCONF, vec![eth_device("eth0")], rpc.clone());
    sched
        .set_target("eth0", TargetRange::at_least(IfState::AddrconfUp))
        .unwrap();
    let summary = sched.run().await;
    assert!(summary.all_done());

    // The device vanishes and comes back; the worker collapses to
    // device-down and a fresh run drives it up again through the factory
    // edge (skipped, the path is re-announced) and the full ladder.
    let events = sched.event_sender();
    events.device_event(DeviceEvent::Deleted {
        name: "eth0".into(),
    });
    events.device_event(DeviceEvent::Created(eth_device("eth0")));
    let summary = sched.run().await;
    assert!(summary.all_done(), "{summary:?}");
    assert_eq!(summary.report("eth0").unwrap().state, IfState::AddrconfUp);

    // Two full bring-ups worth of linkUp dispatches.
    assert_eq!(rpc.methods().iter().filter(|m| *m == "linkUp").count(), 2);
}
