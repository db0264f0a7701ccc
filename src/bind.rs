//! The binder: from abstract actions to dispatchable bindings.
//!
//! For each action the binder resolves the target object (the worker's
//! device object, or the kind's factory when the device does not exist yet),
//! the concrete service, the method overload whose declared signature the
//! configuration subtree types against, and the marshalled argument
//! document. Binders run lazily on first need and re-run whenever the
//! device object path changes.

use serde_json::json;
use tracing::debug;

use crate::config::{ConfigNode, DeviceKind};
use crate::error::Error;
use crate::inventory::Inventory;
use crate::plan::{call, Action, ActionKind, Binding, ACTION_BINDINGS_MAX};
use crate::rpc::ArgDoc;
use crate::schema::{MethodSignature, SchemaEngine, TypeError};
use crate::worker::{DeviceApi, Worker};

/// Object path factory calls are issued on.
pub const SERVER_OBJECT_PATH: &str = "/netsteer/server";

/// Factory service and creation method for a device kind, when one exists.
/// Physical devices only ever come from discovery.
pub fn factory_service(kind: DeviceKind) -> Option<(&'static str, &'static str)> {
    match kind {
        DeviceKind::Bridge => Some(("factory.bridge", "newDevice")),
        DeviceKind::Bond => Some(("factory.bond", "newDevice")),
        DeviceKind::Vlan => Some(("factory.vlan", "newDevice")),
        DeviceKind::Tunnel => Some(("factory.tunnel", "newDevice")),
        _ => None,
    }
}

pub struct Binder<'a> {
    schema: &'a dyn SchemaEngine,
    inventory: &'a Inventory,
}

impl<'a> Binder<'a> {
    pub fn new(schema: &'a dyn SchemaEngine, inventory: &'a Inventory) -> Self {
        Binder { schema, inventory }
    }

    /// Resolve every binding for one action. On success the action is marked
    /// bound against the worker's current object path.
    pub fn bind_action(
        &self,
        worker: &Worker,
        api: &mut DeviceApi,
        action: &mut Action,
    ) -> Result<(), Error> {
        action.bindings.clear();

        match action.kind {
            ActionKind::Enroll => {}
            ActionKind::DeviceCreate => self.bind_create(worker, api, action)?,
            ActionKind::Call { service, method } => {
                self.bind_instance_call(worker, api, action, service, method)?
            }
            ActionKind::AddrconfUp => self.bind_addrconf_up(worker, action)?,
            ActionKind::AddrconfDown => self.bind_addrconf_down(worker, action)?,
            ActionKind::DeviceDelete => self.bind_delete(worker, action)?,
        }

        if action.bindings.len() > ACTION_BINDINGS_MAX {
            return Err(Error::Binding(format!(
                "{}: {} exceeds {ACTION_BINDINGS_MAX} bindings",
                worker.name, action.call
            )));
        }

        action.bound = true;
        action.bound_for = worker.object_path.clone();
        debug!(worker = %worker.name, call = action.call,
               bindings = action.bindings.len(), "action bound");
        Ok(())
    }

    /// `newDevice`: nothing to do when the object already exists; otherwise
    /// bind the kind's factory on the server object.
    fn bind_create(
        &self,
        worker: &Worker,
        api: &mut DeviceApi,
        action: &mut Action,
    ) -> Result<(), Error> {
        if worker.object_path.is_some() {
            return Ok(());
        }
        let Some((service, method)) = factory_service(worker.device_kind) else {
            return Err(Error::Binding(format!(
                "{}: no factory can create a {} device",
                worker.name, worker.device_kind
            )));
        };
        let Some(config) = worker.config.as_ref() else {
            return Err(Error::Binding(format!(
                "{}: no configuration to create the device from",
                worker.name
            )));
        };

        let args = self.marshal(action, service, method, Some(&config.root))?;
        api.factory_service = Some(service.to_string());
        api.factory_method = Some(method.to_string());
        action.bindings.push(Binding {
            service: service.to_string(),
            method: method.to_string(),
            args,
            object_path: Some(SERVER_OBJECT_PATH.to_string()),
            skip_call: false,
            family: None,
        });
        Ok(())
    }

    fn bind_instance_call(
        &self,
        worker: &Worker,
        api: &mut DeviceApi,
        action: &mut Action,
        abstract_service: &str,
        method: &str,
    ) -> Result<(), Error> {
        let subtree = worker
            .config
            .as_ref()
            .and_then(|c| c.subtree_for_call(action.call));
        if subtree.is_none() && action.skip_without_config {
            return Ok(());
        }

        self.require_addressable(worker)?;
        let service = self.resolve_service(worker, abstract_service)?;
        let args = self.marshal(action, &service, method, subtree)?;

        if action.call == call::DEVICE_UP {
            api.service = Some(service.clone());
            api.method = Some(method.to_string());
        }
        action.bindings.push(Binding {
            service,
            method: method.to_string(),
            args,
            object_path: None,
            skip_call: false,
            family: None,
        });
        Ok(())
    }

    /// One `requestLease` per family in configuration; disabled families
    /// still bind, flagged to skip dispatch while advancing state.
    fn bind_addrconf_up(&self, worker: &Worker, action: &mut Action) -> Result<(), Error> {
        let Some(config) = worker.config.as_ref() else {
            return Ok(());
        };
        let families = config.addrconf_families();
        if families.is_empty() {
            return Ok(());
        }
        self.require_addressable(worker)?;

        for fam in families {
            let abstract_service = format!("addrconf.{}.{}", fam.family, fam.mode);
            if !fam.enabled {
                let mut b = Binding::skipped(&abstract_service, "requestLease");
                b.family = Some(fam.family);
                action.bindings.push(b);
                continue;
            }
            let service = self.resolve_service(worker, &abstract_service)?;
            let args = self.marshal(action, &service, "requestLease", Some(&fam.node))?;
            action.bindings.push(Binding {
                service,
                method: "requestLease".to_string(),
                args,
                object_path: None,
                skip_call: false,
                family: Some(fam.family),
            });
        }
        Ok(())
    }

    /// One `dropLease` per held lease.
    fn bind_addrconf_down(&self, worker: &Worker, action: &mut Action) -> Result<(), Error> {
        if worker.leases.is_empty() {
            return Ok(());
        }
        self.require_addressable(worker)?;
        for lease in &worker.leases {
            let abstract_service = format!("addrconf.{}", lease.family);
            let service = self.resolve_service(worker, &abstract_service)?;
            action.bindings.push(Binding {
                service,
                method: "dropLease".to_string(),
                args: json!({ "owner": lease.owner }),
                object_path: None,
                skip_call: false,
                family: Some(lease.family),
            });
        }
        Ok(())
    }

    /// `deleteDevice` applies to virtual devices only.
    fn bind_delete(&self, worker: &Worker, action: &mut Action) -> Result<(), Error> {
        if !worker.device_kind.is_virtual() || worker.object_path.is_none() {
            return Ok(());
        }
        let service = self.resolve_service(worker, "device")?;
        let subtree = worker.config.as_ref().and_then(|c| c.device_node());
        let args = self.marshal(action, &service, "deleteDevice", subtree)?;
        action.bindings.push(Binding {
            service,
            method: "deleteDevice".to_string(),
            args,
            object_path: None,
            skip_call: false,
            family: None,
        });
        Ok(())
    }

    fn require_addressable(&self, worker: &Worker) -> Result<(), Error> {
        if worker.object_path.is_none() {
            return Err(Error::Binding(format!(
                "{}: device object is not addressable",
                worker.name
            )));
        }
        Ok(())
    }

    /// First advertised service matching the abstract identifier. Devices
    /// discovery has not (re)announced yet fall back to the abstract name.
    fn resolve_service(&self, worker: &Worker, abstract_id: &str) -> Result<String, Error> {
        match self.inventory.device(&worker.name) {
            Some(dev) if !dev.services.is_empty() => self
                .inventory
                .resolve_service(&worker.name, abstract_id)
                .ok_or_else(|| {
                    Error::Binding(format!(
                        "{}: object offers no {abstract_id} service",
                        worker.name
                    ))
                }),
            _ => {
                debug!(worker = %worker.name, service = abstract_id,
                       "no advertised service list; using abstract name");
                Ok(abstract_id.to_string())
            }
        }
    }

    /// Pick the overload the subtree types against and marshal it.
    ///
    /// With overloading permitted, candidates are probed in declaration
    /// order and the first that types wins. With it forbidden, the method
    /// must declare exactly one signature.
    fn marshal(
        &self,
        action: &Action,
        service: &str,
        method: &str,
        subtree: Option<&ConfigNode>,
    ) -> Result<ArgDoc, Error> {
        let signatures = self.schema.signatures(service, method);
        if signatures.is_empty() {
            return Err(Error::Binding(format!(
                "no method {method} on service {service}"
            )));
        }

        let empty = ConfigNode::new(action.call);
        let subtree = subtree.unwrap_or(&empty);

        if !action.overloading {
            if signatures.len() != 1 {
                return Err(Error::Binding(format!(
                    "{service}.{method} declares {} signatures but overloading is disabled",
                    signatures.len()
                )));
            }
            return self
                .schema
                .check(&signatures[0], subtree)
                .map_err(Error::from);
        }

        let mut last_err: Option<TypeError> = None;
        for sig in &signatures {
            match self.schema.check(sig, subtree) {
                Ok(args) => return Ok(args),
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(Error::Schema(e)),
            None => Err(Error::Binding(format!(
                "no overload of {service}.{method} matched"
            ))),
        }
    }
}

/// A minimal structural schema used by unit tests: every declared argument
/// is looked up as an attribute or child of the subtree.
#[cfg(test)]
pub(crate) fn check_structural(
    signature: &MethodSignature,
    config: &ConfigNode,
) -> Result<ArgDoc, TypeError> {
    use crate::schema::ArgType;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceConfig;
    use crate::inventory::DeviceInfo;
    use crate::plan;
    use crate::schema::{ArgSpec, ArgType};
    use crate::state::{IfState, TargetRange};
    use std::collections::HashMap;

    struct TestSchema {
        sigs: HashMap<(String, String), Vec<MethodSignature>>,
    }

    impl TestSchema {
        fn new() -> Self {
            let mut sigs = HashMap::new();
            let mut declare = |service: &str, method: &str, args: Vec<ArgSpec>| {
                sigs.entry((service.to_string(), method.to_string()))
                    .or_insert_with(Vec::new)
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
            declare("firewall", "firewallUp", vec![]);
            // Two linkUp overloads: the first requires a rate, the second
            // takes anything.
            declare("link", "linkUp", vec![req("rate", ArgType::Uint32)]);
            declare("link", "linkUp", vec![opt("mtu", ArgType::Uint32)]);
            declare(
                "addrconf.ipv4.dhcp",
                "requestLease",
                vec![opt("hostname", ArgType::Str)],
            );
            declare(
                "factory.bridge",
                "newDevice",
                vec![req("name", ArgType::Str)],
            );
            TestSchema { sigs }
        }
    }

    impl SchemaEngine for TestSchema {
        fn signatures(&self, service: &str, method: &str) -> Vec<MethodSignature> {
            self.sigs
                .get(&(service.to_string(), method.to_string()))
                .cloned()
                .unwrap_or_default()
        }

        fn check(
            &self,
            signature: &MethodSignature,
            config: &ConfigNode,
        ) -> Result<ArgDoc, TypeError> {
            check_structural(signature, config)
        }
    }

    fn eth0_device() -> DeviceInfo {
        DeviceInfo {
            name: "eth0".into(),
            ifindex: 2,
            object_path: Some("/netsteer/device/eth0".into()),
            kind: DeviceKind::Ethernet,
            admin_up: false,
            carrier: false,
            services: vec![
                "device".into(),
                "firewall".into(),
                "link".into(),
                "addrconf.ipv4.dhcp".into(),
            ],
        }
    }

    fn eth0_worker(xml: &str) -> Worker {
        let config = InterfaceConfig::parse(xml).unwrap();
        let mut w = Worker::from_config(0, config, IfState::DeviceExists);
        w.object_path = Some("/netsteer/device/eth0".into());
        w
    }

    fn action_for(call_name: &str) -> Action {
        plan::plan(
            IfState::DeviceDown,
            TargetRange::exact(IfState::AddrconfUp),
        )
        .into_iter()
        .find(|a| a.call == call_name)
        .unwrap()
    }

    #[test]
    fn overload_probing_picks_first_that_types() {
        let schema = TestSchema::new();
        let mut inv = Inventory::new();
        inv.insert(eth0_device());
        let binder = Binder::new(&schema, &inv);

        let w = eth0_worker(
            r#"<interface name="eth0"><ethernet/><link><mtu>9000</mtu></link></interface>"#,
        );
        let mut api = DeviceApi::default();
        let mut action = action_for(call::LINK_UP);
        binder.bind_action(&w, &mut api, &mut action).unwrap();

        // No rate declared, so the first overload fails to type and the
        // second wins.
        assert_eq!(action.bindings.len(), 1);
        assert_eq!(action.bindings[0].args, json!({"mtu": 9000}));

        let w2 = eth0_worker(
            r#"<interface name="eth0"><ethernet/><link><rate>100</rate></link></interface>"#,
        );
        let mut action2 = action_for(call::LINK_UP);
        binder.bind_action(&w2, &mut api, &mut action2).unwrap();
        assert_eq!(action2.bindings[0].args, json!({"rate": 100}));
    }

    #[test]
    fn auth_without_config_binds_nothing() {
        let schema = TestSchema::new();
        let mut inv = Inventory::new();
        inv.insert(eth0_device());
        let binder = Binder::new(&schema, &inv);

        let w = eth0_worker(r#"<interface name="eth0"><ethernet/></interface>"#);
        let mut api = DeviceApi::default();
        let mut action = action_for(call::AUTH_UP);
        binder.bind_action(&w, &mut api, &mut action).unwrap();
        assert!(action.bound);
        assert!(action.bindings.is_empty());
    }

    #[test]
    fn existing_device_skips_factory() {
        let schema = TestSchema::new();
        let mut inv = Inventory::new();
        inv.insert(eth0_device());
        let binder = Binder::new(&schema, &inv);

        let w = eth0_worker(r#"<interface name="eth0"><ethernet/></interface>"#);
        let mut api = DeviceApi::default();
        let mut action = action_for(call::NEW_DEVICE);
        binder.bind_action(&w, &mut api, &mut action).unwrap();
        assert!(action.bindings.is_empty());
        assert!(api.factory_service.is_none());
    }

    #[test]
    fn absent_bridge_binds_factory_on_server_object() {
        let schema = TestSchema::new();
        let inv = Inventory::new();
        let binder = Binder::new(&schema, &inv);

        let config = InterfaceConfig::parse(
            r#"<interface name="br0"><bridge/></interface>"#,
        )
        .unwrap();
        let w = Worker::from_config(0, config, IfState::DeviceDown);
        let mut api = DeviceApi::default();
        let mut action = action_for(call::NEW_DEVICE);
        binder.bind_action(&w, &mut api, &mut action).unwrap();

        assert_eq!(action.bindings.len(), 1);
        let b = &action.bindings[0];
        assert_eq!(b.service, "factory.bridge");
        assert_eq!(b.object_path.as_deref(), Some(SERVER_OBJECT_PATH));
        assert_eq!(b.args, json!({"name": "br0"}));
        assert_eq!(api.factory_service.as_deref(), Some("factory.bridge"));
    }

    #[test]
    fn disabled_family_binds_skipped() {
        let schema = TestSchema::new();
        let mut inv = Inventory::new();
        inv.insert(eth0_device());
        let binder = Binder::new(&schema, &inv);

        let w = eth0_worker(
            r#"<interface name="eth0"><ethernet/>
               <addrconf><ipv4 mode="dhcp"/><ipv6 enabled="false"/></addrconf>
               </interface>"#,
        );
        let mut api = DeviceApi::default();
        let mut action = action_for(call::ADDRCONF_UP);
        binder.bind_action(&w, &mut api, &mut action).unwrap();

        assert_eq!(action.bindings.len(), 2);
        assert!(!action.bindings[0].skip_call);
        assert!(action.bindings[1].skip_call);
    }

    #[test]
    fn missing_service_is_a_binding_error() {
        let schema = TestSchema::new();
        let mut inv = Inventory::new();
        let mut dev = eth0_device();
        dev.services = vec!["device".into()];
        inv.insert(dev);
        let binder = Binder::new(&schema, &inv);

        let w = eth0_worker(r#"<interface name="eth0"><ethernet/></interface>"#);
        let mut api = DeviceApi::default();
        let mut action = action_for(call::FIREWALL_UP);
        let err = binder.bind_action(&w, &mut api, &mut action).unwrap_err();
        assert!(matches!(err, Error::Binding(_)));
    }
}
