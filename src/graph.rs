//! Worker graph construction.
//!
//! Builds the dependency graph from configuration documents and the live
//! device inventory: one worker per configured name or discovered device,
//! edges to lower devices with their transition gates, ownership claims,
//! depth, and cycle detection.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::ops::{Index, IndexMut};
use tracing::{debug, info, warn};

use crate::config::{DeviceKind, EdgePrecondition, InterfaceConfig, LowerRef};
use crate::error::{Error, FailureKind};
use crate::inventory::Inventory;
use crate::plan::call;
use crate::state::{IfState, TargetRange};
use crate::worker::{Edge, Failure, Worker, WorkerId};

/// Arena of workers addressed by stable index.
#[derive(Debug, Default)]
pub struct WorkerGraph {
    workers: Vec<Worker>,
    by_name: HashMap<String, WorkerId>,
}

impl WorkerGraph {
    /// Build the graph from one configuration document per interface plus
    /// the current inventory snapshot.
    pub fn build(configs: Vec<InterfaceConfig>, inventory: &Inventory) -> Result<Self, Error> {
        let mut graph = WorkerGraph::default();

        for config in configs {
            if graph.by_name.contains_key(&config.name) {
                return Err(Error::Config(format!(
                    "duplicate configuration for {}",
                    config.name
                )));
            }
            let state = inventory
                .device(&config.name)
                .map(|d| d.reported_state())
                .unwrap_or(IfState::DeviceDown);
            let id = graph.workers.len();
            let mut worker = Worker::from_config(id, config, state);
            if let Some(device) = inventory.device(&worker.name) {
                worker.ifindex = Some(device.ifindex);
                worker.object_path = device.object_path.clone();
            }
            graph.by_name.insert(worker.name.clone(), id);
            graph.workers.push(worker);
        }

        // Discovery may report devices no document mentions; they get a
        // worker so events and ownership have somewhere to land.
        let discovered: Vec<String> = inventory_names(inventory)
            .into_iter()
            .filter(|name| !graph.by_name.contains_key(name))
            .collect();
        for name in discovered {
            let device = inventory.device(&name).expect("name taken from inventory");
            let id = graph.workers.len();
            let worker = Worker::from_discovery(id, device);
            graph.by_name.insert(name, id);
            graph.workers.push(worker);
        }

        graph.link_edges()?;
        graph.claim_ownership();
        graph.compute_depths();
        Ok(graph)
    }

    /// Resolve lower references into edges, creating placeholder workers for
    /// names that are neither configured nor discovered. A malformed
    /// reference fails its own worker; the rest of the graph stands.
    fn link_edges(&mut self) -> Result<(), Error> {
        for id in 0..self.workers.len() {
            let Some(config) = self.workers[id].config.clone() else {
                continue;
            };
            let lowers = match config.lower_refs() {
                Ok(lowers) => lowers,
                Err(e) => {
                    self.fail(id, FailureKind::Config, e.to_string());
                    continue;
                }
            };
            for lower in lowers {
                let child = self.find_or_placeholder(&lower.name);
                if child == id {
                    self.fail(
                        id,
                        FailureKind::Config,
                        format!("{} references itself as lower device", config.name),
                    );
                    continue;
                }
                let preconditions = effective_preconditions(config.kind, &lower);
                self.workers[id].children.push(Edge {
                    child,
                    config: lower.node.clone(),
                    preconditions,
                });
            }
        }
        Ok(())
    }

    fn find_or_placeholder(&mut self, name: &str) -> WorkerId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.workers.len();
        self.workers.push(Worker::placeholder(id, name));
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Record shared and exclusive claims per edge. A second exclusive claim
    /// is a fatal conflict: the contested device and both claimants fail and
    /// never issue an RPC.
    fn claim_ownership(&mut self) {
        for id in 0..self.workers.len() {
            let Some(config) = self.workers[id].config.clone() else {
                continue;
            };
            let exclusive = config.kind == DeviceKind::Bond;
            let children: Vec<WorkerId> =
                self.workers[id].children.iter().map(|e| e.child).collect();
            for child in children {
                let prior_owner = self.workers[child].exclusive_owner;
                let claim = if exclusive {
                    self.workers[child].claim_exclusive(id)
                } else {
                    self.workers[child].claim_shared(id)
                };
                if let Err(reason) = claim {
                    warn!(parent = %self.workers[id].name,
                          child = %self.workers[child].name,
                          %reason, "ownership conflict");
                    self.fail(id, FailureKind::Config, reason.clone());
                    self.fail(child, FailureKind::Config, reason.clone());
                    if let Some(owner) = prior_owner {
                        self.fail(owner, FailureKind::Config, reason);
                    }
                }
            }
        }
    }

    /// Depth per worker (leaves at 0) and cycle detection. Workers on a
    /// dependency cycle all fail with a configuration error.
    fn compute_depths(&mut self) {
        let mut dig: DiGraph<WorkerId, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..self.workers.len()).map(|id| dig.add_node(id)).collect();
        for (id, worker) in self.workers.iter().enumerate() {
            for edge in &worker.children {
                dig.add_edge(nodes[id], nodes[edge.child], ());
            }
        }

        // SCCs come out children-first, so depths fill bottom-up.
        for scc in tarjan_scc(&dig) {
            let cyclic = scc.len() > 1
                || dig.contains_edge(scc[0], scc[0]);
            if cyclic {
                for node in &scc {
                    let id = dig[*node];
                    self.fail(id, FailureKind::Config, "dependency cycle".to_string());
                }
                continue;
            }
            let id = dig[scc[0]];
            let depth = self.workers[id]
                .children
                .iter()
                .map(|e| self.workers[e.child].depth + 1)
                .max()
                .unwrap_or(0);
            self.workers[id].depth = depth;
        }
    }

    fn fail(&mut self, id: WorkerId, kind: FailureKind, detail: String) {
        let worker = &mut self.workers[id];
        if worker.failed.is_some() {
            return;
        }
        info!(worker = %worker.name, %kind, %detail, "worker failed at graph build");
        worker.failed = Some(Failure {
            kind,
            last_call: None,
            detail,
        });
    }

    // ── Accessors ──

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = WorkerId> {
        0..self.workers.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter()
    }

    pub fn by_name(&self, name: &str) -> Option<WorkerId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: WorkerId) -> &Worker {
        &self.workers[id]
    }

    pub fn get_mut(&mut self, id: WorkerId) -> &mut Worker {
        &mut self.workers[id]
    }

    /// Ids ordered children-first, so one pass lets dependencies move before
    /// their dependents.
    pub fn depth_order(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = (0..self.workers.len()).collect();
        ids.sort_by_key(|&id| self.workers[id].depth);
        ids
    }

    /// Register a device discovery reported after the graph was built.
    pub fn add_discovered(&mut self, device: &crate::inventory::DeviceInfo) -> WorkerId {
        let id = self.workers.len();
        let worker = Worker::from_discovery(id, device);
        self.by_name.insert(worker.name.clone(), id);
        self.workers.push(worker);
        id
    }

    /// Set the target range for a named worker and reset its plan. A failed
    /// worker stays failed.
    pub fn set_target(&mut self, name: &str, target: TargetRange) -> Result<WorkerId, Error> {
        let id = self
            .by_name(name)
            .ok_or_else(|| Error::Config(format!("no such interface: {name}")))?;
        let worker = &mut self.workers[id];
        worker.fsm.target = Some(target);
        worker.fsm.plan.clear();
        worker.fsm.next = 0;
        worker.done = false;
        Ok(id)
    }

    /// Floor the targets of children below every targeted worker, per the
    /// edge gates: before a parent can issue a gated call, the child must at
    /// least reach the gate's minimum.
    pub fn propagate_targets(&mut self) {
        let mut work: Vec<WorkerId> = self
            .ids()
            .filter(|&id| self.workers[id].fsm.target.is_some())
            .collect();

        while let Some(id) = work.pop() {
            let Some(target) = self.workers[id].fsm.target else {
                continue;
            };
            // Bring-down targets do not force children anywhere.
            if self.workers[id].fsm.state >= target.min {
                continue;
            }
            let edges: Vec<(WorkerId, IfState)> = self.workers[id]
                .children
                .iter()
                .flat_map(|e| e.preconditions.iter().map(move |p| (e.child, p.min)))
                .collect();
            for (child, min) in edges {
                let child_worker = &mut self.workers[child];
                let changed = match child_worker.fsm.target {
                    Some(mut existing) => {
                        let before = existing;
                        existing.raise_min(min);
                        child_worker.fsm.target = Some(existing);
                        existing != before
                    }
                    None => {
                        child_worker.fsm.target = Some(TargetRange::at_least(min));
                        true
                    }
                };
                if changed {
                    debug!(child = %self.workers[child].name, floor = %min, "target floored by parent");
                    work.push(child);
                }
            }
        }
    }

    /// Release every claim `parent` holds on its children (bring-down
    /// reached `device-exists` or below).
    pub fn release_claims(&mut self, parent: WorkerId) {
        let children: Vec<WorkerId> = self.workers[parent]
            .children
            .iter()
            .map(|e| e.child)
            .collect();
        for child in children {
            self.workers[child].release_claim(parent);
        }
    }

    /// Parents holding at least one gate on `child`: the cascade set for a
    /// permanent child failure.
    pub fn gated_parents(&self, child: WorkerId) -> Vec<WorkerId> {
        self.ids()
            .filter(|&id| {
                self.workers[id]
                    .children
                    .iter()
                    .any(|e| e.child == child && !e.preconditions.is_empty())
            })
            .collect()
    }
}

impl Index<WorkerId> for WorkerGraph {
    type Output = Worker;

    fn index(&self, id: WorkerId) -> &Worker {
        &self.workers[id]
    }
}

impl IndexMut<WorkerId> for WorkerGraph {
    fn index_mut(&mut self, id: WorkerId) -> &mut Worker {
        &mut self.workers[id]
    }
}

fn inventory_names(inventory: &Inventory) -> Vec<String> {
    // Deterministic order keeps worker ids stable across runs.
    let mut names: Vec<String> = inventory.names().map(str::to_string).collect();
    names.sort();
    names
}

/// Explicit gates from the document win; otherwise the kind's defaults.
fn effective_preconditions(kind: DeviceKind, lower: &LowerRef) -> Vec<EdgePrecondition> {
    if !lower.preconditions.is_empty() {
        return lower.preconditions.clone();
    }
    match kind {
        DeviceKind::Bridge | DeviceKind::Bond => vec![EdgePrecondition::new(
            call::DEVICE_UP,
            IfState::DeviceUp,
            IfState::AddrconfUp,
        )],
        DeviceKind::Vlan => vec![EdgePrecondition::new(
            call::LINK_UP,
            IfState::LinkUp,
            IfState::AddrconfUp,
        )],
        DeviceKind::Tunnel => vec![EdgePrecondition::new(
            call::DEVICE_UP,
            IfState::DeviceUp,
            IfState::AddrconfUp,
        )],
        _ => Vec::new(),
    }
}
