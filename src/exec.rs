//! The cooperative scheduler.
//!
//! One pass visits every worker and advances each ready one by at most one
//! action: evaluate requirements, check edge gates against children, bind,
//! dispatch, and either advance state on synchronous completion or park the
//! worker on its pending callback ids with a timer armed. Between passes the
//! scheduler drains the event queue and sleeps until a callback, a timer or
//! an inventory change wakes it. Only scheduler code mutates worker state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::bind::Binder;
use crate::error::{Error, FailureKind};
use crate::events::{self, CallbackResult, EventSender, SystemEvent};
use crate::graph::WorkerGraph;
use crate::inventory::{DeviceEvent, Inventory};
use crate::lease::Lease;
use crate::plan::{self, ActionKind};
use crate::report::{Disposition, ProgressEvent, RunSummary, WorkerReport};
use crate::require::{Requirement, RequirementOutcome};
use crate::rpc::{ArgDoc, CallReply, RpcClient};
use crate::schema::SchemaEngine;
use crate::state::{IfState, TargetRange};
use crate::worker::{Failure, WaitState, WorkerId};
use uuid::Uuid;

/// Default time a worker may spend parked on callbacks, per action.
pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;

/// Drives every worker from its current state into its target range.
pub struct Scheduler {
    graph: WorkerGraph,
    inventory: Inventory,
    rpc: Arc<dyn RpcClient>,
    schema: Arc<dyn SchemaEngine>,
    rx: mpsc::UnboundedReceiver<SystemEvent>,
    tx: EventSender,
    /// Bumped on every delivered event; requirement tests key on it.
    event_seq: u64,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl Scheduler {
    pub fn new(
        graph: WorkerGraph,
        inventory: Inventory,
        rpc: Arc<dyn RpcClient>,
        schema: Arc<dyn SchemaEngine>,
    ) -> Self {
        let (tx, rx) = events::channel();
        Scheduler {
            graph,
            inventory,
            rpc,
            schema,
            rx,
            tx,
            event_seq: 0,
            progress: None,
        }
    }

    /// Handle for transports to inject callbacks and inventory deltas.
    pub fn event_sender(&self) -> EventSender {
        self.tx.clone()
    }

    /// Per-worker status stream for progress reporting.
    pub fn subscribe_progress(&mut self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.progress = Some(tx);
        rx
    }

    pub fn graph(&self) -> &WorkerGraph {
        &self.graph
    }

    pub fn set_target(&mut self, name: &str, target: TargetRange) -> Result<WorkerId, Error> {
        self.graph.set_target(name, target)
    }

    /// Abort one worker: pending callbacks are discarded, its timer is
    /// cancelled, and it fails with reason `cancelled`.
    pub fn cancel(&mut self, name: &str) -> Result<(), Error> {
        let id = self
            .graph
            .by_name(name)
            .ok_or_else(|| Error::Config(format!("no such interface: {name}")))?;
        self.fail_worker(id, FailureKind::Cancelled, None, "cancelled".to_string());
        Ok(())
    }

    /// Run every worker to a terminal disposition.
    pub async fn run(&mut self) -> RunSummary {
        self.graph.propagate_targets();
        for id in self.graph.ids() {
            let worker = self.graph.get_mut(id);
            if worker.fsm.target.is_none() && worker.failed.is_none() {
                worker.done = true;
            }
        }

        loop {
            while let Ok(event) = self.rx.try_recv() {
                self.handle_event(event);
            }
            let progressed = self.pass().await;
            if self.settled() {
                break;
            }
            if progressed {
                continue;
            }
            self.wait_for_event().await;
        }

        let summary = self.summary();
        info!(
            workers = summary.reports.len(),
            failed = summary.failed_count(),
            "run settled"
        );
        summary
    }

    /// Dispositions for every worker, `Pending` for any not yet settled.
    pub fn summary(&self) -> RunSummary {
        let reports = self
            .graph
            .iter()
            .map(|w| {
                let disposition = if let Some(failure) = &w.failed {
                    Disposition::Failed {
                        kind: failure.kind,
                        last_call: failure.last_call.clone(),
                    }
                } else if w.done {
                    Disposition::Done
                } else {
                    Disposition::Pending {
                        last_call: w.fsm.next_action().map(|a| a.call.to_string()),
                    }
                };
                WorkerReport {
                    name: w.name.clone(),
                    state: w.fsm.state,
                    disposition,
                }
            })
            .collect();
        RunSummary { reports }
    }

    // ── Pass machinery ──

    /// Every worker is settled for its current plan.
    fn settled(&self) -> bool {
        self.graph.iter().all(|w| {
            if w.done {
                true
            } else if w.failed.is_some() {
                // A failed worker still unwinding its teardown plan is live.
                !(w.teardown && !w.fsm.plan_exhausted())
            } else {
                false
            }
        })
    }

    async fn pass(&mut self) -> bool {
        let mut progressed = false;
        for id in self.graph.depth_order() {
            if self.step(id).await {
                progressed = true;
            }
        }
        progressed
    }

    /// Advance one worker by at most one action. Returns true when anything
    /// moved (state advanced, RPC dispatched, plan created, or disposition
    /// changed).
    async fn step(&mut self, id: WorkerId) -> bool {
        let was_ready = {
            let w = self.graph.get(id);
            let teardown_active = w.teardown && !w.fsm.plan_exhausted();
            if w.done || (w.failed.is_some() && !teardown_active) {
                return false;
            }
            match &w.fsm.wait {
                WaitState::Awaiting { .. } => return false,
                WaitState::Requirement { seq } if *seq == self.event_seq => return false,
                wait => wait.is_ready(),
            }
        };

        // Plan on first need.
        if self.graph[id].fsm.plan.is_empty() && !self.graph[id].teardown {
            match self.make_plan(id) {
                Ok(true) => {}
                Ok(false) => return true, // nothing to do: done
                Err(e) => {
                    self.fail_worker(id, e.kind(), None, e.to_string());
                    return true;
                }
            }
        }
        if self.graph[id].fsm.plan_exhausted() {
            self.finish_plan(id);
            return true;
        }

        // Requirements, lazily re-evaluated on event-sequence advance.
        match self.evaluate_requirements(id) {
            RequirementOutcome::Met => {}
            RequirementOutcome::Pending => {
                let seq = self.event_seq;
                self.graph.get_mut(id).fsm.wait = WaitState::Requirement { seq };
                if was_ready {
                    self.park_progress(id, "requirement");
                }
                return false;
            }
            RequirementOutcome::Failed(reason) => {
                let call = self.current_call(id);
                self.fail_worker(id, FailureKind::PreconditionPermanent, call, reason);
                return true;
            }
        }

        // Edge gates against children.
        match self.check_preconditions(id) {
            Gate::Open => {}
            Gate::Parked { child, call } => {
                self.graph.get_mut(id).fsm.wait = WaitState::Child { child, call };
                if was_ready {
                    self.park_progress(id, "child");
                }
                return false;
            }
            Gate::Permanent(reason) => {
                let call = self.current_call(id);
                self.fail_worker(id, FailureKind::PreconditionPermanent, call, reason);
                return true;
            }
        }

        // Bind lazily; rebind when the object path moved under the action.
        let needs_bind = {
            let w = self.graph.get(id);
            let action = &w.fsm.plan[w.fsm.next];
            !action.bound || action.bound_for != w.object_path
        };
        if needs_bind {
            if let Err(e) = self.bind_current(id) {
                let call = self.current_call(id);
                self.fail_worker(id, e.kind(), call, e.to_string());
                return true;
            }
        }

        self.dispatch_current(id).await;
        true
    }

    /// Plan from the current state into the target range, attaching the
    /// document's requirement declarations to their actions.
    /// Returns Ok(false) when the worker is already inside its range.
    fn make_plan(&mut self, id: WorkerId) -> Result<bool, Error> {
        let (state, target_opt, name) = {
            let w = self.graph.get(id);
            (w.fsm.state, w.fsm.target, w.name.clone())
        };
        let Some(target) = target_opt else {
            self.graph.get_mut(id).done = true;
            return Ok(false);
        };

        let mut actions = plan::plan(state, target);
        if actions.is_empty() {
            debug!(worker = %name, state = %state, target = %target, "already in range");
            let w = self.graph.get_mut(id);
            w.done = true;
            self.emit(ProgressEvent::Completed { worker: name });
            return Ok(false);
        }

        if let Some(config) = self.graph[id].config.clone() {
            for node in config.require_nodes() {
                let (call, requirement) = Requirement::from_config(&name, node)?;
                if let Some(action) = actions.iter_mut().find(|a| a.call == call) {
                    action.requirements.push(requirement);
                } else {
                    debug!(worker = %name, call = %call,
                           "requirement declared for a call outside this plan");
                }
            }
        }

        info!(worker = %name, from = %state, target = %target,
              actions = actions.len(), "plan created");
        let w = self.graph.get_mut(id);
        w.fsm.plan = actions;
        w.fsm.next = 0;
        Ok(true)
    }

    fn evaluate_requirements(&mut self, id: WorkerId) -> RequirementOutcome {
        let event_seq = self.event_seq;
        let mut plan_vec = std::mem::take(&mut self.graph.get_mut(id).fsm.plan);
        let next = self.graph[id].fsm.next;
        let mut outcome = RequirementOutcome::Met;
        for requirement in &mut plan_vec[next].requirements {
            match requirement.evaluate(event_seq, &self.inventory) {
                RequirementOutcome::Met => {}
                other => {
                    outcome = other;
                    break;
                }
            }
        }
        self.graph.get_mut(id).fsm.plan = plan_vec;
        outcome
    }

    fn check_preconditions(&self, id: WorkerId) -> Gate {
        let w = self.graph.get(id);
        let call_name = w.fsm.plan[w.fsm.next].call;
        for edge in &w.children {
            for pre in &edge.preconditions {
                if pre.call != call_name {
                    continue;
                }
                let child = self.graph.get(edge.child);
                if pre.admits(child.fsm.state) {
                    continue;
                }
                if child.is_terminal() {
                    return Gate::Permanent(format!(
                        "required worker {} settled at {}, outside [{}..{}] for {}",
                        child.name, child.fsm.state, pre.min, pre.max, call_name
                    ));
                }
                return Gate::Parked {
                    child: edge.child,
                    call: pre.call.clone(),
                };
            }
        }
        Gate::Open
    }

    fn bind_current(&mut self, id: WorkerId) -> Result<(), Error> {
        let mut plan_vec = std::mem::take(&mut self.graph.get_mut(id).fsm.plan);
        let mut api = std::mem::take(&mut self.graph.get_mut(id).device_api);
        let next = self.graph[id].fsm.next;

        let binder = Binder::new(self.schema.as_ref(), &self.inventory);
        let result = binder.bind_action(self.graph.get(id), &mut api, &mut plan_vec[next]);

        let w = self.graph.get_mut(id);
        w.fsm.plan = plan_vec;
        w.device_api = api;
        result
    }

    /// Dispatch every binding of the current action, in order. All-sync
    /// success advances state; any pending callback parks the worker with a
    /// timer armed.
    async fn dispatch_current(&mut self, id: WorkerId) {
        let (bindings, object_path, call_name, timeout_ms) = {
            let w = self.graph.get(id);
            let action = &w.fsm.plan[w.fsm.next];
            (
                action.bindings.clone(),
                w.object_path.clone(),
                action.call,
                w.timeout_ms,
            )
        };

        let mut pending: Vec<Uuid> = Vec::new();
        let mut last_method = String::new();
        let mut completions: Vec<ArgDoc> = Vec::new();

        for binding in &bindings {
            if binding.skip_call {
                debug!(worker = %self.graph[id].name, call = call_name,
                       method = %binding.method, "binding skipped");
                continue;
            }
            let Some(path) = binding.object_path.clone().or_else(|| object_path.clone()) else {
                self.fail_worker(
                    id,
                    FailureKind::Binding,
                    Some(call_name.to_string()),
                    "no object path to dispatch on".to_string(),
                );
                return;
            };
            last_method = binding.method.clone();
            debug!(worker = %self.graph[id].name, %path,
                   service = %binding.service, method = %binding.method, "dispatch");
            match self
                .rpc
                .call(&path, &binding.service, &binding.method, &binding.args)
                .await
            {
                Ok(CallReply::Completed(doc)) => completions.push(doc),
                Ok(CallReply::Pending { callbacks, .. }) => pending.extend(callbacks),
                Err(e) => {
                    let err = Error::Rpc(e);
                    self.fail_worker(
                        id,
                        err.kind(),
                        Some(call_name.to_string()),
                        err.to_string(),
                    );
                    return;
                }
            }
        }

        for doc in &completions {
            self.apply_completion(id, doc);
        }

        if pending.is_empty() {
            self.advance(id);
        } else {
            let deadline = Instant::now() + Duration::from_millis(timeout_ms);
            let w = self.graph.get_mut(id);
            w.fsm.plan[w.fsm.next].pending = pending;
            w.fsm.wait = WaitState::Awaiting {
                deadline,
                last_method,
            };
            self.park_progress(id, "callback");
        }
    }

    /// Complete the current action: advance state, run its side effects,
    /// and move the cursor.
    fn advance(&mut self, id: WorkerId) {
        let (name, to, release, exhausted) = {
            let w = self.graph.get_mut(id);
            let next = w.fsm.next;
            let action = &w.fsm.plan[next];
            let to = action.to;
            let reverse = action.is_reverse();
            if matches!(action.kind, ActionKind::AddrconfDown) {
                w.leases.clear();
            }
            w.fsm.state = to;
            w.fsm.next += 1;
            w.fsm.wait = WaitState::Ready;
            // Claims release exactly when the bring-down crosses out of the
            // addressable range.
            let release = reverse && to == IfState::DeviceExists;
            (w.name.clone(), to, release, w.fsm.plan_exhausted())
        };
        info!(worker = %name, state = %to, "state reached");
        if release {
            self.graph.release_claims(id);
        }
        self.emit(ProgressEvent::StateReached { worker: name, state: to });
        if exhausted {
            self.finish_plan(id);
        }
    }

    fn finish_plan(&mut self, id: WorkerId) {
        let w = self.graph.get_mut(id);
        if w.teardown {
            w.teardown = false;
            w.fsm.plan.clear();
            w.fsm.next = 0;
            info!(worker = %w.name, "teardown after failure complete");
            return;
        }
        w.done = true;
        let name = w.name.clone();
        info!(worker = %name, state = %w.fsm.state, "worker done");
        self.emit(ProgressEvent::Completed { worker: name });
    }

    /// Side effects carried by a completion document: a freshly minted
    /// object path, or a granted lease.
    fn apply_completion(&mut self, id: WorkerId, doc: &ArgDoc) {
        let w = self.graph.get_mut(id);
        if let Some(path) = doc.get("object-path").and_then(|v| v.as_str()) {
            info!(worker = %w.name, %path, "device object created");
            w.object_path = Some(path.to_string());
        }
        let is_addrconf = w
            .fsm
            .next_action()
            .map(|a| matches!(a.kind, ActionKind::AddrconfUp))
            .unwrap_or(false);
        if is_addrconf {
            if let Some(lease) = Lease::from_reply(doc) {
                debug!(worker = %w.name, family = %lease.family, "lease attached");
                w.leases.push(Arc::new(lease));
            }
        }
    }

    // ── Failure policy ──

    /// Fail a worker and cascade to every parent still gated on it. Unless
    /// configuration says otherwise, a bring-up that got past
    /// `device-exists` is unwound back to `device-down`.
    fn fail_worker(
        &mut self,
        id: WorkerId,
        kind: FailureKind,
        last_call: Option<String>,
        detail: String,
    ) {
        let mut queue: Vec<(WorkerId, FailureKind, Option<String>, String)> =
            vec![(id, kind, last_call, detail)];

        while let Some((id, kind, last_call, detail)) = queue.pop() {
            {
                let w = self.graph.get_mut(id);
                if w.failed.is_some() {
                    // A second failure while unwinding abandons the teardown.
                    if w.teardown {
                        w.teardown = false;
                        w.fsm.plan.clear();
                        w.fsm.next = 0;
                        w.fsm.wait = WaitState::Ready;
                    }
                    continue;
                }
                error!(worker = %w.name, %kind, last_call = ?last_call, %detail, "worker failed");
                w.failed = Some(Failure {
                    kind,
                    last_call,
                    detail,
                });
                if let Some(action) = w.fsm.plan.get_mut(w.fsm.next) {
                    action.pending.clear();
                }
                w.fsm.wait = WaitState::Ready;

                let unwind = kind != FailureKind::Cancelled
                    && w.fsm.state > IfState::DeviceExists
                    && !w.persist_on_error;
                if unwind {
                    w.teardown = true;
                    w.fsm.plan = plan::plan(w.fsm.state, TargetRange::exact(IfState::DeviceDown));
                    w.fsm.next = 0;
                } else {
                    w.fsm.plan.clear();
                    w.fsm.next = 0;
                }
                let name = w.name.clone();
                self.emit(ProgressEvent::Failed { worker: name, kind });
            }

            let child_name = self.graph[id].name.clone();
            for parent in self.graph.gated_parents(id) {
                if self.graph[parent].is_terminal() || !self.parent_still_gated(parent, id) {
                    continue;
                }
                queue.push((
                    parent,
                    FailureKind::PreconditionPermanent,
                    None,
                    format!("required worker {child_name} failed"),
                ));
            }
        }
    }

    /// Does `parent` still have a gated call ahead of it on the edge to
    /// `child`? Parents already past the gate are unaffected.
    fn parent_still_gated(&self, parent: WorkerId, child: WorkerId) -> bool {
        let w = self.graph.get(parent);
        let gated_calls: Vec<&str> = w
            .children
            .iter()
            .filter(|e| e.child == child)
            .flat_map(|e| e.preconditions.iter().map(|p| p.call.as_str()))
            .collect();
        if gated_calls.is_empty() {
            return false;
        }
        if w.fsm.plan.is_empty() {
            // Not planned yet; a future plan may hit the gate.
            return w.fsm.target.is_some();
        }
        w.fsm.plan[w.fsm.next..]
            .iter()
            .any(|a| gated_calls.contains(&a.call))
    }

    // ── Event handling ──

    fn handle_event(&mut self, event: SystemEvent) {
        self.event_seq += 1;
        match event {
            SystemEvent::Callback { uuid, result, data } => {
                self.route_callback(uuid, result, data)
            }
            SystemEvent::Device(device_event) => {
                self.inventory.apply(&device_event);
                self.apply_device_event(device_event);
            }
            SystemEvent::Replan => {
                for id in self.graph.ids() {
                    let w = self.graph.get_mut(id);
                    if !w.is_terminal()
                        && matches!(
                            w.fsm.wait,
                            WaitState::Requirement { .. } | WaitState::Child { .. }
                        )
                    {
                        w.fsm.wait = WaitState::Ready;
                    }
                }
            }
            SystemEvent::Cancel { worker } => {
                if let Some(id) = self.graph.by_name(&worker) {
                    self.fail_worker(id, FailureKind::Cancelled, None, "cancelled".to_string());
                } else {
                    warn!(%worker, "cancel for unknown worker ignored");
                }
            }
            SystemEvent::Shutdown => {
                for id in self.graph.ids() {
                    if !self.graph[id].is_terminal() {
                        self.fail_worker(
                            id,
                            FailureKind::Cancelled,
                            None,
                            "shutdown".to_string(),
                        );
                    }
                }
            }
        }
    }

    /// Find the parked worker holding this callback id on its current
    /// action. Unknown ids are late deliveries and are dropped.
    fn route_callback(&mut self, uuid: Uuid, result: CallbackResult, data: Option<ArgDoc>) {
        let found = self.graph.ids().find(|&id| {
            let w = self.graph.get(id);
            matches!(w.fsm.wait, WaitState::Awaiting { .. })
                && w.fsm
                    .next_action()
                    .map(|a| a.pending.contains(&uuid))
                    .unwrap_or(false)
        });
        let Some(id) = found else {
            debug!(%uuid, "callback for no parked worker ignored");
            return;
        };

        let (remaining, call_name) = {
            let w = self.graph.get_mut(id);
            let next = w.fsm.next;
            let action = &mut w.fsm.plan[next];
            action.pending.retain(|u| *u != uuid);
            (action.pending.len(), action.call)
        };

        match result {
            CallbackResult::Error(message) => {
                self.fail_worker(
                    id,
                    FailureKind::Rpc,
                    Some(call_name.to_string()),
                    message,
                );
            }
            CallbackResult::Success => {
                if let Some(doc) = &data {
                    self.apply_completion(id, doc);
                }
                if remaining == 0 {
                    self.advance(id);
                }
            }
        }
    }

    /// Inventory deltas override worker state: a created device materialises
    /// a placeholder, a destroyed one collapses its worker to `device-down`.
    fn apply_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Created(info) => match self.graph.by_name(&info.name) {
                Some(id) => {
                    let w = self.graph.get_mut(id);
                    w.ifindex = Some(info.ifindex);
                    w.object_path = info.object_path.clone();
                    if w.fsm.state == IfState::None {
                        w.fsm.state = IfState::DeviceDown;
                    }
                }
                None => {
                    let id = self.graph.add_discovered(&info);
                    self.graph.get_mut(id).done = true;
                }
            },
            DeviceEvent::Deleted { name } => {
                if let Some(id) = self.graph.by_name(&name) {
                    let w = self.graph.get_mut(id);
                    warn!(worker = %name, "device destroyed; collapsing to device-down");
                    w.collapse();
                    // With a bring-up target still set, the next pass replans
                    // from the collapsed state.
                    if w.fsm.target.is_some() && w.failed.is_none() {
                        w.done = false;
                    }
                }
            }
            DeviceEvent::LinkChanged { ref name, .. } => {
                debug!(device = %name, "link substate changed");
            }
        }
    }

    // ── Timers and sleeping ──

    fn earliest_deadline(&self) -> Option<Instant> {
        self.graph
            .iter()
            .filter_map(|w| match &w.fsm.wait {
                WaitState::Awaiting { deadline, .. } => Some(*deadline),
                _ => None,
            })
            .min()
    }

    fn expire_timers(&mut self) {
        let now = Instant::now();
        let expired: Vec<(WorkerId, String, Option<String>)> = self
            .graph
            .ids()
            .filter_map(|id| {
                let w = self.graph.get(id);
                match &w.fsm.wait {
                    WaitState::Awaiting {
                        deadline,
                        last_method,
                    } if *deadline <= now => Some((
                        id,
                        last_method.clone(),
                        w.fsm.next_action().map(|a| a.call.to_string()),
                    )),
                    _ => None,
                }
            })
            .collect();

        for (id, method, call) in expired {
            let err = Error::Timeout { method };
            self.fail_worker(id, err.kind(), call, err.to_string());
        }
    }

    async fn wait_for_event(&mut self) {
        match self.earliest_deadline() {
            Some(deadline) => {
                tokio::select! {
                    event = self.rx.recv() => {
                        if let Some(event) = event {
                            self.handle_event(event);
                        }
                    }
                    _ = time::sleep_until(deadline) => self.expire_timers(),
                }
            }
            None => {
                if let Some(event) = self.rx.recv().await {
                    self.handle_event(event);
                }
            }
        }
    }

    // ── Small helpers ──

    fn current_call(&self, id: WorkerId) -> Option<String> {
        self.graph[id].fsm.next_action().map(|a| a.call.to_string())
    }

    fn park_progress(&mut self, id: WorkerId, on: &str) {
        let name = self.graph[id].name.clone();
        debug!(worker = %name, on, "parked");
        self.emit(ProgressEvent::Parked {
            worker: name,
            on: on.to_string(),
        });
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(event);
        }
    }
}

enum Gate {
    Open,
    Parked { child: WorkerId, call: String },
    Permanent(String),
}
