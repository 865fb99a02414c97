use crate::node::{MountedNode, NodeArena, NodeId, VNode, ViewId};
use crate::props::{Props, diff_props, strip_handlers};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::WorkerError;

/// Plan-level view handle: a committed view id, or a placeholder the
/// applier resolves against freshly allocated ids.
///
/// Placeholders are numbered in the order the plan would create views
/// (parent before children), so the applier's allocation sequence matches
/// what the serial path would have produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanId {
    Real(ViewId),
    Placeholder(u32),
}

/// Plain-data snapshot of an element subtree, safe to hand to a worker:
/// type, key, non-handler props, listener names, children. Snapshots of
/// the committed tree carry real view ids; diff results may carry
/// placeholders for views the plan creates.
///
/// Only element subtrees serialize. Components are main-context state and
/// cannot render off-thread, so their presence forces the serial path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedNode {
    pub type_name: String,
    pub key: Option<String>,
    pub props: Props,
    pub listeners: Vec<String>,
    pub children: Vec<SerializedNode>,
    pub assigned: Option<PlanId>,
}

impl SerializedNode {
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(SerializedNode::node_count).sum::<usize>()
    }
}

/// Snapshot a mounted subtree. `None` when the subtree holds anything but
/// elements.
pub fn serialize_mounted(arena: &NodeArena, id: NodeId) -> Option<SerializedNode> {
    match arena.get(id)? {
        MountedNode::Element(el) => {
            let mut children = Vec::with_capacity(el.children.len());
            for &child in &el.children {
                children.push(serialize_mounted(arena, child)?);
            }
            Some(SerializedNode {
                type_name: el.type_name.to_string(),
                key: el.key.clone(),
                props: strip_handlers(&el.props),
                listeners: el.listeners.clone(),
                children,
                assigned: Some(PlanId::Real(el.view_id)),
            })
        }
        _ => None,
    }
}

/// Snapshot a description. Same eligibility rule as `serialize_mounted`.
pub fn serialize_description(node: &VNode) -> Option<SerializedNode> {
    match node {
        VNode::Element(el) => {
            let mut children = Vec::with_capacity(el.children.len());
            for child in &el.children {
                children.push(serialize_description(child)?);
            }
            Some(SerializedNode {
                type_name: el.type_name.to_string(),
                key: el.key.clone(),
                props: strip_handlers(&el.props),
                listeners: crate::props::listener_names(&el.props),
                children,
                assigned: None,
            })
        }
        _ => None,
    }
}

/// One record of a diff plan. The vocabulary mirrors the effect list, with
/// placeholders where the serial path would allocate ids, plus `Replace`
/// for whole-subtree swaps the applier expands against its own registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanOp {
    Create {
        id: PlanId,
        type_name: String,
        props: Props,
        listeners: Vec<String>,
    },
    Update {
        id: ViewId,
        changed: Props,
    },
    SetChildren {
        parent: PlanId,
        children: Vec<PlanId>,
    },
    Attach {
        id: PlanId,
        parent: PlanId,
        index: usize,
    },
    Detach {
        id: ViewId,
    },
    Delete {
        id: ViewId,
    },
    AddListeners {
        id: ViewId,
        names: Vec<String>,
    },
    RemoveListeners {
        id: ViewId,
        names: Vec<String>,
    },
    Replace {
        old: ViewId,
        new_subtree: SerializedNode,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffPlan {
    pub ops: Vec<PlanOp>,
    pub placeholders: u32,
}

/// A worker's answer: the plan, and the new subtree annotated with the
/// ids (surviving or placeholder) each node ends up under. The applier
/// rebuilds its registry from the annotation and emits effects from the
/// plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffOutcome {
    pub plan: DiffPlan,
    pub result: SerializedNode,
}

/// Compute the diff plan for a serialized pair. Pure: this is the function
/// worker threads run, and the one the fallback-correctness tests compare
/// against the serial reconciler.
pub fn compute_diff_plan(
    old: &SerializedNode,
    new: &SerializedNode,
    lookahead: usize,
) -> DiffOutcome {
    let mut planner = Planner {
        ops: Vec::new(),
        placeholders: 0,
        lookahead,
    };
    let result = planner.diff_pair(old, new);
    DiffOutcome {
        plan: DiffPlan {
            ops: planner.ops,
            placeholders: planner.placeholders,
        },
        result,
    }
}

struct Planner {
    ops: Vec<PlanOp>,
    placeholders: u32,
    lookahead: usize,
}

fn compatible(old: &SerializedNode, new: &SerializedNode) -> bool {
    if old.type_name != new.type_name {
        return false;
    }
    match (&old.key, &new.key) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

fn has_duplicate_keys(children: &[SerializedNode]) -> bool {
    let mut seen: FxHashMap<&str, ()> = FxHashMap::default();
    for child in children {
        if let Some(key) = child.key.as_deref() {
            if seen.insert(key, ()).is_some() {
                return true;
            }
        }
    }
    false
}

impl Planner {
    fn diff_pair(&mut self, old: &SerializedNode, new: &SerializedNode) -> SerializedNode {
        let key_mismatch =
            matches!((&old.key, &new.key), (Some(a), Some(b)) if a != b);
        if key_mismatch || old.type_name != new.type_name {
            return self.replace(old, new);
        }

        let Some(PlanId::Real(view)) = old.assigned else {
            // Committed snapshots always carry real ids; an unannotated
            // node means the input was already fresh, so just create it.
            let annotated = self.annotate_fresh(new);
            self.push_creates(&annotated);
            return annotated;
        };

        let changed = diff_props(&old.props, &new.props);
        if !changed.is_empty() {
            self.ops.push(PlanOp::Update { id: view, changed });
        }

        let added: Vec<String> = new
            .listeners
            .iter()
            .filter(|name| !old.listeners.iter().any(|o| o == *name))
            .cloned()
            .collect();
        let removed: Vec<String> = old
            .listeners
            .iter()
            .filter(|name| !new.listeners.iter().any(|n| n == *name))
            .cloned()
            .collect();
        if !added.is_empty() {
            self.ops.push(PlanOp::AddListeners { id: view, names: added });
        }
        if !removed.is_empty() {
            self.ops.push(PlanOp::RemoveListeners { id: view, names: removed });
        }

        let children = self.diff_children(view, &old.children, &new.children);

        SerializedNode {
            type_name: new.type_name.clone(),
            key: new.key.clone(),
            props: new.props.clone(),
            listeners: new.listeners.clone(),
            children,
            assigned: Some(PlanId::Real(view)),
        }
    }

    fn replace(&mut self, old: &SerializedNode, new: &SerializedNode) -> SerializedNode {
        let annotated = self.annotate_fresh(new);
        if let Some(PlanId::Real(view)) = old.assigned {
            self.ops.push(PlanOp::Replace {
                old: view,
                new_subtree: annotated.clone(),
            });
        } else {
            self.push_creates(&annotated);
        }
        annotated
    }

    fn diff_children(
        &mut self,
        parent: ViewId,
        old: &[SerializedNode],
        new: &[SerializedNode],
    ) -> Vec<SerializedNode> {
        let delta = old.len().abs_diff(new.len());
        if delta > 3 && delta * 2 > old.len() {
            // Structural shock: swap the child set wholesale.
            for child in old {
                self.push_deletes(child);
            }
            let annotated: Vec<SerializedNode> = new
                .iter()
                .map(|child| {
                    let fresh = self.annotate_fresh(child);
                    self.push_creates(&fresh);
                    fresh
                })
                .collect();
            let ids: Vec<PlanId> = annotated.iter().filter_map(|c| c.assigned).collect();
            self.ops.push(PlanOp::SetChildren {
                parent: PlanId::Real(parent),
                children: ids,
            });
            return annotated;
        }

        let any_keyed = old.iter().chain(new.iter()).any(|c| c.key.is_some());
        let keyed_usable =
            any_keyed && !has_duplicate_keys(old) && !has_duplicate_keys(new);

        let annotated = if keyed_usable {
            self.diff_children_keyed(old, new)
        } else {
            self.diff_children_positional(old, new)
        };

        let old_ids: Vec<PlanId> = old.iter().filter_map(|c| c.assigned).collect();
        let new_ids: Vec<PlanId> = annotated.iter().filter_map(|c| c.assigned).collect();
        if old_ids != new_ids {
            self.ops.push(PlanOp::SetChildren {
                parent: PlanId::Real(parent),
                children: new_ids,
            });
        }
        annotated
    }

    fn diff_children_keyed(
        &mut self,
        old: &[SerializedNode],
        new: &[SerializedNode],
    ) -> Vec<SerializedNode> {
        let mut old_by_key: FxHashMap<&str, usize> = FxHashMap::default();
        for (index, child) in old.iter().enumerate() {
            if let Some(key) = child.key.as_deref() {
                old_by_key.insert(key, index);
            }
        }

        let mut matched = vec![false; old.len()];
        for child in new {
            if let Some(&index) = child.key.as_deref().and_then(|k| old_by_key.get(k)) {
                matched[index] = true;
            }
        }

        // Deletes before creates, so a replaced slot never holds two views.
        for (index, child) in old.iter().enumerate() {
            if !matched[index] {
                self.push_deletes(child);
            }
        }

        new.iter()
            .map(|child| {
                match child.key.as_deref().and_then(|k| old_by_key.get(k)) {
                    Some(&index) => self.diff_pair(&old[index], child),
                    None => {
                        let fresh = self.annotate_fresh(child);
                        self.push_creates(&fresh);
                        fresh
                    }
                }
            })
            .collect()
    }

    fn diff_children_positional(
        &mut self,
        old: &[SerializedNode],
        new: &[SerializedNode],
    ) -> Vec<SerializedNode> {
        let mut out = Vec::with_capacity(new.len());
        let mut i = 0;
        let mut j = 0;
        loop {
            match (i < old.len(), j < new.len()) {
                (false, false) => break,
                (true, false) => {
                    self.push_deletes(&old[i]);
                    i += 1;
                }
                (false, true) => {
                    let fresh = self.annotate_fresh(&new[j]);
                    self.push_creates(&fresh);
                    out.push(fresh);
                    j += 1;
                }
                (true, true) => {
                    if compatible(&old[i], &new[j]) {
                        out.push(self.diff_pair(&old[i], &new[j]));
                        i += 1;
                        j += 1;
                    } else if let Some(k) = (1..=self.lookahead)
                        .find(|&k| j + k < new.len() && compatible(&old[i], &new[j + k]))
                    {
                        // Insertion: the old child reappears k slots ahead.
                        for step in 0..k {
                            let fresh = self.annotate_fresh(&new[j + step]);
                            self.push_creates(&fresh);
                            out.push(fresh);
                        }
                        j += k;
                    } else if let Some(k) = (1..=self.lookahead)
                        .find(|&k| i + k < old.len() && compatible(&old[i + k], &new[j]))
                    {
                        // Removal: the new child matches k slots down the old side.
                        for step in 0..k {
                            self.push_deletes(&old[i + step]);
                        }
                        i += k;
                    } else {
                        out.push(self.diff_pair(&old[i], &new[j]));
                        i += 1;
                        j += 1;
                    }
                }
            }
        }
        out
    }

    fn annotate_fresh(&mut self, node: &SerializedNode) -> SerializedNode {
        // Parent before children, matching serial allocation order.
        let id = PlanId::Placeholder(self.placeholders);
        self.placeholders += 1;
        let children = node
            .children
            .iter()
            .map(|child| self.annotate_fresh(child))
            .collect();
        SerializedNode {
            type_name: node.type_name.clone(),
            key: node.key.clone(),
            props: node.props.clone(),
            listeners: node.listeners.clone(),
            children,
            assigned: Some(id),
        }
    }

    fn push_creates(&mut self, node: &SerializedNode) {
        let Some(id) = node.assigned else { return };
        self.ops.push(PlanOp::Create {
            id,
            type_name: node.type_name.clone(),
            props: node.props.clone(),
            listeners: node.listeners.clone(),
        });
        for child in &node.children {
            self.push_creates(child);
        }
        if !node.children.is_empty() {
            let children: Vec<PlanId> = node.children.iter().filter_map(|c| c.assigned).collect();
            self.ops.push(PlanOp::SetChildren { parent: id, children });
        }
    }

    fn push_deletes(&mut self, node: &SerializedNode) {
        for child in &node.children {
            self.push_deletes(child);
        }
        if let Some(PlanId::Real(view)) = node.assigned {
            self.ops.push(PlanOp::Delete { id: view });
        }
    }
}

/// A diff job handed to the pool. `epoch` tags the engine generation the
/// snapshot was taken under; replies from an older epoch are discarded
/// (hot-reload quiescence).
#[derive(Debug, Clone)]
pub struct DiffJob {
    pub old: SerializedNode,
    pub new: SerializedNode,
    pub lookahead: usize,
    pub epoch: u64,
}

#[derive(Debug)]
pub struct DiffReply {
    pub outcome: DiffOutcome,
    pub epoch: u64,
}

/// What actually crosses the thread boundary: the snapshots and the plan
/// travel as serialized bytes, so handler sentinels (and anything else
/// main-context-only) cannot leak into a worker by construction.
struct PoolJob {
    old: Vec<u8>,
    new: Vec<u8>,
    lookahead: usize,
    epoch: u64,
    reply: Sender<WireReply>,
}

struct WireReply {
    outcome: Vec<u8>,
    epoch: u64,
}

/// In-flight diff computation. Dropping it abandons the reply; the worker's
/// send simply fails.
#[derive(Debug)]
pub struct PendingDiff {
    reply: Receiver<WireReply>,
}

impl PendingDiff {
    /// Block the main context for the worker's plan, up to the soft
    /// timeout. Expiry leaves the worker running to completion on a reply
    /// channel nobody reads.
    pub fn wait(self, timeout: Duration) -> Result<DiffReply, WorkerError> {
        let wire = self.reply.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => WorkerError::Timeout(timeout),
            RecvTimeoutError::Disconnected => WorkerError::Disconnected,
        })?;
        let outcome: DiffOutcome = serde_json::from_slice(&wire.outcome)
            .map_err(|err| WorkerError::Codec(err.to_string()))?;
        Ok(DiffReply {
            outcome,
            epoch: wire.epoch,
        })
    }
}

/// Bounded pool of reusable diff workers.
///
/// Workers only ever see serialized snapshots and return plain-data plans;
/// the node registries never leave the main context.
pub struct WorkerPool {
    submit: Option<Sender<PoolJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (submit, intake) = mpsc::channel::<PoolJob>();
        let intake = Arc::new(Mutex::new(intake));
        let workers = (0..size)
            .map(|index| {
                let intake = Arc::clone(&intake);
                thread::Builder::new()
                    .name(format!("canopy-diff-{index}"))
                    .spawn(move || worker_loop(&intake))
                    .expect("spawn diff worker thread")
            })
            .collect();
        Self {
            submit: Some(submit),
            workers,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Serialize the pair and queue it on the pool without blocking.
    pub fn submit(&self, job: DiffJob) -> Result<PendingDiff, WorkerError> {
        let Some(submit) = &self.submit else {
            return Err(WorkerError::PoolShutDown);
        };
        let old = serde_json::to_vec(&job.old)
            .map_err(|err| WorkerError::Codec(err.to_string()))?;
        let new = serde_json::to_vec(&job.new)
            .map_err(|err| WorkerError::Codec(err.to_string()))?;
        let (reply_tx, reply_rx) = mpsc::channel();
        submit
            .send(PoolJob {
                old,
                new,
                lookahead: job.lookahead,
                epoch: job.epoch,
                reply: reply_tx,
            })
            .map_err(|_| WorkerError::PoolShutDown)?;
        Ok(PendingDiff { reply: reply_rx })
    }

    pub fn shutdown(&mut self) {
        self.submit = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(intake: &Mutex<Receiver<PoolJob>>) {
    loop {
        let polled = {
            let Ok(guard) = intake.lock() else { break };
            guard.recv()
        };
        let Ok(job) = polled else { break };
        let (Ok(old), Ok(new)) = (
            serde_json::from_slice::<SerializedNode>(&job.old),
            serde_json::from_slice::<SerializedNode>(&job.new),
        ) else {
            // A reply that never comes surfaces as a timeout on the main
            // context, which falls back to the serial walk.
            tracing::warn!("diff worker received an undecodable snapshot");
            continue;
        };
        let outcome = compute_diff_plan(&old, &new, job.lookahead);
        let Ok(encoded) = serde_json::to_vec(&outcome) else {
            tracing::warn!("diff worker failed to encode its plan");
            continue;
        };
        let _ = job.reply.send(WireReply {
            outcome: encoded,
            epoch: job.epoch,
        });
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
