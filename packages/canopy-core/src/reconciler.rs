use crate::component::ComponentHandle;
use crate::effects::{Effect, EffectList};
use crate::engine::{EngineConfig, Profiling};
use crate::error::AuthorError;
use crate::node::{
    ElementNode, FragmentNode, MountedNode, NodeArena, NodeId, Slot, StatefulNode, StatelessNode,
    TypeName, VElement, VFragment, VNode, VStateful, VStateless, ViewId,
};
use crate::props::{PropValue, diff_props, listener_names, props_hash, strip_handlers};
use crate::registry::{PositionKey, Registries, RetainedInstance, ViewIdAllocator};
use crate::similarity::{SimilarityCache, shape_hash, structural_similarity};
use crate::worker::{
    DiffJob, DiffOutcome, PlanId, PlanOp, SerializedNode, WorkerPool, serialize_description,
    serialize_mounted,
};
use canopy_scheduler::{ComponentId, Priority};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::rc::Rc;

/// Render-chain depth guard; a component rendering itself forever is an
/// author error, not an engine hang.
const MAX_RENDER_DEPTH: usize = 64;

/// A freshly created stateful instance awaiting its `mounted` hook, which
/// the engine runs after the commit succeeds.
pub struct NewMount {
    pub identity: ComponentId,
    pub handle: ComponentHandle,
    pub priority: Priority,
}

/// What a reconciliation pass leaves behind for the engine: the arena keys
/// it inserted (removed again if the commit fails) and the mount hooks to
/// run if it succeeds.
pub struct ReconcileArtifacts {
    pub built: Vec<NodeId>,
    pub mounts: Vec<NewMount>,
}

/// One reconciliation pass over a boundary (the root, or one component's
/// rendered subtree).
///
/// The pass reads the committed tree and builds a parallel work-in-progress
/// subtree in the same arena, recording effects as it walks. Committed
/// nodes are never mutated; the engine splices the result in at commit.
pub struct Reconciler<'a> {
    pub arena: &'a mut NodeArena,
    pub effects: &'a mut EffectList,
    pub staged: &'a mut Registries,
    pub ids: &'a mut ViewIdAllocator,
    pub config: &'a EngineConfig,
    pub pool: Option<&'a WorkerPool>,
    pub similarity: &'a mut SimilarityCache,
    pub epoch: u64,
    pub next_component: &'a mut u64,
    pub profiling: &'a mut Profiling,
    claimed: FxHashSet<ComponentId>,
    built: Vec<NodeId>,
    mounts: Vec<NewMount>,
}

enum OldSummary {
    Element { type_name: TypeName, key: Option<String> },
    Stateful { type_name: TypeName, key: Option<String> },
    Stateless { type_name: TypeName, key: Option<String> },
    Fragment { key: Option<String> },
    Empty,
}

impl OldSummary {
    fn key(&self) -> Option<&str> {
        match self {
            OldSummary::Element { key, .. }
            | OldSummary::Stateful { key, .. }
            | OldSummary::Stateless { key, .. }
            | OldSummary::Fragment { key } => key.as_deref(),
            OldSummary::Empty => None,
        }
    }
}

struct PendingComponent {
    type_name: TypeName,
    props: crate::props::Props,
    key: Option<String>,
    kind: PendingKind,
}

enum PendingKind {
    Stateful {
        identity: ComponentId,
        handle: ComponentHandle,
        fresh: bool,
    },
    Stateless {
        render: crate::component::RenderFn,
    },
}

impl<'a> Reconciler<'a> {
    pub fn new(
        arena: &'a mut NodeArena,
        effects: &'a mut EffectList,
        staged: &'a mut Registries,
        ids: &'a mut ViewIdAllocator,
        config: &'a EngineConfig,
        pool: Option<&'a WorkerPool>,
        similarity: &'a mut SimilarityCache,
        epoch: u64,
        next_component: &'a mut u64,
        profiling: &'a mut Profiling,
    ) -> Self {
        Self {
            arena,
            effects,
            staged,
            ids,
            config,
            pool,
            similarity,
            epoch,
            next_component,
            profiling,
            claimed: FxHashSet::default(),
            built: Vec::new(),
            mounts: Vec::new(),
        }
    }

    pub fn finish(self) -> ReconcileArtifacts {
        ReconcileArtifacts {
            built: self.built,
            mounts: self.mounts,
        }
    }

    /// Entry point for a root or component-update reconciliation. Large
    /// serializable pairs go through the similarity gate and the worker
    /// pool; everything else (and every worker failure) takes the serial
    /// walk.
    pub fn reconcile_boundary(&mut self, old: Option<NodeId>, new: &VNode, slot: Slot) -> NodeId {
        if let Some(old_id) = old {
            if self.pool.is_some() {
                let combined = self.arena.subtree_count(old_id) + new.node_count();
                if combined >= self.config.isolate_threshold {
                    if let Some(done) = self.try_offthread(old_id, new, slot, combined) {
                        return done;
                    }
                }
            }
        }
        self.reconcile(old, new, slot)
    }

    fn try_offthread(
        &mut self,
        old_id: NodeId,
        new: &VNode,
        slot: Slot,
        combined: usize,
    ) -> Option<NodeId> {
        let old_snapshot = serialize_mounted(self.arena, old_id)?;
        let new_snapshot = serialize_description(new)?;

        if combined >= self.config.direct_replace_threshold {
            let cache_key = (shape_hash(&old_snapshot), shape_hash(&new_snapshot));
            let score = match self.similarity.get(cache_key) {
                Some(score) => score,
                None => {
                    let score = structural_similarity(&old_snapshot, &new_snapshot);
                    self.similarity.insert(cache_key, score);
                    score
                }
            };
            if score < self.config.similarity_cutoff {
                tracing::info!(
                    similarity = score,
                    nodes = combined,
                    "dissimilar subtrees, taking the direct-replace path"
                );
                return Some(self.replace(old_id, new, slot));
            }
        }

        let pool = self.pool?;
        let pending = match pool.submit(DiffJob {
            old: old_snapshot,
            new: new_snapshot,
            lookahead: self.config.lookahead_window,
            epoch: self.epoch,
        }) {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!(error = %err, "worker dispatch failed, falling back to serial");
                return None;
            }
        };
        match pending.wait(self.config.worker_timeout) {
            Ok(reply) if reply.epoch == self.epoch => {
                let VNode::Element(el) = new else { return None };
                Some(self.apply_outcome(el, reply.outcome))
            }
            Ok(_) => {
                tracing::debug!("discarding diff plan from a previous epoch");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "worker diff failed, falling back to serial");
                None
            }
        }
    }

    /// The §-by-§ matching walk: empties, key mismatch, element pairs,
    /// same-type component pairs, cross-type component pairs, replacement.
    pub fn reconcile(&mut self, old: Option<NodeId>, new: &VNode, slot: Slot) -> NodeId {
        let Some(old_id) = old else {
            return self.mount(new, slot);
        };
        if !self.arena.contains(old_id) {
            tracing::warn!("reconcile target vanished from the arena, mounting fresh");
            return self.mount(new, slot);
        }
        self.profiling.diffs += 1;
        let summary = self.summarize(old_id);

        match (&summary, new) {
            (OldSummary::Empty, VNode::Empty) => {
                return self.insert_built(MountedNode::Empty { parent: None });
            }
            (OldSummary::Empty, _) => return self.mount(new, slot),
            (_, VNode::Empty) => {
                self.unmount(old_id);
                return self.insert_built(MountedNode::Empty { parent: None });
            }
            _ => {}
        }

        if let (Some(old_key), Some(new_key)) = (summary.key(), new.key()) {
            if old_key != new_key {
                return self.replace(old_id, new, slot);
            }
        }

        match (summary, new) {
            (OldSummary::Element { type_name, .. }, VNode::Element(el))
                if type_name == el.type_name =>
            {
                self.reconcile_element(old_id, el)
            }
            (OldSummary::Stateful { type_name, .. }, VNode::Stateful(desc))
                if type_name == desc.type_name =>
            {
                self.reconcile_stateful(old_id, desc, slot)
            }
            (OldSummary::Stateless { type_name, .. }, VNode::Stateless(desc))
                if type_name == desc.type_name =>
            {
                self.reconcile_stateless(old_id, desc, slot)
            }
            (OldSummary::Fragment { .. }, VNode::Fragment(frag)) => {
                self.reconcile_fragment(old_id, frag, slot)
            }
            (
                OldSummary::Stateful { .. } | OldSummary::Stateless { .. },
                VNode::Stateful(_) | VNode::Stateless(_),
            ) => self.reconcile_component_swap(old_id, new, slot),
            _ => self.replace(old_id, new, slot),
        }
    }

    fn summarize(&self, id: NodeId) -> OldSummary {
        match self.arena.get(id) {
            Some(MountedNode::Element(el)) => OldSummary::Element {
                type_name: el.type_name.clone(),
                key: el.key.clone(),
            },
            Some(MountedNode::Stateful(c)) => OldSummary::Stateful {
                type_name: c.type_name.clone(),
                key: c.key.clone(),
            },
            Some(MountedNode::Stateless(c)) => OldSummary::Stateless {
                type_name: c.type_name.clone(),
                key: c.key.clone(),
            },
            Some(MountedNode::Fragment(f)) => OldSummary::Fragment { key: f.key.clone() },
            Some(MountedNode::Empty { .. }) | None => OldSummary::Empty,
        }
    }

    fn insert_built(&mut self, node: MountedNode) -> NodeId {
        let id = self.arena.insert(node);
        self.built.push(id);
        id
    }

    fn alloc_component_id(&mut self) -> ComponentId {
        let id = ComponentId(*self.next_component);
        *self.next_component += 1;
        id
    }

    // ----- mounting -----

    pub fn mount(&mut self, new: &VNode, slot: Slot) -> NodeId {
        match new {
            VNode::Element(el) => self.mount_element(el),
            VNode::Fragment(frag) => {
                let mut children: SmallVec<[NodeId; 4]> = SmallVec::new();
                for (index, child) in frag.children.iter().enumerate() {
                    children.push(self.mount(child, Slot::new(slot.parent_view, index)));
                }
                let id = self.insert_built(MountedNode::Fragment(FragmentNode {
                    key: frag.key.clone(),
                    children: children.clone(),
                    parent: None,
                }));
                for &child in &children {
                    self.arena.set_parent(child, Some(id));
                }
                id
            }
            VNode::Empty => self.insert_built(MountedNode::Empty { parent: None }),
            VNode::Stateful(_) | VNode::Stateless(_) => {
                let (chain, tail) = self.resolve_component_chain(new, slot);
                self.mount_with_chain(chain, &tail, slot)
            }
        }
    }

    fn mount_element(&mut self, el: &VElement) -> NodeId {
        let view = self.ids.allocate();
        self.effects.push(Effect::CreateView {
            id: view,
            type_name: el.type_name.to_string(),
            props: strip_handlers(&el.props),
        });

        let names = listener_names(&el.props);
        if !names.is_empty() {
            for name in &names {
                if let Some(PropValue::Handler(handler)) = el.props.get(name) {
                    self.staged.listeners.set(view, name.clone(), handler.clone());
                }
            }
            self.effects.push(Effect::AddEventListeners {
                id: view,
                names: names.clone(),
            });
        }

        let mut children: SmallVec<[NodeId; 4]> = SmallVec::new();
        for (index, child) in el.children.iter().enumerate() {
            children.push(self.mount(child, Slot::new(view, index)));
        }

        let mut flat = Vec::new();
        for &child in &children {
            self.arena.flatten_views(child, &mut flat);
        }
        if !flat.is_empty() {
            self.effects.push(Effect::SetChildren {
                parent: view,
                children: flat,
            });
        }

        let id = self.insert_built(MountedNode::Element(ElementNode {
            type_name: el.type_name.clone(),
            props: el.props.clone(),
            key: el.key.clone(),
            view_id: view,
            children: children.clone(),
            parent: None,
            listeners: names,
        }));
        for &child in &children {
            self.arena.set_parent(child, Some(id));
        }
        if self.staged.views.insert(view, id).is_some() {
            debug_assert!(false, "view {view} mounted twice");
            tracing::warn!(%view, "view registered twice, keeping the newer node");
        }
        id
    }

    /// Walk a component description down to its first non-component node,
    /// instantiating (or re-adopting from the retention registry) and
    /// rendering each wrapper along the way.
    fn resolve_component_chain(
        &mut self,
        desc: &VNode,
        slot: Slot,
    ) -> (Vec<PendingComponent>, VNode) {
        let mut chain = Vec::new();
        let mut current = desc.clone();
        loop {
            if chain.len() >= MAX_RENDER_DEPTH {
                let err = AuthorError::RenderRecursion(MAX_RENDER_DEPTH);
                tracing::warn!(error = %err, "author error");
                return (chain, VNode::Empty);
            }
            match current {
                VNode::Stateful(comp) => {
                    let hash = props_hash(&comp.props);
                    let position = PositionKey {
                        parent_view: slot.parent_view,
                        index: slot.index,
                        type_name: comp.type_name.clone(),
                    };
                    let retained = self
                        .staged
                        .instances
                        .lookup(&position, hash, self.config.lookahead_window)
                        .filter(|r| !self.claimed.contains(&r.identity));
                    let (identity, handle, fresh) = match retained {
                        Some(r) => {
                            tracing::trace!(
                                component = %comp.type_name,
                                index = position.index,
                                "re-adopting retained instance"
                            );
                            (r.identity, r.handle, false)
                        }
                        None => {
                            let identity = self.alloc_component_id();
                            let handle: ComponentHandle =
                                Rc::new(RefCell::new((comp.factory)()));
                            (identity, handle, true)
                        }
                    };
                    self.claimed.insert(identity);
                    self.profiling.renders += 1;
                    let rendered = handle.borrow_mut().render(&comp.props);
                    chain.push(PendingComponent {
                        type_name: comp.type_name,
                        props: comp.props,
                        key: comp.key,
                        kind: PendingKind::Stateful {
                            identity,
                            handle,
                            fresh,
                        },
                    });
                    current = rendered;
                }
                VNode::Stateless(comp) => {
                    self.profiling.renders += 1;
                    let rendered = (comp.render)(&comp.props);
                    chain.push(PendingComponent {
                        type_name: comp.type_name,
                        props: comp.props,
                        key: comp.key,
                        kind: PendingKind::Stateless {
                            render: comp.render,
                        },
                    });
                    current = rendered;
                }
                other => return (chain, other),
            }
        }
    }

    fn mount_with_chain(
        &mut self,
        chain: Vec<PendingComponent>,
        tail: &VNode,
        slot: Slot,
    ) -> NodeId {
        let inner = self.mount(tail, slot);
        self.wrap_chain(chain, inner, slot)
    }

    /// Fold the pending wrappers around a mounted node, innermost first,
    /// recording retention entries and queueing mount hooks for fresh
    /// instances.
    fn wrap_chain(
        &mut self,
        chain: Vec<PendingComponent>,
        inner: NodeId,
        slot: Slot,
    ) -> NodeId {
        let mut current = inner;
        for pending in chain.into_iter().rev() {
            let content = self.arena.flattened(current).first().copied();
            let hash = props_hash(&pending.props);
            let id = match pending.kind {
                PendingKind::Stateful {
                    identity,
                    handle,
                    fresh,
                } => {
                    let priority = if fresh {
                        Some(handle.borrow().priority().unwrap_or_else(|| {
                            Priority::for_component_type(&pending.type_name)
                        }))
                    } else {
                        None
                    };
                    let id = self.insert_built(MountedNode::Stateful(StatefulNode {
                        type_name: pending.type_name.clone(),
                        props: pending.props.clone(),
                        key: pending.key.clone(),
                        identity,
                        instance: handle.clone(),
                        rendered: current,
                        content_view_id: content,
                        parent: None,
                        position: slot,
                    }));
                    self.staged.components.insert(identity, id);
                    self.staged.instances.record(
                        PositionKey {
                            parent_view: slot.parent_view,
                            index: slot.index,
                            type_name: pending.type_name,
                        },
                        hash,
                        RetainedInstance {
                            identity,
                            handle: handle.clone(),
                        },
                    );
                    if let Some(priority) = priority {
                        self.mounts.push(NewMount {
                            identity,
                            handle,
                            priority,
                        });
                    }
                    id
                }
                PendingKind::Stateless { render } => {
                    self.insert_built(MountedNode::Stateless(StatelessNode {
                        type_name: pending.type_name,
                        props: pending.props,
                        key: pending.key,
                        render,
                        rendered: current,
                        content_view_id: content,
                        parent: None,
                        position: slot,
                    }))
                }
            };
            self.arena.set_parent(current, Some(id));
            current = id;
        }
        current
    }

    // ----- unmounting and replacement -----

    /// Depth-first unmount: children's views die before their parent's,
    /// listener registrations and registries are purged, instance hooks
    /// fire for instances that were not re-adopted in this pass.
    pub fn unmount(&mut self, id: NodeId) {
        enum Doomed {
            Element {
                view: ViewId,
                children: SmallVec<[NodeId; 4]>,
            },
            Wrapper {
                rendered: NodeId,
                stateful: Option<(ComponentId, ComponentHandle)>,
            },
            Fragment {
                children: SmallVec<[NodeId; 4]>,
            },
            Inert,
        }

        let doomed = match self.arena.get(id) {
            Some(MountedNode::Element(el)) => Doomed::Element {
                view: el.view_id,
                children: el.children.clone(),
            },
            Some(MountedNode::Stateful(c)) => Doomed::Wrapper {
                rendered: c.rendered,
                stateful: Some((c.identity, c.instance.clone())),
            },
            Some(MountedNode::Stateless(c)) => Doomed::Wrapper {
                rendered: c.rendered,
                stateful: None,
            },
            Some(MountedNode::Fragment(f)) => Doomed::Fragment {
                children: f.children.clone(),
            },
            Some(MountedNode::Empty { .. }) | None => Doomed::Inert,
        };

        match doomed {
            Doomed::Element { view, children } => {
                for &child in &children {
                    self.unmount(child);
                }
                self.staged.listeners.remove_view(view);
                self.staged.views.remove(view);
                self.effects.push(Effect::DeleteView { id: view });
            }
            Doomed::Wrapper { rendered, stateful } => {
                self.unmount(rendered);
                if let Some((identity, handle)) = stateful {
                    if !self.claimed.contains(&identity) {
                        handle.borrow_mut().unmounted();
                        self.staged.instances.evict(identity);
                    }
                    self.staged.components.remove(&identity);
                }
            }
            Doomed::Fragment { children } => {
                for &child in &children {
                    self.unmount(child);
                }
            }
            Doomed::Inert => {}
        }
    }

    fn replace(&mut self, old_id: NodeId, new: &VNode, slot: Slot) -> NodeId {
        tracing::debug!(new = %new.kind_name(), "replacing subtree");
        self.unmount(old_id);
        self.mount(new, slot)
    }

    // ----- element reconciliation -----

    fn reconcile_element(&mut self, old_id: NodeId, el: &VElement) -> NodeId {
        let (view, old_props, old_children, old_listeners) = match self.arena.get(old_id) {
            Some(MountedNode::Element(node)) => (
                node.view_id,
                node.props.clone(),
                node.children.clone(),
                node.listeners.clone(),
            ),
            _ => return self.mount_element(el),
        };

        let changed = diff_props(&old_props, &el.props);
        if !changed.is_empty() {
            self.effects.push(Effect::UpdateView { id: view, changed });
        }

        let names = listener_names(&el.props);
        let added: Vec<String> = names
            .iter()
            .filter(|name| !old_listeners.iter().any(|old| old == *name))
            .cloned()
            .collect();
        let removed: Vec<String> = old_listeners
            .iter()
            .filter(|name| !names.iter().any(|new| new == *name))
            .cloned()
            .collect();
        if !added.is_empty() {
            self.effects.push(Effect::AddEventListeners {
                id: view,
                names: added,
            });
        }
        if !removed.is_empty() {
            for name in &removed {
                self.staged.listeners.remove(view, name);
            }
            self.effects.push(Effect::RemoveEventListeners {
                id: view,
                names: removed,
            });
        }
        // Retarget handlers for all current names; identity changes stay
        // engine-side.
        for name in &names {
            if let Some(PropValue::Handler(handler)) = el.props.get(name) {
                self.staged.listeners.set(view, name.clone(), handler.clone());
            }
        }

        let mut old_flat = Vec::new();
        for &child in &old_children {
            self.arena.flatten_views(child, &mut old_flat);
        }

        let children = self.reconcile_children(view, &old_children, &el.children);

        let mut new_flat = Vec::new();
        for &child in &children {
            self.arena.flatten_views(child, &mut new_flat);
        }
        if old_flat != new_flat {
            self.effects.push(Effect::SetChildren {
                parent: view,
                children: new_flat,
            });
        }

        let id = self.insert_built(MountedNode::Element(ElementNode {
            type_name: el.type_name.clone(),
            props: el.props.clone(),
            key: el.key.clone(),
            view_id: view,
            children: children.clone(),
            parent: None,
            listeners: names,
        }));
        for &child in &children {
            self.arena.set_parent(child, Some(id));
        }
        self.staged.views.insert(view, id);
        id
    }

    // ----- children reconciliation -----

    fn reconcile_children(
        &mut self,
        parent_view: ViewId,
        old_children: &[NodeId],
        new_children: &[VNode],
    ) -> SmallVec<[NodeId; 4]> {
        let delta = old_children.len().abs_diff(new_children.len());
        if delta > 3 && delta * 2 > old_children.len() {
            tracing::debug!(
                parent = %parent_view,
                old = old_children.len(),
                new = new_children.len(),
                "structural shock, replacing the child set"
            );
            for &child in old_children {
                self.unmount(child);
            }
            let mut out: SmallVec<[NodeId; 4]> = SmallVec::new();
            for (index, child) in new_children.iter().enumerate() {
                out.push(self.mount(child, Slot::new(parent_view, index)));
            }
            return out;
        }

        let any_keyed = old_children
            .iter()
            .any(|&c| self.arena.get(c).and_then(|n| n.key()).is_some())
            || new_children.iter().any(|c| c.key().is_some());
        if any_keyed {
            match self.find_duplicate_key(parent_view, old_children, new_children) {
                Some(err) => tracing::warn!(error = %err, "author error"),
                None => {
                    return self.reconcile_children_keyed(
                        parent_view,
                        old_children,
                        new_children,
                    );
                }
            }
        }
        self.reconcile_children_positional(parent_view, old_children, new_children)
    }

    fn find_duplicate_key(
        &self,
        parent_view: ViewId,
        old_children: &[NodeId],
        new_children: &[VNode],
    ) -> Option<AuthorError> {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        for &child in old_children {
            if let Some(key) = self.arena.get(child).and_then(|n| n.key()) {
                if !seen.insert(key) {
                    return Some(AuthorError::DuplicateKey {
                        parent: parent_view,
                        key: key.to_owned(),
                    });
                }
            }
        }
        let mut seen_new: FxHashSet<&str> = FxHashSet::default();
        for child in new_children {
            if let Some(key) = child.key() {
                if !seen_new.insert(key) {
                    return Some(AuthorError::DuplicateKey {
                        parent: parent_view,
                        key: key.to_owned(),
                    });
                }
            }
        }
        None
    }

    fn reconcile_children_keyed(
        &mut self,
        parent_view: ViewId,
        old_children: &[NodeId],
        new_children: &[VNode],
    ) -> SmallVec<[NodeId; 4]> {
        let mut old_by_key: FxHashMap<String, NodeId> = FxHashMap::default();
        for &child in old_children {
            if let Some(key) = self.arena.get(child).and_then(|n| n.key()) {
                old_by_key.insert(key.to_owned(), child);
            }
        }

        let mut surviving: FxHashSet<NodeId> = FxHashSet::default();
        for child in new_children {
            if let Some(&old_id) = child.key().and_then(|k| old_by_key.get(k)) {
                surviving.insert(old_id);
            }
        }

        // Deletes first, so a replaced slot never briefly hosts two views.
        for &child in old_children {
            if !surviving.contains(&child) {
                self.unmount(child);
            }
        }

        let mut out: SmallVec<[NodeId; 4]> = SmallVec::new();
        for (index, child) in new_children.iter().enumerate() {
            let slot = Slot::new(parent_view, index);
            match child.key().and_then(|k| old_by_key.get(k)).copied() {
                Some(old_id) => out.push(self.reconcile(Some(old_id), child, slot)),
                None => out.push(self.mount(child, slot)),
            }
        }
        out
    }

    fn reconcile_children_positional(
        &mut self,
        parent_view: ViewId,
        old_children: &[NodeId],
        new_children: &[VNode],
    ) -> SmallVec<[NodeId; 4]> {
        let window = self.config.lookahead_window;
        let mut out: SmallVec<[NodeId; 4]> = SmallVec::new();
        let mut i = 0;
        let mut j = 0;
        loop {
            match (i < old_children.len(), j < new_children.len()) {
                (false, false) => break,
                (true, false) => {
                    self.unmount(old_children[i]);
                    i += 1;
                }
                (false, true) => {
                    out.push(self.mount(&new_children[j], Slot::new(parent_view, j)));
                    j += 1;
                }
                (true, true) => {
                    if self.compatible(old_children[i], &new_children[j]) {
                        out.push(self.reconcile(
                            Some(old_children[i]),
                            &new_children[j],
                            Slot::new(parent_view, j),
                        ));
                        i += 1;
                        j += 1;
                    } else if let Some(k) = (1..=window).find(|&k| {
                        j + k < new_children.len()
                            && self.compatible(old_children[i], &new_children[j + k])
                    }) {
                        // Insertion: old child reappears k slots ahead on
                        // the new side.
                        for step in 0..k {
                            out.push(
                                self.mount(&new_children[j + step], Slot::new(parent_view, j + step)),
                            );
                        }
                        j += k;
                    } else if let Some(k) = (1..=window).find(|&k| {
                        i + k < old_children.len()
                            && self.compatible(old_children[i + k], &new_children[j])
                    }) {
                        // Removal: new child matches k slots down the old side.
                        for step in 0..k {
                            self.unmount(old_children[i + step]);
                        }
                        i += k;
                    } else {
                        out.push(self.reconcile(
                            Some(old_children[i]),
                            &new_children[j],
                            Slot::new(parent_view, j),
                        ));
                        i += 1;
                        j += 1;
                    }
                }
            }
        }
        out
    }

    fn compatible(&self, old_id: NodeId, new: &VNode) -> bool {
        let Some(old) = self.arena.get(old_id) else {
            return false;
        };
        if let (Some(a), Some(b)) = (old.key(), new.key()) {
            if a != b {
                return false;
            }
        }
        match (old, new) {
            (MountedNode::Element(o), VNode::Element(n)) => o.type_name == n.type_name,
            (MountedNode::Stateful(o), VNode::Stateful(n)) => o.type_name == n.type_name,
            (MountedNode::Stateless(o), VNode::Stateless(n)) => o.type_name == n.type_name,
            (MountedNode::Fragment(_), VNode::Fragment(_)) => true,
            (MountedNode::Empty { .. }, VNode::Empty) => true,
            _ => false,
        }
    }

    fn reconcile_fragment(&mut self, old_id: NodeId, frag: &VFragment, slot: Slot) -> NodeId {
        let old_children = match self.arena.get(old_id) {
            Some(MountedNode::Fragment(node)) => node.children.clone(),
            _ => SmallVec::new(),
        };
        let children = self.reconcile_children(slot.parent_view, &old_children, &frag.children);
        let id = self.insert_built(MountedNode::Fragment(FragmentNode {
            key: frag.key.clone(),
            children: children.clone(),
            parent: None,
        }));
        for &child in &children {
            self.arena.set_parent(child, Some(id));
        }
        id
    }

    // ----- component reconciliation -----

    fn reconcile_stateful(&mut self, old_id: NodeId, desc: &VStateful, slot: Slot) -> NodeId {
        let (identity, handle, old_rendered) = match self.arena.get(old_id) {
            Some(MountedNode::Stateful(node)) => {
                (node.identity, node.instance.clone(), node.rendered)
            }
            _ => {
                let (chain, tail) = self.resolve_component_chain(&VNode::Stateful(desc.clone()), slot);
                return self.mount_with_chain(chain, &tail, slot);
            }
        };
        self.claimed.insert(identity);
        self.profiling.renders += 1;
        let rendered_desc = handle.borrow_mut().render(&desc.props);
        let rendered = self.reconcile(Some(old_rendered), &rendered_desc, slot);
        let content = self.arena.flattened(rendered).first().copied();
        let id = self.insert_built(MountedNode::Stateful(StatefulNode {
            type_name: desc.type_name.clone(),
            props: desc.props.clone(),
            key: desc.key.clone(),
            identity,
            instance: handle.clone(),
            rendered,
            content_view_id: content,
            parent: None,
            position: slot,
        }));
        self.arena.set_parent(rendered, Some(id));
        self.staged.components.insert(identity, id);
        self.staged.instances.record(
            PositionKey {
                parent_view: slot.parent_view,
                index: slot.index,
                type_name: desc.type_name.clone(),
            },
            props_hash(&desc.props),
            RetainedInstance { identity, handle },
        );
        id
    }

    fn reconcile_stateless(&mut self, old_id: NodeId, desc: &VStateless, slot: Slot) -> NodeId {
        let old_rendered = match self.arena.get(old_id) {
            Some(MountedNode::Stateless(node)) => node.rendered,
            _ => {
                let (chain, tail) =
                    self.resolve_component_chain(&VNode::Stateless(desc.clone()), slot);
                return self.mount_with_chain(chain, &tail, slot);
            }
        };
        self.profiling.renders += 1;
        let rendered_desc = (desc.render)(&desc.props);
        let rendered = self.reconcile(Some(old_rendered), &rendered_desc, slot);
        let content = self.arena.flattened(rendered).first().copied();
        let id = self.insert_built(MountedNode::Stateless(StatelessNode {
            type_name: desc.type_name.clone(),
            props: desc.props.clone(),
            key: desc.key.clone(),
            render: desc.render.clone(),
            rendered,
            content_view_id: content,
            parent: None,
            position: slot,
        }));
        self.arena.set_parent(rendered, Some(id));
        id
    }

    /// Cross-type component pair. When both sides resolve (recursively,
    /// through their rendered chains) to the same element type, the native
    /// view is kept and only the wrappers are swapped; otherwise this is a
    /// plain replacement.
    fn reconcile_component_swap(&mut self, old_id: NodeId, new: &VNode, slot: Slot) -> NodeId {
        let old_element = self.resolve_rendered_element(old_id);
        let (chain, tail) = self.resolve_component_chain(new, slot);

        if let (Some(old_el_id), VNode::Element(el)) = (old_element, &tail) {
            let same_type = matches!(
                self.arena.get(old_el_id),
                Some(MountedNode::Element(node)) if node.type_name == el.type_name
            );
            if same_type {
                tracing::debug!(
                    element = %el.type_name,
                    "element-level reconciliation across a component swap"
                );
                self.discard_wrappers(old_id);
                let element = self.reconcile_element(old_el_id, el);
                return self.wrap_chain(chain, element, slot);
            }
        }

        self.unmount(old_id);
        self.mount_with_chain(chain, &tail, slot)
    }

    fn resolve_rendered_element(&self, id: NodeId) -> Option<NodeId> {
        match self.arena.get(id)? {
            MountedNode::Element(_) => Some(id),
            MountedNode::Stateful(c) => self.resolve_rendered_element(c.rendered),
            MountedNode::Stateless(c) => self.resolve_rendered_element(c.rendered),
            _ => None,
        }
    }

    /// Retire the component wrappers above a surviving element: instance
    /// hooks fire and retention entries are purged, but the element and
    /// its views are left to the element-level reconciliation.
    fn discard_wrappers(&mut self, id: NodeId) {
        let (next, stateful) = match self.arena.get(id) {
            Some(MountedNode::Stateful(c)) => {
                (Some(c.rendered), Some((c.identity, c.instance.clone())))
            }
            Some(MountedNode::Stateless(c)) => (Some(c.rendered), None),
            _ => (None, None),
        };
        if let Some((identity, handle)) = stateful {
            if !self.claimed.contains(&identity) {
                handle.borrow_mut().unmounted();
                self.staged.instances.evict(identity);
            }
            self.staged.components.remove(&identity);
        }
        if let Some(next) = next {
            if matches!(
                self.arena.get(next),
                Some(MountedNode::Stateful(_) | MountedNode::Stateless(_))
            ) {
                self.discard_wrappers(next);
            }
        }
    }

    // ----- diff-plan application (worker path) -----

    /// Apply a worker's plan on the main context: allocate real ids for
    /// placeholders, emit the plan's effects in order, and rebuild the
    /// work-in-progress subtree from the description plus the annotated
    /// result so the arena ends up exactly as the serial walk would have
    /// left it.
    pub fn apply_outcome(&mut self, desc: &VElement, outcome: DiffOutcome) -> NodeId {
        let DiffOutcome { plan, result } = outcome;
        let real: Vec<ViewId> = (0..plan.placeholders).map(|_| self.ids.allocate()).collect();
        let resolve = move |id: PlanId| -> ViewId {
            match id {
                PlanId::Real(view) => view,
                PlanId::Placeholder(index) => real[index as usize],
            }
        };

        for op in &plan.ops {
            match op {
                PlanOp::Create {
                    id,
                    type_name,
                    props,
                    listeners,
                } => {
                    let view = resolve(*id);
                    self.effects.push(Effect::CreateView {
                        id: view,
                        type_name: type_name.clone(),
                        props: props.clone(),
                    });
                    if !listeners.is_empty() {
                        self.effects.push(Effect::AddEventListeners {
                            id: view,
                            names: listeners.clone(),
                        });
                    }
                }
                PlanOp::Update { id, changed } => self.effects.push(Effect::UpdateView {
                    id: *id,
                    changed: changed.clone(),
                }),
                PlanOp::SetChildren { parent, children } => {
                    self.effects.push(Effect::SetChildren {
                        parent: resolve(*parent),
                        children: children.iter().map(|&c| resolve(c)).collect(),
                    });
                }
                PlanOp::Attach { id, parent, index } => self.effects.push(Effect::AttachView {
                    id: resolve(*id),
                    parent: resolve(*parent),
                    index: *index,
                }),
                PlanOp::Detach { id } => self.effects.push(Effect::DetachView { id: *id }),
                PlanOp::Delete { id } => {
                    self.purge_view(*id);
                    self.effects.push(Effect::DeleteView { id: *id });
                }
                PlanOp::AddListeners { id, names } => {
                    self.effects.push(Effect::AddEventListeners {
                        id: *id,
                        names: names.clone(),
                    });
                }
                PlanOp::RemoveListeners { id, names } => {
                    for name in names {
                        self.staged.listeners.remove(*id, name);
                    }
                    self.effects.push(Effect::RemoveEventListeners {
                        id: *id,
                        names: names.clone(),
                    });
                }
                PlanOp::Replace { old, new_subtree } => {
                    if let Some(node) = self.staged.views.get(*old) {
                        let mut views = Vec::new();
                        self.arena.subtree_views_bottom_up(node, &mut views);
                        for view in views {
                            self.purge_view(view);
                            self.effects.push(Effect::DeleteView { id: view });
                        }
                    } else {
                        tracing::warn!(view = %old, "plan replaces an unknown view");
                    }
                    self.emit_creates_for(new_subtree, &resolve);
                }
            }
        }

        self.rebuild_from_result(desc, &result, &resolve)
    }

    fn purge_view(&mut self, view: ViewId) {
        self.staged.listeners.remove_view(view);
        self.staged.views.remove(view);
    }

    fn emit_creates_for(&mut self, node: &SerializedNode, resolve: &impl Fn(PlanId) -> ViewId) {
        let Some(plan_id) = node.assigned else { return };
        let view = resolve(plan_id);
        self.effects.push(Effect::CreateView {
            id: view,
            type_name: node.type_name.clone(),
            props: node.props.clone(),
        });
        if !node.listeners.is_empty() {
            self.effects.push(Effect::AddEventListeners {
                id: view,
                names: node.listeners.clone(),
            });
        }
        for child in &node.children {
            self.emit_creates_for(child, resolve);
        }
        if !node.children.is_empty() {
            self.effects.push(Effect::SetChildren {
                parent: view,
                children: node
                    .children
                    .iter()
                    .filter_map(|c| c.assigned)
                    .map(resolve)
                    .collect(),
            });
        }
    }

    fn rebuild_from_result(
        &mut self,
        desc: &VElement,
        result: &SerializedNode,
        resolve: &impl Fn(PlanId) -> ViewId,
    ) -> NodeId {
        let view = match result.assigned {
            Some(plan_id) => resolve(plan_id),
            None => {
                tracing::warn!("diff result missing an id annotation, allocating fresh");
                self.ids.allocate()
            }
        };

        let mut children: SmallVec<[NodeId; 4]> = SmallVec::new();
        for (child_desc, child_result) in desc.children.iter().zip(result.children.iter()) {
            let VNode::Element(child_el) = child_desc else {
                continue;
            };
            children.push(self.rebuild_from_result(child_el, child_result, resolve));
        }

        let names = listener_names(&desc.props);
        for name in &names {
            if let Some(PropValue::Handler(handler)) = desc.props.get(name) {
                self.staged.listeners.set(view, name.clone(), handler.clone());
            }
        }

        let id = self.insert_built(MountedNode::Element(ElementNode {
            type_name: desc.type_name.clone(),
            props: desc.props.clone(),
            key: desc.key.clone(),
            view_id: view,
            children: children.clone(),
            parent: None,
            listeners: names,
        }));
        for &child in &children {
            self.arena.set_parent(child, Some(id));
        }
        self.staged.views.insert(view, id);
        id
    }
}
