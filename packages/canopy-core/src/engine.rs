use crate::bridge::{RendererBridge, dispatch};
use crate::component::{ComponentCtx, Updater};
use crate::effects::{Effect, EffectList};
use crate::error::{EngineError, InvariantViolation};
use crate::node::{MountedNode, NodeArena, NodeId, ROOT_VIEW, Slot, VNode, ViewId};
use crate::props::PropValue;
use crate::reconciler::{NewMount, Reconciler};
use crate::registry::{Registries, ViewIdAllocator};
use crate::similarity::SimilarityCache;
use crate::worker::{DiffJob, WorkerPool, serialize_description, serialize_mounted};
use canopy_scheduler::{ComponentId, DrainTelemetry, PendingUpdate, Priority, UpdateQueue};
use rustc_hash::FxHashSet;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Engine tuning knobs. All thresholds are runtime-adjustable through
/// `Engine::config_mut`; the worker pool size is fixed at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Positional children reconciliation look-ahead window.
    pub lookahead_window: usize,
    /// Combined old+new node count at which a boundary may go off-thread.
    pub isolate_threshold: usize,
    /// Combined node count at which the similarity gate runs.
    pub direct_replace_threshold: usize,
    /// Pending-set size at which a drain processes in parallel.
    pub concurrent_min_batch: usize,
    pub concurrent_enabled: bool,
    /// Soft timeout for one worker diff; expiry falls back to serial.
    pub worker_timeout: Duration,
    /// Similarity below this replaces the subtree outright.
    pub similarity_cutoff: f64,
    pub similarity_cache_capacity: usize,
    pub worker_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lookahead_window: 4,
            isolate_threshold: 20,
            direct_replace_threshold: 100,
            concurrent_min_batch: 5,
            concurrent_enabled: true,
            worker_timeout: Duration::from_millis(200),
            similarity_cutoff: 0.2,
            similarity_cache_capacity: 1000,
            worker_count: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Profiling {
    pub renders: u64,
    pub diffs: u64,
    pub effects: u64,
}

/// Read-only diagnostics snapshot.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub serial_drains: u64,
    pub parallel_drains: u64,
    pub avg_serial_ms: f64,
    pub avg_parallel_ms: f64,
    pub efficiency_pct: f64,
    pub concurrent_enabled: bool,
    pub isolate_threshold: usize,
    pub direct_replace_threshold: usize,
    pub concurrent_min_batch: usize,
    pub profiling: Profiling,
}

enum Splice {
    Root,
    Rendered { component: NodeId },
}

struct Boundary {
    old: Option<NodeId>,
    wip: NodeId,
    splice: Splice,
}

/// The reconciliation engine.
///
/// Owns the renderer bridge, the node arena, all registries and the
/// scheduler queue; every renderer command is issued from the thread that
/// owns this value. Multiple engines may coexist in one process, each with
/// independent state.
pub struct Engine<B: RendererBridge> {
    bridge: B,
    arena: NodeArena,
    /// Committed tree root (the child of view 0), None before first render.
    root: Option<NodeId>,
    registries: Registries,
    ids: ViewIdAllocator,
    queue: Rc<RefCell<UpdateQueue>>,
    pool: WorkerPool,
    similarity: SimilarityCache,
    config: EngineConfig,
    telemetry: DrainTelemetry,
    profiling: Profiling,
    quiesced: bool,
    /// Bumped on hot-reload; worker replies from older epochs are dropped.
    epoch: u64,
    next_component: u64,
    failure_streak: u32,
}

impl<B: RendererBridge> Engine<B> {
    pub fn new(bridge: B) -> Self {
        Self::with_config(bridge, EngineConfig::default())
    }

    pub fn with_config(bridge: B, config: EngineConfig) -> Self {
        let pool = WorkerPool::new(config.worker_count);
        let similarity = SimilarityCache::new(config.similarity_cache_capacity);
        Self {
            bridge,
            arena: NodeArena::new(),
            root: None,
            registries: Registries::default(),
            ids: ViewIdAllocator::new(),
            queue: Rc::new(RefCell::new(UpdateQueue::new())),
            pool,
            similarity,
            config,
            telemetry: DrainTelemetry::default(),
            profiling: Profiling::default(),
            quiesced: false,
            epoch: 0,
            next_component: 0,
            failure_streak: 0,
        }
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            serial_drains: self.telemetry.serial_drains,
            parallel_drains: self.telemetry.parallel_drains,
            avg_serial_ms: self.telemetry.avg_serial_ms(),
            avg_parallel_ms: self.telemetry.avg_parallel_ms(),
            efficiency_pct: self.telemetry.efficiency_pct(),
            concurrent_enabled: self.config.concurrent_enabled,
            isolate_threshold: self.config.isolate_threshold,
            direct_replace_threshold: self.config.direct_replace_threshold,
            concurrent_min_batch: self.config.concurrent_min_batch,
            profiling: self.profiling,
        }
    }

    /// Views reachable from the committed root, for invariant checks.
    pub fn committed_view_count(&self) -> usize {
        self.registries.views.len()
    }

    // ----- rendering -----

    /// Reconcile a full tree description against the committed tree and
    /// commit the resulting batch. The first call mounts under the
    /// pre-existing root view 0.
    pub fn render(&mut self, new_root: VNode) -> Result<(), EngineError> {
        self.profiling.renders += 1;
        let old_root = self.root;
        let first_mount = old_root.is_none();

        let mut staged = self.registries.clone();
        let mut effects = EffectList::default();

        let use_pool = self.config.concurrent_enabled && !self.quiesced;
        let mut recon = Reconciler::new(
            &mut self.arena,
            &mut effects,
            &mut staged,
            &mut self.ids,
            &self.config,
            use_pool.then_some(&self.pool),
            &mut self.similarity,
            self.epoch,
            &mut self.next_component,
            &mut self.profiling,
        );
        let wip = recon.reconcile_boundary(old_root, &new_root, Slot::new(ROOT_VIEW, 0));
        let artifacts = recon.finish();

        let old_flat = old_root
            .map(|root| self.arena.flattened(root))
            .unwrap_or_default();
        let new_flat = self.arena.flattened(wip);
        if first_mount {
            if !new_flat.is_empty() {
                effects.push(Effect::SetChildren {
                    parent: ROOT_VIEW,
                    children: new_flat.clone(),
                });
                for (index, &id) in new_flat.iter().enumerate() {
                    effects.push(Effect::AttachView {
                        id,
                        parent: ROOT_VIEW,
                        index,
                    });
                }
            }
        } else if old_flat != new_flat && !new_flat.is_empty() {
            effects.push(Effect::SetChildren {
                parent: ROOT_VIEW,
                children: new_flat.clone(),
            });
        }

        let boundaries = vec![Boundary {
            old: old_root,
            wip,
            splice: Splice::Root,
        }];
        self.finish_drain(staged, effects, artifacts.built, artifacts.mounts, boundaries)
    }

    // ----- scheduling -----

    /// The callback path external state facilities use: enqueue a
    /// component for re-render. `None` resolves to the instance's declared
    /// priority, falling back to the per-type heuristic.
    pub fn schedule_update(
        &mut self,
        component: ComponentId,
        priority: Option<Priority>,
        now: Instant,
    ) {
        let priority = priority.unwrap_or_else(|| self.default_priority(component));
        self.queue.borrow_mut().enqueue(component, priority, now);
    }

    fn default_priority(&self, component: ComponentId) -> Priority {
        let Some(&node) = self.registries.components.get(&component) else {
            return Priority::Normal;
        };
        match self.arena.get(node) {
            Some(MountedNode::Stateful(c)) => c
                .instance
                .borrow()
                .priority()
                .unwrap_or_else(|| Priority::for_component_type(&c.type_name)),
            _ => Priority::Normal,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.borrow().next_deadline()
    }

    pub fn pending_updates(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Cooperative pump: runs a drain when the armed timer is due.
    /// Returns whether updates remain pending.
    pub fn tick(&mut self, now: Instant) -> Result<bool, EngineError> {
        if self.queue.borrow().is_due(now) {
            self.drain()?;
        }
        Ok(!self.queue.borrow().is_empty())
    }

    fn drain(&mut self) -> Result<(), EngineError> {
        let batch = self.queue.borrow_mut().snapshot();
        if batch.is_empty() {
            return Ok(());
        }
        let started = Instant::now();

        // Resolve to live component nodes, dropping updates whose
        // components unmounted since they were enqueued.
        let mut candidates: Vec<(PendingUpdate, NodeId)> = Vec::new();
        for update in batch {
            match self.registries.components.get(&update.component) {
                Some(&node) if self.arena.contains(node) => candidates.push((update, node)),
                _ => tracing::trace!(
                    component = ?update.component,
                    "dropping update for an unmounted component"
                ),
            }
        }
        // An update nested under another updating component is covered by
        // the ancestor's re-render.
        let candidate_nodes: FxHashSet<NodeId> =
            candidates.iter().map(|(_, node)| *node).collect();
        candidates.retain(|(update, node)| {
            let mut cursor = self.arena.get(*node).and_then(|n| n.parent());
            while let Some(parent) = cursor {
                if candidate_nodes.contains(&parent) {
                    tracing::trace!(
                        component = ?update.component,
                        "covered by an ancestor update in the same drain"
                    );
                    return false;
                }
                cursor = self.arena.get(parent).and_then(|n| n.parent());
            }
            true
        });
        if candidates.is_empty() {
            return Ok(());
        }

        let parallel = self.config.concurrent_enabled
            && !self.quiesced
            && candidates.len() >= self.config.concurrent_min_batch;
        tracing::debug!(updates = candidates.len(), parallel, "drain");

        // Render phase. Renders stay on the main context; in parallel mode
        // each large serializable subtree is dispatched to the pool here.
        struct Entry {
            component: NodeId,
            old_rendered: NodeId,
            desc: VNode,
            slot: Slot,
            pending: Option<crate::worker::PendingDiff>,
        }
        let mut entries: Vec<Entry> = Vec::new();
        for (_, component) in candidates {
            let (handle, props, old_rendered, slot) = match self.arena.get(component) {
                Some(MountedNode::Stateful(node)) => (
                    node.instance.clone(),
                    node.props.clone(),
                    node.rendered,
                    node.position,
                ),
                _ => continue,
            };
            self.profiling.renders += 1;
            let desc = handle.borrow_mut().render(&props);

            let mut pending = None;
            if parallel {
                let combined = self.arena.subtree_count(old_rendered) + desc.node_count();
                if combined >= self.config.isolate_threshold {
                    if let (Some(old_snap), Some(new_snap)) = (
                        serialize_mounted(&self.arena, old_rendered),
                        serialize_description(&desc),
                    ) {
                        match self.pool.submit(DiffJob {
                            old: old_snap,
                            new: new_snap,
                            lookahead: self.config.lookahead_window,
                            epoch: self.epoch,
                        }) {
                            Ok(p) => pending = Some(p),
                            Err(err) => tracing::warn!(
                                error = %err,
                                "worker dispatch failed, keeping the serial path"
                            ),
                        }
                    }
                }
            }
            entries.push(Entry {
                component,
                old_rendered,
                desc,
                slot,
                pending,
            });
        }

        // Apply phase, in the drain's dispatch order: worker plans land
        // serially here, and any failure reruns the pair serially.
        let mut staged = self.registries.clone();
        let mut effects = EffectList::default();
        let mut built = Vec::new();
        let mut mounts = Vec::new();
        let mut boundaries = Vec::new();

        for entry in entries {
            let use_pool = self.config.concurrent_enabled && !self.quiesced;
            let mut recon = Reconciler::new(
                &mut self.arena,
                &mut effects,
                &mut staged,
                &mut self.ids,
                &self.config,
                use_pool.then_some(&self.pool),
                &mut self.similarity,
                self.epoch,
                &mut self.next_component,
                &mut self.profiling,
            );
            let wip = match entry.pending {
                Some(pending) => match pending.wait(self.config.worker_timeout) {
                    Ok(reply) if reply.epoch == self.epoch => {
                        if let VNode::Element(el) = &entry.desc {
                            recon.apply_outcome(el, reply.outcome)
                        } else {
                            recon.reconcile(Some(entry.old_rendered), &entry.desc, entry.slot)
                        }
                    }
                    Ok(_) => {
                        tracing::debug!("discarding diff plan from a previous epoch");
                        recon.reconcile(Some(entry.old_rendered), &entry.desc, entry.slot)
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "worker diff failed, falling back to serial");
                        recon.reconcile(Some(entry.old_rendered), &entry.desc, entry.slot)
                    }
                },
                None => recon.reconcile_boundary(
                    Some(entry.old_rendered),
                    &entry.desc,
                    entry.slot,
                ),
            };
            let artifacts = recon.finish();
            built.extend(artifacts.built);
            mounts.extend(artifacts.mounts);

            self.push_ancestor_set_children(
                entry.component,
                entry.old_rendered,
                wip,
                &mut effects,
            );
            boundaries.push(Boundary {
                old: Some(entry.old_rendered),
                wip,
                splice: Splice::Rendered {
                    component: entry.component,
                },
            });
        }

        let result = self.finish_drain(staged, effects, built, mounts, boundaries);
        let elapsed = started.elapsed();
        if parallel {
            self.telemetry.record_parallel(elapsed);
        } else {
            self.telemetry.record_serial(elapsed);
        }
        result
    }

    /// When a component's contribution to its nearest native ancestor
    /// changed, that ancestor needs one declarative child-order update.
    fn push_ancestor_set_children(
        &self,
        component: NodeId,
        old_rendered: NodeId,
        wip: NodeId,
        effects: &mut EffectList,
    ) {
        let old_flat = self.arena.flattened(old_rendered);
        let new_flat = self.arena.flattened(wip);
        if old_flat == new_flat {
            return;
        }

        let mut cursor = self.arena.get(component).and_then(|n| n.parent());
        let mut ancestor: Option<(ViewId, Vec<NodeId>)> = None;
        while let Some(id) = cursor {
            if let Some(MountedNode::Element(el)) = self.arena.get(id) {
                ancestor = Some((el.view_id, el.children.iter().copied().collect()));
                break;
            }
            cursor = self.arena.get(id).and_then(|n| n.parent());
        }

        let mut list = Vec::new();
        match ancestor {
            Some((view, children)) => {
                for child in children {
                    self.arena
                        .flatten_views_substituting(child, component, &new_flat, &mut list);
                }
                effects.push(Effect::SetChildren {
                    parent: view,
                    children: list,
                });
            }
            None => {
                if let Some(root) = self.root {
                    self.arena
                        .flatten_views_substituting(root, component, &new_flat, &mut list);
                }
                effects.push(Effect::SetChildren {
                    parent: ROOT_VIEW,
                    children: list,
                });
            }
        }
    }

    // ----- commit -----

    fn commit_effects(&mut self, effects: Vec<Effect>) -> Result<(), EngineError> {
        self.bridge.begin_batch()?;
        for effect in &effects {
            if let Err(err) = dispatch(&mut self.bridge, effect) {
                tracing::error!(
                    command = effect.command_name(),
                    view = %effect.view(),
                    error = %err,
                    "bridge rejected an effect, aborting the batch"
                );
                let close = if self.bridge.supports_rollback() {
                    self.bridge.rollback_batch()
                } else {
                    self.bridge.commit_batch()
                };
                if let Err(close_err) = close {
                    tracing::warn!(error = %close_err, "failed to close the aborted batch");
                }
                return Err(err.into());
            }
        }
        self.bridge.commit_batch()?;
        Ok(())
    }

    fn finish_drain(
        &mut self,
        staged: Registries,
        effects: EffectList,
        built: Vec<NodeId>,
        mounts: Vec<NewMount>,
        boundaries: Vec<Boundary>,
    ) -> Result<(), EngineError> {
        let effect_count = effects.len() as u64;
        match self.commit_effects(effects.into_vec()) {
            Ok(()) => {
                self.registries = staged;
                self.profiling.effects += effect_count;
                for boundary in boundaries {
                    match boundary.splice {
                        Splice::Root => {
                            self.root = Some(boundary.wip);
                        }
                        Splice::Rendered { component } => {
                            let content = self.arena.flattened(boundary.wip).first().copied();
                            if let Some(node) = self.arena.get_mut(component) {
                                match node {
                                    MountedNode::Stateful(c) => {
                                        c.rendered = boundary.wip;
                                        c.content_view_id = content;
                                    }
                                    MountedNode::Stateless(c) => {
                                        c.rendered = boundary.wip;
                                        c.content_view_id = content;
                                    }
                                    _ => {}
                                }
                            }
                            self.arena.set_parent(boundary.wip, Some(component));
                        }
                    }
                    if let Some(old) = boundary.old {
                        let mut retired = Vec::new();
                        self.arena.collect_subtree(old, &mut retired);
                        for key in retired {
                            self.arena.remove(key);
                        }
                    }
                }
                for mount in mounts {
                    let updater = Updater::new(
                        Rc::downgrade(&self.queue),
                        mount.identity,
                        mount.priority,
                    );
                    let ctx = ComponentCtx { updater };
                    mount.handle.borrow_mut().mounted(&ctx);
                }
                self.failure_streak = 0;
                Ok(())
            }
            Err(err) => {
                // Discard the work-in-progress subtree; the committed tree
                // and registries stay as they were.
                for key in built {
                    self.arena.remove(key);
                }
                self.failure_streak += 1;
                if self.failure_streak <= 3 {
                    tracing::error!(error = %err, "drain aborted, committed tree unchanged");
                } else {
                    tracing::debug!(
                        error = %err,
                        streak = self.failure_streak,
                        "drain aborted (repeating failure)"
                    );
                }
                Err(err)
            }
        }
    }

    // ----- inbound events -----

    /// Inbound renderer event: route to the current handler for the view
    /// and name. Events for unknown views are dropped silently.
    pub fn dispatch_event(&self, view: ViewId, name: &str, data: PropValue) {
        match self.registries.listeners.get(view, name) {
            Some(handler) => {
                tracing::trace!(%view, event = name, "dispatching event");
                handler.invoke(data);
            }
            None => {
                tracing::trace!(%view, event = name, "dropping event for unknown view");
            }
        }
    }

    // ----- hot reload & teardown -----

    /// Enter hot-reload quiescence: the worker path is disabled, in-flight
    /// plans will be discarded, retention registries reset. Committed views
    /// stay up until the next render rebuilds instances.
    pub fn begin_hot_reload(&mut self) {
        tracing::info!("entering hot-reload quiescence");
        self.quiesced = true;
        self.epoch += 1;
        self.queue.borrow_mut().clear();
        self.registries.instances.clear();
        self.similarity.clear();
    }

    pub fn end_hot_reload(&mut self) {
        tracing::info!("leaving hot-reload quiescence");
        self.quiesced = false;
    }

    pub fn is_quiesced(&self) -> bool {
        self.quiesced
    }

    /// Clean teardown: drop pending updates without effects, quiesce the
    /// workers, clear caches and tables. The bridge keeps whatever was
    /// last committed.
    pub fn shutdown(&mut self) {
        let dropped = self.queue.borrow_mut().snapshot();
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "dropping pending updates at shutdown");
        }
        self.pool.shutdown();
        self.similarity.clear();
        self.registries.instances.clear();
        self.registries.listeners.clear();
    }

    // ----- integrity -----

    /// Walk the committed tree checking parent links, view registration
    /// and sibling-key uniqueness. Violations are engine bugs: fatal under
    /// debug assertions, a warning in release.
    pub fn verify_tree(&self) {
        let Some(root) = self.root else {
            return;
        };
        let mut seen = FxHashSet::default();
        self.verify_node(root, None, &mut seen);
        for view in self.registries.views.view_ids() {
            if !seen.contains(&view) {
                let err = InvariantViolation::UnknownView(view);
                debug_assert!(false, "{err}");
                tracing::warn!(error = %err, "registered view unreachable from the committed root");
            }
        }
    }

    fn verify_node(&self, id: NodeId, parent: Option<NodeId>, seen: &mut FxHashSet<ViewId>) {
        let Some(node) = self.arena.get(id) else {
            debug_assert!(false, "dangling node key in committed tree");
            tracing::warn!("dangling node key in committed tree");
            return;
        };
        if node.parent() != parent {
            let err = InvariantViolation::BrokenParentLink(node.own_view());
            debug_assert!(false, "{err}");
            tracing::warn!(error = %err, "tree integrity");
        }
        match node {
            MountedNode::Element(el) => {
                if !seen.insert(el.view_id) {
                    let err = InvariantViolation::DoubleMount(el.view_id);
                    debug_assert!(false, "{err}");
                    tracing::warn!(error = %err, "tree integrity");
                }
                if self.registries.views.get(el.view_id) != Some(id) {
                    debug_assert!(false, "view registry out of step");
                    tracing::warn!(view = %el.view_id, "view registry out of step");
                }
                let mut keys: FxHashSet<&str> = FxHashSet::default();
                for &child in &el.children {
                    if let Some(key) = self.arena.get(child).and_then(|n| n.key()) {
                        if !keys.insert(key) {
                            tracing::warn!(key, "duplicate sibling key in committed tree");
                        }
                    }
                }
                for &child in &el.children {
                    self.verify_node(child, Some(id), seen);
                }
            }
            MountedNode::Stateful(c) => self.verify_node(c.rendered, Some(id), seen),
            MountedNode::Stateless(c) => self.verify_node(c.rendered, Some(id), seen),
            MountedNode::Fragment(f) => {
                for &child in &f.children {
                    self.verify_node(child, Some(id), seen);
                }
            }
            MountedNode::Empty { .. } => {}
        }
    }
}
