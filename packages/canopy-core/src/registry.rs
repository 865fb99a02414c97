use crate::component::ComponentHandle;
use crate::events::ListenerTable;
use crate::node::{NodeId, TypeName, ViewId};
use canopy_scheduler::ComponentId;
use rustc_hash::FxHashMap;

/// Monotonic view-id source. `0` is the root, pre-allocated at engine
/// construction; ids are never recycled.
#[derive(Debug, Clone)]
pub struct ViewIdAllocator {
    next: u64,
}

impl Default for ViewIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn allocate(&mut self) -> ViewId {
        let id = ViewId(self.next);
        self.next += 1;
        id
    }
}

/// `nodes_by_view_id`: every mounted element's view, injectively.
#[derive(Debug, Default, Clone)]
pub struct ViewRegistry {
    map: FxHashMap<ViewId, NodeId>,
}

impl ViewRegistry {
    /// Returns the previous mapping if the view was already registered;
    /// callers treat that as a double-mount invariant violation.
    pub fn insert(&mut self, view: ViewId, node: NodeId) -> Option<NodeId> {
        self.map.insert(view, node)
    }

    pub fn remove(&mut self, view: ViewId) -> Option<NodeId> {
        self.map.remove(&view)
    }

    pub fn get(&self, view: ViewId) -> Option<NodeId> {
        self.map.get(&view).copied()
    }

    pub fn contains(&self, view: ViewId) -> bool {
        self.map.contains_key(&view)
    }

    pub fn view_ids(&self) -> impl Iterator<Item = ViewId> + '_ {
        self.map.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// Retention key: where a component sat in the committed tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub parent_view: ViewId,
    pub index: usize,
    pub type_name: TypeName,
}

#[derive(Clone)]
pub struct RetainedInstance {
    pub identity: ComponentId,
    pub handle: ComponentHandle,
}

/// Component retention across renders.
///
/// `by_position` preserves identity when the author supplied no key;
/// `by_position_and_props` is the tie-breaker for instances that drifted a
/// few indices but whose props hash unchanged.
#[derive(Default, Clone)]
pub struct InstanceRegistry {
    by_position: FxHashMap<PositionKey, RetainedInstance>,
    by_position_and_props: FxHashMap<(PositionKey, u64), RetainedInstance>,
}

impl InstanceRegistry {
    pub fn record(&mut self, key: PositionKey, props_hash: u64, instance: RetainedInstance) {
        self.by_position.insert(key.clone(), instance.clone());
        self.by_position_and_props.insert((key, props_hash), instance);
    }

    /// Exact-position lookup first, then the props-hash tie-breaker within
    /// `window` indices either side of the requested position.
    pub fn lookup(
        &self,
        key: &PositionKey,
        props_hash: u64,
        window: usize,
    ) -> Option<RetainedInstance> {
        if let Some(found) = self.by_position.get(key) {
            return Some(found.clone());
        }
        let lo = key.index.saturating_sub(window);
        let hi = key.index + window;
        for index in lo..=hi {
            if index == key.index {
                continue;
            }
            let probe = PositionKey {
                parent_view: key.parent_view,
                index,
                type_name: key.type_name.clone(),
            };
            if let Some(found) = self.by_position_and_props.get(&(probe, props_hash)) {
                return Some(found.clone());
            }
        }
        None
    }

    /// Drop every entry retaining the given instance.
    pub fn evict(&mut self, identity: ComponentId) {
        self.by_position.retain(|_, v| v.identity != identity);
        self.by_position_and_props.retain(|_, v| v.identity != identity);
    }

    pub fn len(&self) -> usize {
        self.by_position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_position.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_position.clear();
        self.by_position_and_props.clear();
    }
}

/// Everything the engine tracks beside the arena. A drain works on a
/// staged clone and the engine swaps it in at commit, so a failed drain
/// leaves the committed registries untouched (the dual-tree rule, applied
/// to bookkeeping).
#[derive(Default, Clone)]
pub struct Registries {
    pub views: ViewRegistry,
    pub instances: InstanceRegistry,
    pub listeners: ListenerTable,
    pub components: FxHashMap<ComponentId, NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::node::VNode;
    use crate::props::Props;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Probe;

    impl Component for Probe {
        fn render(&mut self, _props: &Props) -> VNode {
            VNode::Empty
        }
    }

    fn retained(id: u64) -> RetainedInstance {
        RetainedInstance {
            identity: ComponentId(id),
            handle: Rc::new(RefCell::new(Box::new(Probe))),
        }
    }

    fn key_at(index: usize) -> PositionKey {
        PositionKey {
            parent_view: ViewId(1),
            index,
            type_name: "Probe".into(),
        }
    }

    #[test]
    fn allocator_starts_past_the_root() {
        let mut ids = ViewIdAllocator::new();
        assert_eq!(ids.allocate(), ViewId(1));
        assert_eq!(ids.allocate(), ViewId(2));
    }

    #[test]
    fn exact_position_wins() {
        let mut registry = InstanceRegistry::default();
        registry.record(key_at(0), 7, retained(1));
        let found = registry.lookup(&key_at(0), 99, 4).unwrap();
        assert_eq!(found.identity, ComponentId(1));
    }

    #[test]
    fn props_hash_tiebreaker_matches_nearby_indices() {
        let mut registry = InstanceRegistry::default();
        registry.record(key_at(2), 7, retained(1));

        // Drifted two slots, same props: still found.
        let found = registry.lookup(&key_at(4), 7, 4).unwrap();
        assert_eq!(found.identity, ComponentId(1));

        // Different props hash at a drifted slot: not found.
        assert!(registry.lookup(&key_at(4), 8, 4).is_none());

        // Outside the window: not found.
        assert!(registry.lookup(&key_at(9), 7, 2).is_none());
    }

    #[test]
    fn evict_removes_both_tables() {
        let mut registry = InstanceRegistry::default();
        registry.record(key_at(0), 7, retained(1));
        registry.evict(ComponentId(1));
        assert!(registry.lookup(&key_at(0), 7, 4).is_none());
        assert!(registry.is_empty());
    }
}
