use crate::node::ViewId;
use crate::props::EventHandler;
use rustc_hash::FxHashMap;

/// Handler dispatch table keyed by view and event name.
///
/// Rebuilt during reconciliation: a handler identity change retargets the
/// entry here without any renderer call, so the renderer's listener
/// registrations only change when the *set of names* changes.
#[derive(Default, Clone)]
pub struct ListenerTable {
    handlers: FxHashMap<ViewId, FxHashMap<String, EventHandler>>,
}

impl ListenerTable {
    pub fn set(&mut self, view: ViewId, name: impl Into<String>, handler: EventHandler) {
        self.handlers.entry(view).or_default().insert(name.into(), handler);
    }

    pub fn remove(&mut self, view: ViewId, name: &str) {
        if let Some(entries) = self.handlers.get_mut(&view) {
            entries.remove(name);
            if entries.is_empty() {
                self.handlers.remove(&view);
            }
        }
    }

    pub fn remove_view(&mut self, view: ViewId) {
        self.handlers.remove(&view);
    }

    pub fn get(&self, view: ViewId, name: &str) -> Option<EventHandler> {
        self.handlers.get(&view).and_then(|entries| entries.get(name)).cloned()
    }

    pub fn names_for(&self, view: ViewId) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .get(&view)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }

    pub fn view_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}
