use crate::node::ViewId;
use crate::props::Props;
use serde::{Deserialize, Serialize};

/// A single renderer command. The effect list buffers these per drain and
/// the bridge applies them in order inside one batch; the enum is
/// serializable so hosts can ship a batch over a process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Effect {
    CreateView {
        id: ViewId,
        type_name: String,
        props: Props,
    },
    UpdateView {
        id: ViewId,
        changed: Props,
    },
    DeleteView {
        id: ViewId,
    },
    AttachView {
        id: ViewId,
        parent: ViewId,
        index: usize,
    },
    DetachView {
        id: ViewId,
    },
    SetChildren {
        parent: ViewId,
        children: Vec<ViewId>,
    },
    AddEventListeners {
        id: ViewId,
        names: Vec<String>,
    },
    RemoveEventListeners {
        id: ViewId,
        names: Vec<String>,
    },
}

impl Effect {
    /// The primary view the command addresses, for diagnostics.
    pub fn view(&self) -> ViewId {
        match self {
            Effect::CreateView { id, .. }
            | Effect::UpdateView { id, .. }
            | Effect::DeleteView { id }
            | Effect::AttachView { id, .. }
            | Effect::DetachView { id }
            | Effect::AddEventListeners { id, .. }
            | Effect::RemoveEventListeners { id, .. } => *id,
            Effect::SetChildren { parent, .. } => *parent,
        }
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            Effect::CreateView { .. } => "create_view",
            Effect::UpdateView { .. } => "update_view",
            Effect::DeleteView { .. } => "delete_view",
            Effect::AttachView { .. } => "attach_view",
            Effect::DetachView { .. } => "detach_view",
            Effect::SetChildren { .. } => "set_children",
            Effect::AddEventListeners { .. } => "add_event_listeners",
            Effect::RemoveEventListeners { .. } => "remove_event_listeners",
        }
    }
}

/// The ordered buffer of renderer commands produced by one drain,
/// applied atomically at commit.
#[derive(Debug, Default)]
pub struct EffectList {
    effects: Vec<Effect>,
}

impl EffectList {
    pub fn push(&mut self, effect: Effect) {
        tracing::trace!(command = effect.command_name(), view = %effect.view(), "effect");
        self.effects.push(effect);
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn as_slice(&self) -> &[Effect] {
        &self.effects
    }

    pub fn into_vec(self) -> Vec<Effect> {
        self.effects
    }
}
