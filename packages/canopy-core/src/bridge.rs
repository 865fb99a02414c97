use crate::effects::Effect;
use crate::error::BridgeError;
use crate::node::ViewId;
use crate::props::Props;

/// The single-threaded command surface of the native renderer.
///
/// All commands identify views by integer id; `0` is the pre-existing
/// root. Every command is issued from the engine's main context, between a
/// `begin_batch` and a matching `commit_batch` (or `rollback_batch` when
/// the bridge supports it).
pub trait RendererBridge {
    fn begin_batch(&mut self) -> Result<(), BridgeError>;

    /// Apply the buffered mutations atomically.
    fn commit_batch(&mut self) -> Result<(), BridgeError>;

    /// Whether `rollback_batch` discards buffered mutations. Bridges
    /// without rollback rely on the engine's delete-before-create ordering
    /// to keep a partially committed batch consistent.
    fn supports_rollback(&self) -> bool {
        false
    }

    fn rollback_batch(&mut self) -> Result<(), BridgeError> {
        Ok(())
    }

    fn create_view(
        &mut self,
        id: ViewId,
        type_name: &str,
        props: &Props,
    ) -> Result<(), BridgeError>;

    /// Apply only the supplied prop deltas; a key mapped to null means
    /// removal.
    fn update_view(&mut self, id: ViewId, changed: &Props) -> Result<(), BridgeError>;

    fn delete_view(&mut self, id: ViewId) -> Result<(), BridgeError>;

    fn attach_view(&mut self, id: ViewId, parent: ViewId, index: usize)
    -> Result<(), BridgeError>;

    fn detach_view(&mut self, id: ViewId) -> Result<(), BridgeError>;

    /// Declarative replacement of a parent's child order.
    fn set_children(&mut self, parent: ViewId, children: &[ViewId]) -> Result<(), BridgeError>;

    fn add_event_listeners(&mut self, id: ViewId, names: &[String]) -> Result<(), BridgeError>;

    fn remove_event_listeners(&mut self, id: ViewId, names: &[String])
    -> Result<(), BridgeError>;
}

/// Dispatch one buffered effect onto the bridge.
pub fn dispatch<B: RendererBridge + ?Sized>(
    bridge: &mut B,
    effect: &Effect,
) -> Result<(), BridgeError> {
    match effect {
        Effect::CreateView {
            id,
            type_name,
            props,
        } => bridge.create_view(*id, type_name, props),
        Effect::UpdateView { id, changed } => bridge.update_view(*id, changed),
        Effect::DeleteView { id } => bridge.delete_view(*id),
        Effect::AttachView { id, parent, index } => bridge.attach_view(*id, *parent, *index),
        Effect::DetachView { id } => bridge.detach_view(*id),
        Effect::SetChildren { parent, children } => bridge.set_children(*parent, children),
        Effect::AddEventListeners { id, names } => bridge.add_event_listeners(*id, names),
        Effect::RemoveEventListeners { id, names } => bridge.remove_event_listeners(*id, names),
    }
}
