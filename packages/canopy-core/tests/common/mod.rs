#![allow(dead_code)]

use canopy_core::{BridgeError, Effect, Props, PropValue, RendererBridge, VNode, ViewId};
use std::collections::HashSet;

/// Test renderer: records every command as an `Effect`, enforces the
/// bridge contract (batched, create-before-reference, no double create,
/// no dangling children), and can inject failures per command name.
pub struct RecordingBridge {
    pub commands: Vec<Effect>,
    pub begun: u32,
    pub committed: u32,
    pub rolled_back: u32,
    pub open: bool,
    pub live: HashSet<ViewId>,
    pub fail_on: Option<&'static str>,
    pub rollback_supported: bool,
}

impl Default for RecordingBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBridge {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            begun: 0,
            committed: 0,
            rolled_back: 0,
            open: false,
            live: HashSet::from([ViewId(0)]),
            fail_on: None,
            rollback_supported: false,
        }
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.commands.iter().map(Effect::command_name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.commands
            .iter()
            .filter(|c| c.command_name() == name)
            .count()
    }

    /// View id of the n-th created view of the given type.
    pub fn created_view(&self, type_name: &str, nth: usize) -> ViewId {
        self.commands
            .iter()
            .filter_map(|c| match c {
                Effect::CreateView { id, type_name: t, .. } if t == type_name => Some(*id),
                _ => None,
            })
            .nth(nth)
            .unwrap_or_else(|| panic!("no create #{nth} for {type_name}"))
    }

    fn guard(&self, name: &'static str, view: Option<ViewId>) -> Result<(), BridgeError> {
        if !self.open {
            return Err(BridgeError::new(name, view, "command outside a batch"));
        }
        if self.fail_on == Some(name) {
            return Err(BridgeError::new(name, view, "injected failure"));
        }
        Ok(())
    }
}

impl RendererBridge for RecordingBridge {
    fn begin_batch(&mut self) -> Result<(), BridgeError> {
        assert!(!self.open, "nested begin_batch");
        self.open = true;
        self.begun += 1;
        Ok(())
    }

    fn commit_batch(&mut self) -> Result<(), BridgeError> {
        assert!(self.open, "commit without begin");
        self.open = false;
        self.committed += 1;
        Ok(())
    }

    fn supports_rollback(&self) -> bool {
        self.rollback_supported
    }

    fn rollback_batch(&mut self) -> Result<(), BridgeError> {
        assert!(self.open, "rollback without begin");
        self.open = false;
        self.rolled_back += 1;
        Ok(())
    }

    fn create_view(
        &mut self,
        id: ViewId,
        type_name: &str,
        props: &Props,
    ) -> Result<(), BridgeError> {
        self.guard("create_view", Some(id))?;
        assert!(self.live.insert(id), "view {id} created twice");
        self.commands.push(Effect::CreateView {
            id,
            type_name: type_name.to_owned(),
            props: props.clone(),
        });
        Ok(())
    }

    fn update_view(&mut self, id: ViewId, changed: &Props) -> Result<(), BridgeError> {
        self.guard("update_view", Some(id))?;
        assert!(self.live.contains(&id), "update of unknown view {id}");
        self.commands.push(Effect::UpdateView {
            id,
            changed: changed.clone(),
        });
        Ok(())
    }

    fn delete_view(&mut self, id: ViewId) -> Result<(), BridgeError> {
        self.guard("delete_view", Some(id))?;
        assert!(self.live.remove(&id), "delete of unknown view {id}");
        self.commands.push(Effect::DeleteView { id });
        Ok(())
    }

    fn attach_view(
        &mut self,
        id: ViewId,
        parent: ViewId,
        index: usize,
    ) -> Result<(), BridgeError> {
        self.guard("attach_view", Some(id))?;
        assert!(self.live.contains(&id), "attach of unknown view {id}");
        assert!(self.live.contains(&parent), "attach under unknown view {parent}");
        self.commands.push(Effect::AttachView { id, parent, index });
        Ok(())
    }

    fn detach_view(&mut self, id: ViewId) -> Result<(), BridgeError> {
        self.guard("detach_view", Some(id))?;
        self.commands.push(Effect::DetachView { id });
        Ok(())
    }

    fn set_children(&mut self, parent: ViewId, children: &[ViewId]) -> Result<(), BridgeError> {
        self.guard("set_children", Some(parent))?;
        assert!(self.live.contains(&parent), "set_children on unknown view {parent}");
        for child in children {
            assert!(
                self.live.contains(child),
                "set_children references unknown view {child}"
            );
        }
        self.commands.push(Effect::SetChildren {
            parent,
            children: children.to_vec(),
        });
        Ok(())
    }

    fn add_event_listeners(&mut self, id: ViewId, names: &[String]) -> Result<(), BridgeError> {
        self.guard("add_event_listeners", Some(id))?;
        self.commands.push(Effect::AddEventListeners {
            id,
            names: names.to_vec(),
        });
        Ok(())
    }

    fn remove_event_listeners(
        &mut self,
        id: ViewId,
        names: &[String],
    ) -> Result<(), BridgeError> {
        self.guard("remove_event_listeners", Some(id))?;
        self.commands.push(Effect::RemoveEventListeners {
            id,
            names: names.to_vec(),
        });
        Ok(())
    }
}

pub fn props(entries: &[(&str, PropValue)]) -> Props {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

pub fn text(content: &str) -> VNode {
    VNode::element("Text", props(&[("content", content.into())]), vec![])
}

pub fn keyed_text(key: &str, content: &str) -> VNode {
    text(content).with_key(key)
}

pub fn view(children: Vec<VNode>) -> VNode {
    VNode::element("View", Props::default(), children)
}
