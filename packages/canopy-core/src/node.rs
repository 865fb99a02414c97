use crate::component::{Component, ComponentFactory, ComponentHandle, RenderFn};
use crate::props::Props;
use canopy_scheduler::ComponentId;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;
use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;

/// Handle for a native view in the renderer bridge.
///
/// `0` is the pre-existing root; allocations start at 1 and are never
/// recycled for the lifetime of the engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ViewId(pub u64);

pub const ROOT_VIEW: ViewId = ViewId(0);

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

new_key_type! {
    pub struct NodeId;
}

pub type TypeName = Cow<'static, str>;

/// Logical position of a child under its nearest native ancestor, used for
/// component retention keys and top-level attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub parent_view: ViewId,
    pub index: usize,
}

impl Slot {
    pub fn new(parent_view: ViewId, index: usize) -> Self {
        Self { parent_view, index }
    }
}

/// Immutable description of a UI subtree, as produced by component renders
/// or authored directly. The engine never mutates a description; it diffs
/// it against the committed tree.
#[derive(Clone)]
pub enum VNode {
    Element(VElement),
    Stateful(VStateful),
    Stateless(VStateless),
    Fragment(VFragment),
    Empty,
}

#[derive(Clone)]
pub struct VElement {
    pub type_name: TypeName,
    pub props: Props,
    pub children: Vec<VNode>,
    pub key: Option<String>,
}

#[derive(Clone)]
pub struct VStateful {
    pub type_name: TypeName,
    pub props: Props,
    pub key: Option<String>,
    pub factory: ComponentFactory,
}

#[derive(Clone)]
pub struct VStateless {
    pub type_name: TypeName,
    pub props: Props,
    pub key: Option<String>,
    pub render: RenderFn,
}

#[derive(Clone, Default)]
pub struct VFragment {
    pub children: Vec<VNode>,
    pub key: Option<String>,
}

impl VNode {
    pub fn element(
        type_name: impl Into<TypeName>,
        props: Props,
        children: Vec<VNode>,
    ) -> Self {
        VNode::Element(VElement {
            type_name: type_name.into(),
            props,
            children,
            key: None,
        })
    }

    pub fn stateful<C: Component + 'static>(
        type_name: impl Into<TypeName>,
        props: Props,
        factory: impl Fn() -> C + 'static,
    ) -> Self {
        VNode::Stateful(VStateful {
            type_name: type_name.into(),
            props,
            key: None,
            factory: Rc::new(move || Box::new(factory()) as Box<dyn Component>),
        })
    }

    pub fn stateless(
        type_name: impl Into<TypeName>,
        props: Props,
        render: impl Fn(&Props) -> VNode + 'static,
    ) -> Self {
        VNode::Stateless(VStateless {
            type_name: type_name.into(),
            props,
            key: None,
            render: Rc::new(render),
        })
    }

    pub fn fragment(children: Vec<VNode>) -> Self {
        VNode::Fragment(VFragment {
            children,
            key: None,
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        match &mut self {
            VNode::Element(el) => el.key = Some(key),
            VNode::Stateful(c) => c.key = Some(key),
            VNode::Stateless(c) => c.key = Some(key),
            VNode::Fragment(f) => f.key = Some(key),
            VNode::Empty => {}
        }
        self
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            VNode::Element(el) => el.key.as_deref(),
            VNode::Stateful(c) => c.key.as_deref(),
            VNode::Stateless(c) => c.key.as_deref(),
            VNode::Fragment(f) => f.key.as_deref(),
            VNode::Empty => None,
        }
    }

    /// Total node count of the description, used by the off-thread gate.
    pub fn node_count(&self) -> usize {
        match self {
            VNode::Element(el) => 1 + el.children.iter().map(VNode::node_count).sum::<usize>(),
            VNode::Fragment(f) => 1 + f.children.iter().map(VNode::node_count).sum::<usize>(),
            VNode::Stateful(_) | VNode::Stateless(_) | VNode::Empty => 1,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            VNode::Element(_) => "element",
            VNode::Stateful(_) => "stateful",
            VNode::Stateless(_) => "stateless",
            VNode::Fragment(_) => "fragment",
            VNode::Empty => "empty",
        }
    }
}

impl fmt::Debug for VNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VNode::Element(el) => f
                .debug_struct("Element")
                .field("type", &el.type_name)
                .field("children", &el.children.len())
                .finish(),
            VNode::Stateful(c) => f.debug_struct("Stateful").field("type", &c.type_name).finish(),
            VNode::Stateless(c) => {
                f.debug_struct("Stateless").field("type", &c.type_name).finish()
            }
            VNode::Fragment(fr) => f
                .debug_struct("Fragment")
                .field("children", &fr.children.len())
                .finish(),
            VNode::Empty => f.write_str("Empty"),
        }
    }
}

/// A mounted element: owns a native view.
pub struct ElementNode {
    pub type_name: TypeName,
    pub props: Props,
    pub key: Option<String>,
    pub view_id: ViewId,
    pub children: SmallVec<[NodeId; 4]>,
    pub parent: Option<NodeId>,
    /// Derived event names currently registered with the renderer.
    pub listeners: Vec<String>,
}

/// A mounted stateful component instance. Owns no native view; its
/// `content_view_id` aliases the view of the element it renders to.
pub struct StatefulNode {
    pub type_name: TypeName,
    pub props: Props,
    pub key: Option<String>,
    pub identity: ComponentId,
    pub instance: ComponentHandle,
    pub rendered: NodeId,
    pub content_view_id: Option<ViewId>,
    pub parent: Option<NodeId>,
    pub position: Slot,
}

pub struct StatelessNode {
    pub type_name: TypeName,
    pub props: Props,
    pub key: Option<String>,
    pub render: RenderFn,
    pub rendered: NodeId,
    pub content_view_id: Option<ViewId>,
    pub parent: Option<NodeId>,
    pub position: Slot,
}

pub struct FragmentNode {
    pub key: Option<String>,
    pub children: SmallVec<[NodeId; 4]>,
    pub parent: Option<NodeId>,
}

/// Arena-resident form of a committed (or in-progress) node.
pub enum MountedNode {
    Element(ElementNode),
    Stateful(StatefulNode),
    Stateless(StatelessNode),
    Fragment(FragmentNode),
    Empty { parent: Option<NodeId> },
}

impl MountedNode {
    pub fn key(&self) -> Option<&str> {
        match self {
            MountedNode::Element(el) => el.key.as_deref(),
            MountedNode::Stateful(c) => c.key.as_deref(),
            MountedNode::Stateless(c) => c.key.as_deref(),
            MountedNode::Fragment(f) => f.key.as_deref(),
            MountedNode::Empty { .. } => None,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        match self {
            MountedNode::Element(el) => el.parent,
            MountedNode::Stateful(c) => c.parent,
            MountedNode::Stateless(c) => c.parent,
            MountedNode::Fragment(f) => f.parent,
            MountedNode::Empty { parent } => *parent,
        }
    }

    pub fn set_parent(&mut self, new_parent: Option<NodeId>) {
        match self {
            MountedNode::Element(el) => el.parent = new_parent,
            MountedNode::Stateful(c) => c.parent = new_parent,
            MountedNode::Stateless(c) => c.parent = new_parent,
            MountedNode::Fragment(f) => f.parent = new_parent,
            MountedNode::Empty { parent } => *parent = new_parent,
        }
    }

    /// The native view this node directly owns, if any. Components alias
    /// their rendered element's view through `content_view_id` instead.
    pub fn own_view(&self) -> Option<ViewId> {
        match self {
            MountedNode::Element(el) => Some(el.view_id),
            _ => None,
        }
    }
}

/// Arena for mounted nodes. Parent links are arena keys, so the
/// parent/child relation carries no strong reference cycle; unmount
/// removes the key and any stale read simply misses.
pub struct NodeArena {
    pub nodes: SlotMap<NodeId, MountedNode>,
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeArena {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
        }
    }

    pub fn insert(&mut self, node: MountedNode) -> NodeId {
        self.nodes.insert(node)
    }

    pub fn get(&self, id: NodeId) -> Option<&MountedNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut MountedNode> {
        self.nodes.get_mut(id)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<MountedNode> {
        self.nodes.remove(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.set_parent(parent);
        }
    }

    /// The native views a node contributes to its parent's child list:
    /// elements contribute themselves, components their rendered output,
    /// fragments their children in order, empties nothing.
    pub fn flatten_views(&self, id: NodeId, out: &mut Vec<ViewId>) {
        match self.nodes.get(id) {
            Some(MountedNode::Element(el)) => out.push(el.view_id),
            Some(MountedNode::Stateful(c)) => self.flatten_views(c.rendered, out),
            Some(MountedNode::Stateless(c)) => self.flatten_views(c.rendered, out),
            Some(MountedNode::Fragment(f)) => {
                for &child in &f.children {
                    self.flatten_views(child, out);
                }
            }
            Some(MountedNode::Empty { .. }) | None => {}
        }
    }

    pub fn flattened(&self, id: NodeId) -> Vec<ViewId> {
        let mut out = Vec::new();
        self.flatten_views(id, &mut out);
        out
    }

    /// Like `flatten_views`, but the subtree under `target` is replaced by
    /// `substitute`. Used to recompute an ancestor's child list while the
    /// replacement subtree is still work-in-progress.
    pub fn flatten_views_substituting(
        &self,
        id: NodeId,
        target: NodeId,
        substitute: &[ViewId],
        out: &mut Vec<ViewId>,
    ) {
        if id == target {
            out.extend_from_slice(substitute);
            return;
        }
        match self.nodes.get(id) {
            Some(MountedNode::Element(el)) => out.push(el.view_id),
            Some(MountedNode::Stateful(c)) => {
                self.flatten_views_substituting(c.rendered, target, substitute, out)
            }
            Some(MountedNode::Stateless(c)) => {
                self.flatten_views_substituting(c.rendered, target, substitute, out)
            }
            Some(MountedNode::Fragment(f)) => {
                for &child in &f.children {
                    self.flatten_views_substituting(child, target, substitute, out);
                }
            }
            Some(MountedNode::Empty { .. }) | None => {}
        }
    }

    /// Node count of a mounted subtree, for the off-thread gate.
    pub fn subtree_count(&self, id: NodeId) -> usize {
        match self.nodes.get(id) {
            Some(MountedNode::Element(el)) => {
                1 + el.children.iter().map(|&c| self.subtree_count(c)).sum::<usize>()
            }
            Some(MountedNode::Stateful(c)) => 1 + self.subtree_count(c.rendered),
            Some(MountedNode::Stateless(c)) => 1 + self.subtree_count(c.rendered),
            Some(MountedNode::Fragment(f)) => {
                1 + f.children.iter().map(|&c| self.subtree_count(c)).sum::<usize>()
            }
            Some(MountedNode::Empty { .. }) => 1,
            None => 0,
        }
    }

    /// Every node key in a subtree, self included, depth-first.
    pub fn collect_subtree(&self, id: NodeId, out: &mut Vec<NodeId>) {
        out.push(id);
        match self.nodes.get(id) {
            Some(MountedNode::Element(el)) => {
                for &child in &el.children {
                    self.collect_subtree(child, out);
                }
            }
            Some(MountedNode::Stateful(c)) => self.collect_subtree(c.rendered, out),
            Some(MountedNode::Stateless(c)) => self.collect_subtree(c.rendered, out),
            Some(MountedNode::Fragment(f)) => {
                for &child in &f.children {
                    self.collect_subtree(child, out);
                }
            }
            _ => {}
        }
    }

    /// Every view id owned by a subtree, children before parents, the
    /// order deletes must be emitted in.
    pub fn subtree_views_bottom_up(&self, id: NodeId, out: &mut Vec<ViewId>) {
        match self.nodes.get(id) {
            Some(MountedNode::Element(el)) => {
                for &child in &el.children {
                    self.subtree_views_bottom_up(child, out);
                }
                out.push(el.view_id);
            }
            Some(MountedNode::Stateful(c)) => self.subtree_views_bottom_up(c.rendered, out),
            Some(MountedNode::Stateless(c)) => self.subtree_views_bottom_up(c.rendered, out),
            Some(MountedNode::Fragment(f)) => {
                for &child in &f.children {
                    self.subtree_views_bottom_up(child, out);
                }
            }
            _ => {}
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
