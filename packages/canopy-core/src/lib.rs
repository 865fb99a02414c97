pub mod bridge;
pub mod component;
pub mod effects;
pub mod engine;
pub mod error;
pub mod events;
pub mod node;
pub mod props;
pub mod reconciler;
pub mod registry;
pub mod similarity;
pub mod worker;

pub use bridge::{RendererBridge, dispatch};
pub use component::{Component, ComponentCtx, ComponentFactory, ComponentHandle, RenderFn, Updater};
pub use effects::{Effect, EffectList};
pub use engine::{Engine, EngineConfig, EngineStats, Profiling};
pub use error::{AuthorError, BridgeError, EngineError, InvariantViolation, WorkerError};
pub use events::ListenerTable;
pub use node::{
    ElementNode, FragmentNode, MountedNode, NodeArena, NodeId, ROOT_VIEW, Slot, StatefulNode,
    StatelessNode, TypeName, VElement, VFragment, VNode, VStateful, VStateless, ViewId,
};
pub use props::{
    EventHandler, PropValue, Props, diff_props, is_event_prop, listener_names, props_hash,
    strip_handlers,
};
pub use reconciler::{NewMount, ReconcileArtifacts, Reconciler};
pub use registry::{
    InstanceRegistry, PositionKey, Registries, RetainedInstance, ViewIdAllocator, ViewRegistry,
};
pub use similarity::{SimilarityCache, shape_hash, structural_similarity};
pub use worker::{
    DiffJob, DiffOutcome, DiffPlan, DiffReply, PendingDiff, PlanId, PlanOp, SerializedNode,
    WorkerPool, compute_diff_plan, serialize_description, serialize_mounted,
};

pub use canopy_scheduler::{ComponentId, Priority};
