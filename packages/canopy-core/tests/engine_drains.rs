mod common;

use canopy_core::{
    Component, ComponentCtx, Effect, Engine, EngineError, Priority, Props, Updater, VNode,
    ViewId,
};
use common::{RecordingBridge, props, text, view};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

struct Label {
    content: Rc<RefCell<String>>,
    updater: Rc<RefCell<Option<Updater>>>,
}

impl Component for Label {
    fn render(&mut self, _props: &Props) -> VNode {
        text(&self.content.borrow())
    }

    fn mounted(&mut self, ctx: &ComponentCtx) {
        *self.updater.borrow_mut() = Some(ctx.updater.clone());
    }
}

fn label_engine() -> (
    Engine<RecordingBridge>,
    Rc<RefCell<String>>,
    Rc<RefCell<Option<Updater>>>,
) {
    let content = Rc::new(RefCell::new("first".to_owned()));
    let updater: Rc<RefCell<Option<Updater>>> = Rc::new(RefCell::new(None));
    let mut engine = Engine::new(RecordingBridge::new());
    let (c, u) = (content.clone(), updater.clone());
    engine
        .render(VNode::stateful("Label", Props::default(), move || Label {
            content: c.clone(),
            updater: u.clone(),
        }))
        .unwrap();
    (engine, content, updater)
}

#[test]
fn a_failed_commit_leaves_the_committed_tree_intact() {
    let mut engine = Engine::new(RecordingBridge::new());
    engine.render(text("a")).unwrap();
    engine.bridge_mut().clear();

    engine.bridge_mut().fail_on = Some("update_view");
    let err = engine.render(text("b")).unwrap_err();
    assert!(matches!(err, EngineError::Bridge(_)));
    assert!(engine.bridge().commands.is_empty(), "the failing command was not applied");
    assert!(!engine.bridge().open, "the aborted batch was closed");

    // The engine still reconciles from the last committed tree: the same
    // delta is produced again once the bridge recovers.
    engine.bridge_mut().fail_on = None;
    engine.render(text("b")).unwrap();
    assert_eq!(
        engine.bridge().commands,
        vec![Effect::UpdateView {
            id: ViewId(1),
            changed: props(&[("content", "b".into())]),
        }]
    );
    engine.verify_tree();
}

#[test]
fn rollback_is_used_when_the_bridge_supports_it() {
    let mut engine = Engine::new(RecordingBridge::new());
    engine.bridge_mut().rollback_supported = true;
    engine.render(text("a")).unwrap();

    engine.bridge_mut().fail_on = Some("update_view");
    engine.render(text("b")).unwrap_err();

    assert_eq!(engine.bridge().rolled_back, 1);
    assert!(!engine.bridge().open);
}

#[test]
fn updates_coalesce_and_drain_once() {
    let (mut engine, content, updater) = label_engine();
    engine.bridge_mut().clear();

    *content.borrow_mut() = "second".to_owned();
    let updater = updater.borrow().clone().unwrap();
    updater.request_update();
    updater.request_update();
    updater.request_update();
    assert_eq!(engine.pending_updates(), 1, "duplicates coalesce");

    engine
        .tick(Instant::now() + Duration::from_millis(50))
        .unwrap();
    assert_eq!(engine.bridge().count("update_view"), 1);
    assert_eq!(engine.stats().serial_drains, 1);
}

#[test]
fn an_explicit_priority_preempts_the_armed_timer() {
    let (mut engine, _content, updater) = label_engine();
    let updater = updater.borrow().clone().unwrap();
    let component = updater.component();

    let t0 = Instant::now();
    engine.schedule_update(component, Some(Priority::Idle), t0);
    let idle_deadline = engine.next_deadline().unwrap();
    assert_eq!(idle_deadline, t0 + Duration::from_millis(16));

    engine.schedule_update(component, Some(Priority::Immediate), t0 + Duration::from_millis(1));
    let preempted = engine.next_deadline().unwrap();
    assert_eq!(preempted, t0 + Duration::from_millis(1));
    assert!(preempted < idle_deadline);
}

#[test]
fn updates_for_unmounted_components_are_dropped() {
    let (mut engine, _content, updater) = label_engine();
    let updater = updater.borrow().clone().unwrap();

    // Replace the component subtree entirely, unmounting the instance.
    engine.render(text("plain")).unwrap();
    engine.bridge_mut().clear();

    updater.request_update();
    engine
        .tick(Instant::now() + Duration::from_millis(50))
        .unwrap();
    assert!(engine.bridge().commands.is_empty());
}

#[test]
fn hot_reload_drops_pending_updates() {
    let (mut engine, _content, updater) = label_engine();
    updater.borrow().as_ref().unwrap().request_update();
    assert_eq!(engine.pending_updates(), 1);

    engine.begin_hot_reload();
    assert_eq!(engine.pending_updates(), 0);
    assert!(engine.is_quiesced());
    engine.end_hot_reload();
}

#[test]
fn shutdown_quiesces_without_touching_the_renderer() {
    let (mut engine, _content, updater) = label_engine();
    updater.borrow().as_ref().unwrap().request_update();
    let commands_before = engine.bridge().commands.len();

    engine.shutdown();
    assert_eq!(engine.pending_updates(), 0);
    assert_eq!(engine.bridge().commands.len(), commands_before);

    // The engine keeps working serially after its pool is gone.
    engine.render(view(vec![text("after")])).unwrap();
}

#[test]
fn thresholds_are_runtime_adjustable_and_reported() {
    let mut engine = Engine::new(RecordingBridge::new());
    let stats = engine.stats();
    assert_eq!(stats.isolate_threshold, 20);
    assert_eq!(stats.direct_replace_threshold, 100);
    assert_eq!(stats.concurrent_min_batch, 5);
    assert!(stats.concurrent_enabled);
    assert_eq!(stats.serial_drains + stats.parallel_drains, 0);

    engine.config_mut().isolate_threshold = 64;
    engine.config_mut().concurrent_enabled = false;
    let stats = engine.stats();
    assert_eq!(stats.isolate_threshold, 64);
    assert!(!stats.concurrent_enabled);
}
