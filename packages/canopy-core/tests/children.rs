mod common;

use canopy_core::{Effect, Engine, PropValue, VNode, ViewId};
use common::{RecordingBridge, keyed_text, props, text, view};

#[test]
fn prop_only_change_emits_a_single_update() {
    let mut engine = Engine::new(RecordingBridge::new());
    let old = VNode::element(
        "Text",
        props(&[("content", "a".into()), ("fontSize", 14.into())]),
        vec![],
    );
    let new = VNode::element(
        "Text",
        props(&[("content", "b".into()), ("fontSize", 14.into())]),
        vec![],
    );
    engine.render(old).unwrap();
    engine.bridge_mut().clear();

    engine.render(new).unwrap();

    let bridge = engine.bridge();
    assert_eq!(
        bridge.commands,
        vec![Effect::UpdateView {
            id: ViewId(1),
            changed: props(&[("content", "b".into())]),
        }]
    );
}

#[test]
fn removed_prop_is_sent_as_null() {
    let mut engine = Engine::new(RecordingBridge::new());
    engine
        .render(VNode::element(
            "Text",
            props(&[("content", "a".into()), ("opacity", PropValue::Float(0.5))]),
            vec![],
        ))
        .unwrap();
    engine.bridge_mut().clear();

    engine
        .render(VNode::element(
            "Text",
            props(&[("content", "a".into())]),
            vec![],
        ))
        .unwrap();

    let bridge = engine.bridge();
    assert_eq!(
        bridge.commands,
        vec![Effect::UpdateView {
            id: ViewId(1),
            changed: props(&[("opacity", PropValue::Null)]),
        }]
    );
}

#[test]
fn keyed_reorder_is_one_set_children() {
    let mut engine = Engine::new(RecordingBridge::new());
    engine
        .render(view(vec![
            keyed_text("x", "a"),
            keyed_text("y", "b"),
            keyed_text("z", "c"),
        ]))
        .unwrap();
    engine.bridge_mut().clear();

    engine
        .render(view(vec![
            keyed_text("z", "c"),
            keyed_text("x", "a"),
            keyed_text("y", "b"),
        ]))
        .unwrap();

    let bridge = engine.bridge();
    assert_eq!(
        bridge.commands,
        vec![Effect::SetChildren {
            parent: ViewId(1),
            children: vec![ViewId(4), ViewId(2), ViewId(3)],
        }]
    );
    engine.verify_tree();
}

#[test]
fn keyed_insertion_mounts_only_the_newcomer() {
    let mut engine = Engine::new(RecordingBridge::new());
    engine
        .render(view(vec![keyed_text("x", "a"), keyed_text("y", "b")]))
        .unwrap();
    engine.bridge_mut().clear();

    engine
        .render(view(vec![
            keyed_text("x", "a"),
            keyed_text("w", "new"),
            keyed_text("y", "b"),
        ]))
        .unwrap();

    let bridge = engine.bridge();
    assert_eq!(bridge.count("create_view"), 1);
    assert_eq!(bridge.count("delete_view"), 0);
    assert_eq!(bridge.count("update_view"), 0);
    assert_eq!(bridge.count("set_children"), 1);
}

#[test]
fn keyed_removal_unmounts_only_the_dropped_child() {
    let mut engine = Engine::new(RecordingBridge::new());
    engine
        .render(view(vec![
            keyed_text("x", "a"),
            keyed_text("y", "b"),
            keyed_text("z", "c"),
        ]))
        .unwrap();
    engine.bridge_mut().clear();

    engine
        .render(view(vec![keyed_text("x", "a"), keyed_text("z", "c")]))
        .unwrap();

    let bridge = engine.bridge();
    assert_eq!(bridge.count("delete_view"), 1);
    assert_eq!(bridge.count("create_view"), 0);
    assert_eq!(
        bridge.commands.last(),
        Some(&Effect::SetChildren {
            parent: ViewId(1),
            children: vec![ViewId(2), ViewId(4)],
        })
    );
}

#[test]
fn positional_insertion_within_the_window() {
    let mut engine = Engine::new(RecordingBridge::new());
    engine.render(view(vec![text("a"), text("b")])).unwrap();
    engine.bridge_mut().clear();

    engine
        .render(view(vec![
            text("a"),
            VNode::element("Image", props(&[("src", "pic.png".into())]), vec![]),
            text("b"),
        ]))
        .unwrap();

    let bridge = engine.bridge();
    assert_eq!(bridge.count("create_view"), 1);
    assert_eq!(bridge.count("delete_view"), 0);
    assert_eq!(bridge.count("update_view"), 0);
    // Flanking siblings keep their views; the Image lands between them.
    assert_eq!(
        bridge.commands.last(),
        Some(&Effect::SetChildren {
            parent: ViewId(1),
            children: vec![ViewId(2), ViewId(4), ViewId(3)],
        })
    );
    engine.verify_tree();
}

#[test]
fn positional_removal_within_the_window() {
    let mut engine = Engine::new(RecordingBridge::new());
    engine
        .render(view(vec![
            text("a"),
            VNode::element("Image", props(&[("src", "pic.png".into())]), vec![]),
            text("b"),
        ]))
        .unwrap();
    engine.bridge_mut().clear();

    engine.render(view(vec![text("a"), text("b")])).unwrap();

    let bridge = engine.bridge();
    assert_eq!(bridge.count("delete_view"), 1);
    assert_eq!(bridge.count("create_view"), 0);
    assert_eq!(bridge.count("update_view"), 0);
    assert_eq!(
        bridge.commands.last(),
        Some(&Effect::SetChildren {
            parent: ViewId(1),
            children: vec![ViewId(2), ViewId(4)],
        })
    );
}

#[test]
fn structural_shock_replaces_the_child_set() {
    let mut engine = Engine::new(RecordingBridge::new());
    let many: Vec<VNode> = (0..8).map(|i| text(&format!("row {i}"))).collect();
    engine.render(view(many)).unwrap();
    engine.bridge_mut().clear();

    engine.render(view(vec![text("only"), text("two")])).unwrap();

    let bridge = engine.bridge();
    assert_eq!(bridge.count("delete_view"), 8);
    assert_eq!(bridge.count("create_view"), 2);
    assert_eq!(bridge.count("update_view"), 0);

    // Every delete precedes every create.
    let first_create = bridge
        .commands
        .iter()
        .position(|c| matches!(c, Effect::CreateView { .. }))
        .unwrap();
    let last_delete = bridge
        .commands
        .iter()
        .rposition(|c| matches!(c, Effect::DeleteView { .. }))
        .unwrap();
    assert!(last_delete < first_create);
    engine.verify_tree();
}

#[test]
fn small_count_drift_does_not_shock() {
    let mut engine = Engine::new(RecordingBridge::new());
    let many: Vec<VNode> = (0..8).map(|i| text(&format!("row {i}"))).collect();
    engine.render(view(many)).unwrap();
    engine.bridge_mut().clear();

    let fewer: Vec<VNode> = (0..6).map(|i| text(&format!("row {i}"))).collect();
    engine.render(view(fewer)).unwrap();

    let bridge = engine.bridge();
    // Two trailing children unmount; the six survivors are untouched.
    assert_eq!(bridge.count("delete_view"), 2);
    assert_eq!(bridge.count("create_view"), 0);
    assert_eq!(bridge.count("update_view"), 0);
}

#[test]
fn duplicate_keys_fall_back_to_positional_matching() {
    let mut engine = Engine::new(RecordingBridge::new());
    engine
        .render(view(vec![keyed_text("x", "a"), keyed_text("x", "b")]))
        .unwrap();
    engine.bridge_mut().clear();

    engine
        .render(view(vec![keyed_text("x", "a2"), keyed_text("x", "b2")]))
        .unwrap();

    let bridge = engine.bridge();
    // Positional fallback pairs them in order: two updates, no churn.
    assert_eq!(bridge.count("update_view"), 2);
    assert_eq!(bridge.count("create_view"), 0);
    assert_eq!(bridge.count("delete_view"), 0);
}

#[test]
fn emptying_an_element_sends_an_empty_child_list() {
    let mut engine = Engine::new(RecordingBridge::new());
    engine.render(view(vec![text("a")])).unwrap();
    engine.bridge_mut().clear();

    engine.render(view(vec![])).unwrap();

    let bridge = engine.bridge();
    assert_eq!(
        bridge.commands,
        vec![
            Effect::DeleteView { id: ViewId(2) },
            Effect::SetChildren {
                parent: ViewId(1),
                children: vec![],
            },
        ]
    );
}
