use canopy_scheduler::{ComponentId, Priority, UpdateQueue};
use std::time::{Duration, Instant};

#[test]
fn first_arrival_arms_the_timer_at_its_delay() {
    let mut queue = UpdateQueue::new();
    let now = Instant::now();

    assert!(queue.enqueue(ComponentId(1), Priority::Normal, now));
    assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(2)));
    assert_eq!(queue.armed_basis(), Some(Priority::Normal));
}

#[test]
fn more_urgent_arrival_preempts_the_armed_timer() {
    let mut queue = UpdateQueue::new();
    let now = Instant::now();

    queue.enqueue(ComponentId(1), Priority::Normal, now);

    // An immediate update arrives 1ms later: the 2ms timer is canceled and
    // rearmed at the immediate delay (0ms from its arrival).
    let later = now + Duration::from_millis(1);
    assert!(queue.enqueue(ComponentId(2), Priority::Immediate, later));
    assert_eq!(queue.next_deadline(), Some(later));
    assert_eq!(queue.armed_basis(), Some(Priority::Immediate));
    assert!(queue.is_due(later));
}

#[test]
fn less_urgent_arrival_does_not_touch_the_timer() {
    let mut queue = UpdateQueue::new();
    let now = Instant::now();

    queue.enqueue(ComponentId(1), Priority::High, now);
    let deadline = queue.next_deadline().unwrap();

    assert!(!queue.enqueue(ComponentId(2), Priority::Idle, now));
    assert_eq!(queue.next_deadline(), Some(deadline));
    assert_eq!(queue.armed_basis(), Some(Priority::High));
}

#[test]
fn equal_urgency_does_not_rearm() {
    let mut queue = UpdateQueue::new();
    let now = Instant::now();

    queue.enqueue(ComponentId(1), Priority::Normal, now);
    let deadline = queue.next_deadline().unwrap();

    // Strictly-higher only: a same-class arrival keeps the earlier deadline.
    let later = now + Duration::from_millis(1);
    assert!(!queue.enqueue(ComponentId(2), Priority::Normal, later));
    assert_eq!(queue.next_deadline(), Some(deadline));
}
