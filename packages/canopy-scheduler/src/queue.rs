use crate::Priority;
use rustc_hash::FxHashMap;
use std::time::Instant;

/// Stable identity of a mounted component instance across renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingUpdate {
    pub component: ComponentId,
    pub priority: Priority,
    /// Arrival order, used for stable ordering within a priority class.
    pub seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    deadline: Instant,
    basis: Priority,
}

/// The pending-update set.
///
/// Updates coalesce per component: a re-enqueue keeps the earliest arrival
/// order and the most urgent priority. A single timer is armed at the delay
/// of the most urgent pending entry; a strictly-more-urgent arrival cancels
/// and rearms it (interruption).
#[derive(Debug, Default)]
pub struct UpdateQueue {
    pending: FxHashMap<ComponentId, PendingUpdate>,
    armed: Option<ArmedTimer>,
    seq: u64,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an update request. Returns true when the timer was armed or
    /// rearmed by this arrival.
    pub fn enqueue(&mut self, component: ComponentId, priority: Priority, now: Instant) -> bool {
        let seq = self.seq;
        self.seq += 1;

        self.pending
            .entry(component)
            .and_modify(|entry| {
                if priority.is_more_urgent_than(entry.priority) {
                    entry.priority = priority;
                }
            })
            .or_insert(PendingUpdate {
                component,
                priority,
                seq,
            });

        match self.armed {
            None => {
                self.armed = Some(ArmedTimer {
                    deadline: now + priority.dispatch_delay(),
                    basis: priority,
                });
                true
            }
            Some(timer) if priority.is_more_urgent_than(timer.basis) => {
                tracing::debug!(
                    ?priority,
                    basis = ?timer.basis,
                    "preempting armed drain timer"
                );
                self.armed = Some(ArmedTimer {
                    deadline: now + priority.dispatch_delay(),
                    basis: priority,
                });
                true
            }
            Some(_) => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.map(|t| t.deadline)
    }

    pub fn armed_basis(&self) -> Option<Priority> {
        self.armed.map(|t| t.basis)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.armed.is_some_and(|t| now >= t.deadline)
    }

    /// Snapshot and clear the pending set for a drain.
    ///
    /// Entries come back sorted by priority class, arrival order within a
    /// class. Enqueues that happen while the snapshot is being processed
    /// land in the (now empty) pending set and wait for the next drain.
    pub fn snapshot(&mut self) -> Vec<PendingUpdate> {
        self.armed = None;
        let mut batch: Vec<PendingUpdate> = self.pending.drain().map(|(_, u)| u).collect();
        batch.sort_by_key(|u| (u.priority, u.seq));
        batch
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.armed = None;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_duplicate_components() {
        let mut queue = UpdateQueue::new();
        let now = Instant::now();
        queue.enqueue(ComponentId(1), Priority::Normal, now);
        queue.enqueue(ComponentId(1), Priority::Low, now);
        assert_eq!(queue.len(), 1);

        let batch = queue.snapshot();
        // The more urgent of the two priorities wins the coalesce.
        assert_eq!(batch[0].priority, Priority::Normal);
    }

    #[test]
    fn snapshot_clears_pending_and_timer() {
        let mut queue = UpdateQueue::new();
        let now = Instant::now();
        queue.enqueue(ComponentId(1), Priority::Normal, now);
        assert!(queue.next_deadline().is_some());

        let batch = queue.snapshot();
        assert_eq!(batch.len(), 1);
        assert!(queue.is_empty());
        assert!(queue.next_deadline().is_none());
    }
}
