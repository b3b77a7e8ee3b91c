use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::{Rc, Weak};

use crate::kind::Timestamp;
use crate::node::ErasedNode;
use crate::state::{IncrStatus, State};
use crate::WeakNode;

/// A manually-advanced clock driving the time-based node kinds.
///
/// The clock holds `now` and a queue of alarms; [Clock::advance_to] moves
/// `now` forward and fires every alarm that falls due, which makes the
/// corresponding leaf node stale again (and schedules any follow-up alarm).
/// There is deliberately no timing wheel here; a binary heap is plenty for
/// the alarm volumes a hand-advanced clock sees.
pub(crate) struct Clock {
    pub(crate) state: Weak<State>,
    now: Cell<Timestamp>,
    alarms: RefCell<BinaryHeap<Alarm>>,
    next_seq: Cell<u64>,
}

struct Alarm {
    at: Timestamp,
    /// Insertion order; keeps simultaneous alarms firing in schedule order.
    seq: u64,
    node: WeakNode,
}

// BinaryHeap is a max-heap, so the ordering is reversed to pop the earliest
// alarm first.
impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Alarm {}

impl Clock {
    pub(crate) fn new(state: Weak<State>, start: Timestamp) -> Rc<Clock> {
        Rc::new(Clock {
            state,
            now: Cell::new(start),
            alarms: RefCell::new(BinaryHeap::new()),
            next_seq: Cell::new(0),
        })
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.now.get()
    }

    pub(crate) fn schedule(&self, at: Timestamp, node: WeakNode) {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        self.alarms.borrow_mut().push(Alarm { at, seq, node });
    }

    pub(crate) fn advance_to(&self, to: Timestamp) {
        let t = self
            .state
            .upgrade()
            .expect("advanced a clock whose state has been dropped");
        if t.status.get() != IncrStatus::NotStabilising {
            panic!("the clock can only be advanced between stabilisations");
        }
        if to <= self.now.get() {
            return;
        }
        self.now.set(to);
        loop {
            let due = {
                let alarms = self.alarms.borrow();
                matches!(alarms.peek(), Some(alarm) if alarm.at <= to)
            };
            if !due {
                break;
            }
            let alarm = self.alarms.borrow_mut().pop().unwrap();
            // Firing may schedule the next alarm (intervals, step functions),
            // so the queue must not be borrowed across this call.
            if let Some(node) = alarm.node.upgrade() {
                tracing::debug!("alarm fired at {:?} for node {:?}", alarm.at, node.id());
                node.alarm_fired(&t);
            }
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("now", &self.now.get())
            .field("pending_alarms", &self.alarms.borrow().len())
            .finish()
    }
}
