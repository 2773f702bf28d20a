//! Thread-safe FIFO of debug events.
//!
//! Events are delivered in enqueue order with one exception: TRACE_FULL is
//! pushed to the front so the client observes buffer overflow before any
//! tail events still arriving from other threads.

use crate::event::DebugEvent;
use std::collections::VecDeque;
use std::sync::Mutex;

struct QueueInner {
    queue: VecDeque<DebugEvent>,
    last_retrieved_ev: DebugEvent,
}

pub struct EvQueue {
    inner: Mutex<QueueInner>,
}

impl EvQueue {
    pub fn new() -> EvQueue {
        EvQueue {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                last_retrieved_ev: DebugEvent::default(),
            }),
        }
    }

    pub fn push_back(&self, ev: DebugEvent) {
        self.add_ev(ev, false);
    }

    pub fn push_front(&self, ev: DebugEvent) {
        self.add_ev(ev, true);
    }

    /// Pop the oldest event, remembering it as the last retrieved one so
    /// RESUME acknowledgments can be checked against it.
    pub fn pop_front(&self) -> Option<DebugEvent> {
        let mut q = self.inner.lock().unwrap();
        let ev = q.queue.pop_front()?;
        q.last_retrieved_ev = ev.clone();
        Some(ev)
    }

    /// The newest event still in the queue, if any.
    pub fn back(&self) -> Option<DebugEvent> {
        let q = self.inner.lock().unwrap();
        q.queue.back().cloned()
    }

    /// The most recently popped event (NO_EVENT before the first pop).
    pub fn last_ev(&self) -> DebugEvent {
        let q = self.inner.lock().unwrap();
        q.last_retrieved_ev.clone()
    }

    pub fn size(&self) -> usize {
        let q = self.inner.lock().unwrap();
        q.queue.len()
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    fn add_ev(&self, ev: DebugEvent, front: bool) {
        debug_msg!(3, "ev_queue: add event {:x}", ev.eid as u32);
        let mut q = self.inner.lock().unwrap();
        if front {
            q.queue.push_front(ev);
        } else {
            q.queue.push_back(ev);
        }
    }
}

impl Default for EvQueue {
    fn default() -> EvQueue {
        EvQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventId;

    fn ev(eid: EventId, ea: u64) -> DebugEvent {
        let mut e = DebugEvent::new(eid);
        e.ea = ea;
        e
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = EvQueue::new();
        q.push_back(ev(EventId::ProcessStart, 1));
        q.push_back(ev(EventId::Breakpoint, 2));
        q.push_back(ev(EventId::Step, 3));
        assert_eq!(q.size(), 3);
        assert_eq!(q.pop_front().unwrap().ea, 1);
        assert_eq!(q.pop_front().unwrap().ea, 2);
        assert_eq!(q.pop_front().unwrap().ea, 3);
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn trace_full_jumps_the_queue() {
        let q = EvQueue::new();
        q.push_back(ev(EventId::Breakpoint, 1));
        q.push_back(ev(EventId::Step, 2));
        q.push_front(ev(EventId::TraceFull, 0));
        let first = q.pop_front().unwrap();
        assert_eq!(first.eid, EventId::TraceFull);
        assert_eq!(q.pop_front().unwrap().ea, 1);
        assert_eq!(q.pop_front().unwrap().ea, 2);
    }

    #[test]
    fn last_ev_tracks_pops_not_pushes() {
        let q = EvQueue::new();
        assert_eq!(q.last_ev().eid, EventId::NoEvent);
        q.push_back(ev(EventId::Exception, 5));
        assert_eq!(q.last_ev().eid, EventId::NoEvent);
        q.pop_front();
        assert_eq!(q.last_ev().eid, EventId::Exception);
    }

    #[test]
    fn back_peeks_without_removing() {
        let q = EvQueue::new();
        assert!(q.back().is_none());
        q.push_back(ev(EventId::Breakpoint, 7));
        q.push_back(ev(EventId::Step, 8));
        assert_eq!(q.back().unwrap().ea, 8);
        assert_eq!(q.size(), 2);
    }
}
