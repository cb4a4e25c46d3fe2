// LININOIO ETHERD — TIMER QUEUE
// One-shot expiring timers for the alive supervisor. Slot map with
// generations: cancel is explicit and synchronous, and a handle that was
// cancelled (or already fired) is inert, so a teardown racing its own alive
// timer cannot fire twice. Capacity tracks the node pool, so a linear scan
// over a handful of slots beats a heap here.

use std::time::{Duration, Instant};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerHandle {
    slot: usize,
    gen: u64,
}

struct TimerSlot<T> {
    gen: u64,
    deadline: Instant,
    data: Option<T>,
}

pub struct TimerQueue<T> {
    slots: Vec<TimerSlot<T>>,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        TimerQueue { slots: Vec::new() }
    }

    /// Arm a one-shot timer `after` from `now`.
    pub fn schedule(&mut self, now: Instant, after: Duration, data: T) -> TimerHandle {
        let deadline = now + after;
        for (slot, s) in self.slots.iter_mut().enumerate() {
            if s.data.is_none() {
                s.gen = s.gen.wrapping_add(1);
                s.deadline = deadline;
                s.data = Some(data);
                return TimerHandle { slot, gen: s.gen };
            }
        }
        self.slots.push(TimerSlot {
            gen: 0,
            deadline,
            data: Some(data),
        });
        TimerHandle {
            slot: self.slots.len() - 1,
            gen: 0,
        }
    }

    /// Disarm. Returns the payload if the timer was still pending.
    pub fn cancel(&mut self, h: TimerHandle) -> Option<T> {
        let s = self.slots.get_mut(h.slot)?;
        if s.gen != h.gen {
            return None;
        }
        s.data.take()
    }

    /// Earliest pending deadline, for the poll timeout computation.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter(|s| s.data.is_some())
            .map(|s| s.deadline)
            .min()
    }

    /// Pop one expired timer. Call until `None` to drain.
    pub fn pop_expired(&mut self, now: Instant) -> Option<T> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.data.is_some() && s.deadline <= now)?;
        self.slots[slot].data.take()
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn fires_after_deadline_only() {
        let t0 = Instant::now();
        let mut q = TimerQueue::new();
        q.schedule(t0, 10 * MS, "a");
        assert!(q.pop_expired(t0 + 9 * MS).is_none());
        assert_eq!(q.pop_expired(t0 + 10 * MS), Some("a"));
        assert!(q.pop_expired(t0 + 20 * MS).is_none()); // one-shot
    }

    #[test]
    fn cancel_makes_handle_inert() {
        let t0 = Instant::now();
        let mut q = TimerQueue::new();
        let h = q.schedule(t0, 5 * MS, 1u32);
        assert_eq!(q.cancel(h), Some(1));
        assert_eq!(q.cancel(h), None);
        assert!(q.pop_expired(t0 + 10 * MS).is_none());
    }

    #[test]
    fn slot_reuse_does_not_leak_old_handle() {
        let t0 = Instant::now();
        let mut q = TimerQueue::new();
        let h1 = q.schedule(t0, 5 * MS, 1u32);
        q.cancel(h1);
        let h2 = q.schedule(t0, 5 * MS, 2u32);
        // h1 reused the slot; cancelling it must not disarm h2.
        assert_eq!(q.cancel(h1), None);
        assert_eq!(q.cancel(h2), Some(2));
    }

    #[test]
    fn next_deadline_tracks_earliest() {
        let t0 = Instant::now();
        let mut q = TimerQueue::new();
        assert!(q.next_deadline().is_none());
        q.schedule(t0, 30 * MS, ());
        let h = q.schedule(t0, 10 * MS, ());
        assert_eq!(q.next_deadline(), Some(t0 + 10 * MS));
        q.cancel(h);
        assert_eq!(q.next_deadline(), Some(t0 + 30 * MS));
    }
}
