//! One-shot and repeating timers for the runtime loop.
//!
//! Entries live in a slab; due times go into a min-heap of
//! `(deadline, slot, epoch)` triples. Cancelling or re-arming a timer bumps
//! its epoch, so stale heap items are recognized and discarded when popped
//! instead of being dug out of the heap.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use slab::Slab;

use crate::runtime::Runtime;

pub type TimerFn = Rc<dyn Fn(&mut Runtime)>;

/// Identifies a live timer. Stale ids (after [`Runtime::cancel_timer`]) are
/// ignored by every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    slot: usize,
    token: u64,
}

struct Entry {
    token: u64,
    epoch: u64,
    deadline: Instant,
    after: Duration,
    period: Option<Duration>,
    cb: TimerFn,
}

pub(crate) struct Timers {
    entries: Slab<Entry>,
    heap: BinaryHeap<Reverse<(Instant, usize, u64)>>,
    next_token: u64,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Timers {
            entries: Slab::new(),
            heap: BinaryHeap::new(),
            next_token: 1,
        }
    }

    pub(crate) fn insert(
        &mut self,
        after: Duration,
        period: Option<Duration>,
        cb: TimerFn,
    ) -> TimerId {
        let token = self.next_token;
        let epoch = self.next_token + 1;
        self.next_token += 2;

        let deadline = Instant::now() + after;
        let slot = self.entries.insert(Entry {
            token,
            epoch,
            deadline,
            after,
            period,
            cb,
        });

        self.heap.push(Reverse((deadline, slot, epoch)));
        TimerId { slot, token }
    }

    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        match self.entries.get(id.slot) {
            Some(entry) if entry.token == id.token => {
                self.entries.remove(id.slot);
                true
            }
            _ => false,
        }
    }

    /// Re-arms the timer as if it had just been inserted: one-shot timers
    /// fire `after` from now, repeating timers a full period from now.
    pub(crate) fn restart(&mut self, id: TimerId) -> bool {
        let epoch = self.next_token;

        match self.entries.get_mut(id.slot) {
            Some(entry) if entry.token == id.token => {
                self.next_token += 1;
                entry.epoch = epoch;
                entry.deadline = Instant::now() + entry.period.unwrap_or(entry.after);
                let deadline = entry.deadline;
                self.heap.push(Reverse((deadline, id.slot, epoch)));
                true
            }
            _ => false,
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .iter()
            .map(|(_, entry)| entry.deadline)
            .min()
    }

    /// Pops one due timer, rescheduling it first if it repeats, and returns
    /// its callback for the loop to invoke.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<TimerFn> {
        loop {
            let &Reverse((deadline, slot, epoch)) = self.heap.peek()?;

            if deadline > now {
                return None;
            }

            self.heap.pop();

            let live = matches!(self.entries.get(slot), Some(entry) if entry.epoch == epoch);

            if !live {
                continue;
            }

            let entry = &mut self.entries[slot];

            if let Some(period) = entry.period {
                entry.deadline = now + period;
                let deadline = entry.deadline;
                self.heap.push(Reverse((deadline, slot, epoch)));
                return Some(entry.cb.clone());
            }

            let entry = self.entries.remove(slot);
            return Some(entry.cb);
        }
    }
}

impl Runtime {
    /// Schedules `cb` to run once, `after` from now.
    pub fn add_timer(&mut self, after: Duration, cb: impl Fn(&mut Runtime) + 'static) -> TimerId {
        self.timers.insert(after, None, Rc::new(cb))
    }

    /// Schedules `cb` to run every `period`, first firing one period from
    /// now.
    pub fn add_repeating(
        &mut self,
        period: Duration,
        cb: impl Fn(&mut Runtime) + 'static,
    ) -> TimerId {
        self.timers.insert(period, Some(period), Rc::new(cb))
    }

    /// Pushes the timer's next fire time out to a full interval from now.
    pub fn restart_timer(&mut self, id: TimerId) -> bool {
        self.timers.restart(id)
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }
}
