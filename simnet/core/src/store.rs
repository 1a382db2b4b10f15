use std::collections::VecDeque;

use crate::envelope::Envelope;
use crate::errors::{SimError, SimResult};

/// Fixed window covered by one [`Slot`], aligned to
/// `start_time - start_time mod SLOT_DURATION_MS`.
pub const SLOT_DURATION_MS: u64 = 60_000;

/// One ms-in-the-chain link. Envelopes landing in the same millisecond are
/// prepended (LIFO) — acceptable because order within a single ms is not
/// observable across components, but it must stay reproducible, so we never
/// reorder on pop.
struct ChainNode {
    envelope: Envelope,
    next: Option<Box<ChainNode>>,
}

struct Slot {
    start_time: u64,
    end_time: u64,
    heads: Vec<Option<Box<ChainNode>>>,
}

impl Slot {
    fn covering(start_time: u64) -> Self {
        Self { start_time, end_time: start_time + SLOT_DURATION_MS, heads: (0..SLOT_DURATION_MS).map(|_| None).collect() }
    }

    fn ms_index(&self, t: u64) -> usize {
        (t - self.start_time) as usize
    }

    fn covers(&self, t: u64) -> bool {
        t >= self.start_time && t < self.end_time
    }
}

/// Time-bucketed envelope queue. Optimized for "many events in the same
/// millisecond, bounded total horizon": a vector of 60-second slots, each
/// holding one ms-indexed array of chain heads.
pub struct MessageStore {
    slots: VecDeque<Slot>,
}

impl MessageStore {
    pub fn new(start_time: u64) -> Self {
        let aligned = start_time - start_time % SLOT_DURATION_MS;
        Self { slots: VecDeque::from([Slot::covering(aligned)]) }
    }

    /// Appends slots until one covers `t`.
    pub fn ensure_size(&mut self, t: u64) {
        while !self.slots.back().is_some_and(|s| t < s.end_time) {
            let next_start = self.slots.back().map_or(t - t % SLOT_DURATION_MS, |s| s.end_time);
            self.slots.push_back(Slot::covering(next_start));
        }
    }

    fn slot_index(&self, t: u64) -> Option<usize> {
        self.slots.iter().position(|s| s.covers(t))
    }

    /// Enqueues `env` for its current (nearest) destination. Fails if that
    /// arrival is strictly before `now`.
    pub fn add_msg(&mut self, env: Envelope, now: u64) -> SimResult<()> {
        let arrival = env.next_arrival_time().expect("envelope added to the store must have a pending destination");
        if arrival < now {
            return Err(SimError::ScheduleInPast { arrive_at: arrival, now });
        }
        self.ensure_size(arrival);
        let idx = self.slot_index(arrival).expect("ensure_size guarantees a covering slot");
        let ms = self.slots[idx].ms_index(arrival);
        let old_head = self.slots[idx].heads[ms].take();
        self.slots[idx].heads[ms] = Some(Box::new(ChainNode { envelope: env, next: old_head }));
        Ok(())
    }

    /// Removes and returns the chain head scheduled at exactly `t`, or
    /// `None` if nothing is due then.
    pub fn poll(&mut self, t: u64) -> Option<Envelope> {
        let idx = self.slot_index(t)?;
        let ms = self.slots[idx].ms_index(t);
        let node = self.slots[idx].heads[ms].take()?;
        self.slots[idx].heads[ms] = node.next;
        Some(node.envelope)
    }

    pub fn peek(&self, t: u64) -> Option<&Envelope> {
        let idx = self.slot_index(t)?;
        let ms = self.slots[idx].ms_index(t);
        self.slots[idx].heads[ms].as_ref().map(|n| &n.envelope)
    }

    pub fn is_empty_at(&self, t: u64) -> bool {
        self.peek(t).is_none()
    }

    /// Drops any leading slot whose window has fully elapsed, keeping at
    /// least one slot covering `now`.
    pub fn cleanup(&mut self, now: u64) {
        while self.slots.front().is_some_and(|s| s.end_time <= now) {
            self.slots.pop_front();
        }
        if !self.slots.iter().any(|s| s.covers(now)) {
            let start = now - now % SLOT_DURATION_MS;
            self.slots.push_front(Slot::covering(start));
        }
    }

    /// Empties the store and re-seeds it with a single slot at `now`.
    pub fn clear(&mut self, now: u64) {
        self.slots.clear();
        let start = now - now % SLOT_DURATION_MS;
        self.slots.push_back(Slot::covering(start));
    }
}
