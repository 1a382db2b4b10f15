use std::sync::Arc;

use smallvec::SmallVec;

use crate::message::Message;
use crate::node::NodeId;

/// One (destination, arrival-time) pair within an [`Envelope`].
#[derive(Clone, Copy, Debug)]
pub struct Destination {
    pub node: NodeId,
    pub arrival: u64,
}

/// The store's unit of work: a payload plus one or more destinations,
/// sorted by arrival, with a cursor tracking how many have been delivered.
///
/// Chaining envelopes that arrive at the same millisecond (§4.2's
/// "singly-linked `nextSameTime`") is handled by [`crate::store::MessageStore`]
/// itself via an intrusive `Box` chain, so `Envelope` does not need a
/// next-pointer of its own.
pub struct Envelope {
    pub payload: Arc<dyn Message>,
    pub from: NodeId,
    destinations: SmallVec<[Destination; 4]>,
    next_reader: usize,
}

impl Envelope {
    pub fn new(payload: Arc<dyn Message>, from: NodeId, mut destinations: SmallVec<[Destination; 4]>) -> Self {
        destinations.sort_by_key(|d| d.arrival);
        Self { payload, from, destinations, next_reader: 0 }
    }

    /// The destination this envelope is currently scheduled to reach.
    /// `None` once every destination has been delivered.
    pub fn current_destination(&self) -> Option<Destination> {
        self.destinations.get(self.next_reader).copied()
    }

    pub fn next_arrival_time(&self) -> Option<u64> {
        self.current_destination().map(|d| d.arrival)
    }

    /// Marks the current destination as delivered. Returns `true` if more
    /// destinations remain (the envelope must be re-enqueued).
    pub fn advance(&mut self) -> bool {
        self.next_reader += 1;
        self.next_reader < self.destinations.len()
    }
}
