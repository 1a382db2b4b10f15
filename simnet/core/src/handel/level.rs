use std::collections::HashMap;

use crate::bitset::BitSet;
use crate::node::NodeId;

/// One aggregation level: a peer group whose combined contribution this
/// node needs before it can safely widen to the next (larger) group.
/// `cursor` walks `peers` round-robin, one contact per `doCycle`.
pub(super) struct Level {
    pub(super) peers: Vec<NodeId>,
    pub(super) cursor: usize,
    pub(super) incoming: BitSet,
    pub(super) opened: bool,
    pub(super) completed: bool,
    /// Suppresses resending an aggregate a peer has already seen — the
    /// message-suppression invariant: `doCycle` never re-sends the same
    /// bitset to the same peer twice in a row.
    pub(super) last_sent: HashMap<NodeId, BitSet>,
    /// Bits belonging to this level's peer group, fixed at construction.
    /// A peer's reported aggregate is masked against this before it is
    /// merged into `incoming`, since a peer that has already closed this
    /// level carries signers from beyond the group in its running `best`.
    pub(super) peer_mask: BitSet,
}

impl Level {
    pub(super) fn new(peers: Vec<NodeId>) -> Self {
        let peer_mask = peers.iter().map(|p| p.0).collect();
        Self { peers, cursor: 0, incoming: BitSet::empty(), opened: false, completed: false, last_sent: HashMap::new(), peer_mask }
    }

    pub(super) fn full_size(&self) -> u32 {
        self.peers.len() as u32
    }

    pub(super) fn next_peer(&mut self) -> Option<NodeId> {
        if self.peers.is_empty() {
            return None;
        }
        let peer = self.peers[self.cursor % self.peers.len()];
        self.cursor += 1;
        Some(peer)
    }
}

/// Per-node Handel state: one [`Level`] per level `1..=L`, the running
/// `best` aggregate (own signature union every completed level's
/// contribution), and a queue of not-yet-verified incoming aggregates
/// awaiting `bestToVerify` selection.
pub(super) struct NodeState {
    pub(super) binary_id: u32,
    pub(super) levels: Vec<Level>,
    pub(super) best: BitSet,
    /// `(level index, sender, aggregate)` triples awaiting verification.
    pub(super) to_verify: Vec<(u32, NodeId, BitSet)>,
    pub(super) threshold_at: Option<u64>,
    pub(super) done_at: Option<u64>,
    pub(super) done: bool,
    pub(super) sent_requests: u64,
    pub(super) received_requests: u64,
    pub(super) verifications: u64,
}

impl NodeState {
    pub(super) fn new(binary_id: u32, levels: Vec<Level>) -> Self {
        Self {
            binary_id,
            levels,
            best: BitSet::singleton(binary_id),
            to_verify: Vec::new(),
            threshold_at: None,
            done_at: None,
            done: false,
            sent_requests: 0,
            received_requests: 0,
            verifications: 0,
        }
    }
}

/// Builds the `L` peer groups for `id` over an `l`-bit id space: level `i`
/// (1-indexed) pairs `id` with everyone sharing the top `l - i` bits and
/// differing at bit `l - i`, the same prefix relation San Fermín uses for
/// its single candidate at a given depth — Handel just keeps the whole
/// group as peers instead of picking one.
pub(super) fn peer_groups(id: u32, l: u32) -> Vec<Vec<NodeId>> {
    (1..=l)
        .map(|level| {
            let k = l - level;
            (0..(1u32 << l))
                .filter(|&b| crate::idspace::prefix_peer(id, b, l, k))
                .map(NodeId)
                .collect()
        })
        .collect()
}
