use std::collections::{HashMap, HashSet};

use crate::bitset::BitSet;
use crate::node::NodeId;

/// Per-node San Fermín state machine record. `currentPrefixLength` doubles
/// as "which level we're currently trying to swap at" — see `enter_level`
/// in `sanfermin/mod.rs` for the transition logic that owns this field.
///
/// The aggregate is a [`BitSet`] of contributing signer ids rather than a
/// raw count: merging is a set union, which is idempotent, so a stale or
/// duplicate optimistic reply can never inflate the aggregate above the
/// true signer count.
#[derive(Debug)]
pub(super) struct NodeState {
    pub(super) binary_id: u32,
    pub(super) current_prefix_length: u32,
    pub(super) agg: BitSet,
    pub(super) is_swapping: bool,
    /// Our own aggregate snapshotted on entering each level, so a peer
    /// reaching a level we've already passed can still get a useful reply.
    pub(super) signature_cache: HashMap<u32, BitSet>,
    /// Values that arrived for a level we haven't reached yet, consumed by
    /// `enter_level`'s tail recursion once we get there.
    pub(super) future_sigs: HashMap<u32, BitSet>,
    pub(super) pending_nodes: HashSet<NodeId>,
    pub(super) used_candidates: HashMap<u32, HashSet<NodeId>>,
    pub(super) threshold_at: Option<u64>,
    pub(super) done_at: Option<u64>,
    pub(super) done: bool,
    pub(super) sent_requests: u64,
    pub(super) received_requests: u64,
}

impl NodeState {
    pub(super) fn new(binary_id: u32) -> Self {
        Self {
            binary_id,
            current_prefix_length: u32::MAX,
            agg: BitSet::singleton(binary_id),
            is_swapping: false,
            signature_cache: HashMap::new(),
            future_sigs: HashMap::new(),
            pending_nodes: HashSet::new(),
            used_candidates: HashMap::new(),
            threshold_at: None,
            done_at: None,
            done: false,
            sent_requests: 0,
            received_requests: 0,
        }
    }
}

/// A node is a candidate for `self` at level `k` iff they share the
/// binary-prefix relation at that depth — see `crate::idspace::prefix_peer`.
pub(super) fn is_candidate_at(a: u32, b: u32, l: u32, k: u32) -> bool {
    crate::idspace::prefix_peer(a, b, l, k)
}
