use std::sync::Arc;

use crate::bitset::BitSet;
use crate::kernel::Network;
use crate::message::Message;
use crate::node::NodeId;

use super::Shared;

/// "Here's my best aggregate for your level." Handel has no reply: contact
/// is one-directional and periodic, driven entirely by each node's own
/// `doCycle`, with the message-suppression invariant keeping a steady
/// connection from flooding peers with unchanged data.
pub(super) struct SendAggregation {
    pub(super) level: u32,
    pub(super) agg: BitSet,
    pub(super) shared: Arc<Shared>,
}

impl Message for SendAggregation {
    fn size(&self) -> u32 {
        self.shared.params.signature_size_bytes
    }

    fn action(&self, net: &mut Network, from: NodeId, to: NodeId) {
        self.shared.clone().on_receive(net, from, to, self.level, self.agg.clone());
    }
}
