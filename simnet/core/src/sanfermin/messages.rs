use std::sync::Arc;

use crate::bitset::BitSet;
use crate::kernel::Network;
use crate::message::Message;
use crate::node::NodeId;

use super::Shared;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapStatus {
    Ok,
    No,
}

/// "I'm at `level` with this partial aggregate, will you swap with me?"
pub(super) struct SwapRequest {
    pub(super) level: u32,
    pub(super) agg: BitSet,
    pub(super) shared: Arc<Shared>,
}

impl Message for SwapRequest {
    fn size(&self) -> u32 {
        self.shared.params.signature_size_bytes
    }

    fn action(&self, net: &mut Network, from: NodeId, to: NodeId) {
        self.shared.clone().handle_swap_request(net, from, to, self.level, self.agg.clone());
    }
}

/// Reply to a [`SwapRequest`]: `Ok` carries a usable aggregate (either the
/// result of a committed swap or a cached value from a level the replier
/// already passed); `No` means "try someone else".
pub(super) struct SwapReply {
    pub(super) status: SwapStatus,
    pub(super) level: u32,
    pub(super) agg: BitSet,
    pub(super) shared: Arc<Shared>,
}

impl Message for SwapReply {
    fn size(&self) -> u32 {
        self.shared.params.signature_size_bytes
    }

    fn action(&self, net: &mut Network, from: NodeId, to: NodeId) {
        self.shared.clone().handle_swap_reply(net, from, to, self.status, self.level, self.agg.clone());
    }
}
