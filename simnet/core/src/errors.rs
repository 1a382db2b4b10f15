use crate::node::NodeId;

/// Errors originating from the event kernel, the message store and the
/// protocols built on top of them.
#[derive(thiserror::Error, Debug)]
pub enum SimError {
    #[error("node {0} already registered")]
    NodeAlreadyRegistered(NodeId),

    #[error("cannot schedule delivery at {arrive_at} at or before current time {now}")]
    ScheduleInPast { arrive_at: u64, now: u64 },

    #[error("latency model cannot change while {0} message(s) are in flight")]
    LatencyChangeWhileInFlight(usize),

    #[error("partition cut at {0} already present")]
    DuplicatePartition(f64),

    #[error("partition fraction {0} out of range [0, 1)")]
    PartitionOutOfRange(f64),

    #[error("non-task message must have size > 0")]
    ZeroSizeMessage,

    #[error("send() requires at least one destination")]
    EmptyDestinationList,

    #[error("round count must be > 0")]
    InvalidRoundCount,

    #[error("node count {0} is not a power of two")]
    NodeCountNotPowerOfTwo(u32),

    #[error("bitset cardinality invariant violated: {sum} exceeds peers_count {peers_count}")]
    CardinalityOverflow { sum: u32, peers_count: u32 },
}

/// Result type used throughout `simnet-core`.
pub type SimResult<T> = std::result::Result<T, SimError>;
