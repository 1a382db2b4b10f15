//! A discrete-event, virtual-time simulator for distributed protocols: a
//! San Fermín-style binomial-swap signature aggregator and a Handel-style
//! multi-level aggregator, driven by a deterministic event kernel.
//!
//! There is no wall clock here. A single [`kernel::Network`] owns the
//! current virtual time, a time-bucketed message store, a partition list
//! and the RNG that makes every run reproducible from its seed; protocols
//! are built entirely on top of its public contract (`send`,
//! `register_task`, `run_ms`, ...).

pub mod bitset;
pub mod envelope;
pub mod errors;
pub(crate) mod idspace;
pub mod kernel;
pub mod latency;
pub mod message;
pub mod node;
pub mod partition;
pub mod protocol;
pub mod scenario;
pub mod store;

pub mod handel;
pub mod sanfermin;

pub use bitset::BitSet;
pub use errors::{SimError, SimResult};
pub use kernel::Network;
pub use latency::LatencyModel;
pub use message::{Message, Task};
pub use node::{Node, NodeId};
pub use protocol::Protocol;
pub use scenario::{run_scenario, ScenarioReport, StatsCollector};

pub use handel::{HandelParams, HandelProtocol, HandelSnapshot};
pub use sanfermin::{SanFerminParams, SanFerminProtocol, SanFerminSnapshot};
