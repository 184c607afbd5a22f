//! Usage ledger for Quarry.
//!
//! Records every inbound request, hit or miss, with attributed cost.
//! Recording is fire-and-forget: the serving path must never block on or
//! fail because of ledger delivery.

pub mod cost;
pub mod recorder;
pub mod sink;

pub use cost::CostModel;
pub use recorder::{LedgerHandle, UsageRecorder};
pub use sink::MemoryUsageSink;
