//! Materialization graph and cascading refresher for Quarry.
//!
//! Derived aggregate tables are declared as nodes over raw sources and
//! other nodes; the refresher rebuilds them in dependency order, validates
//! each new version against an independent recomputation, and swaps it into
//! place atomically. Readers only ever see fully-old or fully-new versions.

pub mod engine;
pub mod graph;
pub mod journal;
pub mod refresher;
pub mod schedule;

pub use engine::MemoryTableEngine;
pub use graph::{GraphBuilder, MaterializationGraph};
pub use journal::MemoryRefreshJournal;
pub use refresher::{CascadeReport, Refresher, RefresherConfig, RefreshTrigger};
pub use schedule::RefreshSchedule;
