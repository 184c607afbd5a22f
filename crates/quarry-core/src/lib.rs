//! Quarry Core
//!
//! Core domain types, traits, and error handling for the Quarry analysis
//! cache and materialization pipeline. This crate has minimal dependencies
//! and defines the shared vocabulary used across all other crates.

pub mod cache;
pub mod error;
pub mod ids;
pub mod job;
pub mod materialize;
pub mod params;
pub mod ports;
pub mod section;
pub mod usage;

pub use error::{Error, Result};
pub use ids::*;
