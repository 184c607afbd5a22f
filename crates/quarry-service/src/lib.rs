//! Serving-path facade for Quarry.
//!
//! Wires the normalizer, fingerprint generator, cache store, section store,
//! usage ledger, and refresher together behind one `AnalysisService` type.
//! Callers submit a raw parameter bag and get back a job id; whether the
//! result was computed or replayed from cache is an implementation detail
//! surfaced only as metadata.

pub mod registry;
pub mod service;
pub mod settings;

pub use registry::{AppDefinition, AppRegistry};
pub use service::{AnalysisService, SubmitOutcome, SubmitRequest};
pub use settings::Settings;
