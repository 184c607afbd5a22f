//! Parameter normalization and cache-key fingerprinting.
//!
//! Two requests that are semantically identical (same filter values
//! regardless of list ordering, string case, or numeric representation)
//! must normalize to the same canonical form and therefore fingerprint to
//! the same cache key.

pub mod fingerprint;
pub mod normalize;
pub mod schema;

pub use fingerprint::fingerprint;
pub use normalize::normalize;
pub use schema::{FieldKind, FieldSpec, ParamSchema};
