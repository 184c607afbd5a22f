//! Registered analysis applications.

use quarry_core::{Error, Result};
use quarry_fingerprint::ParamSchema;
use std::collections::HashMap;
use std::time::Duration;

/// One registered application: its parameter schema plus per-app overrides
/// of the serving defaults.
pub struct AppDefinition {
    pub schema: ParamSchema,
    /// Overrides the service-wide claim timeout for this app's typically
    /// longer or shorter computations.
    pub claim_timeout: Option<Duration>,
    /// Time-to-live for completed results; `None` means never expires.
    pub result_ttl: Option<Duration>,
}

impl AppDefinition {
    pub fn new(schema: ParamSchema) -> Self {
        Self {
            schema,
            claim_timeout: None,
            result_ttl: None,
        }
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = Some(timeout);
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = Some(ttl);
        self
    }
}

/// Lookup table of known applications. Requests naming an unregistered
/// application are rejected before any normalization or caching happens.
#[derive(Default)]
pub struct AppRegistry {
    apps: HashMap<String, AppDefinition>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, definition: AppDefinition) {
        self.apps.insert(name.into(), definition);
    }

    pub fn get(&self, name: &str) -> Result<&AppDefinition> {
        self.apps
            .get(name)
            .ok_or_else(|| Error::UnknownApplication(name.to_string()))
    }
}
