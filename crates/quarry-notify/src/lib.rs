//! Operator alerting for Quarry.
//!
//! A failed refresh cascade raises exactly one outbound notification per
//! failed node, naming the node and the validation mismatch. Delivery goes
//! to a webhook or Slack channel; with nothing configured, alerts land in
//! the structured log.

pub mod sender;

pub use sender::{SlackAlerter, SlackConfig, TracingAlertSink, WebhookAlerter};
