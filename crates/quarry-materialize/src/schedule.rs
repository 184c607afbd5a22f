//! Timed refresh triggers.

use chrono::{DateTime, Utc};
use cron::Schedule;
use quarry_core::{Error, Result};
use std::str::FromStr;

/// Cron-driven refresh schedule: which nodes are due between two instants.
///
/// A scheduler loop calls [`RefreshSchedule::due_between`] with the time of
/// its previous tick; due nodes feed `Refresher::run_cascade` as a
/// `RefreshTrigger::Nodes` batch.
#[derive(Debug)]
pub struct RefreshSchedule {
    entries: Vec<(String, Schedule)>,
}

impl RefreshSchedule {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a node with a cron expression (seconds field included,
    /// e.g. `"0 0 3 * * * *"` for 03:00 daily).
    pub fn entry(mut self, node: impl Into<String>, expression: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| Error::Config(format!("invalid cron expression '{expression}': {e}")))?;
        self.entries.push((node.into(), schedule));
        Ok(self)
    }

    /// Node names with at least one firing time in `(after, now]`.
    pub fn due_between(&self, after: DateTime<Utc>, now: DateTime<Utc>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, schedule)| {
                schedule
                    .after(&after)
                    .next()
                    .is_some_and(|firing| firing <= now)
            })
            .map(|(node, _)| node.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RefreshSchedule {
    fn default() -> Self {
        Self::new()
    }
}
