//! Fire-and-forget usage recording.

use quarry_core::ports::UsageSink;
use quarry_core::usage::UsageLogEntry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Non-blocking front for a [`UsageSink`].
///
/// Entries go through a bounded channel drained by a background task.
/// Overflow and sink failures are logged and dropped: losing a usage record
/// is acceptable, delaying a report to guarantee its durability is not.
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<UsageLogEntry>,
}

/// Owns the drain task; dropping the last recorder closes the channel and
/// lets the task finish the buffered backlog.
pub struct LedgerHandle {
    task: JoinHandle<()>,
}

impl LedgerHandle {
    /// Wait for the drain task to flush and exit. Call after dropping every
    /// recorder clone.
    pub async fn shutdown(self) {
        let _ = self.task.await;
    }
}

impl UsageRecorder {
    /// Spawn the drain task and return the recorder plus its handle.
    pub fn spawn(sink: Arc<dyn UsageSink>, capacity: usize) -> (Self, LedgerHandle) {
        let (tx, mut rx) = mpsc::channel::<UsageLogEntry>(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = sink.append(&entry).await {
                    warn!(request_id = %entry.request_id, error = %e, "usage record dropped");
                }
            }
        });
        (Self { tx }, LedgerHandle { task })
    }

    /// Record an entry. Never blocks, never fails the caller.
    pub fn record(&self, entry: UsageLogEntry) {
        if let Err(e) = self.tx.try_send(entry) {
            warn!(error = %e, "usage ledger buffer full, record dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryUsageSink;
    use quarry_core::ids::{CacheKey, RequestId};
    use quarry_core::params::CanonicalParams;
    use quarry_core::usage::CostBreakdown;

    fn entry() -> UsageLogEntry {
        UsageLogEntry {
            request_id: RequestId::new(),
            timestamp: chrono::Utc::now(),
            requester_class: "api".to_string(),
            app_name: "lending-report".to_string(),
            parameters: CanonicalParams::new(),
            cache_key: CacheKey::from_digest("ab".repeat(32)),
            cache_hit: true,
            job_id: None,
            latency_ms: 12,
            cost: CostBreakdown::default(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_records_are_delivered() {
        let sink = Arc::new(MemoryUsageSink::new());
        let (recorder, handle) = UsageRecorder::spawn(sink.clone(), 16);

        let first = entry();
        let id = first.request_id;
        recorder.record(first);
        recorder.record(entry());

        drop(recorder);
        handle.shutdown().await;

        assert_eq!(sink.len().await, 2);
        assert!(sink.get_entry(id).await.is_some());
    }

    #[tokio::test]
    async fn test_overflow_drops_without_error() {
        let sink = Arc::new(MemoryUsageSink::new());
        sink.block_appends().await;
        let (recorder, handle) = UsageRecorder::spawn(sink.clone(), 1);

        // Far more records than the buffer holds; none of these may fail.
        for _ in 0..64 {
            recorder.record(entry());
        }

        sink.unblock_appends().await;
        drop(recorder);
        handle.shutdown().await;

        assert!(sink.len().await < 64);
    }
}
