//! In-memory usage sink for local development and tests.

use async_trait::async_trait;
use quarry_core::ids::RequestId;
use quarry_core::ports::UsageSink;
use quarry_core::usage::UsageLogEntry;
use quarry_core::Result;
use tokio::sync::{watch, Mutex};

/// Append-only in-memory [`UsageSink`].
pub struct MemoryUsageSink {
    entries: Mutex<Vec<UsageLogEntry>>,
    blocked_tx: watch::Sender<bool>,
    blocked_rx: watch::Receiver<bool>,
}

impl Default for MemoryUsageSink {
    fn default() -> Self {
        let (blocked_tx, blocked_rx) = watch::channel(false);
        Self {
            entries: Mutex::new(Vec::new()),
            blocked_tx,
            blocked_rx,
        }
    }
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn get_entry(&self, id: RequestId) -> Option<UsageLogEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|e| e.request_id == id)
            .cloned()
    }

    pub async fn all(&self) -> Vec<UsageLogEntry> {
        self.entries.lock().await.clone()
    }

    /// Stall appends until [`Self::unblock_appends`], for backpressure tests.
    pub async fn block_appends(&self) {
        let _ = self.blocked_tx.send(true);
    }

    pub async fn unblock_appends(&self) {
        let _ = self.blocked_tx.send(false);
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn append(&self, entry: &UsageLogEntry) -> Result<()> {
        let mut blocked = self.blocked_rx.clone();
        while *blocked.borrow() {
            if blocked.changed().await.is_err() {
                break;
            }
        }
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }

    async fn get(&self, id: RequestId) -> Result<Option<UsageLogEntry>> {
        Ok(self.get_entry(id).await)
    }
}
