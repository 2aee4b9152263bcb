//! Chain watchers driven by persisted sync cursors
//!
//! Each watcher scans block windows handed out by its [`SyncTask`] rows and
//! inserts the messages it finds. Inserts are idempotent, so a window that is
//! scanned twice after a crash does no harm.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::db::models::{NewSyncTask, SyncTask};
use crate::ledger::Ledger;
use crate::metrics;
use crate::types::{ledger_int, ChainType};

pub mod evm;
pub mod utxo;

pub use evm::EvmWatcher;
pub use utxo::UtxoWatcher;

/// One chain's block source
#[async_trait]
pub trait WindowScanner: Send + Sync {
    /// Highest block considered final
    async fn safe_head(&self) -> Result<u64>;

    /// Ingest every event in the inclusive window; returns messages inserted
    async fn scan(&self, from_block: u64, to_block: u64) -> Result<usize>;
}

/// Polls the sync tasks of one chain and feeds their windows to a scanner
pub struct SyncLoop {
    scanner: Box<dyn WindowScanner>,
    ledger: Arc<dyn Ledger>,
    chain_type: ChainType,
    chain_id: i64,
    interval: Duration,
}

impl SyncLoop {
    pub fn new(
        scanner: Box<dyn WindowScanner>,
        ledger: Arc<dyn Ledger>,
        chain_type: ChainType,
        chain_id: i64,
        interval: Duration,
    ) -> Self {
        Self {
            scanner,
            ledger,
            chain_type,
            chain_id,
            interval,
        }
    }

    /// Create the chain's cursor on first boot. `end_block` 0 follows the
    /// chain head forever; otherwise the task finishes after that block.
    pub async fn ensure_task(
        &self,
        start_block: u64,
        end_block: u64,
        handle_num: u64,
    ) -> Result<()> {
        self.ledger
            .ensure_sync_task(&NewSyncTask {
                chain_type: self.chain_type,
                chain_id: self.chain_id,
                start_block: ledger_int(start_block, "start block")?,
                end_block: ledger_int(end_block, "end block")?,
                handle_num: ledger_int(handle_num, "handle num")?,
            })
            .await
    }

    /// Advance every active task by one window
    pub async fn tick(&self) -> Result<usize> {
        let tasks = self
            .ledger
            .active_sync_tasks(self.chain_type, self.chain_id)
            .await?;
        if tasks.is_empty() {
            return Ok(0);
        }

        let safe_head = self.scanner.safe_head().await?;
        let mut inserted = 0;
        for task in tasks {
            inserted += self.advance(&task, safe_head).await?;
        }
        Ok(inserted)
    }

    async fn advance(&self, task: &SyncTask, safe_head: u64) -> Result<usize> {
        let Some((from_block, to_block)) = task.next_window(safe_head) else {
            return Ok(0);
        };

        let inserted = self.scanner.scan(from_block, to_block).await?;
        let latest_block = ledger_int(to_block.saturating_add(1), "latest block")?;
        let status = task.status_after(latest_block);
        self.ledger
            .save_sync_progress(task.id, latest_block, status)
            .await?;
        metrics::set_latest_block(&self.chain_id.to_string(), latest_block);

        debug!(
            chain_id = self.chain_id,
            task_id = task.id,
            from_block,
            to_block,
            inserted,
            status = %status,
            "Scanned block window"
        );
        Ok(inserted)
    }

    /// Run until shutdown
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!(
            chain_id = self.chain_id,
            chain_type = %self.chain_type,
            interval_ms = self.interval.as_millis() as u64,
            "Starting chain watcher"
        );

        let mut cycle_count: u64 = 0;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(chain_id = self.chain_id, "Shutdown signal received, stopping watcher");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            cycle_count += 1;
            match self.tick().await {
                Ok(inserted) if inserted > 0 => {
                    info!(chain_id = self.chain_id, inserted, "Ingested new messages");
                    metrics::record_ingested(&self.chain_id.to_string(), inserted);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(chain_id = self.chain_id, error = %e, "Watcher tick failed");
                    metrics::record_error(&self.chain_id.to_string(), "watcher");
                }
            }

            if cycle_count % 20 == 1 {
                info!(chain_id = self.chain_id, cycle = cycle_count, "Watcher heartbeat");
            }
        }
    }
}

/// Log an event that could not be ingested and move on
pub(crate) fn log_skipped(chain_id: i64, tx_hash: &str, error: &eyre::Report) {
    error!(
        chain_id,
        tx_hash = %tx_hash,
        error = %error,
        "Failed to ingest event"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use std::sync::Mutex;

    struct RecordingScanner {
        head: u64,
        windows: Arc<Mutex<Vec<(u64, u64)>>>,
    }

    #[async_trait]
    impl WindowScanner for RecordingScanner {
        async fn safe_head(&self) -> Result<u64> {
            Ok(self.head)
        }

        async fn scan(&self, from_block: u64, to_block: u64) -> Result<usize> {
            self.windows.lock().unwrap().push((from_block, to_block));
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_tick_walks_windows_to_head() {
        let windows = Arc::new(Mutex::new(Vec::new()));
        let ledger = Arc::new(MemoryLedger::new());
        let sync = SyncLoop::new(
            Box::new(RecordingScanner {
                head: 125,
                windows: windows.clone(),
            }),
            ledger.clone(),
            ChainType::Evm,
            1,
            Duration::from_millis(10),
        );
        sync.ensure_task(100, 0, 10).await.unwrap();

        for _ in 0..4 {
            sync.tick().await.unwrap();
        }

        assert_eq!(
            *windows.lock().unwrap(),
            vec![(100, 109), (110, 119), (120, 125)]
        );
        let task = &ledger.active_sync_tasks(ChainType::Evm, 1).await.unwrap()[0];
        assert_eq!(task.latest_block, 126);
    }

    #[tokio::test]
    async fn test_bounded_task_finishes_at_end_block() {
        let windows = Arc::new(Mutex::new(Vec::new()));
        let ledger = Arc::new(MemoryLedger::new());
        let sync = SyncLoop::new(
            Box::new(RecordingScanner {
                head: 500,
                windows: windows.clone(),
            }),
            ledger.clone(),
            ChainType::Evm,
            1,
            Duration::from_millis(10),
        );
        sync.ensure_task(100, 115, 10).await.unwrap();

        for _ in 0..4 {
            sync.tick().await.unwrap();
        }

        assert_eq!(*windows.lock().unwrap(), vec![(100, 109), (110, 115)]);
        assert!(ledger
            .active_sync_tasks(ChainType::Evm, 1)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_oversized_start_block_is_rejected() {
        let sync = SyncLoop::new(
            Box::new(RecordingScanner {
                head: 10,
                windows: Arc::new(Mutex::new(Vec::new())),
            }),
            Arc::new(MemoryLedger::new()),
            ChainType::Evm,
            1,
            Duration::from_millis(10),
        );
        assert!(sync.ensure_task(u64::MAX, 0, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_no_task_no_scan() {
        let windows = Arc::new(Mutex::new(Vec::new()));
        let sync = SyncLoop::new(
            Box::new(RecordingScanner {
                head: 10,
                windows: windows.clone(),
            }),
            Arc::new(MemoryLedger::new()),
            ChainType::Utxo,
            3,
            Duration::from_millis(10),
        );
        assert_eq!(sync.tick().await.unwrap(), 0);
        assert!(windows.lock().unwrap().is_empty());
    }
}
