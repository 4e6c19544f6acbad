use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use shopfront_storage::Database;

/// Ledger entries older than this are swept; a provider redelivering an
/// event after a month is treated as a fresh delivery.
const RETENTION_DAYS: i64 = 30;
const BATCH_LIMIT: i64 = 1000;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("ttl sweep failed: {0}")]
    TtlDelete(sqlx::Error),
    #[error("wal checkpoint failed: {0}")]
    Checkpoint(sqlx::Error),
}

/// Background task that keeps the idempotency ledger bounded and the WAL
/// from growing without limit.
pub struct MaintenanceWorker {
    storage: Database,
    interval: Duration,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl MaintenanceWorker {
    pub fn new(storage: Database) -> Self {
        Self {
            storage,
            interval: DEFAULT_INTERVAL,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run_loop())
    }

    async fn run_loop(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "maintenance", error = %err, "maintenance pass failed");
            }
        }
    }

    /// One maintenance pass: sweep expired ledger rows in batches, then
    /// truncate the WAL.
    pub async fn run_once(&self) -> Result<(), MaintenanceError> {
        let threshold = (self.clock)() - chrono::Duration::days(RETENTION_DAYS);
        let ledger = self.storage.processed_events();

        let mut total_deleted = 0u64;
        loop {
            match ledger.delete_older_than_batch(threshold, BATCH_LIMIT).await {
                Ok(deleted) => {
                    total_deleted += deleted;
                    if deleted < BATCH_LIMIT as u64 {
                        break;
                    }
                }
                Err(err) if is_sqlite_busy(&err) => {
                    counter!("db_busy_total", "op" => "ttl_delete").increment(1);
                    warn!(stage = "maintenance", "ttl sweep hit a busy database; deferring");
                    break;
                }
                Err(err) => return Err(MaintenanceError::TtlDelete(err)),
            }
        }
        if total_deleted > 0 {
            counter!("db_ttl_deleted_total", "table" => "processed_events")
                .increment(total_deleted);
            info!(
                stage = "maintenance",
                deleted = total_deleted,
                "swept expired idempotency ledger rows"
            );
        }

        let start = Instant::now();
        match self.storage.wal_checkpoint_truncate().await {
            Ok(stats) => {
                histogram!("db_checkpoint_seconds").record(start.elapsed().as_secs_f64());
                debug!(
                    stage = "maintenance",
                    busy_frames = stats.busy_frames,
                    log_frames = stats.log_frames,
                    checkpointed_frames = stats.checkpointed_frames,
                    "wal checkpoint complete"
                );
            }
            Err(err) if is_sqlite_busy(&err) => {
                counter!("db_busy_total", "op" => "checkpoint").increment(1);
                warn!(stage = "maintenance", "wal checkpoint hit a busy database; deferring");
            }
            Err(err) => return Err(MaintenanceError::Checkpoint(err)),
        }

        Ok(())
    }
}

// 5 = SQLITE_BUSY, 6 = SQLITE_LOCKED.
fn is_sqlite_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            matches!(db_err.code().as_deref(), Some("5") | Some("6"))
        }
        _ => false,
    }
}
