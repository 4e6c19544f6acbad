use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;

use shopfront_core::types::{EventType, Order, OrderStatus, PaymentStatus};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Begins a transaction spanning the idempotency claim and the state
    /// mutation it guards.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Returns a handle for the processed-event idempotency ledger.
    pub fn processed_events(&self) -> ProcessedEventRepository {
        ProcessedEventRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to operate on orders.
    pub fn orders(&self) -> OrderRepository {
        OrderRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to operate on payments.
    pub fn payments(&self) -> PaymentRepository {
        PaymentRepository {
            pool: self.pool.clone(),
        }
    }

    /// Truncates the WAL, returning frame statistics for observability.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(&self.pool)
            .await?;

        Ok(CheckpointStats {
            busy_frames: row.get::<i64, _>(0),
            log_frames: row.get::<i64, _>(1),
            checkpointed_frames: row.get::<i64, _>(2),
        })
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// Statistics returned by a WAL checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository backing the idempotency guard.
///
/// The unique key on `(external_id, event_type)` is the concurrency
/// primitive: of N concurrent deliveries of the same event, exactly one
/// insert succeeds and the rest observe [`ClaimOutcome::AlreadyProcessed`].
#[derive(Clone)]
pub struct ProcessedEventRepository {
    pool: SqlitePool,
}

impl ProcessedEventRepository {
    /// Atomically claims an event for processing inside the caller's
    /// transaction. Rolling back the transaction releases the claim, so a
    /// delivery that fails mid-flight can be retried by the provider.
    pub async fn claim(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        external_id: &str,
        event_type: EventType,
        received_at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, ProcessedEventError> {
        let result = sqlx::query(
            "INSERT INTO processed_events (external_id, event_type, outcome, received_at) \
             VALUES (?, ?, NULL, ?)",
        )
        .bind(external_id)
        .bind(event_type.as_str())
        .bind(to_rfc3339(received_at))
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(ClaimOutcome::Claimed),
            Err(sqlx::Error::Database(db_err)) => {
                // 1555 = primary key violation, 2067 = unique index violation.
                if matches!(db_err.code().as_deref(), Some("1555") | Some("2067")) {
                    return Ok(ClaimOutcome::AlreadyProcessed);
                }
                Err(ProcessedEventError::Database(sqlx::Error::Database(db_err)))
            }
            Err(err) => Err(ProcessedEventError::Database(err)),
        }
    }

    /// Records the processing outcome for a claimed event. The outcome is
    /// written once; replays never touch the ledger entry again.
    pub async fn finalize(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        external_id: &str,
        event_type: EventType,
        outcome: &str,
    ) -> Result<(), ProcessedEventError> {
        sqlx::query(
            "UPDATE processed_events SET outcome = ? \
             WHERE external_id = ? AND event_type = ? AND outcome IS NULL",
        )
        .bind(outcome)
        .bind(external_id)
        .bind(event_type.as_str())
        .execute(&mut **tx)
        .await
        .map_err(ProcessedEventError::Database)?;

        Ok(())
    }

    /// Returns the recorded outcome for an event, if it was ever claimed.
    pub async fn fetch_outcome(
        &self,
        external_id: &str,
        event_type: EventType,
    ) -> Result<Option<Option<String>>, ProcessedEventError> {
        let row = sqlx::query(
            "SELECT outcome FROM processed_events WHERE external_id = ? AND event_type = ?",
        )
        .bind(external_id)
        .bind(event_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(ProcessedEventError::Database)?;

        Ok(row.map(|row| row.get::<Option<String>, _>("outcome")))
    }

    /// Deletes a batch of ledger entries older than the retention threshold.
    /// Returns the number of rows removed.
    pub async fn delete_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM processed_events WHERE rowid IN (\
                 SELECT rowid FROM processed_events WHERE received_at < ? LIMIT ?\
             )",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Result of attempting to claim an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyProcessed,
}

impl ClaimOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::AlreadyProcessed)
    }
}

/// Error type for operations on the processed-event ledger.
#[derive(Debug, Error)]
pub enum ProcessedEventError {
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

/// Repository for the order aggregate.
#[derive(Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    /// Loads an order inside the caller's transaction.
    pub async fn fetch(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
    ) -> Result<Option<Order>, OrderError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, status, payment_id, total_cents, currency, \
                    created_at, updated_at \
             FROM orders WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(OrderError::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_raw: String = row.get("status");
        let status = OrderStatus::from_str(&status_raw)
            .map_err(|_| OrderError::InvalidStatus(status_raw))?;

        Ok(Some(Order {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            status,
            payment_id: row.get("payment_id"),
            total_cents: row.get("total_cents"),
            currency: row.get("currency"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    /// Applies a conditional status update: the row changes only when its
    /// status still equals `from`, which excludes stale transitions racing
    /// each other. Returns `true` when a row was updated.
    ///
    /// `payment_id` is recorded on the first settling transition and left
    /// untouched afterwards.
    pub async fn update_status(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: i64,
        from: OrderStatus,
        to: OrderStatus,
        payment_id: Option<&str>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, OrderError> {
        let result = sqlx::query(
            "UPDATE orders \
             SET status = ?, payment_id = COALESCE(payment_id, ?), updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(payment_id)
        .bind(to_rfc3339(updated_at))
        .bind(id)
        .bind(from.as_str())
        .execute(&mut **tx)
        .await
        .map_err(OrderError::Database)?;

        Ok(result.rows_affected() == 1)
    }

    /// Inserts an order row. Order creation belongs to the checkout flow;
    /// this exists for provisioning and tests.
    pub async fn insert(&self, order: &NewOrder<'_>) -> Result<(), OrderError> {
        sqlx::query(
            "INSERT INTO orders \
             (id, tenant_id, status, payment_id, total_cents, currency, created_at, updated_at) \
             VALUES (?, ?, ?, NULL, ?, ?, ?, ?)",
        )
        .bind(order.id)
        .bind(order.tenant_id)
        .bind(order.status.as_str())
        .bind(order.total_cents)
        .bind(order.currency)
        .bind(to_rfc3339(order.created_at))
        .bind(to_rfc3339(order.created_at))
        .execute(&self.pool)
        .await
        .map_err(OrderError::Database)?;

        Ok(())
    }
}

/// Data required to create a new order row.
pub struct NewOrder<'a> {
    pub id: i64,
    pub tenant_id: &'a str,
    pub status: OrderStatus,
    pub total_cents: i64,
    pub currency: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Errors that can occur while reading or mutating orders.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order row carries an unknown status: {0}")]
    InvalidStatus(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

/// Repository for payment rows.
#[derive(Clone)]
pub struct PaymentRepository {
    pool: SqlitePool,
}

impl PaymentRepository {
    /// Upserts a payment keyed by the provider-assigned id. Redeliveries
    /// refresh the status without duplicating the row.
    pub async fn upsert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        payment: &NewPayment<'_>,
    ) -> Result<(), PaymentError> {
        sqlx::query(
            "INSERT INTO payments \
             (payment_id, order_id, status, amount_cents, currency, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(payment_id) DO UPDATE \
             SET status = excluded.status, updated_at = excluded.updated_at",
        )
        .bind(payment.payment_id)
        .bind(payment.order_id)
        .bind(payment.status.as_str())
        .bind(payment.amount_cents)
        .bind(payment.currency)
        .bind(to_rfc3339(payment.recorded_at))
        .bind(to_rfc3339(payment.recorded_at))
        .execute(&mut **tx)
        .await
        .map_err(PaymentError::Database)?;

        Ok(())
    }

    /// Loads a payment row by its provider-assigned id.
    pub async fn fetch(&self, payment_id: &str) -> Result<Option<PaymentRecord>, PaymentError> {
        let row = sqlx::query(
            "SELECT payment_id, order_id, status, amount_cents, currency \
             FROM payments WHERE payment_id = ?",
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(PaymentError::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_raw: String = row.get("status");
        let status = PaymentStatus::from_str(&status_raw)
            .map_err(|_| PaymentError::InvalidStatus(status_raw))?;

        Ok(Some(PaymentRecord {
            payment_id: row.get("payment_id"),
            order_id: row.get("order_id"),
            status,
            amount_cents: row.get("amount_cents"),
            currency: row.get("currency"),
        }))
    }
}

/// Data required to upsert a payment row.
pub struct NewPayment<'a> {
    pub payment_id: &'a str,
    pub order_id: i64,
    pub status: PaymentStatus,
    pub amount_cents: Option<i64>,
    pub currency: Option<&'a str>,
    pub recorded_at: DateTime<Utc>,
}

/// Payment row as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRecord {
    pub payment_id: String,
    pub order_id: i64,
    pub status: PaymentStatus,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
}

/// Errors that can occur while reading or mutating payments.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment row carries an unknown status: {0}")]
    InvalidStatus(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
