//! Storage contracts for artifacts and host records, plus the Postgres and
//! in-memory backends.
//!
//! Every host-record mutation is a single conditional statement so that
//! concurrent workers touching the same fingerprint never race through a
//! read-modify-write window.

use std::time::Duration;

use async_trait::async_trait;
use hinv_core::{Artifact, ArtifactId, FactUpdate, HostSighting};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::{FaultPoint, MemoryInventoryStore, StoredArtifact};
pub use postgres::PgInventoryStore;

pub const CRATE_NAME: &str = "hinv-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("injected fault at {0:?}")]
    Injected(FaultPoint),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Sqlx(err) => classify_sqlx_error(err),
            StoreError::Migrate(_) => RetryDisposition::NonRetryable,
            StoreError::Injected(_) => RetryDisposition::Retryable,
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Connection trouble and serialization conflicts are worth another attempt;
/// constraint and decode errors are not.
pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => RetryDisposition::Retryable,
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // serialization_failure, deadlock_detected
            Some("40001") | Some("40P01") => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

/// Result of an insert-if-absent on the host table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer created the row first; the row exists either way.
    AlreadyExists,
}

/// Retry bookkeeping for an artifact that cannot be ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoisonState {
    pub attempts: u32,
    /// Terminal: the artifact is excluded from discovery from now on.
    pub failed: bool,
}

/// Non-transactional access to the artifact and host tables.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Ids of artifacts that are neither processed nor terminally failed.
    async fn unprocessed_artifact_ids(&self) -> Result<Vec<ArtifactId>>;

    async fn begin(&self) -> Result<Box<dyn InventoryTx>>;

    /// Sets IP address and OS hostname only when at least one differs from the
    /// stored value, clearing the name TTL marker in the same statement.
    /// Returns whether the row changed.
    async fn merge_network_identity(&self, sighting: &HostSighting) -> Result<bool>;

    /// Unconditional field sets keyed by fingerprint. Returns rows affected.
    async fn apply_facts(&self, certfp: &str, update: &FactUpdate) -> Result<u64>;

    /// Counts one failed ingestion attempt. With `max_attempts > 0` the
    /// artifact is flagged failed once the count reaches the bound.
    async fn record_poison_attempt(&self, id: ArtifactId, max_attempts: u32) -> Result<PoisonState>;
}

/// One storage transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait InventoryTx: Send {
    /// `None` when the artifact is gone or another worker already processed it.
    async fn load_artifact(&mut self, id: ArtifactId) -> Result<Option<Artifact>>;

    /// Updates last-seen and client version. Returns rows affected.
    async fn touch_host(&mut self, sighting: &HostSighting) -> Result<u64>;

    async fn insert_host(&mut self, sighting: &HostSighting) -> Result<InsertOutcome>;

    async fn mark_processed(&mut self, id: ArtifactId) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn connection_errors_are_retryable() {
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::PoolTimedOut),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_sqlx_error(&sqlx::Error::RowNotFound),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            StoreError::Injected(FaultPoint::ApplyFacts).disposition(),
            RetryDisposition::Retryable
        );
    }
}
