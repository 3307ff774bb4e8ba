//! Ingestion orchestration: host record merging, per-artifact processing and
//! the polling loop that drives it.

use std::sync::Arc;

use anyhow::{Context, Result};
use hinv_extractors::{builtin_registry, ExtractorRegistry};
use hinv_storage::{InventoryStore, PgInventoryStore};
use tokio::sync::Semaphore;

pub mod config;
pub mod merger;
pub mod processor;
pub mod scheduler;

pub use config::InventoryConfig;
pub use merger::{ensure_host, EnrichmentReport, HostMerger, HostPresence};
pub use processor::{ArtifactProcessor, ProcessError, ProcessOutcome};
pub use scheduler::{CycleSummary, PollingScheduler};

pub const CRATE_NAME: &str = "hinv-sync";

/// Wires merger, processor and limiter for `store` from `config`.
pub fn build_poller(
    config: &InventoryConfig,
    store: Arc<dyn InventoryStore>,
    registry: ExtractorRegistry,
) -> PollingScheduler {
    let merger = HostMerger::new(
        Arc::clone(&store),
        Arc::new(registry),
        config.enrich_backoff,
    );
    let processor = ArtifactProcessor::new(Arc::clone(&store), merger, config.max_poison_attempts);
    PollingScheduler::new(
        store,
        processor,
        Arc::new(Semaphore::new(config.max_concurrency.max(1))),
        config.poll_interval,
    )
}

pub async fn connect_store(config: &InventoryConfig) -> Result<PgInventoryStore> {
    PgInventoryStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to inventory database")
}

/// Runs a single poll cycle against the database named by `config`.
pub async fn run_cycle_once(config: &InventoryConfig) -> Result<CycleSummary> {
    let store = connect_store(config).await?;
    let registry = builtin_registry().context("building extractor registry")?;
    build_poller(config, Arc::new(store), registry)
        .run_cycle()
        .await
}
