//! Polling Scheduler: periodic discovery of unprocessed artifacts with a
//! bounded number of processors in flight.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hinv_storage::InventoryStore;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

use crate::processor::{log_process_error, ArtifactProcessor, ProcessError, ProcessOutcome};

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovered: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub poisoned: usize,
    pub enrich_failed: usize,
}

impl CycleSummary {
    fn started() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            discovered: 0,
            processed: 0,
            skipped: 0,
            failed: 0,
            poisoned: 0,
            enrich_failed: 0,
        }
    }

    fn record(&mut self, result: &Result<ProcessOutcome, ProcessError>) {
        match result {
            Ok(ProcessOutcome::Skipped) => self.skipped += 1,
            Ok(ProcessOutcome::Processed { enrichment, .. }) => {
                self.processed += 1;
                if enrichment.is_none() {
                    self.enrich_failed += 1;
                }
            }
            Err(ProcessError::MissingFingerprint { poisoned: true, .. }) => self.poisoned += 1,
            Err(_) => self.failed += 1,
        }
    }
}

pub struct PollingScheduler {
    store: Arc<dyn InventoryStore>,
    processor: Arc<ArtifactProcessor>,
    limiter: Arc<Semaphore>,
    interval: Duration,
}

impl PollingScheduler {
    /// `limiter` caps processors in flight and is shared by every cycle,
    /// including overlapping ones.
    pub fn new(
        store: Arc<dyn InventoryStore>,
        processor: ArtifactProcessor,
        limiter: Arc<Semaphore>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            processor: Arc::new(processor),
            limiter,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One discovery pass. Per-artifact failures are logged and counted;
    /// only a failed discovery query fails the cycle.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let mut summary = CycleSummary::started();
        let ids = self
            .store
            .unprocessed_artifact_ids()
            .await
            .context("querying unprocessed artifacts")?;
        summary.discovered = ids.len();

        let mut workers = JoinSet::new();
        for id in ids {
            let permit = Arc::clone(&self.limiter)
                .acquire_owned()
                .await
                .context("concurrency limiter closed")?;
            let processor = Arc::clone(&self.processor);
            workers.spawn(
                async move {
                    let _permit = permit;
                    let result = processor.process(id).await;
                    if let Err(err) = &result {
                        log_process_error(id, err);
                    }
                    result
                }
                .instrument(info_span!("process_artifact", artifact_id = id)),
            );
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(result) => summary.record(&result),
                Err(err) => {
                    error!(error = %err, "artifact worker panicked");
                    summary.failed += 1;
                }
            }
        }

        summary.finished_at = Utc::now();
        if summary.discovered > 0 {
            info!(
                discovered = summary.discovered,
                processed = summary.processed,
                skipped = summary.skipped,
                failed = summary.failed,
                poisoned = summary.poisoned,
                enrich_failed = summary.enrich_failed,
                "poll cycle finished"
            );
        }
        Ok(summary)
    }

    /// Registers the poll cycle as a fixed-interval job. The caller starts
    /// and shuts down the returned scheduler.
    pub async fn build_job_scheduler(self: Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let interval = self.interval;
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let poller = Arc::clone(&self);
            Box::pin(async move {
                if let Err(err) = poller.run_cycle().await {
                    warn!("poll cycle failed: {err:#}");
                }
            })
        })
        .with_context(|| format!("creating poll job every {interval:?}"))?;
        sched.add(job).await.context("adding poll job")?;
        Ok(sched)
    }
}
