//! Artifact Processor: ingest one artifact and mark it processed only once its
//! host row is durable.

use std::sync::Arc;

use hinv_core::ArtifactId;
use hinv_storage::{InventoryStore, StoreError};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::merger::{ensure_host, EnrichmentReport, HostMerger, HostPresence};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("artifact {artifact_id} has no trust fingerprint (attempt {attempts})")]
    MissingFingerprint {
        artifact_id: ArtifactId,
        attempts: u32,
        /// The artifact reached the retry bound and is no longer polled.
        poisoned: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The artifact row vanished or was not visible; nothing was written.
    Skipped,
    Processed {
        presence: HostPresence,
        /// `None` when phase 2 gave up. The artifact stays processed.
        enrichment: Option<EnrichmentReport>,
    },
}

pub struct ArtifactProcessor {
    store: Arc<dyn InventoryStore>,
    merger: HostMerger,
    max_poison_attempts: u32,
}

impl ArtifactProcessor {
    pub fn new(store: Arc<dyn InventoryStore>, merger: HostMerger, max_poison_attempts: u32) -> Self {
        Self {
            store,
            merger,
            max_poison_attempts,
        }
    }

    pub async fn process(&self, id: ArtifactId) -> Result<ProcessOutcome, ProcessError> {
        let mut tx = self.store.begin().await?;

        let Some(artifact) = tx.load_artifact(id).await? else {
            tx.rollback().await?;
            debug!(artifact_id = id, "artifact not found; skipping");
            return Ok(ProcessOutcome::Skipped);
        };

        let Some(sighting) = artifact.sighting() else {
            // The transaction must be gone before touching the store again.
            tx.rollback().await?;
            let state = self
                .store
                .record_poison_attempt(id, self.max_poison_attempts)
                .await?;
            return Err(ProcessError::MissingFingerprint {
                artifact_id: id,
                attempts: state.attempts,
                poisoned: state.failed,
            });
        };

        let presence = ensure_host(tx.as_mut(), &sighting).await?;
        tx.mark_processed(id).await?;
        tx.commit().await?;
        debug!(artifact_id = id, certfp = %sighting.certfp, ?presence, "artifact committed");

        let enrichment = match self.merger.enrich(&artifact, &sighting).await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(
                    artifact_id = id,
                    certfp = %sighting.certfp,
                    error = %err,
                    "host enrichment abandoned"
                );
                None
            }
        };

        Ok(ProcessOutcome::Processed {
            presence,
            enrichment,
        })
    }
}

/// Logs a failed `process` call at the level its kind deserves.
pub fn log_process_error(id: ArtifactId, err: &ProcessError) {
    match err {
        ProcessError::Store(err) => {
            warn!(artifact_id = id, error = %err, "artifact left unprocessed after storage error");
        }
        ProcessError::MissingFingerprint {
            attempts,
            poisoned: false,
            ..
        } => {
            error!(artifact_id = id, attempts, "artifact has no trust fingerprint");
        }
        ProcessError::MissingFingerprint {
            attempts,
            poisoned: true,
            ..
        } => {
            error!(
                artifact_id = id,
                attempts, "artifact has no trust fingerprint; giving up on it"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use hinv_core::{Artifact, HostRecord};
    use hinv_extractors::builtin_registry;
    use hinv_storage::{BackoffPolicy, FaultPoint, MemoryInventoryStore};

    use super::*;

    fn processor(store: &MemoryInventoryStore, max_poison_attempts: u32) -> ArtifactProcessor {
        let shared: Arc<dyn InventoryStore> = Arc::new(store.clone());
        let merger = HostMerger::new(
            shared.clone(),
            Arc::new(builtin_registry().unwrap()),
            BackoffPolicy::none(),
        );
        ArtifactProcessor::new(shared, merger, max_poison_attempts)
    }

    fn rhel_artifact(id: ArtifactId, certfp: Option<&str>) -> Artifact {
        Artifact {
            id,
            name: Some("/etc/redhat-release".into()),
            content: Some("Red Hat Enterprise Linux Server release 6.5 (Santiago)\n".into()),
            captured_at: Utc.with_ymd_and_hms(2026, 9, 30, 12, 0, 0).single(),
            is_command: Some(false),
            certfp: certfp.map(str::to_string),
            ip_addr: Some("192.0.2.10".into()),
            client_version: Some("2.4.1".into()),
            os_hostname: Some("rhel6-db".into()),
        }
    }

    #[tokio::test]
    async fn processes_artifact_for_new_host() {
        let store = MemoryInventoryStore::new();
        store.insert_artifact(rhel_artifact(1, Some("fp:rhel"))).await;

        let outcome = processor(&store, 5).process(1).await.unwrap();

        let ProcessOutcome::Processed {
            presence,
            enrichment,
        } = outcome
        else {
            panic!("expected processed outcome");
        };
        assert_eq!(presence, HostPresence::Inserted);
        assert_eq!(enrichment.unwrap().rule_id, Some("redhat-release"));
        assert!(store.artifact(1).await.unwrap().processed);

        let host = store.host("fp:rhel").await.unwrap();
        assert_eq!(host.os.as_deref(), Some("RHEL 6"));
        assert_eq!(host.os_edition.as_deref(), Some("Server"));
        assert_eq!(host.client_version.as_deref(), Some("2.4.1"));
        assert_eq!(host.os_hostname.as_deref(), Some("rhel6-db"));
    }

    #[tokio::test]
    async fn already_processed_artifact_is_skipped_and_host_kept() {
        let store = MemoryInventoryStore::new();
        store.insert_artifact(rhel_artifact(1, Some("fp:rhel"))).await;
        store
            .insert_artifact(Artifact {
                ip_addr: Some("192.0.2.11".into()),
                ..rhel_artifact(2, Some("fp:rhel"))
            })
            .await;
        let processor = processor(&store, 5);
        processor.process(1).await.unwrap();
        processor.process(2).await.unwrap();

        let ttl = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single();
        let mut host = store.host("fp:rhel").await.unwrap();
        host.name_ttl = ttl;
        store.put_host(host.clone()).await;

        assert_eq!(processor.process(1).await.unwrap(), ProcessOutcome::Skipped);

        let after = store.host("fp:rhel").await.unwrap();
        assert_eq!(after, host);
        assert_eq!(after.ip_addr.as_deref(), Some("192.0.2.11"));
        assert_eq!(after.name_ttl, ttl);
        assert_eq!(store.hosts().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_artifact_is_skipped() {
        let store = MemoryInventoryStore::new();
        assert_eq!(processor(&store, 5).process(42).await.unwrap(), ProcessOutcome::Skipped);
        assert!(store.hosts().await.is_empty());
    }

    #[tokio::test]
    async fn missing_fingerprint_is_never_marked_processed() {
        let store = MemoryInventoryStore::new();
        store.insert_artifact(rhel_artifact(3, None)).await;
        let processor = processor(&store, 2);

        let first = processor.process(3).await.unwrap_err();
        assert!(matches!(
            first,
            ProcessError::MissingFingerprint {
                artifact_id: 3,
                attempts: 1,
                poisoned: false
            }
        ));
        let second = processor.process(3).await.unwrap_err();
        assert!(matches!(
            second,
            ProcessError::MissingFingerprint {
                attempts: 2,
                poisoned: true,
                ..
            }
        ));

        let stored = store.artifact(3).await.unwrap();
        assert!(!stored.processed);
        assert!(stored.failed);
        assert!(store.hosts().await.is_empty());
    }

    #[tokio::test]
    async fn failure_before_commit_rolls_back_host_and_flag() {
        for point in [FaultPoint::MarkProcessed, FaultPoint::Commit, FaultPoint::InsertHost] {
            let store = MemoryInventoryStore::new();
            store.insert_artifact(rhel_artifact(4, Some("fp:new"))).await;
            store.fail_next(point).await;

            let err = processor(&store, 5).process(4).await.unwrap_err();

            assert!(matches!(err, ProcessError::Store(StoreError::Injected(p)) if p == point));
            assert!(!store.artifact(4).await.unwrap().processed, "{point:?}");
            assert!(store.host("fp:new").await.is_none(), "{point:?}");
            assert_eq!(store.artifact(4).await.unwrap().attempts, 0);
        }
    }

    #[tokio::test]
    async fn load_failure_leaves_artifact_for_next_cycle() {
        let store = MemoryInventoryStore::new();
        store.insert_artifact(rhel_artifact(5, Some("fp:rhel"))).await;
        store.fail_next(FaultPoint::LoadArtifact).await;
        let processor = processor(&store, 5);

        assert!(matches!(processor.process(5).await, Err(ProcessError::Store(_))));
        assert!(!store.artifact(5).await.unwrap().processed);

        processor.process(5).await.unwrap();
        assert!(store.artifact(5).await.unwrap().processed);
    }

    #[tokio::test]
    async fn insert_race_counts_as_existing_host() {
        let store = MemoryInventoryStore::new();
        store
            .put_host(HostRecord {
                certfp: "fp:rhel".into(),
                ..HostRecord::default()
            })
            .await;
        store.insert_artifact(rhel_artifact(6, Some("fp:rhel"))).await;
        store.fail_next(FaultPoint::RacedInsert).await;

        let outcome = processor(&store, 5).process(6).await.unwrap();

        assert!(matches!(
            outcome,
            ProcessOutcome::Processed {
                presence: HostPresence::Raced,
                ..
            }
        ));
        assert!(store.artifact(6).await.unwrap().processed);
        assert_eq!(store.host("fp:rhel").await.unwrap().os.as_deref(), Some("RHEL 6"));
    }

    #[tokio::test]
    async fn enrichment_failure_keeps_artifact_processed() {
        let store = MemoryInventoryStore::new();
        store.insert_artifact(rhel_artifact(7, Some("fp:rhel"))).await;
        store.fail_next(FaultPoint::ApplyFacts).await;

        let outcome = processor(&store, 5).process(7).await.unwrap();

        assert!(matches!(
            outcome,
            ProcessOutcome::Processed {
                enrichment: None,
                ..
            }
        ));
        assert!(store.artifact(7).await.unwrap().processed);
        assert_eq!(store.host("fp:rhel").await.unwrap().os, None);
    }
}
