//! Host Record Merger.
//!
//! Phase 1 makes sure the host row exists and runs inside the artifact's
//! transaction. Phase 2 merges network identity and classified facts as its
//! own unit of work. Both phases only issue single conditional statements, so
//! concurrent workers on one fingerprint cannot lose each other's writes.

use std::sync::Arc;

use hinv_core::{Artifact, FactUpdate, HostSighting};
use hinv_extractors::ExtractorRegistry;
use hinv_storage::{
    BackoffPolicy, InsertOutcome, InventoryStore, InventoryTx, RetryDisposition, StoreError,
};
use tracing::{debug, warn};

/// How phase 1 found the host row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPresence {
    Touched,
    Inserted,
    /// Another worker inserted the row between our update and insert.
    Raced,
}

/// What phase 2 changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentReport {
    pub rule_id: Option<&'static str>,
    pub identity_changed: bool,
    pub updates_applied: usize,
    pub attempts: usize,
}

/// Phase 1: update-or-insert by fingerprint.
pub async fn ensure_host(
    tx: &mut dyn InventoryTx,
    sighting: &HostSighting,
) -> Result<HostPresence, StoreError> {
    if tx.touch_host(sighting).await? > 0 {
        return Ok(HostPresence::Touched);
    }
    match tx.insert_host(sighting).await? {
        InsertOutcome::Inserted => Ok(HostPresence::Inserted),
        InsertOutcome::AlreadyExists => {
            debug!(certfp = %sighting.certfp, "host inserted concurrently");
            // The winner's row is committed now; record this sighting on it.
            tx.touch_host(sighting).await?;
            Ok(HostPresence::Raced)
        }
    }
}

pub struct HostMerger {
    store: Arc<dyn InventoryStore>,
    registry: Arc<ExtractorRegistry>,
    backoff: BackoffPolicy,
}

impl HostMerger {
    pub fn new(
        store: Arc<dyn InventoryStore>,
        registry: Arc<ExtractorRegistry>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            backoff,
        }
    }

    /// Phase 2 for one artifact whose host row is already committed.
    ///
    /// Classification runs once; the storage writes are retried as a whole
    /// on retryable errors, which is safe because every write is idempotent.
    pub async fn enrich(
        &self,
        artifact: &Artifact,
        sighting: &HostSighting,
    ) -> Result<EnrichmentReport, StoreError> {
        let classification = self.registry.classify(artifact.name(), artifact.content());
        let mut attempt = 0usize;
        loop {
            match self.write_phase2(sighting, &classification.updates).await {
                Ok(identity_changed) => {
                    return Ok(EnrichmentReport {
                        rule_id: classification.rule_id,
                        identity_changed,
                        updates_applied: classification.updates.len(),
                        attempts: attempt + 1,
                    });
                }
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        artifact_id = artifact.id,
                        certfp = %sighting.certfp,
                        attempt,
                        ?delay,
                        error = %err,
                        "host enrichment failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn write_phase2(
        &self,
        sighting: &HostSighting,
        updates: &[FactUpdate],
    ) -> Result<bool, StoreError> {
        let identity_changed = self.store.merge_network_identity(sighting).await?;
        for update in updates {
            self.store.apply_facts(&sighting.certfp, update).await?;
        }
        Ok(identity_changed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use hinv_core::HostRecord;
    use hinv_extractors::builtin_registry;
    use hinv_storage::{FaultPoint, MemoryInventoryStore};

    use super::*;

    fn sighting(certfp: &str, ip: &str) -> HostSighting {
        HostSighting {
            certfp: certfp.to_string(),
            last_seen: None,
            client_version: Some("3.0.1".into()),
            ip_addr: Some(ip.to_string()),
            os_hostname: Some("mac01".into()),
        }
    }

    fn artifact(name: &str, content: &str) -> Artifact {
        Artifact {
            id: 11,
            name: Some(name.into()),
            content: Some(content.into()),
            certfp: Some("fp:mac".into()),
            ..Artifact::default()
        }
    }

    fn merger(store: &MemoryInventoryStore, backoff: BackoffPolicy) -> HostMerger {
        HostMerger::new(
            Arc::new(store.clone()),
            Arc::new(builtin_registry().unwrap()),
            backoff,
        )
    }

    #[tokio::test]
    async fn ensure_host_inserts_then_touches() {
        let store = MemoryInventoryStore::new();
        let s = sighting("fp:new", "10.0.0.9");

        let mut tx = store.begin().await.unwrap();
        assert_eq!(ensure_host(tx.as_mut(), &s).await.unwrap(), HostPresence::Inserted);
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(ensure_host(tx.as_mut(), &s).await.unwrap(), HostPresence::Touched);
        tx.commit().await.unwrap();

        store.fail_next(FaultPoint::RacedInsert).await;
        let later = HostSighting {
            last_seen: chrono::Utc.with_ymd_and_hms(2026, 10, 2, 8, 0, 0).single(),
            client_version: Some("3.1.0".into()),
            ..s.clone()
        };
        let mut tx = store.begin().await.unwrap();
        assert_eq!(ensure_host(tx.as_mut(), &later).await.unwrap(), HostPresence::Raced);
        tx.commit().await.unwrap();

        assert_eq!(store.hosts().await.len(), 1);
        let host = store.host("fp:new").await.unwrap();
        assert_eq!(host.client_version.as_deref(), Some("3.1.0"));
        assert_eq!(host.last_seen, later.last_seen);
    }

    #[tokio::test]
    async fn enrich_twice_equals_enrich_once() {
        let store = MemoryInventoryStore::new();
        let s = sighting("fp:mac", "10.0.0.5");
        store
            .put_host(HostRecord {
                os_edition: Some("Workstation".into()),
                ..HostRecord::from_sighting(&s)
            })
            .await;
        let merger = merger(&store, BackoffPolicy::none());
        let a = artifact("/usr/bin/sw_vers", "ProductName:\tMac OS X\nProductVersion:\t10.14");

        let report = merger.enrich(&a, &s).await.unwrap();
        assert_eq!(report.rule_id, Some("sw-vers"));
        assert_eq!(report.updates_applied, 1);
        let once = store.host("fp:mac").await.unwrap();
        merger.enrich(&a, &s).await.unwrap();
        let twice = store.host("fp:mac").await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.os.as_deref(), Some("macOS 10.14"));
        assert_eq!(twice.os_edition, None);
    }

    #[tokio::test]
    async fn unrecognized_name_leaves_classification_untouched() {
        let store = MemoryInventoryStore::new();
        let s = sighting("fp:mac", "10.0.0.5");
        let before = HostRecord {
            os: Some("Debian 10".into()),
            os_edition: Some("Server".into()),
            kernel: Some("4.19.0-8-amd64".into()),
            vendor: Some("Dell Inc.".into()),
            model: Some("PowerEdge R640".into()),
            serial_no: Some("8XK2L13".into()),
            ..HostRecord::from_sighting(&s)
        };
        store.put_host(before.clone()).await;

        let report = merger(&store, BackoffPolicy::none())
            .enrich(&artifact("/etc/hosts", "127.0.0.1 localhost"), &s)
            .await
            .unwrap();

        assert_eq!(report.rule_id, None);
        assert_eq!(store.host("fp:mac").await.unwrap(), before);
    }

    #[tokio::test]
    async fn identity_change_clears_ttl_and_unchanged_keeps_it() {
        let store = MemoryInventoryStore::new();
        let s = sighting("fp:mac", "10.0.0.5");
        let marker = chrono::Utc::now();
        store
            .put_host(HostRecord {
                name_ttl: Some(marker),
                ..HostRecord::from_sighting(&s)
            })
            .await;
        let merger = merger(&store, BackoffPolicy::none());
        let a = artifact("/etc/hosts", "");

        assert!(!merger.enrich(&a, &s).await.unwrap().identity_changed);
        assert_eq!(store.host("fp:mac").await.unwrap().name_ttl, Some(marker));

        let moved = sighting("fp:mac", "10.0.0.6");
        assert!(merger.enrich(&a, &moved).await.unwrap().identity_changed);
        let host = store.host("fp:mac").await.unwrap();
        assert_eq!(host.ip_addr.as_deref(), Some("10.0.0.6"));
        assert_eq!(host.name_ttl, None);
    }

    #[tokio::test]
    async fn enrich_retries_transient_failures() {
        let store = MemoryInventoryStore::new();
        let s = sighting("fp:mac", "10.0.0.5");
        store.put_host(HostRecord::from_sighting(&s)).await;
        store.fail_next(FaultPoint::ApplyFacts).await;
        let merger = merger(
            &store,
            BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        );

        let report = merger
            .enrich(&artifact("/etc/debian_version", "10.4\n"), &s)
            .await
            .unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(store.host("fp:mac").await.unwrap().os.as_deref(), Some("Debian 10"));
    }

    #[tokio::test]
    async fn enrich_gives_up_after_retries() {
        let store = MemoryInventoryStore::new();
        let s = sighting("fp:mac", "10.0.0.5");
        store.put_host(HostRecord::from_sighting(&s)).await;
        store.fail_next(FaultPoint::MergeNetworkIdentity).await;
        store.fail_next(FaultPoint::MergeNetworkIdentity).await;

        let err = merger(
            &store,
            BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        )
        .enrich(&artifact("/etc/debian_version", "10.4\n"), &s)
        .await
        .unwrap_err();

        assert!(matches!(err, StoreError::Injected(FaultPoint::MergeNetworkIdentity)));
        assert_eq!(store.host("fp:mac").await.unwrap().os, None);
    }
}
