//! In-memory backend for local runs and tests.
//!
//! Transactions are serialisable: a transaction holds the store lock for its
//! whole lifetime and restores a snapshot on rollback or drop.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use hinv_core::{Artifact, ArtifactId, FactUpdate, HostRecord, HostSighting};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{InsertOutcome, InventoryStore, InventoryTx, PoisonState, Result, StoreError};

/// Operations that can be made to fail once via [`MemoryInventoryStore::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    UnprocessedQuery,
    Begin,
    LoadArtifact,
    TouchHost,
    InsertHost,
    MarkProcessed,
    Commit,
    MergeNetworkIdentity,
    ApplyFacts,
    RecordPoisonAttempt,
    /// Not an error: `touch_host` reports zero rows, as it does when a
    /// concurrent transaction inserts the host after this one looked.
    RacedInsert,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub artifact: Artifact,
    pub processed: bool,
    pub attempts: u32,
    pub failed: bool,
}

#[derive(Debug, Clone, Default)]
struct MemoryData {
    artifacts: BTreeMap<ArtifactId, StoredArtifact>,
    hosts: BTreeMap<String, HostRecord>,
}

#[derive(Debug, Default)]
struct MemoryState {
    data: MemoryData,
    faults: Vec<FaultPoint>,
}

impl MemoryState {
    fn take_fault(&mut self, point: FaultPoint) -> bool {
        match self.faults.iter().position(|f| *f == point) {
            Some(idx) => {
                self.faults.remove(idx);
                true
            }
            None => false,
        }
    }

    fn check(&mut self, point: FaultPoint) -> Result<()> {
        if self.take_fault(point) {
            return Err(StoreError::Injected(point));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryInventoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an unprocessed artifact, replacing any artifact with the same id.
    pub async fn insert_artifact(&self, artifact: Artifact) {
        let mut state = self.state.lock().await;
        state.data.artifacts.insert(
            artifact.id,
            StoredArtifact {
                artifact,
                processed: false,
                attempts: 0,
                failed: false,
            },
        );
    }

    /// Rewrites an artifact's fingerprint in place, as the ingestion side does
    /// when it repairs a row.
    pub async fn set_fingerprint(&self, id: ArtifactId, certfp: Option<String>) -> bool {
        let mut state = self.state.lock().await;
        match state.data.artifacts.get_mut(&id) {
            Some(stored) => {
                stored.artifact.certfp = certfp;
                true
            }
            None => false,
        }
    }

    pub async fn put_host(&self, record: HostRecord) {
        let mut state = self.state.lock().await;
        state.data.hosts.insert(record.certfp.clone(), record);
    }

    pub async fn host(&self, certfp: &str) -> Option<HostRecord> {
        self.state.lock().await.data.hosts.get(certfp).cloned()
    }

    pub async fn hosts(&self) -> Vec<HostRecord> {
        self.state.lock().await.data.hosts.values().cloned().collect()
    }

    pub async fn artifact(&self, id: ArtifactId) -> Option<StoredArtifact> {
        self.state.lock().await.data.artifacts.get(&id).cloned()
    }

    /// Queues a one-shot fault; the next operation at `point` fails.
    pub async fn fail_next(&self, point: FaultPoint) {
        self.state.lock().await.faults.push(point);
    }
}

#[async_trait]
impl InventoryStore for MemoryInventoryStore {
    async fn unprocessed_artifact_ids(&self) -> Result<Vec<ArtifactId>> {
        let mut state = self.state.lock().await;
        state.check(FaultPoint::UnprocessedQuery)?;
        Ok(state
            .data
            .artifacts
            .values()
            .filter(|a| !a.processed && !a.failed)
            .map(|a| a.artifact.id)
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn InventoryTx>> {
        let mut guard = Arc::clone(&self.state).lock_owned().await;
        guard.check(FaultPoint::Begin)?;
        let snapshot = guard.data.clone();
        Ok(Box::new(MemoryTx {
            guard,
            snapshot: Some(snapshot),
        }))
    }

    async fn merge_network_identity(&self, sighting: &HostSighting) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.check(FaultPoint::MergeNetworkIdentity)?;
        let Some(host) = state.data.hosts.get_mut(&sighting.certfp) else {
            return Ok(false);
        };
        if host.ip_addr == sighting.ip_addr && host.os_hostname == sighting.os_hostname {
            return Ok(false);
        }
        host.ip_addr = sighting.ip_addr.clone();
        host.os_hostname = sighting.os_hostname.clone();
        host.name_ttl = None;
        Ok(true)
    }

    async fn apply_facts(&self, certfp: &str, update: &FactUpdate) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.check(FaultPoint::ApplyFacts)?;
        if update.is_empty() {
            return Ok(0);
        }
        match state.data.hosts.get_mut(certfp) {
            Some(host) => {
                update.apply_to(host);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn record_poison_attempt(&self, id: ArtifactId, max_attempts: u32) -> Result<PoisonState> {
        let mut state = self.state.lock().await;
        state.check(FaultPoint::RecordPoisonAttempt)?;
        let Some(stored) = state.data.artifacts.get_mut(&id) else {
            return Ok(PoisonState::default());
        };
        stored.attempts = stored.attempts.saturating_add(1);
        stored.failed = max_attempts > 0 && stored.attempts >= max_attempts;
        Ok(PoisonState {
            attempts: stored.attempts,
            failed: stored.failed,
        })
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    /// `Some` until the transaction commits or rolls back.
    snapshot: Option<MemoryData>,
}

impl MemoryTx {
    fn restore(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.guard.data = snapshot;
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.restore();
    }
}

#[async_trait]
impl InventoryTx for MemoryTx {
    async fn load_artifact(&mut self, id: ArtifactId) -> Result<Option<Artifact>> {
        self.guard.check(FaultPoint::LoadArtifact)?;
        Ok(self
            .guard
            .data
            .artifacts
            .get(&id)
            .filter(|a| !a.processed)
            .map(|a| a.artifact.clone()))
    }

    async fn touch_host(&mut self, sighting: &HostSighting) -> Result<u64> {
        self.guard.check(FaultPoint::TouchHost)?;
        if self.guard.take_fault(FaultPoint::RacedInsert) {
            return Ok(0);
        }
        match self.guard.data.hosts.get_mut(&sighting.certfp) {
            Some(host) => {
                host.last_seen = sighting.last_seen;
                host.client_version = sighting.client_version.clone();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn insert_host(&mut self, sighting: &HostSighting) -> Result<InsertOutcome> {
        self.guard.check(FaultPoint::InsertHost)?;
        if self.guard.data.hosts.contains_key(&sighting.certfp) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        self.guard
            .data
            .hosts
            .insert(sighting.certfp.clone(), HostRecord::from_sighting(sighting));
        Ok(InsertOutcome::Inserted)
    }

    async fn mark_processed(&mut self, id: ArtifactId) -> Result<()> {
        self.guard.check(FaultPoint::MarkProcessed)?;
        if let Some(stored) = self.guard.data.artifacts.get_mut(&id) {
            stored.processed = true;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        tx.guard.check(FaultPoint::Commit)?;
        tx.snapshot = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        tx.restore();
        Ok(())
    }
}
