//! Core domain model for host inventory fact ingestion.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "hinv-core";

/// Opaque storage key of an uploaded artifact.
pub type ArtifactId = i64;

/// One stored text payload (file content or command output) submitted by an agent.
///
/// Everything except `id` is nullable in storage, so every attribute is optional here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub name: Option<String>,
    pub content: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    pub is_command: Option<bool>,
    pub certfp: Option<String>,
    pub ip_addr: Option<String>,
    pub client_version: Option<String>,
    pub os_hostname: Option<String>,
}

impl Artifact {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    pub fn content(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }

    /// The host-level observation carried by this artifact, or `None` when the
    /// trust fingerprint is missing.
    pub fn sighting(&self) -> Option<HostSighting> {
        let certfp = self.certfp.clone()?;
        Some(HostSighting {
            certfp,
            last_seen: self.captured_at,
            client_version: self.client_version.clone(),
            ip_addr: self.ip_addr.clone(),
            os_hostname: self.os_hostname.clone(),
        })
    }
}

/// Host attributes reported alongside every artifact, keyed by trust fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSighting {
    pub certfp: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub client_version: Option<String>,
    pub ip_addr: Option<String>,
    pub os_hostname: Option<String>,
}

/// Per-fingerprint inventory row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub certfp: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub client_version: Option<String>,
    pub ip_addr: Option<String>,
    pub os_hostname: Option<String>,
    pub os: Option<String>,
    pub os_edition: Option<String>,
    pub kernel: Option<String>,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial_no: Option<String>,
    /// Freshness marker for names derived from `ip_addr`/`os_hostname`.
    /// Cleared whenever either input changes.
    pub name_ttl: Option<DateTime<Utc>>,
}

impl HostRecord {
    pub fn from_sighting(sighting: &HostSighting) -> Self {
        Self {
            certfp: sighting.certfp.clone(),
            last_seen: sighting.last_seen,
            client_version: sighting.client_version.clone(),
            ip_addr: sighting.ip_addr.clone(),
            os_hostname: sighting.os_hostname.clone(),
            ..Self::default()
        }
    }

    fn fact_mut(&mut self, fact: HostFact) -> &mut Option<String> {
        match fact {
            HostFact::Os => &mut self.os,
            HostFact::OsEdition => &mut self.os_edition,
            HostFact::Kernel => &mut self.kernel,
            HostFact::Vendor => &mut self.vendor,
            HostFact::Model => &mut self.model,
            HostFact::SerialNo => &mut self.serial_no,
        }
    }
}

/// Classification fields an extractor may propose for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostFact {
    Os,
    OsEdition,
    Kernel,
    Vendor,
    Model,
    SerialNo,
}

impl HostFact {
    /// Column name in the `hostinfo` table.
    pub const fn column(self) -> &'static str {
        match self {
            HostFact::Os => "os",
            HostFact::OsEdition => "os_edition",
            HostFact::Kernel => "kernel",
            HostFact::Vendor => "vendor",
            HostFact::Model => "model",
            HostFact::SerialNo => "serialno",
        }
    }
}

/// Partial set of host facts proposed by one extractor.
///
/// Setting an edition and clearing it are mutually exclusive; whichever was
/// requested last wins. An update built elsewhere with both keeps the edition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactUpdate {
    pub fields: BTreeMap<HostFact, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clear_edition: bool,
}

impl FactUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, fact: HostFact, value: impl Into<String>) -> Self {
        if fact == HostFact::OsEdition {
            self.clear_edition = false;
        }
        self.fields.insert(fact, value.into());
        self
    }

    pub fn clearing_edition(mut self) -> Self {
        self.fields.remove(&HostFact::OsEdition);
        self.clear_edition = true;
        self
    }

    pub fn get(&self, fact: HostFact) -> Option<&str> {
        self.fields.get(&fact).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && !self.clear_edition
    }

    /// Whether applying this update nulls `os_edition`.
    pub fn clears_edition(&self) -> bool {
        self.clear_edition && !self.fields.contains_key(&HostFact::OsEdition)
    }

    /// Field-level last-writer-wins merge; applying twice equals applying once.
    pub fn apply_to(&self, record: &mut HostRecord) {
        for (fact, value) in &self.fields {
            *record.fact_mut(*fact) = Some(value.clone());
        }
        if self.clears_edition() {
            record.os_edition = None;
        }
    }
}
