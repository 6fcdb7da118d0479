//! Core domain model for the armiger registry.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "armory-core";

/// Stable external key of a registry entry (the "GreiiN" number in the book).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Reference to an account in the external identity directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub i64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Parsed handoff contract from the record grammar into the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmigerEntry {
    pub record_id: RecordId,
    pub qualified_name: String,
    pub qualified_discriminator: String,
    pub blazon: String,
}

impl ArmigerEntry {
    /// `name#discriminator`, the form the registry book prints.
    pub fn qualified(&self) -> String {
        format!("{}#{}", self.qualified_name, self.qualified_discriminator)
    }
}

/// Persisted registry row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmigerRecord {
    pub record_id: RecordId,
    pub qualified_name: String,
    pub qualified_discriminator: String,
    pub blazon: String,
    pub linked_identity_id: Option<IdentityId>,
}

impl ArmigerRecord {
    pub fn is_linked(&self) -> bool {
        self.linked_identity_id.is_some()
    }
}

impl From<ArmigerEntry> for ArmigerRecord {
    fn from(entry: ArmigerEntry) -> Self {
        Self {
            record_id: entry.record_id,
            qualified_name: entry.qualified_name,
            qualified_discriminator: entry.qualified_discriminator,
            blazon: entry.blazon,
            linked_identity_id: None,
        }
    }
}

/// One full parse of the registry book, keyed and ordered by record id.
pub type ParsedBook = BTreeMap<RecordId, ArmigerEntry>;

/// Process-wide sync bookkeeping, threaded through the driver by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncState {
    /// Remote modification time (epoch seconds) of the last fully applied document.
    pub last_synced_timestamp: i64,
}

impl SyncState {
    /// Sentinel written on first start; older than any real document.
    pub const UNSYNCED: SyncState = SyncState {
        last_synced_timestamp: 0,
    };

    pub fn new(last_synced_timestamp: i64) -> Self {
        Self {
            last_synced_timestamp,
        }
    }

    pub fn is_unsynced(&self) -> bool {
        self.last_synced_timestamp == Self::UNSYNCED.last_synced_timestamp
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.last_synced_timestamp, 0).single()
    }

    pub fn advanced_to(self, remote_modified: i64) -> Self {
        Self {
            last_synced_timestamp: remote_modified,
        }
    }
}

/// Stages of a single sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Idle,
    CheckingFreshness,
    Fetching,
    Extracting,
    Parsing,
    Reconciling,
    Resolving,
    Persisting,
    Aborted,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::Idle => "idle",
            SyncStage::CheckingFreshness => "checking_freshness",
            SyncStage::Fetching => "fetching",
            SyncStage::Extracting => "extracting",
            SyncStage::Parsing => "parsing",
            SyncStage::Reconciling => "reconciling",
            SyncStage::Resolving => "resolving",
            SyncStage::Persisting => "persisting",
            SyncStage::Aborted => "aborted",
        }
    }

    /// Whether a failure in this stage can have touched the record store.
    pub fn mutates_store(&self) -> bool {
        matches!(
            self,
            SyncStage::Reconciling | SyncStage::Resolving | SyncStage::Persisting
        )
    }
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
