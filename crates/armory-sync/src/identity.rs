//! Identity directory lookups and the resolver that links records to identities.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use armory_core::{IdentityId, RecordId, SyncStage};
use armory_storage::ArmigerStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, warn};

use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    pub discriminator: String,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("identity directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Identity whose name and discriminator both match exactly.
    async fn find_exact(
        &self,
        name: &str,
        discriminator: &str,
    ) -> Result<Option<Identity>, DirectoryError>;

    /// Candidates whose name contains `partial`, best match first.
    async fn search(&self, partial: &str) -> Result<Vec<Identity>, DirectoryError>;

    /// Exact match, falling back to the first scanned candidate with the same discriminator.
    async fn lookup(
        &self,
        name: &str,
        discriminator: &str,
    ) -> Result<Option<IdentityId>, DirectoryError> {
        if let Some(found) = self.find_exact(name, discriminator).await? {
            return Ok(Some(found.id));
        }
        Ok(self
            .search(name)
            .await?
            .into_iter()
            .find(|candidate| candidate.discriminator == discriminator)
            .map(|candidate| candidate.id))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RosterFile {
    #[serde(default)]
    members: Vec<Identity>,
}

/// Directory backed by a YAML member roster exported from the community server.
#[derive(Debug, Clone, Default)]
pub struct RosterDirectory {
    members: Vec<Identity>,
}

impl RosterDirectory {
    pub fn new(members: Vec<Identity>) -> Self {
        Self { members }
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let roster: RosterFile = serde_yaml::from_str(text).context("parsing roster yaml")?;
        Ok(Self::new(roster.members))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Missing roster means nothing resolves yet; a malformed one is still an error.
    pub fn load_or_empty(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "identity roster not found; records will stay unlinked");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[async_trait]
impl IdentityDirectory for RosterDirectory {
    async fn find_exact(
        &self,
        name: &str,
        discriminator: &str,
    ) -> Result<Option<Identity>, DirectoryError> {
        Ok(self
            .members
            .iter()
            .find(|m| m.name == name && m.discriminator == discriminator)
            .cloned())
    }

    async fn search(&self, partial: &str) -> Result<Vec<Identity>, DirectoryError> {
        let needle = partial.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let mut scored: Vec<(f64, &Identity)> = self
            .members
            .iter()
            .filter_map(|m| {
                let name = m.name.to_lowercase();
                name.contains(&needle)
                    .then(|| (jaro_winkler(&name, &needle), m))
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(scored.into_iter().map(|(_, m)| m.clone()).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Linked(IdentityId),
    AlreadyLinked,
    /// Nothing matched; retried on a later run.
    Miss,
    /// The record vanished between upsert and resolution.
    NoRecord,
}

pub struct IdentityResolver {
    store: Arc<dyn ArmigerStore>,
    directory: Arc<dyn IdentityDirectory>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn ArmigerStore>, directory: Arc<dyn IdentityDirectory>) -> Self {
        Self { store, directory }
    }

    pub async fn resolve(&self, record_id: RecordId) -> Result<Resolution, SyncError> {
        let stage = SyncStage::Resolving;
        let Some(record) = self
            .store
            .get(record_id)
            .await
            .map_err(|source| SyncError::Persistence { stage, source })?
        else {
            return Ok(Resolution::NoRecord);
        };
        if record.is_linked() {
            return Ok(Resolution::AlreadyLinked);
        }

        let found = self
            .directory
            .lookup(&record.qualified_name, &record.qualified_discriminator)
            .await
            .map_err(|source| SyncError::Directory { stage, source })?;
        let Some(identity) = found else {
            debug!(%record_id, name = %record.qualified_name, "no identity match yet");
            return Ok(Resolution::Miss);
        };

        let linked = self
            .store
            .link_identity(record_id, identity)
            .await
            .map_err(|source| SyncError::Persistence { stage, source })?;
        Ok(if linked {
            debug!(%record_id, %identity, "linked identity");
            Resolution::Linked(identity)
        } else {
            Resolution::AlreadyLinked
        })
    }
}
