//! One sync run: freshness check, fetch, extract, parse, reconcile, persist.

use std::future::Future;
use std::sync::Arc;

use armory_adapters::{extract_document_text, DocumentSource, ParseError, RecordGrammar};
use armory_core::{SyncStage, SyncState};
use armory_storage::{
    ArmigerStore, ArtifactStore, BackoffPolicy, FetchError, PersistenceError, StateStore,
};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::freshness::FreshnessGate;
use crate::identity::{IdentityDirectory, IdentityResolver};
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::SyncError;

/// Key in the scalar state store holding the last applied remote modification time.
pub const STATE_KEY: &str = "book_timestamp";

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub fetch_backoff: BackoffPolicy,
    /// Apply a parse with zero records (empties the registry) instead of refusing it.
    pub allow_empty_sync: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            fetch_backoff: BackoffPolicy::default(),
            allow_empty_sync: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Remote document not newer than the last applied one.
    Skipped { remote_modified: i64 },
    Completed {
        remote_modified: i64,
        summary: ReconcileSummary,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub state: SyncState,
    pub outcome: SyncOutcome,
}

pub struct SyncDriver {
    source: Arc<dyn DocumentSource>,
    artifacts: ArtifactStore,
    grammar: Arc<RecordGrammar>,
    store: Arc<dyn ArmigerStore>,
    state_store: Arc<dyn StateStore>,
    directory: Option<Arc<dyn IdentityDirectory>>,
    options: SyncOptions,
}

impl SyncDriver {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        artifacts: ArtifactStore,
        store: Arc<dyn ArmigerStore>,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            source,
            artifacts,
            grammar: Arc::new(RecordGrammar::registry_book()),
            store,
            state_store,
            directory: None,
            options: SyncOptions::default(),
        }
    }

    pub fn with_grammar(mut self, grammar: RecordGrammar) -> Self {
        self.grammar = Arc::new(grammar);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn IdentityDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Persisted state, seeding the unsynced sentinel on first start.
    pub async fn load_state(&self) -> Result<SyncState, PersistenceError> {
        load_state(self.state_store.as_ref()).await
    }

    /// Execute one run against `state`. The returned state is advanced only when
    /// every stage through persisting succeeded.
    pub async fn run_once(&self, state: SyncState) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_stages(run_id, state).instrument(span).await
    }

    async fn run_stages(&self, run_id: Uuid, state: SyncState) -> Result<SyncReport, SyncError> {
        let stage = SyncStage::CheckingFreshness;
        debug!(%stage, last_synced = state.last_synced_timestamp, "stage");
        let metadata = with_retry(self.options.fetch_backoff, "metadata", || {
            self.source.fetch_metadata()
        })
        .await
        .map_err(|source| SyncError::Fetch { stage, source })?;
        let decision = FreshnessGate::check(&metadata.modified_time, state)
            .map_err(|source| SyncError::Fetch { stage, source })?;
        let remote_modified = decision.remote_modified();
        if !decision.should_proceed() {
            info!(
                remote_modified,
                last_synced = state.last_synced_timestamp,
                "registry book unchanged, skipping"
            );
            return Ok(SyncReport {
                run_id,
                state,
                outcome: SyncOutcome::Skipped { remote_modified },
            });
        }

        let stage = SyncStage::Fetching;
        debug!(%stage, remote_modified, "stage");
        let bytes = with_retry(self.options.fetch_backoff, "content", || {
            self.source.fetch_content(&metadata.content_location)
        })
        .await
        .map_err(|source| SyncError::Fetch { stage, source })?;

        let stage = SyncStage::Extracting;
        debug!(%stage, "stage");
        let artifact = self
            .artifacts
            .replace(&bytes)
            .await
            .map_err(|err| SyncError::Parse {
                stage,
                source: ParseError::Artifact(err),
            })?;
        drop(bytes);
        info!(
            sha256 = %artifact.content_hash,
            bytes = artifact.byte_size,
            path = %artifact.path.display(),
            "stored registry book"
        );

        let path = artifact.path.clone();
        let text = tokio::task::spawn_blocking(move || extract_document_text(&path))
            .await
            .map_err(|join| SyncError::Parse {
                stage,
                source: ParseError::Worker(join.to_string()),
            })?
            .map_err(|source| SyncError::Parse { stage, source })?;

        let stage = SyncStage::Parsing;
        debug!(%stage, chars = text.len(), "stage");
        let grammar = Arc::clone(&self.grammar);
        let parsed = tokio::task::spawn_blocking(move || grammar.parse(&text))
            .await
            .map_err(|join| SyncError::Parse {
                stage,
                source: ParseError::Worker(join.to_string()),
            })?
            .map_err(|source| SyncError::Parse { stage, source })?;
        if parsed.is_empty() && !self.options.allow_empty_sync {
            return Err(SyncError::Parse {
                stage,
                source: ParseError::EmptyBook,
            });
        }

        debug!(stage = %SyncStage::Reconciling, records = parsed.len(), "stage");
        let resolver = self
            .directory
            .as_ref()
            .map(|directory| IdentityResolver::new(Arc::clone(&self.store), Arc::clone(directory)));
        let summary = Reconciler::new(Arc::clone(&self.store))
            .reconcile(&parsed, resolver.as_ref())
            .await?;

        let stage = SyncStage::Persisting;
        debug!(%stage, "stage");
        self.state_store
            .set_value(STATE_KEY, &remote_modified.to_string())
            .await
            .map_err(|source| SyncError::Persistence { stage, source })?;

        info!(
            remote_modified,
            deleted = summary.deleted,
            inserted = summary.inserted,
            updated = summary.updated,
            linked = summary.linked,
            unresolved = summary.unresolved,
            "sync completed"
        );
        Ok(SyncReport {
            run_id,
            state: state.advanced_to(remote_modified),
            outcome: SyncOutcome::Completed {
                remote_modified,
                summary,
            },
        })
    }
}

pub async fn load_state(store: &dyn StateStore) -> Result<SyncState, PersistenceError> {
    match store.get_value(STATE_KEY).await? {
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map(SyncState::new)
            .map_err(|_| PersistenceError::InvalidValue {
                key: STATE_KEY.to_string(),
                value: raw.clone(),
            }),
        None => {
            let unsynced = SyncState::UNSYNCED;
            store
                .set_value(STATE_KEY, &unsynced.last_synced_timestamp.to_string())
                .await?;
            Ok(unsynced)
        }
    }
}

/// Retry retryable fetch failures with the policy's capped exponential delay.
async fn with_retry<T, F, Fut>(
    policy: BackoffPolicy,
    what: &'static str,
    mut attempt_once: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0usize;
    loop {
        match attempt_once().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(what, attempt = attempt + 1, ?delay, error = %err, "fetch failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
