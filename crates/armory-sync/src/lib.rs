//! Registry sync pipeline: freshness gate, reconciliation, identity resolution,
//! the staged driver and its periodic scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use armory_adapters::{
    DocumentSource, DriveDocumentSource, DriveSourceConfig, ParseError, DEFAULT_DRIVE_ENDPOINT,
};
use armory_core::SyncStage;
use armory_storage::{
    ArtifactStore, BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, PersistenceError,
    SqliteStore,
};
use thiserror::Error;
use tracing::info;

pub mod driver;
pub mod freshness;
pub mod identity;
pub mod reconcile;
pub mod schedule;

pub use driver::{load_state, SyncDriver, SyncOptions, SyncOutcome, SyncReport, STATE_KEY};
pub use freshness::{parse_modified_time, FreshnessGate, GateDecision};
pub use identity::{
    DirectoryError, Identity, IdentityDirectory, IdentityResolver, Resolution, RosterDirectory,
};
pub use reconcile::{ReconcileSummary, Reconciler};
pub use schedule::{SyncScheduler, SyncTrigger, TickOutcome};

pub const CRATE_NAME: &str = "armory-sync";

/// Drive file id of the published registry book.
pub const DEFAULT_BOOK_FILE_ID: &str = "1RyuY_WM4zSRtVhTwjs9lut9vrlMmmd24";

/// A failed run, tagged with the stage it failed in.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{stage}: {source}")]
    Fetch {
        stage: SyncStage,
        #[source]
        source: FetchError,
    },
    #[error("{stage}: {source}")]
    Parse {
        stage: SyncStage,
        #[source]
        source: ParseError,
    },
    #[error("{stage}: {source}")]
    Persistence {
        stage: SyncStage,
        #[source]
        source: PersistenceError,
    },
    #[error("{stage}: {source}")]
    Directory {
        stage: SyncStage,
        #[source]
        source: DirectoryError,
    },
}

impl SyncError {
    pub fn stage(&self) -> SyncStage {
        match self {
            SyncError::Fetch { stage, .. }
            | SyncError::Parse { stage, .. }
            | SyncError::Persistence { stage, .. }
            | SyncError::Directory { stage, .. } => *stage,
        }
    }

    /// Whether the store may have been partially updated before the failure.
    pub fn store_touched(&self) -> bool {
        self.stage().mutates_store()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub artifact_path: PathBuf,
    pub drive_endpoint: String,
    pub drive_file_id: String,
    pub drive_api_key: Option<String>,
    pub roster_path: PathBuf,
    pub sync_interval_secs: u64,
    pub sync_cron: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_retries: usize,
    pub allow_empty_sync: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/armory.db".to_string()),
            artifact_path: std::env::var("ARMORY_ARTIFACT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/book/book.docx")),
            drive_endpoint: std::env::var("ARMORY_DRIVE_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_DRIVE_ENDPOINT.to_string()),
            drive_file_id: std::env::var("ARMORY_DRIVE_FILE_ID")
                .unwrap_or_else(|_| DEFAULT_BOOK_FILE_ID.to_string()),
            drive_api_key: std::env::var("ARMORY_DRIVE_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            roster_path: std::env::var("ARMORY_ROSTER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/roster.yaml")),
            sync_interval_secs: std::env::var("ARMORY_SYNC_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(36_000),
            sync_cron: std::env::var("ARMORY_SYNC_CRON")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            user_agent: std::env::var("ARMORY_USER_AGENT")
                .unwrap_or_else(|_| "armory-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("ARMORY_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            fetch_retries: std::env::var("ARMORY_FETCH_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            allow_empty_sync: std::env::var("ARMORY_ALLOW_EMPTY_SYNC")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    pub fn trigger(&self) -> SyncTrigger {
        match &self.sync_cron {
            Some(expr) => SyncTrigger::Cron(expr.clone()),
            None => SyncTrigger::Interval(Duration::from_secs(self.sync_interval_secs)),
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            fetch_backoff: BackoffPolicy {
                max_retries: self.fetch_retries,
                ..BackoffPolicy::default()
            },
            allow_empty_sync: self.allow_empty_sync,
        }
    }
}

/// Open (creating if needed) and migrate the configured database.
pub async fn open_store(config: &SyncConfig) -> Result<SqliteStore> {
    let store = SqliteStore::connect(&config.database_url).await?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

pub fn build_document_source(config: &SyncConfig) -> Result<DriveDocumentSource> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    Ok(DriveDocumentSource::new(
        http,
        DriveSourceConfig {
            endpoint: config.drive_endpoint.clone(),
            file_id: config.drive_file_id.clone(),
            api_key: config.drive_api_key.clone(),
        },
    ))
}

pub async fn build_driver(config: &SyncConfig) -> Result<SyncDriver> {
    let store = Arc::new(open_store(config).await?);
    let source: Arc<dyn DocumentSource> = Arc::new(build_document_source(config)?);
    let roster = RosterDirectory::load_or_empty(&config.roster_path)?;
    info!(members = roster.len(), path = %config.roster_path.display(), "loaded identity roster");

    Ok(SyncDriver::new(
        source,
        ArtifactStore::new(config.artifact_path.clone()),
        store.clone(),
        store,
    )
    .with_directory(Arc::new(roster))
    .with_options(config.sync_options()))
}

pub async fn run_sync_once_from_env() -> Result<SyncReport> {
    let config = SyncConfig::from_env();
    let driver = build_driver(&config).await?;
    let state = driver.load_state().await.context("loading sync state")?;
    let report = driver.run_once(state).await?;
    Ok(report)
}

/// Run immediately, then on every trigger until SIGINT or SIGTERM. A run in
/// flight when the signal arrives is allowed to finish.
pub async fn run_daemon_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let driver = build_driver(&config).await?;
    let state = driver.load_state().await.context("loading sync state")?;
    let scheduler = Arc::new(SyncScheduler::new(Arc::new(driver), state));

    let shutdown = shutdown_signal()?;
    tokio::pin!(shutdown);
    let initial = scheduler.tick();
    tokio::pin!(initial);

    tokio::select! {
        _ = &mut initial => {
            let mut sched = scheduler.start(&config.trigger()).await?;
            shutdown.await;
            info!("shutdown requested, waiting for in-flight sync");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        _ = &mut shutdown => {
            info!("shutdown requested, waiting for in-flight sync");
            initial.await;
        }
    }

    let state = scheduler.close().await;
    info!(last_synced = state.last_synced_timestamp, "sync daemon stopped");
    Ok(())
}

/// Registers the handlers before returning, so a signal delivered while the
/// first run is still going is not lost.
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
        let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        Ok(async move {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = term.recv() => {}
            }
        })
    }
    #[cfg(not(unix))]
    {
        Ok(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "ctrl-c handler failed, stopping");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_touched_follows_stage() {
        let fetch = SyncError::Fetch {
            stage: SyncStage::Fetching,
            source: FetchError::Malformed("empty".to_string()),
        };
        assert_eq!(fetch.stage(), SyncStage::Fetching);
        assert!(!fetch.store_touched());

        let directory = SyncError::Directory {
            stage: SyncStage::Resolving,
            source: DirectoryError::Unavailable("timeout".to_string()),
        };
        assert!(directory.store_touched());
        assert!(directory.to_string().starts_with("resolving:"));
    }

    #[test]
    fn trigger_prefers_cron_expression() {
        let mut config = SyncConfig::from_env();
        config.sync_cron = None;
        config.sync_interval_secs = 36_000;
        assert_eq!(
            config.trigger(),
            SyncTrigger::Interval(Duration::from_secs(36_000))
        );
        config.sync_cron = Some("0 0 */10 * * *".to_string());
        assert_eq!(config.trigger(), SyncTrigger::Cron("0 0 */10 * * *".to_string()));
        config.fetch_retries = 4;
        assert_eq!(config.sync_options().fetch_backoff.max_retries, 4);
    }
}
