//! Periodic trigger around the sync driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use armory_core::{SyncStage, SyncState};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::driver::{SyncDriver, SyncReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
    Interval(Duration),
    Cron(String),
}

#[derive(Debug)]
pub enum TickOutcome {
    /// A previous run still held the state.
    Busy,
    /// The scheduler was closed for shutdown.
    Closed,
    Finished(SyncReport),
    Aborted(SyncStage),
}

/// Owns the process-wide `SyncState`. Holding its lock is what marks a run as in flight.
pub struct SyncScheduler {
    driver: Arc<SyncDriver>,
    state: Arc<Mutex<SyncState>>,
    /// Only written while holding `state`.
    closed: AtomicBool,
}

impl SyncScheduler {
    pub fn new(driver: Arc<SyncDriver>, initial: SyncState) -> Self {
        Self {
            driver,
            state: Arc::new(Mutex::new(initial)),
            closed: AtomicBool::new(false),
        }
    }

    /// Run once unless a run is already in flight. Failures are logged here and
    /// never propagate to the timer.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(mut state) = self.state.try_lock() else {
            warn!("previous sync still in flight, skipping tick");
            return TickOutcome::Busy;
        };
        if self.closed.load(Ordering::Acquire) {
            debug!("scheduler closed, ignoring tick");
            return TickOutcome::Closed;
        }

        match self.driver.run_once(*state).await {
            Ok(report) => {
                *state = report.state;
                TickOutcome::Finished(report)
            }
            Err(err) => {
                error!(stage = %err.stage(), error = %err, "sync run aborted");
                TickOutcome::Aborted(err.stage())
            }
        }
    }

    pub async fn start(self: &Arc<Self>, trigger: &SyncTrigger) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let this = Arc::clone(self);
        let job = match trigger {
            SyncTrigger::Interval(every) => Job::new_repeated_async(*every, move |_uuid, _l| {
                let this = Arc::clone(&this);
                Box::pin(async move {
                    this.tick().await;
                })
            })
            .with_context(|| format!("creating interval job every {every:?}"))?,
            SyncTrigger::Cron(expr) => Job::new_async(expr.as_str(), move |_uuid, _l| {
                let this = Arc::clone(&this);
                Box::pin(async move {
                    this.tick().await;
                })
            })
            .with_context(|| format!("creating scheduler job for cron {expr}"))?,
        };
        sched.add(job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;
        info!(?trigger, "sync scheduler started");
        Ok(sched)
    }

    /// Wait for any in-flight run to finish, then refuse every later tick.
    pub async fn close(&self) -> SyncState {
        let state = self.state.lock().await;
        self.closed.store(true, Ordering::Release);
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armory_adapters::{DocumentMetadata, DocumentSource};
    use armory_storage::{ArtifactStore, FetchError, SqliteStore};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Blocks inside the metadata fetch until released.
    struct HeldSource {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl DocumentSource for HeldSource {
        async fn fetch_metadata(&self) -> Result<DocumentMetadata, FetchError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(DocumentMetadata {
                modified_time: "1970-01-01T00:00:00Z".to_string(),
                content_location: "unused".to_string(),
            })
        }

        async fn fetch_content(&self, _content_location: &str) -> Result<Vec<u8>, FetchError> {
            unreachable!("freshness gate skips unchanged documents")
        }
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let source = Arc::new(HeldSource {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let driver = SyncDriver::new(
            source.clone(),
            ArtifactStore::new(dir.path().join("book.docx")),
            store.clone(),
            store,
        );
        let scheduler = Arc::new(SyncScheduler::new(Arc::new(driver), SyncState::UNSYNCED));

        let first = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.tick().await }
        });
        source.entered.notified().await;

        assert!(matches!(scheduler.tick().await, TickOutcome::Busy));

        source.release.notify_one();
        let finished = first.await.unwrap();
        assert!(matches!(finished, TickOutcome::Finished(_)));
        assert_eq!(scheduler.close().await, SyncState::UNSYNCED);
    }

    #[tokio::test]
    async fn close_waits_for_the_running_sync_and_blocks_later_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let source = Arc::new(HeldSource {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let driver = SyncDriver::new(
            source.clone(),
            ArtifactStore::new(dir.path().join("book.docx")),
            store.clone(),
            store,
        );
        let scheduler = Arc::new(SyncScheduler::new(Arc::new(driver), SyncState::UNSYNCED));

        let running = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.tick().await }
        });
        source.entered.notified().await;

        let closing = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.close().await }
        });
        tokio::task::yield_now().await;
        assert!(!closing.is_finished());

        source.release.notify_one();
        assert!(matches!(running.await.unwrap(), TickOutcome::Finished(_)));
        assert_eq!(closing.await.unwrap(), SyncState::UNSYNCED);
        assert!(matches!(scheduler.tick().await, TickOutcome::Closed));
    }
}
