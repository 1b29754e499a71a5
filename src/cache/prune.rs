//! Retention pruning of the instruction log and retired checkpoints.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, info, instrument, warn};

use crate::application::repos::{PruneRepo, RepoError};
use crate::domain::entities::PruneReport;

use super::config::PruneConfig;
use super::ownership::PruneOwnership;

const METRIC_PRUNE_INSTRUCTIONS: &str = "farmsync_prune_instructions_deleted_total";
const METRIC_PRUNE_CHECKPOINTS: &str = "farmsync_prune_checkpoints_deleted_total";
const METRIC_PRUNE_MS: &str = "farmsync_prune_ms";

pub struct PruneWorker {
    config: PruneConfig,
    repo: Arc<dyn PruneRepo>,
    ownership: Arc<dyn PruneOwnership>,
    shutdown: watch::Sender<bool>,
}

impl PruneWorker {
    pub fn new(
        config: PruneConfig,
        repo: Arc<dyn PruneRepo>,
        ownership: Arc<dyn PruneOwnership>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            repo,
            ownership,
            shutdown,
        }
    }

    /// Oldest `created_at`/`updated_at` that survives a prune at `now`.
    pub fn cutoff(&self, now: OffsetDateTime) -> OffsetDateTime {
        let retention =
            time::Duration::try_from(self.config.retention).unwrap_or(time::Duration::MAX);
        now.checked_sub(retention).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Run one pass if this process owns pruning; `None` when it does not.
    #[instrument(skip(self))]
    pub async fn prune_once(&self) -> Result<Option<PruneReport>, RepoError> {
        if !self.ownership.is_pruning_owner() {
            debug!("Not the pruning owner; skipping");
            return Ok(None);
        }

        let started = Instant::now();
        let cutoff = self.cutoff(OffsetDateTime::now_utc());
        let report = self.repo.prune(cutoff).await?;

        if report.lock_contended {
            info!("Another process is pruning; skipped this pass");
        } else {
            counter!(METRIC_PRUNE_INSTRUCTIONS).increment(report.instructions_deleted);
            counter!(METRIC_PRUNE_CHECKPOINTS).increment(report.checkpoints_deleted);
            info!(
                instructions_deleted = report.instructions_deleted,
                checkpoints_deleted = report.checkpoints_deleted,
                %cutoff,
                "Pruned instruction log"
            );
        }
        histogram!(METRIC_PRUNE_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        Ok(Some(report))
    }

    /// Prune every `interval` until [`PruneWorker::shutdown`] is called.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.interval.max(Duration::from_secs(1));
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.prune_once().await {
                        warn!(error = %err, "Prune pass failed; retrying next interval");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Prune worker stopped");
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.run().await })
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPrune {
        cutoffs: Mutex<Vec<OffsetDateTime>>,
    }

    #[async_trait]
    impl PruneRepo for RecordingPrune {
        async fn prune(&self, cutoff: OffsetDateTime) -> Result<PruneReport, RepoError> {
            self.cutoffs.lock().unwrap().push(cutoff);
            Ok(PruneReport {
                instructions_deleted: 3,
                checkpoints_deleted: 1,
                lock_contended: false,
            })
        }
    }

    fn worker(owner: bool, repo: Arc<RecordingPrune>) -> PruneWorker {
        let role = if owner {
            crate::domain::types::ServerRole::Leader
        } else {
            crate::domain::types::ServerRole::Replica
        };
        PruneWorker::new(
            PruneConfig {
                interval: Duration::from_secs(60),
                retention: Duration::from_secs(3600),
            },
            repo,
            Arc::new(role),
        )
    }

    #[tokio::test]
    async fn non_owner_never_prunes() {
        let repo = Arc::new(RecordingPrune::default());
        let worker = worker(false, repo.clone());

        assert_eq!(worker.prune_once().await.unwrap(), None);
        assert!(repo.cutoffs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn owner_prunes_at_retention_cutoff() {
        let repo = Arc::new(RecordingPrune::default());
        let worker = worker(true, repo.clone());

        let before = OffsetDateTime::now_utc();
        let report = worker.prune_once().await.unwrap().unwrap();
        let after = OffsetDateTime::now_utc();

        assert_eq!(report.instructions_deleted, 3);
        let cutoff = repo.cutoffs.lock().unwrap()[0];
        assert!(cutoff >= before - time::Duration::hours(1));
        assert!(cutoff <= after - time::Duration::hours(1));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let repo = Arc::new(RecordingPrune::default());
        let worker = Arc::new(worker(true, repo));
        let handle = worker.spawn();

        worker.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker stops")
            .expect("task joins");
    }
}
