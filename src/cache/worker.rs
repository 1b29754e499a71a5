//! Per-node sync worker.
//!
//! Replays the shared instruction log into the local [`RefresherRegistry`] and records
//! progress in the node's checkpoint:
//!
//! 1. On the first cycle, load the checkpoint. No checkpoint, a pruned anchor row or an
//!    oversized backlog sends the node through a cold start (full rebuild).
//! 2. Each cycle reads the next batch after the checkpoint, applies every command of every
//!    instruction in id order, and advances the checkpoint after each instruction.
//! 3. A failing instruction holds the checkpoint and is retried with backoff; past the
//!    retry limit the node rebuilds instead.
//!
//! Cycles are single-flight: a trigger that finds one in progress returns [`TickOutcome::Busy`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use farmsync_types::RefresherId;
use metrics::{counter, gauge, histogram};
use time::OffsetDateTime;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::application::repos::{CheckpointRepo, InstructionLogRepo, RepoError};
use crate::domain::entities::InstructionRecord;
use crate::domain::types::{CorruptPayloadPolicy, LocalIdentity};

use super::config::SyncConfig;
use super::error::{ColdStartReason, SyncError};
use super::registry::RefresherRegistry;

const METRIC_SYNC_CYCLE_MS: &str = "farmsync_sync_cycle_ms";
const METRIC_APPLIED: &str = "farmsync_instructions_applied_total";
const METRIC_SKIPPED: &str = "farmsync_instructions_skipped_total";
const METRIC_FAILURES: &str = "farmsync_sync_failures_total";
const METRIC_COLD_STARTS: &str = "farmsync_cold_starts_total";
const METRIC_CHECKPOINT: &str = "farmsync_checkpoint_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    ColdStart,
    CatchingUp,
    SteadyState,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::ColdStart => "cold_start",
            SyncPhase::CatchingUp => "catching_up",
            SyncPhase::SteadyState => "steady_state",
        }
    }
}

/// What one trigger of the worker did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another cycle was in flight.
    Busy,
    /// A manual trigger arrived within one interval of the last cycle.
    Throttled,
    /// Nothing new in the log.
    Idle,
    Applied {
        applied: usize,
        skipped: usize,
        checkpoint: i64,
        /// The batch was full; more instructions are probably waiting.
        more: bool,
    },
    ColdStarted {
        reason: ColdStartReason,
        checkpoint: i64,
    },
    Failed {
        kind: &'static str,
        instruction_id: Option<i64>,
        retry_in: Duration,
    },
}

impl TickOutcome {
    fn label(&self) -> &'static str {
        match self {
            TickOutcome::Busy => "busy",
            TickOutcome::Throttled => "throttled",
            TickOutcome::Idle => "idle",
            TickOutcome::Applied { .. } => "applied",
            TickOutcome::ColdStarted { .. } => "cold_started",
            TickOutcome::Failed { .. } => "failed",
        }
    }
}

/// Point-in-time view of the worker, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub phase: SyncPhase,
    /// `None` until the checkpoint has been loaded or established.
    pub checkpoint: Option<i64>,
    pub consecutive_failures: u32,
}

struct WorkerState {
    phase: SyncPhase,
    booted: bool,
    checkpoint: i64,
    pending_cold_start: Option<ColdStartReason>,
    /// Last advance or heartbeat of the checkpoint row.
    touched_at: OffsetDateTime,
    failures: u32,
    /// Instruction currently holding the checkpoint and how often it failed in a row.
    blocked: Option<(i64, u32)>,
    last_cycle_started: Option<Instant>,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            phase: SyncPhase::CatchingUp,
            booted: false,
            checkpoint: 0,
            pending_cold_start: None,
            touched_at: OffsetDateTime::now_utc(),
            failures: 0,
            blocked: None,
            last_cycle_started: None,
        }
    }
}

enum InstructionResult {
    Applied,
    Skipped(&'static str),
}

pub struct SyncWorker {
    config: SyncConfig,
    identity: Arc<LocalIdentity>,
    log: Arc<dyn InstructionLogRepo>,
    checkpoints: Arc<dyn CheckpointRepo>,
    registry: Arc<RefresherRegistry>,
    state: Mutex<WorkerState>,
    shutdown: watch::Sender<bool>,
}

impl SyncWorker {
    pub fn new(
        config: SyncConfig,
        identity: Arc<LocalIdentity>,
        log: Arc<dyn InstructionLogRepo>,
        checkpoints: Arc<dyn CheckpointRepo>,
        registry: Arc<RefresherRegistry>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            identity,
            log,
            checkpoints,
            registry,
            state: Mutex::new(WorkerState::new()),
            shutdown,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RefresherRegistry> {
        &self.registry
    }

    /// Run one cycle now unless one is already in flight.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(mut state) = self.state.try_lock() else {
            return TickOutcome::Busy;
        };
        self.run_cycle(&mut state).await
    }

    /// Manual trigger, e.g. at the end of a request that expects fresh caches.
    ///
    /// A node in steady state is not re-polled within one interval of its last cycle.
    pub async fn request_sync(&self) -> TickOutcome {
        let Ok(mut state) = self.state.try_lock() else {
            return TickOutcome::Busy;
        };
        let recent = state
            .last_cycle_started
            .is_some_and(|started| started.elapsed() < self.config.interval);
        if state.phase == SyncPhase::SteadyState && recent {
            return TickOutcome::Throttled;
        }
        self.run_cycle(&mut state).await
    }

    pub async fn status(&self) -> WorkerStatus {
        let state = self.state.lock().await;
        WorkerStatus {
            phase: state.phase,
            checkpoint: state.booted.then_some(state.checkpoint),
            consecutive_failures: state.failures,
        }
    }

    /// Poll until [`SyncWorker::shutdown`] is called.
    #[instrument(skip(self), fields(node_id = %self.identity.node_id()))]
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut delay = Duration::ZERO;
        info!(origin = self.identity.origin(), "Sync worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let cycle = self.tick();
            tokio::pin!(cycle);
            let outcome = tokio::select! {
                outcome = &mut cycle => outcome,
                _ = shutdown.changed() => {
                    match tokio::time::timeout(self.config.shutdown_grace, &mut cycle).await {
                        Ok(outcome) => debug!(outcome = outcome.label(), "In-flight cycle finished"),
                        Err(_) => warn!("In-flight sync cycle abandoned after grace period"),
                    }
                    break;
                }
            };
            delay = self.next_delay(&outcome);
        }
        info!("Sync worker stopped");
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.run().await })
    }

    /// Stop between instructions; an in-flight cycle gets the configured grace period.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn next_delay(&self, outcome: &TickOutcome) -> Duration {
        match outcome {
            TickOutcome::Failed { retry_in, .. } => *retry_in,
            TickOutcome::Applied { more: true, .. } => Duration::ZERO,
            _ => self.config.interval,
        }
    }

    async fn run_cycle(&self, state: &mut WorkerState) -> TickOutcome {
        let started = Instant::now();
        state.last_cycle_started = Some(started);

        let outcome = match self.cycle(state).await {
            Ok(outcome) => {
                state.failures = 0;
                outcome
            }
            Err(err) => self.record_failure(state, &err),
        };

        histogram!(METRIC_SYNC_CYCLE_MS, "outcome" => outcome.label())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    async fn cycle(&self, state: &mut WorkerState) -> Result<TickOutcome, SyncError> {
        if state.pending_cold_start.is_none() {
            let checked =
                tokio::time::timeout(self.config.cycle_timeout, self.check_position(state)).await;
            match checked.unwrap_or(Err(SyncError::CycleTimeout)) {
                Ok(()) => {}
                Err(SyncError::ColdStartRequired { reason }) => {
                    state.pending_cold_start = Some(reason);
                    state.phase = SyncPhase::ColdStart;
                }
                Err(err) => return Err(err),
            }
        }

        // Cold starts run under `rebuild_timeout`, not `cycle_timeout`.
        if let Some(reason) = state.pending_cold_start {
            return tokio::time::timeout(self.config.rebuild_timeout, self.cold_start(state, reason))
                .await
                .unwrap_or(Err(SyncError::RebuildTimeout));
        }

        tokio::time::timeout(self.config.cycle_timeout, self.replay(state))
            .await
            .unwrap_or(Err(SyncError::CycleTimeout))
    }

    /// Decide whether replay may continue from the current checkpoint.
    async fn check_position(&self, state: &mut WorkerState) -> Result<(), SyncError> {
        if !state.booted {
            self.boot(state).await?;
        }
        self.check_age_gap(state).await
    }

    async fn boot(&self, state: &mut WorkerState) -> Result<(), SyncError> {
        let node_id = self.identity.node_id();
        let record = self
            .store("checkpoint.get", self.checkpoints.get(node_id))
            .await?;
        let Some(record) = record else {
            info!("No checkpoint recorded for this node");
            return Err(SyncError::ColdStartRequired {
                reason: ColdStartReason::NoCheckpoint,
            });
        };

        let checkpoint = record.last_applied_id;
        if checkpoint > 0 {
            let anchored = self
                .store("log.contains", self.log.contains(checkpoint))
                .await?;
            if !anchored {
                let head = self.store("log.max_id", self.log.max_id()).await?;
                if head > checkpoint {
                    warn!(
                        checkpoint,
                        head, "Checkpoint row was pruned while newer rows exist"
                    );
                    return Err(SyncError::ColdStartRequired {
                        reason: ColdStartReason::Gap,
                    });
                }
            }
        }

        let pending = self
            .store(
                "log.pending_command_count",
                self.log.pending_command_count(checkpoint),
            )
            .await?;
        if pending > self.config.max_pending_commands {
            info!(
                checkpoint,
                pending,
                limit = self.config.max_pending_commands,
                "Backlog too large to replay"
            );
            return Err(SyncError::ColdStartRequired {
                reason: ColdStartReason::Backlog,
            });
        }

        state.checkpoint = checkpoint;
        state.touched_at = record.updated_at;
        state.booted = true;
        state.phase = SyncPhase::CatchingUp;
        gauge!(METRIC_CHECKPOINT).set(checkpoint as f64);
        info!(checkpoint, pending, "Resuming replay from checkpoint");
        Ok(())
    }

    /// A checkpoint that has not moved for a whole retention window may sit below pruned rows.
    async fn check_age_gap(&self, state: &WorkerState) -> Result<(), SyncError> {
        if !older_than(state.touched_at, self.config.retention) {
            return Ok(());
        }

        let oldest = self.store("log.oldest_id", self.log.oldest_id()).await?;
        if let Some(oldest) = oldest
            && oldest > state.checkpoint.saturating_add(1)
        {
            warn!(
                checkpoint = state.checkpoint,
                oldest, "Instructions past the checkpoint may have been pruned"
            );
            return Err(SyncError::ColdStartRequired {
                reason: ColdStartReason::Gap,
            });
        }
        Ok(())
    }

    async fn cold_start(
        &self,
        state: &mut WorkerState,
        reason: ColdStartReason,
    ) -> Result<TickOutcome, SyncError> {
        state.phase = SyncPhase::ColdStart;
        warn!(
            reason = reason.as_str(),
            checkpoint = state.checkpoint,
            "Cold start: rebuilding caches from the authoritative store"
        );

        let node_id = self.identity.node_id();
        let head = self.store("log.max_id", self.log.max_id()).await?;
        self.registry
            .rebuild_all()
            .await
            .map_err(SyncError::Rebuild)?;
        let moved = self
            .store("checkpoint.advance", self.checkpoints.advance(node_id, head))
            .await?;
        if !moved {
            self.store("checkpoint.touch", self.checkpoints.touch(node_id))
                .await?;
        }

        state.checkpoint = state.checkpoint.max(head);
        state.touched_at = OffsetDateTime::now_utc();
        state.booted = true;
        state.pending_cold_start = None;
        state.blocked = None;
        state.phase = SyncPhase::SteadyState;

        counter!(METRIC_COLD_STARTS, "reason" => reason.as_str()).increment(1);
        gauge!(METRIC_CHECKPOINT).set(state.checkpoint as f64);
        info!(
            reason = reason.as_str(),
            checkpoint = state.checkpoint,
            "Cold start complete"
        );

        Ok(TickOutcome::ColdStarted {
            reason,
            checkpoint: state.checkpoint,
        })
    }

    async fn replay(&self, state: &mut WorkerState) -> Result<TickOutcome, SyncError> {
        let batch = self
            .store(
                "log.read_since",
                self.log.read_since(state.checkpoint, self.config.batch_limit),
            )
            .await?;

        if batch.is_empty() {
            state.phase = SyncPhase::SteadyState;
            self.heartbeat(state).await?;
            return Ok(TickOutcome::Idle);
        }

        let more = batch.len() >= self.config.batch_limit as usize;
        let node_id = self.identity.node_id();
        let mut last_by_refresher: HashMap<RefresherId, String> = HashMap::new();
        let mut applied = 0;
        let mut skipped = 0;

        for record in &batch {
            if self.shutdown_requested() {
                debug!(
                    checkpoint = state.checkpoint,
                    "Shutdown requested; leaving the rest of the batch"
                );
                break;
            }

            match self.apply_instruction(record, &mut last_by_refresher).await? {
                InstructionResult::Applied => {
                    applied += 1;
                    counter!(METRIC_APPLIED).increment(1);
                }
                InstructionResult::Skipped(reason) => {
                    skipped += 1;
                    counter!(METRIC_SKIPPED, "reason" => reason).increment(1);
                }
            }

            self.store(
                "checkpoint.advance",
                self.checkpoints.advance(node_id, record.id),
            )
            .await?;
            state.checkpoint = record.id;
            state.touched_at = OffsetDateTime::now_utc();
            state.blocked = None;
            gauge!(METRIC_CHECKPOINT).set(record.id as f64);
        }

        state.phase = if more {
            SyncPhase::CatchingUp
        } else {
            SyncPhase::SteadyState
        };
        debug!(
            applied,
            skipped,
            checkpoint = state.checkpoint,
            phase = state.phase.as_str(),
            "Batch replayed"
        );

        Ok(TickOutcome::Applied {
            applied,
            skipped,
            checkpoint: state.checkpoint,
            more,
        })
    }

    async fn apply_instruction(
        &self,
        record: &InstructionRecord,
        last_by_refresher: &mut HashMap<RefresherId, String>,
    ) -> Result<InstructionResult, SyncError> {
        if self.config.skip_own_instructions && record.origin_id == self.identity.origin() {
            return Ok(InstructionResult::Skipped("own_origin"));
        }

        let payload = match record.decode_payload() {
            Ok(payload) => payload,
            Err(source) => match self.config.corrupt_payload_policy {
                CorruptPayloadPolicy::Skip => {
                    error!(
                        instruction_id = record.id,
                        origin = %record.origin_id,
                        error = %source,
                        "Skipping instruction with undecodable payload"
                    );
                    return Ok(InstructionResult::Skipped("corrupt_payload"));
                }
                CorruptPayloadPolicy::Block => {
                    return Err(SyncError::CorruptPayload {
                        instruction_id: record.id,
                        source,
                    });
                }
            },
        };

        for command in payload.commands() {
            let fingerprint = command.fingerprint();
            if last_by_refresher.get(&command.refresher) == Some(&fingerprint) {
                debug!(
                    instruction_id = record.id,
                    refresher = %command.refresher,
                    "Repeated command collapsed"
                );
                continue;
            }

            self.registry
                .apply(command)
                .await
                .map_err(|source| SyncError::Handler {
                    instruction_id: record.id,
                    refresher: command.refresher.clone(),
                    source,
                })?;
            last_by_refresher.insert(command.refresher.clone(), fingerprint);
        }

        Ok(InstructionResult::Applied)
    }

    async fn heartbeat(&self, state: &mut WorkerState) -> Result<(), SyncError> {
        if !older_than(state.touched_at, self.config.heartbeat_after()) {
            return Ok(());
        }
        let node_id = self.identity.node_id();
        let touched = self
            .store("checkpoint.touch", self.checkpoints.touch(node_id))
            .await?;
        if !touched {
            warn!(
                checkpoint = state.checkpoint,
                "Checkpoint row was removed; recording it again"
            );
            self.store(
                "checkpoint.advance",
                self.checkpoints.advance(node_id, state.checkpoint),
            )
            .await?;
        }
        state.touched_at = OffsetDateTime::now_utc();
        debug!(checkpoint = state.checkpoint, "Checkpoint heartbeat");
        Ok(())
    }

    fn record_failure(&self, state: &mut WorkerState, err: &SyncError) -> TickOutcome {
        state.failures = state.failures.saturating_add(1);
        counter!(METRIC_FAILURES, "kind" => err.kind()).increment(1);

        if let Some(instruction_id) = err.instruction_id() {
            let attempts = match state.blocked {
                Some((blocked, attempts)) if blocked == instruction_id => attempts + 1,
                _ => 1,
            };
            state.blocked = Some((instruction_id, attempts));
            error!(
                instruction_id,
                attempts,
                error = %err,
                "Instruction failed; checkpoint held"
            );

            if self.config.retry_limit > 0 && attempts >= self.config.retry_limit {
                warn!(
                    instruction_id,
                    attempts, "Retry limit reached; escalating to a cold start"
                );
                state.pending_cold_start = Some(ColdStartReason::RetryLimit);
                state.phase = SyncPhase::ColdStart;
            }
        } else {
            warn!(
                error = %err,
                failures = state.failures,
                phase = state.phase.as_str(),
                "Sync cycle failed"
            );
        }

        TickOutcome::Failed {
            kind: err.kind(),
            instruction_id: err.instruction_id(),
            retry_in: self.config.backoff_delay(state.failures),
        }
    }

    async fn store<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, RepoError>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => result.map_err(|source| SyncError::store(operation, source)),
            Err(_) => Err(SyncError::store(operation, RepoError::Timeout)),
        }
    }
}

fn older_than(at: OffsetDateTime, window: Duration) -> bool {
    let elapsed = OffsetDateTime::now_utc() - at;
    let window_ms = i128::try_from(window.as_millis()).unwrap_or(i128::MAX);
    elapsed.whole_milliseconds() > window_ms
}
