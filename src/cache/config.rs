//! Sync and prune worker configuration.
//!
//! Built from the `[sync]` and `[prune]` sections of the layered settings.

use std::time::Duration;

use crate::domain::types::CorruptPayloadPolicy;

const DEFAULT_INTERVAL_MS: u64 = 5000;
const DEFAULT_BATCH_LIMIT: u32 = 100;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_CYCLE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_REBUILD_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 60_000;
const DEFAULT_MAX_PENDING_COMMANDS: u64 = 1000;
const DEFAULT_MAX_COMMANDS_PER_ROW: usize = 1000;
const DEFAULT_RETRY_LIMIT: u32 = 20;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5000;
const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 3600;
const DEFAULT_RETENTION_SECS: u64 = 2 * 24 * 3600;
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Sync worker and publisher tuning.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Poll period of the sync loop.
    pub interval: Duration,
    /// Maximum instructions read per cycle.
    pub batch_limit: u32,
    /// Bound on a single store call.
    pub store_timeout: Duration,
    /// Bound on one read-apply-advance cycle.
    pub cycle_timeout: Duration,
    /// Bound on one cold start, which runs outside `cycle_timeout`.
    pub rebuild_timeout: Duration,
    /// Cap on failure backoff.
    pub max_backoff: Duration,
    /// Backlog (in keyed effects) above which a booting node rebuilds instead of replaying.
    pub max_pending_commands: u64,
    /// Keyed effects per stored row before a publish is split.
    pub max_commands_per_row: usize,
    /// Consecutive failures of one instruction before a rebuild; `0` never escalates.
    pub retry_limit: u32,
    pub skip_own_instructions: bool,
    pub corrupt_payload_policy: CorruptPayloadPolicy,
    /// How long an in-flight cycle may run after shutdown is requested.
    pub shutdown_grace: Duration,
    /// Instruction retention window; drives the heartbeat and the age gap rule.
    pub retention: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            batch_limit: DEFAULT_BATCH_LIMIT,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            cycle_timeout: Duration::from_millis(DEFAULT_CYCLE_TIMEOUT_MS),
            rebuild_timeout: Duration::from_millis(DEFAULT_REBUILD_TIMEOUT_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            max_pending_commands: DEFAULT_MAX_PENDING_COMMANDS,
            max_commands_per_row: DEFAULT_MAX_COMMANDS_PER_ROW,
            retry_limit: DEFAULT_RETRY_LIMIT,
            skip_own_instructions: true,
            corrupt_payload_policy: CorruptPayloadPolicy::Block,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
        }
    }
}

impl From<&crate::config::Settings> for SyncConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        let sync = &settings.sync;
        Self {
            interval: sync.interval,
            batch_limit: sync.batch_limit.get(),
            store_timeout: sync.store_timeout,
            cycle_timeout: sync.cycle_timeout,
            rebuild_timeout: sync.rebuild_timeout,
            max_backoff: sync.max_backoff,
            max_pending_commands: sync.max_pending_commands,
            max_commands_per_row: sync.max_commands_per_row.get(),
            retry_limit: sync.retry_limit,
            skip_own_instructions: sync.skip_own_instructions,
            corrupt_payload_policy: sync.corrupt_payload_policy,
            shutdown_grace: sync.shutdown_grace,
            retention: settings.prune.retention,
        }
    }
}

impl SyncConfig {
    /// Delay before retrying after `failures` consecutive failed cycles.
    ///
    /// `interval * 2^failures`, capped by `max_backoff` and never below `interval`.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.interval;
        }
        let factor = 1_u32 << failures.min(MAX_BACKOFF_EXPONENT);
        self.interval
            .saturating_mul(factor)
            .min(self.max_backoff)
            .max(self.interval)
    }

    /// Checkpoints older than this get a heartbeat while the node is idle.
    pub fn heartbeat_after(&self) -> Duration {
        self.retention / 2
    }
}

/// Pruning worker tuning.
#[derive(Debug, Clone)]
pub struct PruneConfig {
    pub interval: Duration,
    pub retention: Duration,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_PRUNE_INTERVAL_SECS),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
        }
    }
}

impl From<&crate::config::PruneSettings> for PruneConfig {
    fn from(settings: &crate::config::PruneSettings) -> Self {
        Self {
            interval: settings.interval,
            retention: settings.retention,
        }
    }
}
