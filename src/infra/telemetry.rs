use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register units and help text for every metric the sync subsystem emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "farmsync_instructions_applied_total",
            Unit::Count,
            "Instructions replayed into local refreshers."
        );
        describe_counter!(
            "farmsync_instructions_skipped_total",
            Unit::Count,
            "Instructions acknowledged without replay (own origin or corrupt payload)."
        );
        describe_counter!(
            "farmsync_sync_failures_total",
            Unit::Count,
            "Failed sync cycles, labelled by failure kind."
        );
        describe_counter!(
            "farmsync_cold_starts_total",
            Unit::Count,
            "Full cache rebuilds, labelled by reason."
        );
        describe_gauge!(
            "farmsync_checkpoint_id",
            Unit::Count,
            "Id of the last instruction this node applied."
        );
        describe_histogram!(
            "farmsync_sync_cycle_ms",
            Unit::Milliseconds,
            "Sync cycle latency in milliseconds."
        );
        describe_counter!(
            "farmsync_prune_instructions_deleted_total",
            Unit::Count,
            "Instruction rows removed by retention pruning."
        );
        describe_counter!(
            "farmsync_prune_checkpoints_deleted_total",
            Unit::Count,
            "Retired node checkpoints removed by retention pruning."
        );
        describe_histogram!(
            "farmsync_prune_ms",
            Unit::Milliseconds,
            "Prune pass latency in milliseconds."
        );
    });
}
