use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use farmsync::application::repos::InstructionLogRepo;
use farmsync::cache::{
    PruneConfig, PruneWorker, Refresher, RefresherError, RefresherRegistry, SyncConfig, SyncWorker,
};
use farmsync::domain::types::{LocalIdentity, NodeId, ServerRole};
use farmsync::infra::memory::InMemorySyncStore;
use farmsync::infra::telemetry;
use farmsync_types::{InstructionPayload, RefreshKey, RefresherCommand};
use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
use serde_json::json;
use serial_test::serial;
use time::OffsetDateTime;

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        telemetry::describe_metrics();
        snapshotter
    })
}

/// `name` and `name{label=value}` for every recorded series.
fn series() -> HashSet<String> {
    let mut names = HashSet::new();
    for (composite_key, _, _, _) in snapshotter().snapshot().into_vec() {
        let key = composite_key.key();
        names.insert(key.name().to_string());
        for label in key.labels() {
            names.insert(format!("{}{{{}={}}}", key.name(), label.key(), label.value()));
        }
    }
    names
}

struct Flaky;

#[async_trait]
impl Refresher for Flaky {
    async fn refresh_all(&self) -> Result<(), RefresherError> {
        Ok(())
    }

    async fn refresh(&self, key: &RefreshKey) -> Result<(), RefresherError> {
        if key == &RefreshKey::from("broken") {
            return Err(RefresherError::failed("refresh failed"));
        }
        Ok(())
    }

    async fn remove(&self, _key: &RefreshKey) -> Result<(), RefresherError> {
        Ok(())
    }
}

#[tokio::test]
#[serial]
async fn sync_paths_emit_expected_metric_keys() {
    snapshotter();

    let store = Arc::new(InMemorySyncStore::new());
    let identity = Arc::new(LocalIdentity::new(NodeId::parse("metrics-01").unwrap()));
    let registry = Arc::new(RefresherRegistry::new());
    registry.register("content", Arc::new(Flaky));
    let worker = SyncWorker::new(
        SyncConfig::default(),
        identity.clone(),
        store.clone(),
        store.clone(),
        registry,
    );

    worker.tick().await;

    store
        .append(
            "metrics-02",
            &InstructionPayload::new(vec![RefresherCommand::refresh_key("content", "ok")]),
        )
        .await
        .unwrap();
    store
        .append(
            identity.origin(),
            &InstructionPayload::new(vec![RefresherCommand::refresh_all("content")]),
        )
        .await
        .unwrap();
    worker.tick().await;

    store
        .append(
            "metrics-02",
            &InstructionPayload::new(vec![RefresherCommand::refresh_key("content", "broken")]),
        )
        .await
        .unwrap();
    worker.tick().await;

    let names = series();
    let expected = [
        "farmsync_sync_cycle_ms",
        "farmsync_checkpoint_id",
        "farmsync_instructions_applied_total",
        "farmsync_instructions_skipped_total{reason=own_origin}",
        "farmsync_sync_failures_total{kind=handler}",
        "farmsync_cold_starts_total{reason=no_checkpoint}",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

#[tokio::test]
#[serial]
async fn prune_paths_emit_expected_metric_keys() {
    snapshotter();

    let store = Arc::new(InMemorySyncStore::new());
    let payload = json!([{ "refresher": "content", "action": "refresh_all" }]);
    store.append_raw(
        "metrics-02",
        payload.clone(),
        OffsetDateTime::now_utc() - time::Duration::days(3),
    );
    store.append_raw("metrics-02", payload, OffsetDateTime::now_utc());

    let pruner = PruneWorker::new(
        PruneConfig {
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(3600),
        },
        store,
        Arc::new(ServerRole::Leader),
    );
    let report = pruner.prune_once().await.unwrap().expect("leader prunes");
    assert_eq!(report.instructions_deleted, 1);

    let names = series();
    for metric in [
        "farmsync_prune_instructions_deleted_total",
        "farmsync_prune_checkpoints_deleted_total",
        "farmsync_prune_ms",
    ] {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
