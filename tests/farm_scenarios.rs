//! Multi-node replay scenarios over the in-memory store.
//!
//! Each test wires one or more `SyncWorker`s to a shared `InMemorySyncStore`, the same way
//! farm nodes share one database.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use farmsync::application::repos::{CheckpointRepo, InstructionLogRepo};
use farmsync::cache::{
    ColdStartReason, KeyedCache, KeyedCacheRefresher, Lookup, PruneConfig, PruneWorker, Publisher,
    Refresher, RefresherError, RefresherRegistry, SnapshotSource, SyncConfig, SyncWorker,
    TickOutcome,
};
use farmsync::domain::types::{LocalIdentity, NodeId, ServerRole};
use farmsync::infra::memory::InMemorySyncStore;
use farmsync_types::{InstructionPayload, RefreshKey, RefresherCommand};
use serde_json::json;
use time::OffsetDateTime;

#[derive(Default)]
struct Recording {
    events: Mutex<Vec<String>>,
    fail_once_on: Mutex<Option<String>>,
}

impl Recording {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl Refresher for Recording {
    async fn refresh_all(&self) -> Result<(), RefresherError> {
        self.events.lock().unwrap().push("all".to_string());
        Ok(())
    }

    async fn refresh(&self, key: &RefreshKey) -> Result<(), RefresherError> {
        let key = key.to_string();
        {
            let mut fail = self.fail_once_on.lock().unwrap();
            if fail.as_deref() == Some(key.as_str()) {
                *fail = None;
                return Err(RefresherError::failed("simulated crash"));
            }
        }
        self.events.lock().unwrap().push(key);
        Ok(())
    }

    async fn remove(&self, key: &RefreshKey) -> Result<(), RefresherError> {
        self.events.lock().unwrap().push(format!("-{key}"));
        Ok(())
    }

    async fn rebuild(&self) -> Result<(), RefresherError> {
        self.events.lock().unwrap().push("rebuild".to_string());
        Ok(())
    }
}

struct Node {
    identity: Arc<LocalIdentity>,
    registry: Arc<RefresherRegistry>,
    worker: SyncWorker,
}

fn node(store: &Arc<InMemorySyncStore>, id: &str, refresher: Arc<dyn Refresher>) -> Node {
    node_with(store, id, refresher, SyncConfig::default())
}

fn node_with(
    store: &Arc<InMemorySyncStore>,
    id: &str,
    refresher: Arc<dyn Refresher>,
    config: SyncConfig,
) -> Node {
    let identity = Arc::new(LocalIdentity::new(NodeId::parse(id).unwrap()));
    let registry = Arc::new(RefresherRegistry::new());
    registry.register("content", refresher);
    let worker = SyncWorker::new(
        config,
        identity.clone(),
        store.clone(),
        store.clone(),
        registry.clone(),
    );
    Node {
        identity,
        registry,
        worker,
    }
}

async fn append(store: &InMemorySyncStore, command: RefresherCommand) -> i64 {
    store
        .append("web-09 [P9] OTHER", &InstructionPayload::new(vec![command]))
        .await
        .unwrap()
}

async fn checkpoint_of(store: &InMemorySyncStore, id: &str) -> Option<i64> {
    store
        .get(&NodeId::parse(id).unwrap())
        .await
        .unwrap()
        .map(|record| record.last_applied_id)
}

#[tokio::test]
async fn writes_on_one_node_reach_the_others_in_order() {
    let store = Arc::new(InMemorySyncStore::new());
    let writer_cache = Arc::new(Recording::default());
    let reader_cache = Arc::new(Recording::default());
    let writer = node(&store, "web-01", writer_cache.clone());
    let reader = node(&store, "web-02", reader_cache.clone());

    writer.worker.tick().await;
    reader.worker.tick().await;
    writer_cache.clear();
    reader_cache.clear();

    let publisher = Publisher::new(
        &SyncConfig::default(),
        writer.identity.clone(),
        writer.registry.clone(),
    );
    for key in ["A", "B", "C"] {
        let mut scope = store.scope();
        let receipt = publisher
            .publish(&mut scope, vec![RefresherCommand::refresh_key("content", key)])
            .await
            .unwrap();
        scope.commit();
        publisher.confirm(receipt).await;
    }

    assert_eq!(writer_cache.events(), vec!["A", "B", "C"]);

    reader.worker.tick().await;
    assert_eq!(reader_cache.events(), vec!["A", "B", "C"]);
    assert_eq!(checkpoint_of(&store, "web-02").await, Some(3));

    assert!(matches!(
        writer.worker.tick().await,
        TickOutcome::Applied {
            applied: 0,
            skipped: 3,
            checkpoint: 3,
            ..
        }
    ));
    assert_eq!(writer_cache.events(), vec!["A", "B", "C"]);
}

struct Rows;

#[async_trait]
impl SnapshotSource<String> for Rows {
    async fn load_all(&self) -> Result<Vec<(RefreshKey, String)>, RefresherError> {
        Ok(vec![
            (RefreshKey::from("A"), "A-v1".to_string()),
            (RefreshKey::from("B"), "B-v1".to_string()),
        ])
    }

    async fn load_one(&self, key: &RefreshKey) -> Result<Option<String>, RefresherError> {
        Ok(Some(format!("{key}-v2")))
    }
}

#[tokio::test]
async fn refresh_and_remove_scenario_leaves_a_stale_and_b_absent() {
    let store = Arc::new(InMemorySyncStore::new());
    let cache = Arc::new(KeyedCache::<String>::new(64));
    let refresher = Arc::new(KeyedCacheRefresher::new(cache.clone(), Arc::new(Rows)));
    let node = node_with(
        &store,
        "web-01",
        refresher.clone(),
        SyncConfig {
            batch_limit: 10,
            ..Default::default()
        },
    );

    assert!(matches!(
        node.worker.tick().await,
        TickOutcome::ColdStarted { checkpoint: 0, .. }
    ));
    assert_eq!(cache.len(), 2);

    append(&store, RefresherCommand::refresh_key("content", "A")).await;
    append(&store, RefresherCommand::remove_key("content", "B")).await;
    node.worker.tick().await;

    assert_eq!(checkpoint_of(&store, "web-01").await, Some(2));
    assert_eq!(
        cache.lookup(&RefreshKey::from("A")),
        Lookup::Stale("A-v1".to_string())
    );
    assert_eq!(cache.lookup(&RefreshKey::from("B")), Lookup::Missing);
    assert_eq!(
        refresher.get(&RefreshKey::from("A")).await.unwrap(),
        Some("A-v2".to_string())
    );
}

#[tokio::test]
async fn replaying_the_same_instructions_twice_is_harmless() {
    let store = Arc::new(InMemorySyncStore::new());
    let cache = Arc::new(KeyedCache::<String>::new(64));
    let refresher: Arc<dyn Refresher> =
        Arc::new(KeyedCacheRefresher::new(cache.clone(), Arc::new(Rows)));
    cache.replace_all(Rows.load_all().await.unwrap());

    append(&store, RefresherCommand::refresh_key("content", "A")).await;
    append(&store, RefresherCommand::remove_key("content", "B")).await;

    for id in ["first", "second"] {
        store
            .advance(&NodeId::parse(id).unwrap(), 0)
            .await
            .unwrap();
    }
    let first = node(&store, "first", refresher.clone());
    let second = node(&store, "second", refresher);

    first.worker.tick().await;
    let after_once = (
        cache.lookup(&RefreshKey::from("A")),
        cache.lookup(&RefreshKey::from("B")),
    );
    second.worker.tick().await;
    let after_twice = (
        cache.lookup(&RefreshKey::from("A")),
        cache.lookup(&RefreshKey::from("B")),
    );

    assert_eq!(after_once, after_twice);
    assert_eq!(after_twice.1, Lookup::Missing);
}

#[tokio::test]
async fn cold_start_never_replays_rows_it_already_covers() {
    let store = Arc::new(InMemorySyncStore::new());
    for key in 1..=5_i64 {
        append(&store, RefresherCommand::refresh_key("content", key)).await;
    }
    let cache = Arc::new(Recording::default());
    let node = node(&store, "web-03", cache.clone());

    assert_eq!(
        node.worker.tick().await,
        TickOutcome::ColdStarted {
            reason: ColdStartReason::NoCheckpoint,
            checkpoint: 5
        }
    );

    append(&store, RefresherCommand::refresh_key("content", 6_i64)).await;
    node.worker.tick().await;

    assert_eq!(cache.events(), vec!["rebuild", "6"]);
}

#[tokio::test]
async fn pruning_past_a_checkpoint_forces_a_rebuild_not_a_resume() {
    let store = Arc::new(InMemorySyncStore::new());
    let old = OffsetDateTime::now_utc() - time::Duration::hours(3);
    for key in 1..=100_i64 {
        store.append_raw(
            "web-09 [P9] OTHER",
            json!([{ "refresher": "content", "action": "refresh_by_key", "key": key }]),
            old,
        );
    }
    append(&store, RefresherCommand::refresh_key("content", 101_i64)).await;
    store
        .advance(&NodeId::parse("web-04").unwrap(), 50)
        .await
        .unwrap();

    let pruner = PruneWorker::new(
        PruneConfig {
            interval: Duration::from_secs(3600),
            retention: Duration::from_secs(3600),
        },
        store.clone(),
        Arc::new(ServerRole::Leader),
    );
    let report = pruner.prune_once().await.unwrap().unwrap();
    assert_eq!(report.instructions_deleted, 100);
    assert_eq!(report.checkpoints_deleted, 0);

    let cache = Arc::new(Recording::default());
    let node = node(&store, "web-04", cache.clone());

    assert_eq!(
        node.worker.tick().await,
        TickOutcome::ColdStarted {
            reason: ColdStartReason::Gap,
            checkpoint: 101
        }
    );
    assert_eq!(cache.events(), vec!["rebuild"]);
}

#[tokio::test]
async fn interrupted_batch_is_completed_after_restart() {
    let store = Arc::new(InMemorySyncStore::new());
    store
        .advance(&NodeId::parse("web-05").unwrap(), 0)
        .await
        .unwrap();
    for key in 1..=20_i64 {
        append(&store, RefresherCommand::refresh_key("content", key)).await;
    }

    let cache = Arc::new(Recording::default());
    *cache.fail_once_on.lock().unwrap() = Some("7".to_string());
    let config = SyncConfig {
        batch_limit: 10,
        ..Default::default()
    };

    let crashed = node_with(&store, "web-05", cache.clone(), config.clone());
    assert!(matches!(
        crashed.worker.tick().await,
        TickOutcome::Failed {
            instruction_id: Some(7),
            ..
        }
    ));
    assert_eq!(checkpoint_of(&store, "web-05").await, Some(6));
    drop(crashed);

    let restarted = node_with(&store, "web-05", cache.clone(), config);
    for _ in 0..5 {
        restarted.worker.tick().await;
    }

    assert_eq!(checkpoint_of(&store, "web-05").await, Some(20));
    let expected: Vec<String> = (1..=20).map(|key: i64| key.to_string()).collect();
    assert_eq!(cache.events(), expected);
}

#[tokio::test]
async fn retention_removes_old_rows_and_keeps_recent_ones() {
    let store = Arc::new(InMemorySyncStore::new());
    let command = json!([{ "refresher": "content", "action": "refresh_all" }]);
    let stale = store.append_raw(
        "origin",
        command.clone(),
        OffsetDateTime::now_utc() - time::Duration::hours(2),
    );
    let recent = store.append_raw(
        "origin",
        command,
        OffsetDateTime::now_utc() - time::Duration::minutes(30),
    );

    let pruner = PruneWorker::new(
        PruneConfig {
            interval: Duration::from_secs(60),
            retention: Duration::from_secs(3600),
        },
        store.clone(),
        Arc::new(ServerRole::Single),
    );
    pruner.prune_once().await.unwrap();

    assert!(!store.contains(stale).await.unwrap());
    assert!(store.contains(recent).await.unwrap());
}

#[tokio::test]
async fn replicas_never_prune() {
    let store = Arc::new(InMemorySyncStore::new());
    store.append_raw(
        "origin",
        json!([{ "refresher": "content", "action": "refresh_all" }]),
        OffsetDateTime::now_utc() - time::Duration::days(30),
    );
    store.append_raw(
        "origin",
        json!([{ "refresher": "content", "action": "refresh_all" }]),
        OffsetDateTime::now_utc(),
    );

    let pruner = PruneWorker::new(
        PruneConfig::default(),
        store.clone(),
        Arc::new(ServerRole::Replica),
    );

    assert_eq!(pruner.prune_once().await.unwrap(), None);
    assert_eq!(store.count().await.unwrap(), 2);
}
