//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{CliArgs, Command, GlobalOverrides, PruneArgs, PublishArgs, StatusArgs};

use std::{
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::domain::types::{CorruptPayloadPolicy, NodeId, ServerRole};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "farmsync";
const ENV_PREFIX: &str = "FARMSYNC";
const DEFAULT_NODE_ID: &str = "default";
const DEFAULT_SYNC_INTERVAL_MS: u64 = 5000;
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
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub node: NodeSettings,
    pub sync: SyncSettings,
    pub prune: PruneSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub id: NodeId,
    pub role: ServerRole,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub interval: Duration,
    pub batch_limit: NonZeroU32,
    pub store_timeout: Duration,
    pub cycle_timeout: Duration,
    pub rebuild_timeout: Duration,
    pub max_backoff: Duration,
    pub max_pending_commands: u64,
    pub max_commands_per_row: NonZeroUsize,
    pub retry_limit: u32,
    pub skip_own_instructions: bool,
    pub corrupt_payload_policy: CorruptPayloadPolicy,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct PruneSettings {
    pub interval: Duration,
    pub retention: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Parse the process arguments and resolve settings for them.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_cli_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    node: RawNodeSettings,
    sync: RawSyncSettings,
    prune: RawPruneSettings,
    database: RawDatabaseSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_cli_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(node_id) = overrides.node_id.as_ref() {
            self.node.id = Some(node_id.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            node,
            sync,
            prune,
            database,
            logging,
        } = raw;

        Ok(Self {
            node: build_node_settings(node)?,
            sync: build_sync_settings(sync)?,
            prune: build_prune_settings(prune)?,
            database: build_database_settings(database)?,
            logging: build_logging_settings(logging)?,
        })
    }
}

fn build_node_settings(node: RawNodeSettings) -> Result<NodeSettings, LoadError> {
    let id = NodeId::parse(node.id.unwrap_or_else(|| DEFAULT_NODE_ID.to_string()))
        .map_err(|err| LoadError::invalid("node.id", err.to_string()))?;

    let role = match node.role {
        Some(role) => ServerRole::from_str(role.as_str())
            .map_err(|err| LoadError::invalid("node.role", err.to_string()))?,
        None => ServerRole::default(),
    };

    Ok(NodeSettings { id, role })
}

fn build_sync_settings(sync: RawSyncSettings) -> Result<SyncSettings, LoadError> {
    let interval = positive_millis(
        sync.interval_ms.unwrap_or(DEFAULT_SYNC_INTERVAL_MS),
        "sync.interval_ms",
    )?;
    let batch_limit = NonZeroU32::new(sync.batch_limit.unwrap_or(DEFAULT_BATCH_LIMIT))
        .ok_or_else(|| LoadError::invalid("sync.batch_limit", "must be greater than zero"))?;
    let store_timeout = positive_millis(
        sync.store_timeout_ms.unwrap_or(DEFAULT_STORE_TIMEOUT_MS),
        "sync.store_timeout_ms",
    )?;
    let cycle_timeout = positive_millis(
        sync.cycle_timeout_ms.unwrap_or(DEFAULT_CYCLE_TIMEOUT_MS),
        "sync.cycle_timeout_ms",
    )?;
    if cycle_timeout < store_timeout {
        return Err(LoadError::invalid(
            "sync.cycle_timeout_ms",
            "must not be shorter than sync.store_timeout_ms",
        ));
    }
    let rebuild_timeout = positive_millis(
        sync.rebuild_timeout_ms
            .unwrap_or(DEFAULT_REBUILD_TIMEOUT_MS),
        "sync.rebuild_timeout_ms",
    )?;
    if rebuild_timeout < store_timeout {
        return Err(LoadError::invalid(
            "sync.rebuild_timeout_ms",
            "must not be shorter than sync.store_timeout_ms",
        ));
    }
    let max_backoff = positive_millis(
        sync.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS),
        "sync.max_backoff_ms",
    )?;

    let max_commands_per_row = NonZeroUsize::new(
        sync.max_commands_per_row
            .unwrap_or(DEFAULT_MAX_COMMANDS_PER_ROW),
    )
    .ok_or_else(|| LoadError::invalid("sync.max_commands_per_row", "must be greater than zero"))?;

    let corrupt_payload_policy = match sync.corrupt_payload_policy {
        Some(policy) => CorruptPayloadPolicy::from_str(policy.as_str())
            .map_err(|err| LoadError::invalid("sync.corrupt_payload_policy", err.to_string()))?,
        None => CorruptPayloadPolicy::default(),
    };

    Ok(SyncSettings {
        interval,
        batch_limit,
        store_timeout,
        cycle_timeout,
        rebuild_timeout,
        max_backoff,
        max_pending_commands: sync
            .max_pending_commands
            .unwrap_or(DEFAULT_MAX_PENDING_COMMANDS),
        max_commands_per_row,
        retry_limit: sync.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT),
        skip_own_instructions: sync.skip_own_instructions.unwrap_or(true),
        corrupt_payload_policy,
        shutdown_grace: Duration::from_millis(
            sync.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
        ),
    })
}

fn build_prune_settings(prune: RawPruneSettings) -> Result<PruneSettings, LoadError> {
    let interval_seconds = prune
        .interval_seconds
        .unwrap_or(DEFAULT_PRUNE_INTERVAL_SECS);
    if interval_seconds == 0 {
        return Err(LoadError::invalid(
            "prune.interval_seconds",
            "must be greater than zero",
        ));
    }

    let retention_seconds = prune.retention_seconds.unwrap_or(DEFAULT_RETENTION_SECS);
    if retention_seconds == 0 {
        return Err(LoadError::invalid(
            "prune.retention_seconds",
            "must be greater than zero",
        ));
    }

    Ok(PruneSettings {
        interval: Duration::from_secs(interval_seconds),
        retention: Duration::from_secs(retention_seconds),
    })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = NonZeroU32::new(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
    )
    .ok_or_else(|| LoadError::invalid("database.max_connections", "must be greater than zero"))?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawNodeSettings {
    id: Option<String>,
    role: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSyncSettings {
    interval_ms: Option<u64>,
    batch_limit: Option<u32>,
    store_timeout_ms: Option<u64>,
    cycle_timeout_ms: Option<u64>,
    rebuild_timeout_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_pending_commands: Option<u64>,
    max_commands_per_row: Option<usize>,
    retry_limit: Option<u32>,
    skip_own_instructions: Option<bool>,
    corrupt_payload_policy: Option<String>,
    shutdown_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPruneSettings {
    interval_seconds: Option<u64>,
    retention_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}
