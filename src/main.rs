use std::{process::ExitCode, sync::Arc};

use farmsync::{
    application::{error::AppError, status::farm_status},
    cache::{PruneConfig, PruneWorker, Publisher, RefresherRegistry, SyncConfig},
    config::{self, Command, PublishArgs, StatusArgs},
    domain::types::LocalIdentity,
    infra::{db::PostgresRepositories, error::InfraError, telemetry},
};
use farmsync_types::{RefreshKey, RefresherCommand};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report_application_error(&error);
            ExitCode::from(error.exit_code())
        }
    }
}

fn report_application_error(error: &AppError) {
    let chain = error.chain().join(": ");
    if dispatcher::has_been_set() {
        error!(error = %chain, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %chain, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let repositories = init_repositories(&settings).await?;

    match cli_args.command {
        Command::Status(args) => run_status(&repositories, args).await,
        Command::Publish(args) => run_publish(&repositories, &settings, args).await,
        Command::Prune(args) => run_prune(repositories, &settings, args.watch).await,
        Command::Migrate => run_migrate(&repositories).await,
    }
}

async fn init_repositories(settings: &config::Settings) -> Result<PostgresRepositories, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))?;

    let pool = PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    Ok(PostgresRepositories::new(pool))
}

async fn run_status(repositories: &PostgresRepositories, args: StatusArgs) -> Result<(), AppError> {
    let status = farm_status(repositories, repositories).await?;

    if args.json {
        let rendered = serde_json::to_string_pretty(&status)
            .map_err(|err| AppError::unexpected(format!("failed to encode status: {err}")))?;
        println!("{rendered}");
    } else {
        print!("{status}");
    }
    Ok(())
}

async fn run_publish(
    repositories: &PostgresRepositories,
    settings: &config::Settings,
    args: PublishArgs,
) -> Result<(), AppError> {
    let command = command_from_args(args)?;
    let identity = Arc::new(LocalIdentity::new(settings.node.id.clone()));
    // The operator process hosts no caches; the farm's workers pick the row up.
    let publisher = Publisher::new(
        &SyncConfig::from(settings),
        identity,
        Arc::new(RefresherRegistry::new()),
    );

    let ids = publisher.publish_now(repositories, vec![command]).await?;
    info!(ids = ?ids, "Instruction published");
    println!(
        "published instruction {}",
        ids.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

fn command_from_args(args: PublishArgs) -> Result<RefresherCommand, AppError> {
    let refresher = args.refresher.trim();
    if refresher.is_empty() {
        return Err(AppError::validation("--refresher must not be empty"));
    }

    if args.all {
        return Ok(RefresherCommand::refresh_all(refresher));
    }
    if let Some(key) = args.remove {
        return Ok(RefresherCommand::remove_key(refresher, parse_key(&key)));
    }
    if let Some(raw) = args.payload {
        let payload = serde_json::from_str(&raw)
            .map_err(|err| AppError::validation(format!("--payload is not valid JSON: {err}")))?;
        return Ok(RefresherCommand::refresh_payload(refresher, payload));
    }

    let mut keys: Vec<RefreshKey> = args.key.iter().map(|key| parse_key(key)).collect();
    match keys.len() {
        0 => Err(AppError::validation(
            "one of --all, --key, --remove or --payload is required",
        )),
        1 => Ok(RefresherCommand::refresh_key(refresher, keys.remove(0))),
        _ => Ok(RefresherCommand::refresh_keys(refresher, keys)),
    }
}

fn parse_key(raw: &str) -> RefreshKey {
    let trimmed = raw.trim();
    match trimmed.parse() {
        Ok(key) => key,
        Err(never) => match never {},
    }
}

async fn run_prune(
    repositories: PostgresRepositories,
    settings: &config::Settings,
    watch: bool,
) -> Result<(), AppError> {
    let worker = Arc::new(PruneWorker::new(
        PruneConfig::from(&settings.prune),
        Arc::new(repositories),
        Arc::new(settings.node.role),
    ));

    if !watch {
        match worker.prune_once().await? {
            Some(report) if report.lock_contended => {
                println!("another process is pruning; nothing deleted");
            }
            Some(report) => println!(
                "deleted {} instructions and {} checkpoints",
                report.instructions_deleted, report.checkpoints_deleted
            ),
            None => println!(
                "node role `{}` does not own pruning; nothing deleted",
                settings.node.role.as_str()
            ),
        }
        return Ok(());
    }

    let handle = worker.spawn();
    info!(
        interval_secs = settings.prune.interval.as_secs(),
        role = settings.node.role.as_str(),
        "Prune worker running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await.map_err(InfraError::from)?;
    info!("Shutdown requested");
    worker.shutdown();
    handle
        .await
        .map_err(|err| AppError::unexpected(format!("prune worker panicked: {err}")))?;
    Ok(())
}

async fn run_migrate(repositories: &PostgresRepositories) -> Result<(), AppError> {
    PostgresRepositories::run_migrations(repositories.pool())
        .await
        .map_err(InfraError::from)?;
    info!("Migrations applied");
    Ok(())
}
