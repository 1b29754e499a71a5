use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the farmsync operator binary.
#[derive(Debug, Parser)]
#[command(
    name = "farmsync",
    version,
    about = "Inspect and maintain the farm cache instruction log"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "FARMSYNC_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL", global = true)]
    pub database_url: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the node id used as this process's checkpoint key.
    #[arg(long = "node-id", value_name = "ID", global = true)]
    pub node_id: Option<String>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the log head and every node's checkpoint lag.
    Status(StatusArgs),
    /// Append one instruction to the shared log.
    Publish(PublishArgs),
    /// Delete instructions and checkpoints past the retention window.
    Prune(PruneArgs),
    /// Run database migrations.
    Migrate,
}

#[derive(Debug, Args, Clone)]
pub struct StatusArgs {
    /// Emit the report as JSON.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["all", "key", "remove", "payload"])
))]
pub struct PublishArgs {
    /// Refresher the command is addressed to.
    #[arg(long, value_name = "ID")]
    pub refresher: String,

    /// Refresh the refresher's whole domain.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub all: bool,

    /// Refresh one or more keys; repeat the flag for several keys.
    #[arg(long = "key", value_name = "KEY", num_args = 1..)]
    pub key: Vec<String>,

    /// Evict one key without reloading it.
    #[arg(long, value_name = "KEY")]
    pub remove: Option<String>,

    /// Hand a refresher-specific JSON document to the handler.
    #[arg(long, value_name = "JSON")]
    pub payload: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct PruneArgs {
    /// Keep pruning on the configured interval until interrupted.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub watch: bool,
}
