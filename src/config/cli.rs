use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the sideline binary.
#[derive(Debug, Parser)]
#[command(
    name = "sideline",
    version,
    about = "Offline cache and interception proxy for live dashboards"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "SIDELINE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the interception proxy.
    Serve(Box<ServeArgs>),
    /// List cache regions in the configured store.
    Regions(RegionsArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StorageOverrides {
    /// Override the cache store backend (memory|disk).
    #[arg(long = "storage-backend", value_name = "BACKEND")]
    pub storage_backend: Option<String>,

    /// Override the directory of the disk backend.
    #[arg(
        long = "storage-directory",
        value_name = "PATH",
        value_hint = ValueHint::DirPath
    )]
    pub storage_directory: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub storage: StorageOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the upstream origin every request is forwarded to.
    #[arg(long = "upstream-origin", value_name = "URL", value_hint = ValueHint::Url)]
    pub upstream_origin: Option<String>,

    /// Override the generation manifest path.
    #[arg(long = "manifest", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub manifest: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RegionsArgs {
    #[command(flatten)]
    pub storage: StorageOverrides,

    /// Delete every region that does not belong to this generation.
    #[arg(long = "prune-except", value_name = "GENERATION")]
    pub prune_except: Option<String>,
}
