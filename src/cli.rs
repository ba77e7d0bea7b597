use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "opsdeck",
    version,
    about = "Watch, filter and kill in-flight MongoDB operations from the terminal."
)]
pub struct CliArgs {
    /// MongoDB host
    #[arg(long)]
    pub host: Option<String>,

    /// MongoDB port
    #[arg(long)]
    pub port: Option<u16>,

    /// Username for authentication
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password for authentication
    #[arg(short, long, env = "MONGODB_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Authentication database
    #[arg(long)]
    pub auth_source: Option<String>,

    /// Only list operations whose namespace starts with this prefix
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Refresh interval in seconds (1-60)
    #[arg(short, long)]
    pub refresh_interval: Option<u64>,

    /// Include admin/config/local and internal operations
    #[arg(long)]
    pub show_system_ops: bool,

    /// Connect through a load balancer
    #[arg(long)]
    pub load_balanced: bool,

    /// Log file path
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long)]
    pub log_filter: Option<String>,

    /// Config file to use instead of the discovered one
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}
