use crate::cli::CliArgs;
use crate::model::{DEFAULT_REFRESH_INTERVAL_SECS, clamp_interval};
use crate::mongo::ConnectionSettings;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 27017;
const DEFAULT_AUTH_SOURCE: &str = "admin";
const DEFAULT_LOG_FILE: &str = "mongo_opsdeck.log";
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub source: Option<String>,
    pub connection: ConnectionSettings,
    pub namespace: Option<String>,
    pub refresh_interval_secs: u64,
    requested_refresh_secs: u64,
    pub show_system_ops: bool,
    pub log_file: PathBuf,
    pub log_filter: String,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct OpsdeckConfigFile {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default, alias = "user")]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, alias = "authSource")]
    auth_source: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default, alias = "refresh", alias = "interval")]
    refresh_interval: Option<u64>,
    #[serde(default)]
    show_system_ops: Option<bool>,
    #[serde(default)]
    load_balanced: Option<bool>,
    #[serde(default)]
    log_file: Option<PathBuf>,
    #[serde(default)]
    log_filter: Option<String>,
}

impl Settings {
    pub fn load(args: &CliArgs) -> Result<Self> {
        let path = args.config.clone().or_else(discover_config_path);
        let file = match &path {
            Some(path) => read_config_file(path)?,
            None => OpsdeckConfigFile::default(),
        };
        Ok(Self::merge(
            args,
            file,
            path.map(|path| path.display().to_string()),
        ))
    }

    pub fn log_startup(&self) {
        if let Some(source) = &self.source {
            info!("loaded config from {}", source);
        }
        if let Some(notice) = self.clamp_notice() {
            warn!("{}", notice);
        }
    }

    fn clamp_notice(&self) -> Option<String> {
        (self.requested_refresh_secs != self.refresh_interval_secs).then(|| {
            format!(
                "refresh interval {}s out of range, using {}s",
                self.requested_refresh_secs, self.refresh_interval_secs
            )
        })
    }

    fn merge(args: &CliArgs, file: OpsdeckConfigFile, source: Option<String>) -> Self {
        let requested = args
            .refresh_interval
            .or(file.refresh_interval)
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);
        let refresh_interval_secs = clamp_interval(requested);

        let connection = ConnectionSettings {
            host: args
                .host
                .clone()
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: args.port.or(file.port).unwrap_or(DEFAULT_PORT),
            username: args.username.clone().or(file.username),
            password: args.password.clone().or(file.password),
            auth_source: args
                .auth_source
                .clone()
                .or(file.auth_source)
                .unwrap_or_else(|| DEFAULT_AUTH_SOURCE.to_string()),
            load_balanced: args.load_balanced || file.load_balanced.unwrap_or(false),
            app_name: env!("CARGO_PKG_NAME").to_string(),
        };

        Self {
            source,
            connection,
            namespace: args
                .namespace
                .clone()
                .or(file.namespace)
                .filter(|namespace| !namespace.trim().is_empty()),
            refresh_interval_secs,
            requested_refresh_secs: requested,
            show_system_ops: args.show_system_ops || file.show_system_ops.unwrap_or(false),
            log_file: args
                .log_file
                .clone()
                .or(file.log_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
            log_filter: args
                .log_filter
                .clone()
                .or(file.log_filter)
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        }
    }
}

fn read_config_file(path: &Path) -> Result<OpsdeckConfigFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(OpsdeckConfigFile::default());
    }
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("OPSDECK_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("opsdeck.yaml"),
        PathBuf::from("opsdeck.yml"),
        PathBuf::from(".opsdeck.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/opsdeck/config.yaml"),
            PathBuf::from(&home).join(".config/opsdeck/config.yml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}
