use clap::Parser;
use relay_core::{CoordinatorConfig, Deadlines};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_DATABASE: &str = ".relay/relay.db";
pub const MEMORY_DATABASE: &str = ":memory:";
pub const DEFAULT_LOG_NAME: &str = "relay-hub";

#[derive(Parser, Debug, Clone)]
#[command(name = "relay-hub", about = "Command relay coordinator")]
pub struct Args {
    #[arg(long, env = "RELAY_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,
    #[arg(long, env = "RELAY_API_KEY", hide_env_values = true)]
    pub api_key: String,
    /// SQLite file, or `:memory:` for a non-durable relay.
    #[arg(long, env = "RELAY_DATABASE", default_value = DEFAULT_DATABASE)]
    pub database: String,
    #[arg(long, env = "RELAY_HEARTBEAT_TIMEOUT", default_value_t = 60)]
    pub heartbeat_timeout: u64,
    #[arg(long, env = "RELAY_PENDING_DEADLINE", default_value_t = 120)]
    pub pending_deadline: u64,
    #[arg(long, env = "RELAY_RUNNING_DEADLINE", default_value_t = 600)]
    pub running_deadline: u64,
    #[arg(long, env = "RELAY_SWEEP_INTERVAL", default_value_t = 15)]
    pub sweep_interval: u64,
    #[arg(long, env = "RELAY_EVENT_BACKLOG", default_value_t = 256)]
    pub event_backlog: usize,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, env = "RELAY_LOG_DIR", default_value = "")]
    pub log_dir: String,
    /// Log file stem inside `--log-dir`; replicas sharing a directory set
    /// distinct names.
    #[arg(long, env = "RELAY_LOG_NAME", default_value = DEFAULT_LOG_NAME)]
    pub log_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Database {
    Memory,
    File(PathBuf),
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Database::Memory => f.write_str(MEMORY_DATABASE),
            Database::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub api_key: String,
    pub database: Database,
    pub coordinator: CoordinatorConfig,
    pub sweep_interval: Duration,
    pub debug: bool,
    pub log_dir: String,
    pub log_name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidAddr { addr: String, reason: String },
    #[error("api key must not be empty")]
    EmptyApiKey,
    #[error("database path must not be empty")]
    EmptyDatabase,
    #[error("invalid log name '{0}': must be non-empty and contain no path separators")]
    InvalidLogName(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

pub fn load_config() -> Result<Config, ConfigError> {
    let args = Args::parse();
    let mut config = build_config(args)?;
    config.debug = config.debug || env_true("RELAY_DEBUG");
    Ok(config)
}

pub fn build_config(args: Args) -> Result<Config, ConfigError> {
    let addr = args
        .addr
        .trim()
        .parse::<SocketAddr>()
        .map_err(|err| ConfigError::InvalidAddr {
            addr: args.addr.clone(),
            reason: err.to_string(),
        })?;

    let api_key = args.api_key.trim().to_string();
    if api_key.is_empty() {
        return Err(ConfigError::EmptyApiKey);
    }

    let database = match args.database.trim() {
        "" => return Err(ConfigError::EmptyDatabase),
        MEMORY_DATABASE => Database::Memory,
        path => Database::File(PathBuf::from(path)),
    };

    for (name, value) in [
        ("heartbeat timeout", args.heartbeat_timeout),
        ("pending deadline", args.pending_deadline),
        ("running deadline", args.running_deadline),
        ("sweep interval", args.sweep_interval),
    ] {
        if value == 0 {
            return Err(ConfigError::Zero(name));
        }
    }
    if args.event_backlog == 0 {
        return Err(ConfigError::Zero("event backlog"));
    }

    let log_name = args.log_name.trim().to_string();
    if log_name.is_empty() || log_name.contains(['/', '\\']) || log_name == ".." {
        return Err(ConfigError::InvalidLogName(args.log_name.clone()));
    }

    Ok(Config {
        addr,
        api_key,
        database,
        coordinator: CoordinatorConfig {
            heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout),
            deadlines: Deadlines {
                pending: Duration::from_secs(args.pending_deadline),
                running: Duration::from_secs(args.running_deadline),
            },
            event_backlog: args.event_backlog,
        },
        sweep_interval: Duration::from_secs(args.sweep_interval),
        debug: args.debug,
        log_dir: args.log_dir.trim().to_string(),
        log_name,
    })
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["relay-hub", "--api-key", "s3cret"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("parse args")
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = build_config(args(&[])).expect("config");
        assert_eq!(config.addr.to_string(), DEFAULT_ADDR);
        assert_eq!(
            config.database,
            Database::File(PathBuf::from(DEFAULT_DATABASE))
        );
        assert_eq!(config.coordinator, CoordinatorConfig::default());
        assert_eq!(config.sweep_interval, Duration::from_secs(15));
        assert!(config.log_dir.is_empty());
        assert_eq!(config.log_name, DEFAULT_LOG_NAME);
    }

    #[test]
    fn memory_database_and_overrides() {
        let config = build_config(args(&[
            "--database",
            ":memory:",
            "--pending-deadline",
            "30",
            "--running-deadline",
            "90",
            "--event-backlog",
            "8",
        ]))
        .expect("config");
        assert_eq!(config.database, Database::Memory);
        assert_eq!(config.coordinator.deadlines.pending, Duration::from_secs(30));
        assert_eq!(config.coordinator.deadlines.running, Duration::from_secs(90));
        assert_eq!(config.coordinator.event_backlog, 8);
    }

    #[test]
    fn rejects_invalid_combinations() {
        assert_eq!(
            build_config(args(&["--sweep-interval", "0"])).expect_err("zero sweep"),
            ConfigError::Zero("sweep interval")
        );
        assert_eq!(
            build_config(args(&["--event-backlog", "0"])).expect_err("zero backlog"),
            ConfigError::Zero("event backlog")
        );
        assert!(matches!(
            build_config(args(&["--addr", "not-an-addr"])),
            Err(ConfigError::InvalidAddr { .. })
        ));

        assert!(matches!(
            build_config(args(&["--log-name", "../escape"])),
            Err(ConfigError::InvalidLogName(_))
        ));
        assert_eq!(
            build_config(args(&["--log-name", "relay-east"]))
                .expect("named log")
                .log_name,
            "relay-east"
        );

        let blank = Args::try_parse_from(["relay-hub", "--api-key", "  "]).expect("parse");
        assert_eq!(
            build_config(blank).expect_err("blank key"),
            ConfigError::EmptyApiKey
        );
    }
}
