//! Server configuration.
//!
//! Resolved once at startup from CLI flags, falling back to `AGENTRELAY_*`
//! environment variables, then to the defaults below.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Parser)]
#[command(name = "agentrelay-server", version, about = "Relay between coding agents and UI clients")]
pub struct ServerArgs {
    /// Address to listen on
    #[arg(long, env = "AGENTRELAY_BIND", default_value = "127.0.0.1:4100")]
    pub bind: SocketAddr,

    /// Seconds between server pings to agent connections
    #[arg(long, env = "AGENTRELAY_PING_INTERVAL_SECS", default_value_t = 10)]
    pub ping_interval_secs: u64,

    /// Heartbeat timeout, as a multiple of the ping interval
    #[arg(long, env = "AGENTRELAY_TIMEOUT_MULTIPLIER", default_value_t = 5)]
    pub timeout_multiplier: u32,

    /// Seconds after registration during which the relaxed timeout applies
    #[arg(long, env = "AGENTRELAY_GRACE_PERIOD_SECS", default_value_t = 30)]
    pub grace_period_secs: u64,

    /// Minimum heartbeat timeout while a connection is in its grace period
    #[arg(long, env = "AGENTRELAY_GRACE_MIN_TIMEOUT_SECS", default_value_t = 60)]
    pub grace_min_timeout_secs: u64,

    /// Require this bearer token on /ws and /status
    #[arg(long, env = "AGENTRELAY_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Data directory (logs live under `<data-dir>/logs`)
    #[arg(long, env = "AGENTRELAY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, env = "AGENTRELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Log to stdout instead of the log file
    #[arg(long)]
    pub log_stdout: bool,
}

/// Heartbeat supervision timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub ping_interval: Duration,
    pub timeout_multiplier: u32,
    /// How long a fresh registration keeps its grace flag.
    pub grace_period: Duration,
    /// Floor applied to the timeout while the grace flag is set.
    pub grace_min_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            timeout_multiplier: 5,
            grace_period: Duration::from_secs(30),
            grace_min_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Timeout applied to a connection's heartbeat age.
    pub fn effective_timeout(&self, in_grace_period: bool) -> Duration {
        let normal = self.ping_interval * self.timeout_multiplier;
        if in_grace_period {
            normal.max(self.grace_min_timeout)
        } else {
            normal
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub heartbeat: HeartbeatConfig,
    pub auth_token: Option<String>,
}

impl ServerArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            heartbeat: HeartbeatConfig {
                ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
                timeout_multiplier: self.timeout_multiplier.max(1),
                grace_period: Duration::from_secs(self.grace_period_secs),
                grace_min_timeout: Duration::from_secs(self.grace_min_timeout_secs),
            },
            auth_token: self
                .auth_token
                .as_deref()
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(str::to_string),
        }
    }

    /// Log directory: `--data-dir` > `~/.agentrelay`, plus `/logs`.
    pub fn log_dir(&self) -> PathBuf {
        let base = self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".agentrelay")
        });
        base.join("logs")
    }
}
