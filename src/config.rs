use std::fs::read_to_string;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Network {
    ///
    /// The address the UDP socket binds to.
    ///
    #[serde(default = "Network::listen")]
    pub listen: SocketAddr,
    ///
    /// Number of worker threads draining the receiver task's datagram queue.
    /// Defaults to the number of logical cores.
    ///
    #[serde(default = "Network::worker_threads")]
    pub worker_threads: usize,
}

impl Network {
    fn listen() -> SocketAddr {
        "0.0.0.0:9753".parse().unwrap()
    }

    fn worker_threads() -> usize {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    }
}

impl Default for Network {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            worker_threads: Self::worker_threads(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Transaction {
    ///
    /// Number of retransmissions attempted before a pending call fails with
    /// `Timeout`.
    ///
    #[serde(default = "Transaction::retries")]
    pub retries: u32,
    ///
    /// Interval before the first retransmission, in milliseconds. Doubles on
    /// each subsequent attempt.
    ///
    #[serde(default = "Transaction::base_interval_ms")]
    pub base_interval_ms: u64,
    ///
    /// How long a computed reply is kept so a retransmitted request is
    /// answered without re-executing the operation, in seconds.
    ///
    #[serde(default = "Transaction::reply_cache_ttl_secs")]
    pub reply_cache_ttl_secs: u64,
}

impl Transaction {
    fn retries() -> u32 {
        3
    }

    fn base_interval_ms() -> u64 {
        200
    }

    fn reply_cache_ttl_secs() -> u64 {
        30
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn reply_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.reply_cache_ttl_secs)
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            retries: Self::retries(),
            base_interval_ms: Self::base_interval_ms(),
            reply_cache_ttl_secs: Self::reply_cache_ttl_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Auth {
    ///
    /// Attribute and item-key name prefixes denied to every peer, checked
    /// before any dispatch. The default policy denies a leading underscore.
    ///
    #[serde(default = "Auth::deny_prefixes")]
    pub deny_prefixes: Vec<String>,
    ///
    /// When non-empty, only these endpoints are admitted as peers; every
    /// other endpoint is rejected at first contact. Empty means admit all.
    ///
    #[serde(default)]
    pub allow_peers: Vec<SocketAddr>,
}

impl Auth {
    fn deny_prefixes() -> Vec<String> {
        vec!["_".to_string()]
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub transaction: Transaction,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub log: Log,
    ///
    /// Names to advertise on startup, each naming a built-in demo object.
    /// Real deployments register objects through the `netmirror` library
    /// crate instead of the config file.
    ///
    #[serde(default)]
    pub publish: Vec<String>,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    ///
    /// Specify the configuration file path.
    ///
    /// Example: netmirrord --config /etc/netmirror/config.toml
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Loads configuration from the file named on the command line, if any,
    /// otherwise falls back to the default configuration.
    ///
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        Ok(match cli.config {
            Some(path) => toml::from_str(&read_to_string(path)?)?,
            None => Config::default(),
        })
    }
}
