use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::validate_name;
use crate::store::DEFAULT_MAX_BODY_BYTES;

pub const DEFAULT_PROJECT_ID: &str = "default";
pub const DEFAULT_AGENT_STALE_SECS: u64 = 60;

pub const DEFAULT_GC_MAX_AGE_DAYS: u64 = 30;

pub const DEFAULT_REPLAY_WINDOW: usize = 512;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

pub const DEFAULT_RELAY_DIAL_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_RELAY_RECONNECT_MS: u64 = 2_000;

pub const DEFAULT_WATCH_DIAL_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_POLL_MIN_MS: u64 = 200;
pub const DEFAULT_POLL_MAX_MS: u64 = 5_000;
pub const DEFAULT_REDISCOVER_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default, rename = "log_level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(
        default,
        rename = "project-id",
        alias = "project_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub project_id: Option<String>,

    #[serde(
        default,
        rename = "agent-stale-secs",
        alias = "agent_stale_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_stale_secs: Option<u64>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    /// Extra TCP listener for remote clients and relay peers.
    #[serde(rename = "tcp-listen", alias = "tcp_listen", default)]
    pub tcp_listen: Option<String>,

    /// Address clients try after the local socket.
    #[serde(rename = "tcp-connect", alias = "tcp_connect", default)]
    pub tcp_connect: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(rename = "max-body-bytes", alias = "max_body_bytes", default)]
    pub max_body_bytes: usize,

    #[serde(rename = "gc-max-age-days", alias = "gc_max_age_days", default)]
    pub gc_max_age_days: u64,
}

impl StoreConfig {
    pub fn effective_max_body_bytes(&self) -> usize {
        non_zero_or(self.max_body_bytes, DEFAULT_MAX_BODY_BYTES)
    }

    pub fn effective_gc_max_age_days(&self) -> u64 {
        non_zero_or(self.gc_max_age_days, DEFAULT_GC_MAX_AGE_DAYS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HubConfig {
    /// Messages kept in memory for replay before falling back to disk.
    /// Unset means the default; `0` turns the window off.
    #[serde(
        rename = "replay-window",
        alias = "replay_window",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub replay_window: Option<usize>,

    /// Per-subscriber delivery queue length.
    #[serde(rename = "channel-capacity", alias = "channel_capacity", default)]
    pub channel_capacity: usize,
}

impl HubConfig {
    pub fn effective_replay_window(&self) -> usize {
        self.replay_window.unwrap_or(DEFAULT_REPLAY_WINDOW)
    }

    pub fn effective_channel_capacity(&self) -> usize {
        non_zero_or(self.channel_capacity, DEFAULT_CHANNEL_CAPACITY)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<String>,

    #[serde(rename = "dial-timeout-ms", alias = "dial_timeout_ms", default)]
    pub dial_timeout_ms: u64,

    #[serde(
        rename = "reconnect-interval-ms",
        alias = "reconnect_interval_ms",
        default
    )]
    pub reconnect_interval_ms: u64,
}

impl RelayConfig {
    pub fn effective_dial_timeout(&self) -> Duration {
        Duration::from_millis(non_zero_or(
            self.dial_timeout_ms,
            DEFAULT_RELAY_DIAL_TIMEOUT_MS,
        ))
    }

    pub fn effective_reconnect_interval(&self) -> Duration {
        Duration::from_millis(non_zero_or(
            self.reconnect_interval_ms,
            DEFAULT_RELAY_RECONNECT_MS,
        ))
    }

    pub fn endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.peers.iter().map(|p| p.parse()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WatchConfig {
    #[serde(rename = "dial-timeout-ms", alias = "dial_timeout_ms", default)]
    pub dial_timeout_ms: u64,

    #[serde(rename = "poll-min-ms", alias = "poll_min_ms", default)]
    pub poll_min_ms: u64,

    #[serde(rename = "poll-max-ms", alias = "poll_max_ms", default)]
    pub poll_max_ms: u64,

    #[serde(rename = "rediscover-ms", alias = "rediscover_ms", default)]
    pub rediscover_ms: u64,
}

impl WatchConfig {
    pub fn effective_dial_timeout(&self) -> Duration {
        Duration::from_millis(non_zero_or(
            self.dial_timeout_ms,
            DEFAULT_WATCH_DIAL_TIMEOUT_MS,
        ))
    }

    pub fn effective_poll_min(&self) -> Duration {
        Duration::from_millis(non_zero_or(self.poll_min_ms, DEFAULT_POLL_MIN_MS))
    }

    pub fn effective_poll_max(&self) -> Duration {
        Duration::from_millis(non_zero_or(self.poll_max_ms, DEFAULT_POLL_MAX_MS))
            .max(self.effective_poll_min())
    }

    pub fn effective_rediscover(&self) -> Duration {
        Duration::from_millis(non_zero_or(self.rediscover_ms, DEFAULT_REDISCOVER_MS))
    }
}

fn non_zero_or<T: PartialEq + Default>(v: T, default: T) -> T {
    if v == T::default() {
        default
    } else {
        v
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid project id: {id}")]
    InvalidProjectId { id: String },
    #[error("invalid endpoint: {endpoint}")]
    InvalidEndpoint { endpoint: String },
    #[error("duplicate relay peer: {endpoint}")]
    DuplicatePeer { endpoint: String },
}

impl ConfigFile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = self.project_id.as_deref() {
            if validate_name(id.trim()).is_err() {
                return Err(ConfigError::InvalidProjectId { id: id.to_owned() });
            }
        }

        let mut seen = BTreeSet::new();
        for endpoint in self.relay.endpoints()? {
            if !seen.insert(endpoint.to_string()) {
                return Err(ConfigError::DuplicatePeer {
                    endpoint: endpoint.to_string(),
                });
            }
        }

        if let Some(addr) = self.server.tcp_connect.as_deref() {
            Endpoint::from_str(&format!("tcp:{}", addr.trim()))?;
        }

        Ok(())
    }

    pub fn effective_project_id(&self) -> String {
        self.project_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_PROJECT_ID)
            .to_owned()
    }

    pub fn effective_agent_stale(&self) -> Duration {
        Duration::from_secs(
            self.agent_stale_secs
                .filter(|s| *s > 0)
                .unwrap_or(DEFAULT_AGENT_STALE_SECS),
        )
    }
}

/// A daemon address: the local socket or a TCP host:port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    /// Accepts `unix:/path`, `tcp:host:port`, `tcp://host:port` and bare
    /// `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ConfigError::InvalidEndpoint {
            endpoint: s.to_owned(),
        };

        if let Some(path) = s.strip_prefix("unix:") {
            let path = path.trim_start_matches("//");
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let addr = s
            .strip_prefix("tcp://")
            .or_else(|| s.strip_prefix("tcp:"))
            .unwrap_or(s);
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Tcp(addr.to_owned()))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}
