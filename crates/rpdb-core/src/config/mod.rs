//! Configuration for debug sessions and the broker.
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional TOML file, `RPDB_*` environment variables, and per-call overrides.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Default bind/connect address.
pub const DEFAULT_ADDR: &str = "127.0.0.1";
/// Default debugging port.
pub const DEFAULT_PORT: u16 = 4444;
/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RPDB";

fn default_address() -> String {
    DEFAULT_ADDR.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_search_window() -> u16 {
    100
}

fn default_retry_timeout_secs() -> u64 {
    180
}

fn default_retry_interval_secs() -> u64 {
    10
}

fn default_probe_timeout_ms() -> u64 {
    200
}

/// Debuggee-side session configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DebugConfig {
    /// Address to bind (passive) or dial (active).
    #[serde(default = "default_address")]
    pub address: String,
    /// Port to bind or dial.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pick the first free port at or above `port` before binding.
    #[serde(default)]
    pub port_search: bool,
    /// Number of ports scanned when `port_search` is on.
    #[serde(default = "default_search_window")]
    pub search_window: u16,
    /// Give up retrying a busy port after this many seconds.
    #[serde(default = "default_retry_timeout_secs")]
    pub retry_timeout_secs: u64,
    /// Wait between retries of a busy port.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    /// Connect timeout used by the port probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            port_search: false,
            search_window: default_search_window(),
            retry_timeout_secs: default_retry_timeout_secs(),
            retry_interval_secs: default_retry_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl DebugConfig {
    /// Load from the process environment only.
    pub fn load() -> Result<Self> {
        Self::load_from(None, None)
    }

    /// Load from an optional TOML file and an environment map.
    ///
    /// `env` defaults to the process environment when `None`; tests pass an
    /// explicit map so they never mutate global state.
    pub fn load_from(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        Ok(build_source(file, env)?.try_deserialize()?)
    }

    /// Override address and port for a single call.
    #[must_use]
    pub fn with_endpoint(mut self, address: impl Into<String>, port: u16) -> Self {
        self.address = address.into();
        self.port = port;
        self
    }

    /// Resolve `address:port` into a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.address.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Broker (multi-session console) configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// Address the broker listens on.
    #[serde(default = "default_address")]
    pub address: String,
    /// Port the broker listens on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { address: default_address(), port: default_port() }
    }
}

impl BrokerConfig {
    /// Load from an optional TOML file and an environment map.
    pub fn load_from(file: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        Ok(build_source(file, env)?.try_deserialize()?)
    }

    /// Resolve `address:port` into a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.address.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

fn build_source(
    file: Option<&Path>,
    env: Option<HashMap<String, String>>,
) -> Result<config::Config> {
    let mut builder = config::Config::builder();
    if let Some(path) = file {
        builder = builder.add_source(config::File::from(path).required(false));
    }
    let mut environment = config::Environment::with_prefix(ENV_PREFIX).try_parsing(true);
    if let Some(vars) = env {
        environment = environment.source(Some(vars.into_iter().collect()));
    }
    Ok(builder.add_source(environment).build()?)
}
