use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::{DEFAULT_PROTOCOL_VERSION, ServerIdentity};
use crate::host::DEFAULT_RECONNECT_DELAY;
use crate::registry::DEFAULT_DISCONNECTED_RETENTION;
use crate::relay::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::router::{
    DEFAULT_BIND_ADDRESS, DEFAULT_CALL_TIMEOUT, DEFAULT_MAX_CONNECTIONS, DEFAULT_SLOW_CALL_TIMEOUT, ListenerConfig,
    TimeoutPolicy,
};

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub listener: ListenerSection,
    pub routing: RoutingConfig,
    pub relay: RelayConfig,
    pub agent: AgentConfig,
    pub host: HostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSection {
    pub bind_address: String,
    pub max_connections: usize,
    pub shared_secret: Option<String>,
}

impl Default for ListenerSection {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            shared_secret: None,
        }
    }
}

impl ListenerSection {
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig::default()
            .with_bind_address(self.bind_address.clone())
            .with_max_connections(self.max_connections)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub call_timeout_ms: u64,
    pub slow_call_timeout_ms: u64,
    pub slow_tools: Vec<String>,
    pub disconnected_retention: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: millis(DEFAULT_CALL_TIMEOUT),
            slow_call_timeout_ms: millis(DEFAULT_SLOW_CALL_TIMEOUT),
            slow_tools: vec!["capture_screenshot".to_string()],
            disconnected_retention: DEFAULT_DISCONNECTED_RETENTION,
        }
    }
}

impl RoutingConfig {
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::new(Duration::from_millis(self.call_timeout_ms)).with_slow_tools(
            Duration::from_millis(self.slow_call_timeout_ms),
            self.slow_tools.iter().cloned(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: millis(DEFAULT_HANDSHAKE_TIMEOUT),
            request_timeout_ms: millis(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server_name: String,
    pub protocol_version: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_name: env!("CARGO_PKG_NAME").to_string(),
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
        }
    }
}

impl AgentConfig {
    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity {
            name: self.server_name.clone(),
            protocol_version: self.protocol_version.clone(),
            ..ServerIdentity::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Defaults to the listener's bind address
    pub router_address: Option<String>,
    pub reconnect_delay_ms: u64,
    pub shared_secret: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            router_address: None,
            reconnect_delay_ms: millis(DEFAULT_RECONNECT_DELAY),
            shared_secret: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            listener: ListenerSection::default(),
            routing: RoutingConfig::default(),
            relay: RelayConfig::default(),
            agent: AgentConfig::default(),
            host: HostConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_name = env!("CARGO_PKG_NAME");

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Reject settings the router cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.listener.max_connections == 0 {
            eyre::bail!("listener.max_connections must be at least 1");
        }
        if self.routing.call_timeout_ms == 0 {
            eyre::bail!("routing.call_timeout_ms must be greater than 0");
        }
        let ceiling = self.routing.call_timeout_ms.max(self.routing.slow_call_timeout_ms);
        if self.relay.request_timeout_ms <= ceiling {
            log::warn!(
                "relay.request_timeout_ms ({}) does not exceed the slowest call deadline ({}); relayed calls may time out at the relay first",
                self.relay.request_timeout_ms,
                ceiling
            );
        }
        Ok(())
    }

    /// Address tool hosts connect to.
    pub fn router_address(&self) -> &str {
        self.host
            .router_address
            .as_deref()
            .unwrap_or(&self.listener.bind_address)
    }

    /// Apply command-line overrides.
    pub fn with_overrides(mut self, bind: Option<String>, max_connections: Option<usize>, timeout_ms: Option<u64>) -> Self {
        if let Some(bind) = bind {
            self.listener.bind_address = bind;
        }
        if let Some(max) = max_connections {
            self.listener.max_connections = max;
        }
        if let Some(timeout) = timeout_ms {
            self.routing.call_timeout_ms = timeout;
        }
        self
    }
}
