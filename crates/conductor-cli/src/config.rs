//! `conductor.toml` loading.

use conductor_gateway::GatewayConfig;
use conductor_orchestrator::{OrchestratorConfig, SchedulerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct ConductorConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            heartbeat_interval_secs: default_heartbeat(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SchedulerSection {
    #[serde(default)]
    pub retry_failed_runs: u32,
    #[serde(default = "default_resync")]
    pub resync_interval_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            retry_failed_runs: 0,
            resync_interval_secs: default_resync(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentsConfig {
    /// No deadline when absent.
    #[serde(default)]
    pub dispatch_timeout_secs: Option<u64>,
    #[serde(default)]
    pub definitions: Vec<AgentDefinition>,
}

/// An HTTP agent declared in config.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub endpoint: String,
}

#[derive(Debug, Deserialize)]
pub struct CapabilitiesConfig {
    /// `0` disables the periodic probe.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_heartbeat() -> u64 {
    30
}
fn default_resync() -> u64 {
    60
}
fn default_health_interval() -> u64 {
    60
}
fn default_request_timeout() -> u64 {
    30
}

impl ConductorConfig {
    /// Read and parse a config file. A missing file yields the defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text).map_err(|e| {
                anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Self::parse("")
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            )),
        }
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            scheduler: SchedulerConfig {
                retry_failed_runs: self.scheduler.retry_failed_runs,
            },
            dispatch_timeout: self.agents.dispatch_timeout_secs.map(Duration::from_secs),
            ..OrchestratorConfig::default()
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            heartbeat_interval_secs: self.server.heartbeat_interval_secs,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.capabilities.request_timeout_secs)
    }
}
