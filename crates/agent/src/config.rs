//! Agent configuration

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command line flags; each overrides its `AGENT_*` counterpart
#[derive(Debug, Clone, Parser)]
#[command(name = "aurora-agent", version, about = "Aurora Guard self-protection agent")]
pub struct Cli {
    /// Monitor configuration file (TOML, YAML or JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// API server port for health/metrics/status
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Interval between the agent's own heartbeats in milliseconds
    #[arg(long)]
    pub heartbeat_interval_ms: Option<u64>,
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Host name reported in logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics/status
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Path of the monitor configuration file
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_heartbeat_interval() -> u64 {
    5_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            config_path: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment, then apply command line flags
    pub fn load(cli: &Cli) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT").try_parsing(true))
            .build()?;

        let mut agent: AgentConfig = config.try_deserialize()?;
        agent.apply(cli);
        Ok(agent)
    }

    pub fn apply(&mut self, cli: &Cli) {
        if let Some(port) = cli.port {
            self.api_port = port;
        }
        if let Some(interval) = cli.heartbeat_interval_ms {
            self.heartbeat_interval_ms = interval;
        }
        if cli.config.is_some() {
            self.config_path = cli.config.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from(["aurora-agent", "--port", "9100", "--config", "/etc/aurora.toml"]);
        let mut config = AgentConfig::default();
        config.apply(&cli);

        assert_eq!(config.api_port, 9100);
        assert_eq!(config.heartbeat_interval_ms, 5_000);
        assert_eq!(config.config_path, Some(PathBuf::from("/etc/aurora.toml")));
    }

    #[test]
    fn test_no_flags_keeps_config() {
        let cli = Cli::parse_from(["aurora-agent"]);
        let mut config = AgentConfig::default();
        config.apply(&cli);
        assert_eq!(config.api_port, 8080);
        assert!(config.config_path.is_none());
    }
}
