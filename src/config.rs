//! Gateway configuration.
//!
//! Defaults, overlaid by an optional TOML file, overlaid by CLI flags and
//! environment variables.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::session::ReconnectPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Command line interface
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "wagate", version, about = "Multi-tenant messaging session gateway")]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "WAGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Directory holding one credential directory per session
    #[arg(long, env = "SESSIONS_DIR")]
    pub sessions_dir: Option<PathBuf>,

    /// Program that hosts the protocol library
    #[arg(long, env = "WAGATE_BRIDGE")]
    pub bridge: Option<String>,

    /// Resume every session with stored credentials at startup
    #[arg(long)]
    pub restore: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long create-or-get waits for a challenge or connection
    pub auth_wait_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            auth_wait_ms: 5000,
        }
    }
}

impl ServerConfig {
    pub fn auth_wait(&self) -> Duration {
        Duration::from_millis(self.auth_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub sessions_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sessions_dir: PathBuf::from("sessions"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Device name shown on the linked phone
    pub client_name: String,
    pub request_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: "wagate-bridge".to_string(),
            args: Vec::new(),
            client_name: "wagate".to_string(),
            request_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub bridge: BridgeConfig,
    pub reconnect: ReconnectPolicy,
    pub restore_on_start: bool,
}

impl GatewayConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build the effective configuration for a CLI invocation
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Self::from_toml(&text, path)?
            }
            None => Self::default(),
        };

        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(dir) = &cli.sessions_dir {
            self.storage.sessions_dir = dir.clone();
        }
        if let Some(program) = &cli.bridge {
            self.bridge.program = program.clone();
        }
        if cli.restore {
            self.restore_on_start = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.program.trim().is_empty() {
            return Err(ConfigError::Invalid("bridge.program is empty".to_string()));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "reconnect.multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.max_delay_ms is below reconnect.initial_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
