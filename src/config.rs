//! Configuration file for kubeport
//!
//! Read from `--config <path>` or `<config dir>/kubeport/config.toml`.
//! Every field has a default, so a missing file is not an error.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Namespace every request runs against
    pub namespace: String,
    /// Kubeconfig context; the current context when unset
    pub context: Option<String>,
    pub forward: ForwardConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            context: None,
            forward: ForwardConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForwardConfig {
    pub local_address: IpAddr,
    pub local_port: u16,
    /// Container port traffic is delivered to
    pub remote_port: u16,
    /// Port the provisioned service exposes
    pub service_port: u16,
    pub node_port: Option<u16>,
    pub service_type: String,
    /// Close connections idle this long; 0 disables
    pub idle_timeout_secs: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            local_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: 3003,
            remote_port: 3000,
            service_port: 3000,
            node_port: Some(30008),
            service_type: "LoadBalancer".to_string(),
            idle_timeout_secs: 0,
        }
    }
}

impl ForwardConfig {
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_address, self.local_port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

impl Config {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kubeport").join("config.toml"))
    }

    /// Load from an explicit path, or from the default location when present
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
