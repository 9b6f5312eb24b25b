use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use kubegate_session::{DEFAULT_SHELL, PortForwardConfig, ShellPolicy, TerminalConfig};

/// Port the gateway listens on unless configured otherwise
pub const DEFAULT_PORT: u16 = 14122;

/// Gateway settings, read from an optional TOML file
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket server binds to
    pub listen: SocketAddr,
    /// Address port-forward listeners bind to
    pub forward_bind_address: IpAddr,
    pub session_ready_timeout_secs: u64,
    pub exec_start_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub allowed_shells: Vec<String>,
    pub default_shell: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            forward_bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            session_ready_timeout_secs: 10,
            exec_start_timeout_secs: 10,
            keepalive_interval_secs: 30,
            allowed_shells: ["bash", "sh", "powershell", "cmd"]
                .into_iter()
                .map(String::from)
                .collect(),
            default_shell: DEFAULT_SHELL.to_string(),
        }
    }
}

impl ServerConfig {
    /// Load the config file, or the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::parse(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;

        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.session_ready_timeout_secs == 0 {
            bail!("session_ready_timeout_secs must be greater than zero");
        }
        if self.exec_start_timeout_secs == 0 {
            bail!("exec_start_timeout_secs must be greater than zero");
        }
        if self.keepalive_interval_secs == 0 {
            bail!("keepalive_interval_secs must be greater than zero");
        }
        if self.default_shell.trim().is_empty() {
            bail!("default_shell must not be empty");
        }
        Ok(())
    }

    pub fn port_forward(&self) -> PortForwardConfig {
        PortForwardConfig {
            bind_address: self.forward_bind_address,
            ready_timeout: Duration::from_secs(self.session_ready_timeout_secs),
        }
    }

    pub fn terminal(&self) -> TerminalConfig {
        TerminalConfig {
            shells: ShellPolicy::new(self.allowed_shells.clone(), self.default_shell.clone()),
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            exec_timeout: Duration::from_secs(self.exec_start_timeout_secs),
        }
    }
}
