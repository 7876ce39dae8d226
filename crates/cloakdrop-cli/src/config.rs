//! Configuration system for the CloakDrop CLI.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use cloakdrop_cloak::CloakParams;
use cloakdrop_core::{
    CloakConfig, DirectConfig, DropConfig, SwarmConfig, TimeoutConfig, TransferPolicy,
};

/// CloakDrop configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Rendezvous server
    #[serde(default)]
    pub rendezvous: RendezvousSection,
    /// Direct transport
    #[serde(default)]
    pub direct: DirectSection,
    /// Swarm transport
    #[serde(default)]
    pub swarm: SwarmSection,
    /// Transfer policy and deadlines
    #[serde(default)]
    pub transfer: TransferSection,
    /// Cloak codec
    #[serde(default)]
    pub cloak: CloakSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rendezvous server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousSection {
    /// Server address
    #[serde(default = "default_server")]
    pub server: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Direct transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectSection {
    /// Listener address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Host published to receivers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,
    /// Require the secret before streaming
    #[serde(default = "default_true")]
    pub require_token: bool,
    /// Per-connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    /// Streaming buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Swarm transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmSection {
    /// Session listen address
    #[serde(default = "default_bind_addr")]
    pub listen_addr: String,
    /// IP put into magnet peer hints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,
    /// Metadata fetch deadline in seconds
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,
    /// Keep seeding finished downloads
    #[serde(default)]
    pub seed_after_complete: bool,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    /// `direct`, `swarm` or `both`
    #[serde(default = "default_policy")]
    pub policy: String,
    /// How long a sender waits for an answer, in seconds
    #[serde(default = "default_acceptance_timeout")]
    pub acceptance_timeout_secs: u64,
    /// How long one receive may take, in seconds
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,
}

/// Cloak configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloakSection {
    /// Scratch directory for artifacts
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Argon2 memory cost in KiB
    #[serde(default = "default_memory_cost")]
    pub memory_cost_kib: u32,
    /// Argon2 iterations
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Argon2 lanes
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_server() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_bind_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_metadata_timeout() -> u64 {
    30
}

fn default_policy() -> String {
    "direct".to_string()
}

fn default_acceptance_timeout() -> u64 {
    15 * 60
}

fn default_receive_timeout() -> u64 {
    30 * 60
}

fn default_work_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cloakdrop")
}

fn default_memory_cost() -> u32 {
    CloakParams::default().memory_cost_kib
}

fn default_iterations() -> u32 {
    CloakParams::default().iterations
}

fn default_parallelism() -> u32 {
    CloakParams::default().parallelism
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RendezvousSection {
    fn default() -> Self {
        Self {
            server: default_server(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for DirectSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            advertise_host: None,
            require_token: true,
            connection_timeout_secs: default_connection_timeout(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for SwarmSection {
    fn default() -> Self {
        Self {
            listen_addr: default_bind_addr(),
            advertise_host: None,
            metadata_timeout_secs: default_metadata_timeout(),
            seed_after_complete: false,
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            acceptance_timeout_secs: default_acceptance_timeout(),
            receive_timeout_secs: default_receive_timeout(),
        }
    }
}

impl Default for CloakSection {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            memory_cost_kib: default_memory_cost(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("cloakdrop/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Rendezvous server address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn server_addr(&self) -> anyhow::Result<SocketAddr> {
        self.rendezvous
            .server
            .parse()
            .with_context(|| format!("invalid rendezvous server {:?}", self.rendezvous.server))
    }

    /// Transfer policy
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown policy name.
    pub fn policy(&self) -> anyhow::Result<TransferPolicy> {
        Ok(self.transfer.policy.parse()?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server_addr()?;
        self.policy()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.direct.buffer_size == 0 || self.direct.buffer_size > 16 * 1024 * 1024 {
            anyhow::bail!("Direct buffer size must be between 1 and 16MB");
        }

        if let Some(host) = &self.direct.advertise_host {
            if host.is_empty() || host.contains('/') || host.contains(' ') {
                anyhow::bail!("Direct advertise_host '{}' is not a host name", host);
            }
        }

        for (name, secs) in [
            ("rendezvous.request_timeout_secs", self.rendezvous.request_timeout_secs),
            ("direct.connection_timeout_secs", self.direct.connection_timeout_secs),
            ("swarm.metadata_timeout_secs", self.swarm.metadata_timeout_secs),
            ("transfer.acceptance_timeout_secs", self.transfer.acceptance_timeout_secs),
            ("transfer.receive_timeout_secs", self.transfer.receive_timeout_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        self.to_drop_config()?.validate()?;
        Ok(())
    }

    /// Convert into the library configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if an address does not parse.
    pub fn to_drop_config(&self) -> anyhow::Result<DropConfig> {
        let bind_addr: SocketAddr = self
            .direct
            .bind_addr
            .parse()
            .with_context(|| format!("invalid direct.bind_addr {:?}", self.direct.bind_addr))?;
        let listen_addr: SocketAddr = self
            .swarm
            .listen_addr
            .parse()
            .with_context(|| format!("invalid swarm.listen_addr {:?}", self.swarm.listen_addr))?;
        let swarm_host = self
            .swarm
            .advertise_host
            .as_deref()
            .map(str::parse::<IpAddr>)
            .transpose()
            .context("swarm.advertise_host must be an IP address")?;

        Ok(DropConfig {
            direct: DirectConfig {
                bind_addr,
                advertise_host: self.direct.advertise_host.clone(),
                require_token: self.direct.require_token,
                connection_timeout: Duration::from_secs(self.direct.connection_timeout_secs),
                buffer_size: self.direct.buffer_size,
                ..DirectConfig::default()
            },
            swarm: SwarmConfig {
                listen_addr,
                advertise_host: swarm_host,
                metadata_timeout: Duration::from_secs(self.swarm.metadata_timeout_secs),
                seed_after_complete: self.swarm.seed_after_complete,
                ..SwarmConfig::default()
            },
            cloak: CloakConfig {
                work_dir: self.cloak.work_dir.clone(),
                params: CloakParams {
                    memory_cost_kib: self.cloak.memory_cost_kib,
                    iterations: self.cloak.iterations,
                    parallelism: self.cloak.parallelism,
                },
            },
            policy: self.policy()?,
            timeouts: TimeoutConfig {
                acceptance: Duration::from_secs(self.transfer.acceptance_timeout_secs),
                receive: Duration::from_secs(self.transfer.receive_timeout_secs),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rendezvous.server, "127.0.0.1:7420");
        assert_eq!(config.transfer.policy, "direct");
        assert!(config.direct.require_token);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.transfer.policy = "pigeon".to_string();
        assert!(config.validate().is_err());

        config.transfer.policy = "both".to_string();
        config.direct.buffer_size = 0;
        assert!(config.validate().is_err());

        config.direct.buffer_size = 4096;
        config.transfer.receive_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.transfer.receive_timeout_secs = 60;
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [transfer]
            policy = "swarm"

            [swarm]
            advertise_host = "192.0.2.7"
            "#,
        )
        .unwrap();
        let drop = config.to_drop_config().unwrap();
        assert_eq!(drop.policy, TransferPolicy::Swarm);
        assert_eq!(drop.swarm.advertise_host, Some("192.0.2.7".parse().unwrap()));
        assert_eq!(drop.swarm.metadata_timeout, Duration::from_secs(30));
        assert_eq!(drop.timeouts.acceptance, Duration::from_secs(900));
    }

    #[test]
    fn test_toml_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.rendezvous.server, deserialized.rendezvous.server);
        assert_eq!(config.direct.buffer_size, deserialized.direct.buffer_size);
    }
}
