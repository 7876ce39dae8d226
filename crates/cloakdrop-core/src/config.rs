//! Drop configuration

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use cloakdrop_cloak::CloakParams;
use cloakdrop_swarm::{SessionConfig, SwarmManagerConfig};

use crate::error::DropError;

/// Drop configuration
#[derive(Debug, Clone, Default)]
pub struct DropConfig {
    /// Direct transport configuration
    pub direct: DirectConfig,

    /// Swarm transport configuration
    pub swarm: SwarmConfig,

    /// Cloak codec configuration
    pub cloak: CloakConfig,

    /// Which transports a drop uses
    pub policy: TransferPolicy,

    /// Deadlines
    pub timeouts: TimeoutConfig,
}

impl DropConfig {
    /// Check every section.
    ///
    /// # Errors
    ///
    /// Returns [`DropError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<(), DropError> {
        if self.direct.buffer_size == 0 {
            return Err(DropError::InvalidConfig("direct.buffer_size must be > 0".into()));
        }
        if self.direct.connection_timeout.is_zero() {
            return Err(DropError::InvalidConfig(
                "direct.connection_timeout must be > 0".into(),
            ));
        }
        if self.swarm.metadata_timeout.is_zero() {
            return Err(DropError::InvalidConfig(
                "swarm.metadata_timeout must be > 0".into(),
            ));
        }
        if self.swarm.state_update_interval < Duration::from_millis(10) {
            return Err(DropError::InvalidConfig(
                "swarm.state_update_interval must be at least 10ms".into(),
            ));
        }
        if self.timeouts.receive.is_zero() || self.timeouts.acceptance.is_zero() {
            return Err(DropError::InvalidConfig("timeouts must be > 0".into()));
        }
        self.cloak
            .params
            .validate()
            .map_err(|e| DropError::InvalidConfig(format!("cloak: {e}")))
    }
}

/// Direct transport configuration
#[derive(Debug, Clone)]
pub struct DirectConfig {
    /// Listener address; port 0 picks an ephemeral port
    pub bind_addr: SocketAddr,

    /// Host published in the drop request; `None` leaves it to the rendezvous
    /// service unless the bind address is specific
    pub advertise_host: Option<String>,

    /// Require receivers to send the drop secret before streaming
    pub require_token: bool,

    /// Per-connection read/write timeout
    pub connection_timeout: Duration,

    /// Streaming buffer size
    pub buffer_size: usize,

    /// How long `stop()` waits for the accept loop to exit
    pub stop_timeout: Duration,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertise_host: None,
            require_token: true,
            connection_timeout: Duration::from_secs(30),
            buffer_size: 64 * 1024,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl DirectConfig {
    /// Host to publish: the configured one, else a specific bind address.
    #[must_use]
    pub fn published_host(&self) -> Option<String> {
        self.advertise_host.clone().or_else(|| {
            let ip = self.bind_addr.ip();
            (!ip.is_unspecified()).then(|| ip.to_string())
        })
    }
}

/// Swarm transport configuration
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Session listener address
    pub listen_addr: SocketAddr,

    /// Host put into magnet peer hints
    pub advertise_host: Option<IpAddr>,

    /// Deadline for resolving a link's metadata
    pub metadata_timeout: Duration,

    /// Interval between progress updates
    pub state_update_interval: Duration,

    /// Keep seeding finished downloads
    pub seed_after_complete: bool,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertise_host: None,
            metadata_timeout: Duration::from_secs(30),
            state_update_interval: Duration::from_secs(1),
            seed_after_complete: false,
        }
    }
}

impl SwarmConfig {
    /// Session settings derived from this section.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            listen_addr: self.listen_addr,
            state_update_interval: self.state_update_interval,
            ..SessionConfig::default()
        }
    }

    /// Manager settings derived from this section.
    #[must_use]
    pub fn manager_config(&self) -> SwarmManagerConfig {
        SwarmManagerConfig {
            metadata_timeout: self.metadata_timeout,
            seed_after_complete: self.seed_after_complete,
            advertise_host: self.advertise_host,
            ..SwarmManagerConfig::default()
        }
    }
}

/// Cloak codec configuration
#[derive(Debug, Clone)]
pub struct CloakConfig {
    /// Where artifacts and staged downloads are written
    pub work_dir: PathBuf,

    /// Key derivation cost
    pub params: CloakParams,
}

impl Default for CloakConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("cloakdrop"),
            params: CloakParams::default(),
        }
    }
}

/// Deadlines
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// How long a sender waits for the receiver to answer
    pub acceptance: Duration,

    /// How long a receiver may spend pulling one drop
    pub receive: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            acceptance: Duration::from_secs(15 * 60),
            receive: Duration::from_secs(30 * 60),
        }
    }
}

/// Transports a drop may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferPolicy {
    /// Direct socket only
    #[default]
    Direct,
    /// Swarm preferred; receivers fall back to direct without a link
    Swarm,
    /// Sender offers both; receivers take the swarm when a link is present
    Both,
}

impl TransferPolicy {
    /// Whether senders seed a swarm.
    #[must_use]
    pub fn offers_swarm(self) -> bool {
        matches!(self, TransferPolicy::Swarm | TransferPolicy::Both)
    }

    /// Config/CLI name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransferPolicy::Direct => "direct",
            TransferPolicy::Swarm => "swarm",
            TransferPolicy::Both => "both",
        }
    }
}

impl fmt::Display for TransferPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferPolicy {
    type Err = DropError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(TransferPolicy::Direct),
            "swarm" => Ok(TransferPolicy::Swarm),
            "both" => Ok(TransferPolicy::Both),
            other => Err(DropError::InvalidConfig(format!(
                "unknown transfer policy {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = DropConfig::default();
        config.validate().unwrap();
        assert_eq!(config.swarm.metadata_timeout, Duration::from_secs(30));
        assert_eq!(config.direct.bind_addr.port(), 0);
        assert!(config.direct.require_token);
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let mut config = DropConfig::default();
        config.direct.buffer_size = 0;
        assert!(matches!(config.validate(), Err(DropError::InvalidConfig(_))));
    }

    #[test]
    fn test_published_host() {
        let mut direct = DirectConfig::default();
        assert_eq!(direct.published_host(), None);
        direct.bind_addr = "127.0.0.1:0".parse().unwrap();
        assert_eq!(direct.published_host().as_deref(), Some("127.0.0.1"));
        direct.advertise_host = Some("drop.example.net".into());
        assert_eq!(direct.published_host().as_deref(), Some("drop.example.net"));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("Both".parse::<TransferPolicy>().unwrap(), TransferPolicy::Both);
        assert!("carrier-pigeon".parse::<TransferPolicy>().is_err());
        assert!(TransferPolicy::Swarm.offers_swarm());
        assert!(!TransferPolicy::Direct.offers_swarm());
    }

    #[test]
    fn test_swarm_sections() {
        let swarm = SwarmConfig {
            seed_after_complete: true,
            ..Default::default()
        };
        assert!(swarm.manager_config().seed_after_complete);
        assert_eq!(swarm.session_config().listen_addr, swarm.listen_addr);
    }
}
