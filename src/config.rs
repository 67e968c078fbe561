// Configuration schema for the guardport transport.

use std::{
    env, fs,
    io::{self, Read},
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    buffer::{BufferLayout, BASIC_HEADER_RESERVE},
    crypto::trust::{Psk, TrustStore, PSK_LEN},
    fragment::FragmentLimits,
};

const MIN_MTU: usize = 1280;
const MAX_MTU: usize = 1500;

/// Environment variable naming the TOML file read by [`Config::load`].
pub const CONFIG_ENV: &str = "GUARDPORT_CONFIG";

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Transport configuration loaded at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local UDP address.
    pub bind: SocketAddr,
    /// Datagram ceiling for the envelope, excluding raw IP/UDP framing.
    pub mtu: usize,
    /// Frame outbound IPv4 datagrams through a raw socket when permitted.
    pub raw_socket: bool,
    /// Multitenant project id stamped on every envelope.
    pub project_id: Option<u64>,
    /// Drop cleartext data messages.
    pub require_encryption: bool,
    /// Slots in the ring of pending handshakes.
    pub connecting_capacity: usize,
    /// Idle buffers retained by the pool.
    pub buffer_pool_size: usize,
    pub handshake_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub fragment: FragmentConfig,
    pub identity: IdentityConfig,
    /// Nodes allowed to complete a handshake with this one.
    pub peers: Vec<PeerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            mtu: 1400,
            raw_socket: false,
            project_id: None,
            require_encryption: true,
            connecting_capacity: 500,
            buffer_pool_size: 256,
            handshake_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
            fragment: FragmentConfig::default(),
            identity: IdentityConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from `GUARDPORT_CONFIG` if set, otherwise returns defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var(CONFIG_ENV) {
            Ok(path) => Self::from_path(path),
            Err(_missing) => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Validates the configuration, returning an error when constraints are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check().map_err(ConfigError::Validation)
    }

    fn check(&self) -> Result<(), String> {
        // A ClientHello (ML-KEM-768 public key) must fit in one datagram.
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(format!("mtu {} must lie within [{MIN_MTU}, {MAX_MTU}]", self.mtu));
        }
        if self.connecting_capacity == 0 || self.connecting_capacity > usize::from(u16::MAX) {
            return Err("connecting_capacity must be within [1, 65535]".into());
        }
        if self.buffer_pool_size == 0 {
            return Err("buffer_pool_size must be > 0".into());
        }
        if self.handshake_timeout_ms == 0 {
            return Err("handshake_timeout_ms must be > 0".into());
        }
        if self.idle_timeout_ms == 0 {
            return Err("idle_timeout_ms must be > 0".into());
        }
        self.fragment.validate()?;

        if self.identity.node_id == 0 {
            return Err("identity.node_id must be non-zero".into());
        }
        parse_psk("identity.psk", &self.identity.psk)?;
        for peer in &self.peers {
            if peer.node_id == 0 {
                return Err("peer node_id must be non-zero".into());
            }
            if peer.node_id == self.identity.node_id {
                return Err(format!("peer {} duplicates the local identity", peer.node_id));
            }
            parse_psk("peers.psk", &peer.psk)?;
        }
        Ok(())
    }

    /// Header reservation and MTU for pooled buffers.
    pub fn buffer_layout(&self, raw: bool) -> BufferLayout {
        if raw {
            BufferLayout::raw(self.mtu)
        } else {
            BufferLayout::basic(self.mtu)
        }
    }

    /// Largest application payload one datagram carries.
    pub fn max_payload(&self) -> usize {
        self.mtu - BASIC_HEADER_RESERVE
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn fragment_limits(&self) -> FragmentLimits {
        FragmentLimits {
            max_partial_messages: self.fragment.max_partial_messages,
            max_fragments: self.fragment.max_fragments,
            partial_timeout: Duration::from_millis(self.fragment.partial_timeout_ms),
        }
    }

    /// Builds the trust store from the identity and peer list.
    pub fn trust_store(&self) -> Result<TrustStore, ConfigError> {
        let local = parse_psk("identity.psk", &self.identity.psk).map_err(ConfigError::Validation)?;
        let mut store = TrustStore::new(self.identity.node_id, local)
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        for peer in &self.peers {
            let key = parse_psk("peers.psk", &peer.psk).map_err(ConfigError::Validation)?;
            store
                .insert(peer.node_id, key)
                .map_err(|err| ConfigError::Validation(err.to_string()))?;
        }
        Ok(store)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Fragment reassembly bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FragmentConfig {
    /// Partial messages retained per session.
    pub max_partial_messages: usize,
    /// Largest fragment count accepted for one message.
    pub max_fragments: u64,
    pub partial_timeout_ms: u64,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        let limits = FragmentLimits::default();
        Self {
            max_partial_messages: limits.max_partial_messages,
            max_fragments: limits.max_fragments,
            partial_timeout_ms: limits.partial_timeout.as_millis() as u64,
        }
    }
}

impl FragmentConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_partial_messages == 0 {
            return Err("fragment.max_partial_messages must be > 0".into());
        }
        if self.max_fragments < 2 {
            return Err("fragment.max_fragments must be >= 2".into());
        }
        if self.partial_timeout_ms == 0 {
            return Err("fragment.partial_timeout_ms must be > 0".into());
        }
        Ok(())
    }
}

/// This node's id and authentication key.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub node_id: u64,
    /// 32-byte key as 64 hex characters.
    pub psk: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            psk: "00".repeat(PSK_LEN),
        }
    }
}

/// Remote node permitted to authenticate.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub node_id: u64,
    pub psk: String,
}

fn parse_psk(field: &str, value: &str) -> Result<Psk, String> {
    let bytes = hex::decode(value.trim()).map_err(|err| format!("{field} is not hex: {err}"))?;
    let key: [u8; PSK_LEN] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| format!("{field} must be {PSK_LEN} bytes, got {}", bytes.len()))?;
    Ok(Psk::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_payload(), 1348);
        assert_eq!(cfg.buffer_layout(true).header_reserve, 152);
    }

    #[test]
    fn parses_full_file() {
        let input = format!(
            r#"
            bind = "127.0.0.1:7400"
            project_id = 12
            connecting_capacity = 64

            [fragment]
            max_partial_messages = 4

            [identity]
            node_id = 10
            psk = "{local}"

            [[peers]]
            node_id = 11
            psk = "{peer}"
        "#,
            local = "11".repeat(32),
            peer = "22".repeat(32)
        );
        let cfg = Config::from_toml_str(&input).expect("valid");
        assert_eq!(cfg.bind.port(), 7400);
        assert_eq!(cfg.project_id, Some(12));
        assert_eq!(cfg.fragment_limits().max_partial_messages, 4);
        assert_eq!(cfg.fragment_limits().max_fragments, 64);

        let trust = cfg.trust_store().expect("trust");
        assert_eq!(trust.local_id(), 10);
        assert_eq!(trust.resolve(11).map(|psk| psk.as_bytes()[0]), Some(0x22));
    }

    #[test]
    fn mtu_out_of_range_rejected() {
        let err = Config::from_toml_str("mtu = 9000").unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains("mtu")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn short_psk_rejected() {
        let input = r#"
            [identity]
            node_id = 3
            psk = "abcd"
        "#;
        let err = Config::from_toml_str(input).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("32 bytes")));
    }

    #[test]
    fn connecting_capacity_bounded() {
        assert!(Config::from_toml_str("connecting_capacity = 0").is_err());
        assert!(Config::from_toml_str("connecting_capacity = 65536").is_err());
        assert!(Config::from_toml_str("connecting_capacity = 65535").is_ok());
    }
}
