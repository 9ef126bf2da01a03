//! Configuration for the burrow daemon.
//!
//! Settings come out of one TOML file, with a handful of `BURROW_*`
//! environment variables winning over the file for quick experiments. The
//! file lives at `$BURROW_CONFIG` if set, under the XDG config home
//! otherwise, and a missing file simply means defaults.
//!
//! Each `[[peers]]` entry is the static stand-in for the handshake
//! collaborator: it carries the shared session key and the parameters a real
//! key agreement would negotiate (role, timeout, padding, rate shaping).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::crypto::{KeyError, PeerId, SessionKey};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BurrowConfig {
    pub network: NetworkConfig,
    pub peers: Vec<PeerStatic>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TAP interface name shared by all peers.
    pub interface: String,
    /// Tunnel MTU. Fixed for the lifetime of the process.
    pub mtu: usize,
    /// Local UDP bind address.
    pub bind: String,
}

/// One statically keyed remote peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerStatic {
    /// Remote endpoint, host:port.
    pub addr: String,
    /// Shared 32-byte session key, 64 hex characters.
    pub key: String,
    /// Initiating side uses odd outbound nonces, responding side even ones.
    pub initiator: bool,
    /// Liveness timeout in seconds.
    pub timeout_secs: u64,
    /// Pad every datagram to the full MTU.
    pub noise: bool,
    /// Constant packet rate in KiB/s. 0 = unshaped. Implies noise.
    pub cpr_kibps: u32,
}

/// Runtime peer parameters, as the handshake collaborator would hand them
/// over.
#[derive(Debug, Clone)]
pub struct PeerConf {
    pub id: PeerId,
    pub timeout: Duration,
    pub noise: bool,
    pub cpr_kibps: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BurrowConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "tap0".to_string(),
            mtu: crate::wire::DEFAULT_MTU,
            bind: "0.0.0.0:5797".to_string(),
        }
    }
}

impl Default for PeerStatic {
    fn default() -> Self {
        Self {
            addr: String::new(),
            key: String::new(),
            initiator: false,
            timeout_secs: 60,
            noise: false,
            cpr_kibps: 0,
        }
    }
}

impl PeerStatic {
    pub fn session_key(&self) -> Result<SessionKey, ConfigError> {
        SessionKey::from_hex(&self.key).map_err(|e| ConfigError::BadPeerKey(self.addr.clone(), e))
    }

    pub fn peer_conf(&self) -> Result<PeerConf, ConfigError> {
        let key = self.session_key()?;
        Ok(PeerConf {
            id: PeerId::derive(&key),
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            noise: self.noise,
            cpr_kibps: self.cpr_kibps,
        })
    }

    /// Initial outbound nonce: the two sides stride by two from different
    /// parities so their counters can never collide.
    pub fn initial_nonce(&self) -> u64 {
        if self.initiator {
            1
        } else {
            0
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config at {path} is not valid TOML: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("could not write starter config to {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("peer {0}: {1}")]
    BadPeerKey(String, KeyError),
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Starter file written on first run. Parses back to the defaults; the peer
/// block stays commented out until the operator fills in a key.
const STARTER_CONFIG: &str = "\
# burrow configuration
#
# One [[peers]] entry per remote endpoint. Both sides share the key
# (64 hex characters); exactly one side sets initiator = true.

[network]
interface = \"tap0\"
mtu = 1452
bind = \"0.0.0.0:5797\"

# [[peers]]
# addr = \"192.0.2.10:5797\"
# key = \"<64 hex characters>\"
# initiator = true
# timeout_secs = 60
# noise = false
# cpr_kibps = 0
";

/// Read a `name` environment variable and parse it, discarding unset or
/// unparsable values.
fn env_override<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

impl BurrowConfig {
    /// Resolve the effective configuration: the config file (when present),
    /// then any `BURROW_*` environment overrides on top.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Same, from an explicit path. Absence is not an error — the daemon
    /// runs on defaults until a file appears.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if let Some(interface) = env_override("BURROW_IFACE") {
            config.network.interface = interface;
        }
        if let Some(mtu) = env_override("BURROW_MTU") {
            config.network.mtu = mtu;
        }
        if let Some(bind) = env_override("BURROW_BIND") {
            config.network.bind = bind;
        }
        Ok(config)
    }

    /// Where the config file lives: `$BURROW_CONFIG`, or
    /// `<xdg config home>/burrow/config.toml`.
    pub fn file_path() -> PathBuf {
        if let Some(explicit) = env_override::<PathBuf>("BURROW_CONFIG") {
            return explicit;
        }
        let base = env_override::<PathBuf>("XDG_CONFIG_HOME")
            .or_else(|| env_override::<PathBuf>("HOME").map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("/etc"));
        base.join("burrow").join("config.toml")
    }

    /// Drop the starter template at the config path unless something is
    /// already there. Returns the path either way.
    pub fn bootstrap() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if path.exists() {
            return Ok(path);
        }
        let write = |source| ConfigError::Write {
            path: path.clone(),
            source,
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(write)?;
        }
        std::fs::write(&path, STARTER_CONFIG).map_err(write)?;
        Ok(path)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_network() {
        let config = BurrowConfig::default();
        assert_eq!(config.network.interface, "tap0");
        assert_eq!(config.network.mtu, 1452);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn starter_template_parses_back_to_defaults() {
        let config: BurrowConfig = toml::from_str(STARTER_CONFIG).unwrap();
        assert_eq!(config.network.interface, "tap0");
        assert_eq!(config.network.mtu, crate::wire::DEFAULT_MTU);
        assert_eq!(config.network.bind, "0.0.0.0:5797");
        assert!(config.peers.is_empty(), "the peer block ships commented out");
    }

    #[test]
    fn peer_entry_parses() {
        let text = r#"
            [network]
            interface = "tap1"
            mtu = 1400

            [[peers]]
            addr = "192.0.2.1:5797"
            key = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
            initiator = true
            timeout_secs = 10
            cpr_kibps = 10
        "#;
        let config: BurrowConfig = toml::from_str(text).unwrap();
        assert_eq!(config.network.interface, "tap1");
        assert_eq!(config.peers.len(), 1);

        let peer = &config.peers[0];
        assert_eq!(peer.initial_nonce(), 1);
        let conf = peer.peer_conf().unwrap();
        assert_eq!(conf.timeout, Duration::from_secs(10));
        assert_eq!(conf.cpr_kibps, 10);
        assert!(!conf.noise, "noise defaults off; the shaper forces it on");
    }

    #[test]
    fn bad_peer_key_is_rejected() {
        let peer = PeerStatic {
            addr: "192.0.2.1:5797".into(),
            key: "feedface".into(),
            ..PeerStatic::default()
        };
        assert!(matches!(peer.peer_conf(), Err(ConfigError::BadPeerKey(..))));
    }

    #[test]
    fn responder_starts_at_zero() {
        let peer = PeerStatic::default();
        assert_eq!(peer.initial_nonce(), 0);
    }

    #[test]
    fn env_override_ignores_garbage() {
        std::env::set_var("BURROW_TEST_NUMBER", "1400");
        assert_eq!(env_override::<usize>("BURROW_TEST_NUMBER"), Some(1400));

        std::env::set_var("BURROW_TEST_NUMBER", "fourteen hundred");
        assert_eq!(env_override::<usize>("BURROW_TEST_NUMBER"), None);
        std::env::remove_var("BURROW_TEST_NUMBER");

        assert_eq!(env_override::<usize>("BURROW_TEST_UNSET"), None);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let ghost = std::env::temp_dir().join("burrow-no-such-config.toml");
        let config = BurrowConfig::load_from(&ghost).unwrap();
        assert_eq!(config.network.interface, "tap0");
    }

    #[test]
    fn broken_file_is_a_parse_error() {
        let dir = std::env::temp_dir().join(format!("burrow-broken-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "network = \"not a table\"").unwrap();

        assert!(matches!(
            BurrowConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn bootstrap_writes_the_starter_once() {
        let dir = std::env::temp_dir().join(format!("burrow-boot-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::env::set_var("BURROW_CONFIG", &path);

        let written = BurrowConfig::bootstrap().unwrap();
        assert_eq!(written, path);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), STARTER_CONFIG);

        // A second bootstrap must leave an edited file alone.
        std::fs::write(&path, "[network]\ninterface = \"tap9\"\n").unwrap();
        BurrowConfig::bootstrap().unwrap();
        let config = BurrowConfig::load().unwrap();
        assert_eq!(config.network.interface, "tap9");

        std::env::remove_var("BURROW_CONFIG");
        std::fs::remove_dir_all(&dir).ok();
    }
}
