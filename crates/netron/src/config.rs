//! Hub configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a Netron hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetronConfig {
    /// Default address for [`Netron::bind`](crate::Netron::bind) when none is given.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// How long a request waits for its reply before failing with `Timeout`.
    #[serde(with = "duration_ms_serde")]
    pub response_timeout: Duration,

    /// Announce this hub as a super peer during the handshake.
    pub is_super: bool,

    /// Whether interface twins registered with `set_interface_twin` are honored.
    pub accept_twins: bool,

    /// Subscribe to `context attach` / `context detach` of every peer after
    /// the handshake so its context table stays current.
    pub track_remote_contexts: bool,

    /// Outgoing connection retry policy.
    pub connect: ConnectConfig,
}

/// Retry policy for [`Netron::connect`](crate::Netron::connect).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Number of additional attempts after the first one fails.
    pub retries: u32,

    /// Delay before the first retry; doubles on every further attempt.
    #[serde(with = "duration_ms_serde")]
    pub min_timeout: Duration,

    /// Upper bound of the retry delay.
    #[serde(with = "duration_ms_serde")]
    pub max_timeout: Duration,
}

impl Default for NetronConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8888)),
            response_timeout: Duration::from_secs(180),
            is_super: false,
            accept_twins: true,
            track_remote_contexts: true,
            connect: ConnectConfig::default(),
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            min_timeout: Duration::from_millis(300),
            max_timeout: Duration::from_millis(3000),
        }
    }
}

impl ConnectConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.min_timeout
            .saturating_mul(factor)
            .min(self.max_timeout)
    }
}

impl NetronConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetronConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
