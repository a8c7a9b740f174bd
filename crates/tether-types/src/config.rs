//! Peer configuration, deserialized from `~/.tether/config.toml`.

use crate::identity::PeerAddress;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Top-level configuration of one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Address the session server listens on.
    pub listen_addr: SocketAddr,
    /// Hex-encoded Ed25519 secret seed. Empty = generate a fresh identity.
    pub secret_key: String,
    /// Hex-encoded public key of the system authority, for System/Admin services.
    pub system_public_key: Option<String>,
    /// Default deadline for session requests.
    pub request_timeout_secs: u64,
    /// Deadline for one exchange round trip.
    pub exchange_timeout_secs: u64,
    /// Backoff stages used when opening outbound connections.
    pub connect_retry: Vec<RetryStage>,
    /// Static routing table for remote peers.
    pub routes: Vec<RouteConfig>,
    /// Remote peers registered at startup.
    pub entities: Vec<EntityConfig>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4710)),
            secret_key: String::new(),
            system_public_key: None,
            request_timeout_secs: 30,
            exchange_timeout_secs: 15,
            connect_retry: vec![
                RetryStage {
                    count: Some(3),
                    delay_ms: 1_000,
                },
                RetryStage {
                    count: Some(3),
                    delay_ms: 5_000,
                },
            ],
            routes: Vec::new(),
            entities: Vec::new(),
        }
    }
}

impl PeerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }
}

/// One stage of a retry policy: `count` attempts spaced `delay_ms` apart.
/// A missing count repeats forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStage {
    #[serde(default)]
    pub count: Option<u32>,
    pub delay_ms: u64,
}

impl RetryStage {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Where to reach a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub address: PeerAddress,
    pub socket: SocketAddr,
}

/// A remote peer to register as a pending entity at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub address: PeerAddress,
    #[serde(default)]
    pub name: String,
}
