//! Type definitions for the tunnel module.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::tunnel::error::{TunnelError, TunnelResult};

/// Longest name an interface can carry.
pub const MAX_NAME_LEN: usize = 15;

/// Check a tunnel name against the interface naming rules.
///
/// Names are 1 to 15 characters drawn from `[a-zA-Z0-9_=+.-]`.
pub fn validate_name(name: &str) -> TunnelResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(TunnelError::InvalidName(name.to_string()))
    }
}

/// Registry ordering: case-insensitive first, ties broken by natural order.
pub fn compare_names(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
        .then_with(|| a.cmp(b))
}

/// Activation state of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// Interface is configured and running
    Up,
    /// Interface is not running
    #[default]
    Down,
}

impl TunnelState {
    pub fn is_up(self) -> bool {
        self == TunnelState::Up
    }

    pub fn from_active(active: bool) -> Self {
        if active {
            TunnelState::Up
        } else {
            TunnelState::Down
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Up => write!(f, "up"),
            TunnelState::Down => write!(f, "down"),
        }
    }
}

impl FromStr for TunnelState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(TunnelState::Up),
            "down" => Ok(TunnelState::Down),
            other => Err(format!("unknown tunnel state: {other}")),
        }
    }
}

/// Transfer counters for one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    /// Bytes received from the peer
    pub rx_bytes: u64,
    /// Bytes sent to the peer
    pub tx_bytes: u64,
}

/// Statistics for a tunnel, keyed by peer public key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStats {
    peers: BTreeMap<String, PeerStats>,
}

impl TunnelStats {
    /// Create empty statistics.
    pub fn new() -> Self {
        TunnelStats::default()
    }

    /// Record the counters for a peer, replacing any previous values.
    pub fn add_peer(&mut self, key: impl Into<String>, rx_bytes: u64, tx_bytes: u64) {
        self.peers
            .insert(key.into(), PeerStats { rx_bytes, tx_bytes });
    }

    pub fn peer(&self, key: &str) -> Option<PeerStats> {
        self.peers.get(key).copied()
    }

    pub fn peers(&self) -> impl Iterator<Item = (&str, &PeerStats)> {
        self.peers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Total bytes received across all peers.
    pub fn total_rx(&self) -> u64 {
        self.peers.values().map(|p| p.rx_bytes).sum()
    }

    /// Total bytes sent across all peers.
    pub fn total_tx(&self) -> u64 {
        self.peers.values().map(|p| p.tx_bytes).sum()
    }
}

/// Configuration of a single tunnel.
///
/// The orchestrator treats the content as opaque text; only the backend
/// and the config store interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelConfig(String);

impl TunnelConfig {
    pub fn new(text: impl Into<String>) -> Self {
        TunnelConfig(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TunnelConfig {
    fn from(s: String) -> Self {
        TunnelConfig(s)
    }
}

impl From<&str> for TunnelConfig {
    fn from(s: &str) -> Self {
        TunnelConfig(s.to_string())
    }
}

/// Change notification published by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// A tunnel became visible in the registry
    Added { name: String },
    /// A tunnel left the registry
    Removed { name: String },
    /// A tunnel changed its name
    Renamed { from: String, to: String },
    /// Observed state changed
    StateChanged { name: String, state: TunnelState },
    /// Fresh statistics were fetched
    StatisticsChanged { name: String },
    /// Configuration was loaded or replaced
    ConfigChanged { name: String },
    /// The last-used tunnel changed
    LastUsedChanged { name: Option<String> },
}
