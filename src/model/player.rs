//! Player Entities
//!
//! A player is one UDP endpoint participating in a session. Identity within
//! a session is the player name; the stored address is where replies and
//! broadcasts go, and `last_seen` drives idle detection.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How long a mesh player may stay silent before the cleanup sweep drops it.
pub const MESH_PLAYER_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a relay host may stay silent before its session is torn down.
/// Relay clients talk to the host directly once paired, so only the host
/// heartbeats the server.
pub const RELAY_HOST_TIMEOUT: Duration = Duration::from_secs(80);

/// A participant in a mesh session.
#[derive(Debug, Clone)]
pub struct Player {
    /// Player name, unique within its session.
    pub name: String,
    /// Source address of the player's datagrams.
    pub addr: SocketAddr,
    /// When the server last accepted a message from this player.
    last_seen: Instant,
}

impl Player {
    /// Create a player first seen now.
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            last_seen: Instant::now(),
        }
    }

    /// Record activity from this player.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Time since the last accepted message.
    pub fn idle(&self) -> Duration {
        self.last_seen.elapsed()
    }

    /// Whether the mesh player-timeout has elapsed.
    pub fn is_timed_out(&self) -> bool {
        self.idle() > MESH_PLAYER_TIMEOUT
    }

    /// Backdate `last_seen`, so tests can expire players without sleeping.
    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        self.last_seen = Instant::now() - by;
    }
}

/// A participant in a relay session.
///
/// Carries the pairing state on top of the base player: `host_port` is the
/// UDP port the session host opened for this specific player, or `None`
/// while the player is still waiting for the host to confirm a path.
#[derive(Debug, Clone)]
pub struct RelayPlayer {
    /// Base identity and liveness.
    pub player: Player,
    /// Host-side port assigned to this player, once the host reports one.
    pub host_port: Option<u16>,
}

impl RelayPlayer {
    /// Create an unpaired relay player.
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            player: Player::new(name, addr),
            host_port: None,
        }
    }

    /// Whether the host has confirmed a path to this player.
    pub fn is_confirmed(&self) -> bool {
        self.host_port.is_some()
    }
}
