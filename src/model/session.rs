//! Session Entities
//!
//! A session is a server-side room grouping players under one short code.
//! Two variants exist: [`MeshSession`] hands every player the full peer
//! roster and then disappears; [`RelaySession`] pairs each joining player to
//! a port its host opens, and lives until the host closes it or goes silent.
//!
//! Both variants compose the same [`SessionCore`], which owns the player set
//! and the invariants around it: names are unique, the player count never
//! exceeds `max_players`, and the host is always the first player in
//! insertion order (removing the host promotes the next one).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::model::player::{Player, RelayPlayer, RELAY_HOST_TIMEOUT};

/// Smallest session a client may request.
pub const MIN_SESSION_PLAYERS: u8 = 2;

/// Largest session a client may request.
pub const MAX_SESSION_PLAYERS: u8 = 12;

/// Idle mesh sessions are dropped this long after creation.
pub const MESH_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Started mesh sessions are dropped this long after start. Measured from
/// start, not creation: a session that started late still gets its full
/// confirmation window.
pub const MESH_STARTED_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Absolute age cap for relay sessions, regardless of host liveness.
pub const RELAY_SESSION_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Length of the secret handed to a relay host at creation.
const RELAY_SECRET_LENGTH: usize = 12;

/// Session mutation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session already holds `max_players` players.
    #[error("session is full")]
    Full,

    /// Another player in the session already uses this name.
    #[error("player name already in use")]
    NameTaken,

    /// No player with the given name is in the session.
    #[error("no such player")]
    NoSuchPlayer,
}

/// Common shape of the two player variants, so [`SessionCore`] can manage
/// either.
pub trait SessionPlayer {
    /// Name, unique within the session.
    fn name(&self) -> &str;
    /// Where this player's datagrams come from and replies go.
    fn addr(&self) -> SocketAddr;
    /// Record activity.
    fn touch(&mut self);
}

impl SessionPlayer for Player {
    fn name(&self) -> &str {
        &self.name
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn touch(&mut self) {
        Player::touch(self);
    }
}

impl SessionPlayer for RelayPlayer {
    fn name(&self) -> &str {
        &self.player.name
    }

    fn addr(&self) -> SocketAddr {
        self.player.addr
    }

    fn touch(&mut self) {
        self.player.touch();
    }
}

/// State shared by both session variants.
#[derive(Debug)]
pub struct SessionCore<P> {
    /// The allocator-assigned session code.
    pub code: String,
    /// Requested room size, `2..=12`.
    pub max_players: u8,
    /// Plaintext join password, if the host set one.
    pub password: Option<String>,
    /// When the session was created.
    pub created_at: Instant,
    players: Vec<P>,
}

impl<P: SessionPlayer> SessionCore<P> {
    fn new(code: String, host: P, max_players: u8, password: Option<String>) -> Self {
        Self {
            code,
            max_players,
            password,
            created_at: Instant::now(),
            players: vec![host],
        }
    }

    /// All players, host first, in join order.
    pub fn players(&self) -> &[P] {
        &self.players
    }

    /// The current host. `None` only transiently, while teardown of an
    /// emptied session is in flight.
    pub fn host(&self) -> Option<&P> {
        self.players.first()
    }

    /// Whether the datagram source address is the host's.
    pub fn is_host_addr(&self, addr: SocketAddr) -> bool {
        self.host().is_some_and(|host| host.addr() == addr)
    }

    /// Look up a player by name.
    pub fn player(&self, name: &str) -> Result<&P, SessionError> {
        self.players
            .iter()
            .find(|p| p.name() == name)
            .ok_or(SessionError::NoSuchPlayer)
    }

    /// Look up a player by name, mutably.
    pub fn player_mut(&mut self, name: &str) -> Result<&mut P, SessionError> {
        self.players
            .iter_mut()
            .find(|p| p.name() == name)
            .ok_or(SessionError::NoSuchPlayer)
    }

    /// Whether a player with this name is in the session.
    pub fn has_player(&self, name: &str) -> bool {
        self.players.iter().any(|p| p.name() == name)
    }

    /// Whether the session holds `max_players` players.
    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players as usize
    }

    /// Whether any players remain.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Admit a player.
    pub fn add_player(&mut self, player: P) -> Result<(), SessionError> {
        if self.is_full() {
            return Err(SessionError::Full);
        }
        if self.has_player(player.name()) {
            return Err(SessionError::NameTaken);
        }
        self.players.push(player);
        Ok(())
    }

    /// Remove a player by name and return it. Removing the host promotes the
    /// next player in join order.
    pub fn remove_player(&mut self, name: &str) -> Option<P> {
        let index = self.players.iter().position(|p| p.name() == name)?;
        Some(self.players.remove(index))
    }

    /// Whether the given password satisfies the session's. A passwordless
    /// session accepts anything; a password-protected one requires an exact
    /// match.
    pub fn password_matches(&self, input: Option<&str>) -> bool {
        match &self.password {
            None => true,
            Some(expected) => input == Some(expected.as_str()),
        }
    }
}

/// A one-shot address-exchange session.
///
/// Lives until every player has confirmed receipt of the peer addresses (or
/// the start-broadcast retry budget runs out), then self-deletes via the
/// start handler. Unstarted sessions are reaped by the cleanup sweep.
#[derive(Debug)]
pub struct MeshSession {
    /// Player set and shared invariants.
    pub core: SessionCore<Player>,
    started_at: Option<Instant>,
}

impl MeshSession {
    /// Open a mesh session with its host as the only player.
    pub fn open(
        code: String,
        host_name: &str,
        host_addr: SocketAddr,
        max_players: u8,
        password: Option<String>,
    ) -> Self {
        Self {
            core: SessionCore::new(
                code,
                Player::new(host_name, host_addr),
                max_players,
                password,
            ),
            started_at: None,
        }
    }

    /// Mark the session started. Started sessions accept no new players.
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Whether the host has started the address exchange.
    pub fn has_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Whether the cleanup sweep should drop this session.
    pub fn is_timed_out(&self) -> bool {
        match self.started_at {
            Some(started_at) => started_at.elapsed() > MESH_STARTED_TIMEOUT,
            None => self.core.created_at.elapsed() > MESH_SESSION_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_created(&mut self, by: Duration) {
        self.core.created_at = Instant::now() - by;
    }

    #[cfg(test)]
    pub(crate) fn backdate_started(&mut self, by: Duration) {
        self.started_at = Some(Instant::now() - by);
    }
}

/// A host-relay session.
///
/// The server's job here is pairing: each joining player waits until the
/// host reports a freshly opened port for it. The `secret` proves that
/// host-originated control messages really come from the host, since they
/// may arrive from ports other than the one the session was created from.
#[derive(Debug)]
pub struct RelaySession {
    /// Player set and shared invariants.
    pub core: SessionCore<RelayPlayer>,
    secret: String,
}

impl RelaySession {
    /// Open a relay session, generating its host secret.
    pub fn open(
        code: String,
        host_name: &str,
        host_addr: SocketAddr,
        max_players: u8,
        password: Option<String>,
    ) -> Self {
        Self {
            core: SessionCore::new(
                code,
                RelayPlayer::new(host_name, host_addr),
                max_players,
                password,
            ),
            secret: generate_secret(),
        }
    }

    /// The token the host must present on control messages.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Constant shape, exact match. `None` never matches.
    pub fn secret_matches(&self, input: Option<&str>) -> bool {
        input == Some(self.secret.as_str())
    }

    /// Whether the host has gone silent past the heartbeat window.
    pub fn host_is_timed_out(&self) -> bool {
        self.core
            .host()
            .is_some_and(|host| host.player.idle() > RELAY_HOST_TIMEOUT)
    }

    /// Whether the absolute session age cap has passed.
    pub fn is_timed_out(&self) -> bool {
        self.core.created_at.elapsed() > RELAY_SESSION_MAX_AGE
    }

    #[cfg(test)]
    pub(crate) fn backdate_created(&mut self, by: Duration) {
        self.core.created_at = Instant::now() - by;
    }
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(RELAY_SECRET_LENGTH)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn mesh() -> MeshSession {
        MeshSession::open("SESSA".into(), "ALICE", addr(4000), 4, None)
    }

    #[test]
    fn test_host_is_first_player() {
        let session = mesh();
        assert_eq!(session.core.host().unwrap().name, "ALICE");
        assert!(session.core.is_host_addr(addr(4000)));
        assert!(!session.core.is_host_addr(addr(4001)));
    }

    #[test]
    fn test_add_player_respects_capacity_and_names() {
        let mut session = MeshSession::open("SESSA".into(), "ALICE", addr(4000), 2, None);
        session
            .core
            .add_player(Player::new("BOB", addr(4001)))
            .unwrap();

        let full = session.core.add_player(Player::new("CAROL", addr(4002)));
        assert_eq!(full, Err(SessionError::Full));

        let mut roomy = mesh();
        roomy
            .core
            .add_player(Player::new("BOB", addr(4001)))
            .unwrap();
        let taken = roomy.core.add_player(Player::new("BOB", addr(4003)));
        assert_eq!(taken, Err(SessionError::NameTaken));
        assert_eq!(roomy.core.players().len(), 2);
    }

    #[test]
    fn test_removing_host_promotes_next_player() {
        let mut session = mesh();
        session
            .core
            .add_player(Player::new("BOB", addr(4001)))
            .unwrap();

        let removed = session.core.remove_player("ALICE").unwrap();
        assert_eq!(removed.name, "ALICE");
        assert_eq!(session.core.host().unwrap().name, "BOB");

        session.core.remove_player("BOB");
        assert!(session.core.is_empty());
        assert!(session.core.host().is_none());
    }

    #[test]
    fn test_password_matching() {
        let open = mesh();
        assert!(open.core.password_matches(None));
        assert!(open.core.password_matches(Some("anything")));

        let locked = MeshSession::open("SESSB".into(), "ALICE", addr(4000), 4, Some("pw1".into()));
        assert!(locked.core.password_matches(Some("pw1")));
        assert!(!locked.core.password_matches(Some("pw2")));
        assert!(!locked.core.password_matches(None));
    }

    #[test]
    fn test_mesh_timeout_measured_from_start_once_started() {
        let mut session = mesh();
        assert!(!session.is_timed_out());

        session.backdate_created(MESH_SESSION_TIMEOUT + Duration::from_secs(1));
        assert!(session.is_timed_out());

        // Starting resets the clock to the started-timeout window.
        session.start();
        assert!(!session.is_timed_out());

        session.backdate_started(MESH_STARTED_TIMEOUT + Duration::from_secs(1));
        assert!(session.is_timed_out());
    }

    #[test]
    fn test_relay_secret_shape_and_matching() {
        let session = RelaySession::open("SESSA".into(), "ALICE", addr(4000), 4, None);
        assert_eq!(session.secret().len(), 12);
        assert!(session
            .secret()
            .chars()
            .all(|c| c.is_ascii_alphanumeric()));

        assert!(session.secret_matches(Some(session.secret())));
        assert!(!session.secret_matches(Some("nope")));
        assert!(!session.secret_matches(None));
    }

    #[test]
    fn test_relay_host_idle_detection() {
        let mut session = RelaySession::open("SESSA".into(), "ALICE", addr(4000), 4, None);
        assert!(!session.host_is_timed_out());

        session
            .core
            .player_mut("ALICE")
            .unwrap()
            .player
            .backdate(RELAY_HOST_TIMEOUT + Duration::from_secs(1));
        assert!(session.host_is_timed_out());
    }
}
