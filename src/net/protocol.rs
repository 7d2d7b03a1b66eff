//! Wire Protocol
//!
//! Everything that touches the datagram text format lives here: message
//! prefixes, the stable error-code strings clients parse, the field
//! grammars, and the parsers/builders handlers use.
//!
//! The format is UTF-8 text, `<prefix>:<field>:<field>...`, colon-separated
//! throughout except the start/roster payloads, which join per-player
//! entries with `;` because the entries themselves contain colons.

use std::net::SocketAddr;

use crate::model::session::{MAX_SESSION_PLAYERS, MIN_SESSION_PLAYERS};
use crate::model::RelayPlayer;

/// Server info/roster reply prefix.
pub const INFO: &str = "i";
/// Mesh session creation.
pub const MESH_HOST: &str = "h";
/// Mesh join.
pub const MESH_CONNECT: &str = "c";
/// Mesh keep-alive.
pub const MESH_PING: &str = "p";
/// Start request, and the server's address-exchange broadcast.
pub const START: &str = "s";
/// Client confirmation that the address broadcast arrived.
pub const CONFIRM: &str = "y";
/// Host kicks a player (mesh).
pub const MESH_KICK: &str = "k";
/// Player leaves voluntarily (mesh).
pub const MESH_EXIT: &str = "x";
/// Relay session creation.
pub const RELAY_HOST: &str = "rh";
/// Relay join, and the server's pairing reply.
pub const RELAY_CONNECT: &str = "rc";
/// Relay host heartbeat.
pub const RELAY_PING: &str = "rp";
/// Host kicks a player (relay).
pub const RELAY_KICK: &str = "rk";
/// Host closes the whole relay session.
pub const RELAY_CLOSE: &str = "rx";
/// Host reports a newly opened port; also the server's new-joiner notice.
pub const HOST_NEW_PORT: &str = "nc";
/// Host-directed acknowledgements.
pub const OK: &str = "ok";

/// Placeholder sent in a pairing reply while the host has not yet opened a
/// port for the player.
pub const WAIT: &str = "wait";

/// Stable error-code strings. Clients parse these, so they must not change
/// within a deployment.
pub mod err {
    /// Malformed datagram or wrong field count.
    pub const REQUEST: &str = "e:request";
    /// Player name fails the grammar.
    pub const PLAYER_NAME: &str = "e:player-name";
    /// Max-players field out of range.
    pub const MAX_PLAYERS: &str = "e:max-players";
    /// Session code fails the grammar.
    pub const SESSION_CODE: &str = "e:session-code";
    /// Password fails the grammar.
    pub const PASSWORD: &str = "e:password";
    /// No session with that code.
    pub const NO_SESSION: &str = "e:no-session";
    /// No such player in the session.
    pub const NO_PLAYER: &str = "e:no-player";
    /// Sender is not the session host.
    pub const NOT_HOST: &str = "e:not-host";
    /// Session is at max players.
    pub const FULL: &str = "e:full";
    /// Wrong session password.
    pub const PASSWORD_MISMATCH: &str = "e:password-mismatch";
    /// Name already taken by a player at another address.
    pub const NAME_TAKEN: &str = "e:name-taken";
    /// Sender address does not match the named player's.
    pub const ADDRESS_MISMATCH: &str = "e:address-mismatch";
    /// Cannot start a session with one player.
    pub const SINGLE_PLAYER: &str = "e:single-player";
    /// Confirm received before the session started.
    pub const NOT_STARTED: &str = "e:not-started";
    /// Wrong relay secret.
    pub const SECRET_MISMATCH: &str = "e:secret-mismatch";
    /// Host reported a port for a player that already has a different one.
    pub const PORT_MISMATCH: &str = "e:port-mismatch";
    /// Session expired.
    pub const SESSION_TIMEOUT: &str = "e:session-timeout";
    /// Player (or relay host) went silent.
    pub const PLAYER_TIMEOUT: &str = "e:player-timeout";
    /// Removed by the host.
    pub const KICKED: &str = "e:kicked";
    /// Acknowledgement of a voluntary exit.
    pub const EXIT: &str = "e:exit";
    /// Acknowledgement that the relay session was closed.
    pub const CLOSED: &str = "e:closed";
}

/// A field-grammar or shape violation. Carries the error code the sender
/// gets back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Wrong number of `:`-separated fields.
    #[error("wrong field count")]
    FieldCount,
    /// Player name outside `[A-Za-z0-9]{1,12}`.
    #[error("invalid player name")]
    PlayerName,
    /// Session code outside `[A-Z0-9]{1,10}`.
    #[error("invalid session code")]
    SessionCode,
    /// Max players outside `2..=12`.
    #[error("invalid max players")]
    MaxPlayers,
    /// Password outside `[A-Za-z0-9]{1,12}`.
    #[error("invalid password")]
    Password,
}

impl ParseError {
    /// The wire code to reply with for this violation.
    pub fn reply_code(self) -> &'static str {
        match self {
            ParseError::FieldCount => err::REQUEST,
            ParseError::PlayerName => err::PLAYER_NAME,
            ParseError::SessionCode => err::SESSION_CODE,
            ParseError::MaxPlayers => err::MAX_PLAYERS,
            ParseError::Password => err::PASSWORD,
        }
    }
}

/// `<name>:<max-players>[:<password>]`: payload of `h` and `rh`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRequest {
    /// Requested host player name.
    pub player_name: String,
    /// Requested room size.
    pub max_players: u8,
    /// Join password, if any.
    pub password: Option<String>,
}

/// `<code>:<name>[:<password>]`: payload of `c`, `rc` and (with the secret
/// in the password slot) `nc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Target session code.
    pub code: String,
    /// Joining player name.
    pub player_name: String,
    /// Join password, or the relay secret for `nc`.
    pub password: Option<String>,
}

/// `<code>:<name>`: payload of the ping/start/confirm/kick/exit family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPlayerRequest {
    /// Target session code.
    pub code: String,
    /// Named player.
    pub player_name: String,
}

/// Parse a host request, validating field count first, then each field.
pub fn parse_host_request(payload: &str) -> Result<HostRequest, ParseError> {
    let fields: Vec<&str> = payload.split(':').collect();
    if fields.len() < 2 || fields.len() > 3 {
        return Err(ParseError::FieldCount);
    }
    if !is_valid_player_name(fields[0]) {
        return Err(ParseError::PlayerName);
    }
    let max_players = parse_max_players(fields[1]).ok_or(ParseError::MaxPlayers)?;
    let password = match fields.get(2) {
        Some(raw) if is_valid_password(raw) => Some((*raw).to_string()),
        Some(_) => return Err(ParseError::Password),
        None => None,
    };
    Ok(HostRequest {
        player_name: fields[0].to_string(),
        max_players,
        password,
    })
}

/// Parse a connect request, validating field count first, then each field.
pub fn parse_connect_request(payload: &str) -> Result<ConnectRequest, ParseError> {
    let fields: Vec<&str> = payload.split(':').collect();
    if fields.len() < 2 || fields.len() > 3 {
        return Err(ParseError::FieldCount);
    }
    if !is_valid_session_code(fields[0]) {
        return Err(ParseError::SessionCode);
    }
    if !is_valid_player_name(fields[1]) {
        return Err(ParseError::PlayerName);
    }
    let password = match fields.get(2) {
        Some(raw) if is_valid_password(raw) => Some((*raw).to_string()),
        Some(_) => return Err(ParseError::Password),
        None => None,
    };
    Ok(ConnectRequest {
        code: fields[0].to_string(),
        player_name: fields[1].to_string(),
        password,
    })
}

/// Parse a `<code>:<name>` request.
pub fn parse_session_player_request(payload: &str) -> Result<SessionPlayerRequest, ParseError> {
    let fields: Vec<&str> = payload.split(':').collect();
    if fields.len() != 2 {
        return Err(ParseError::FieldCount);
    }
    if !is_valid_session_code(fields[0]) {
        return Err(ParseError::SessionCode);
    }
    if !is_valid_player_name(fields[1]) {
        return Err(ParseError::PlayerName);
    }
    Ok(SessionPlayerRequest {
        code: fields[0].to_string(),
        player_name: fields[1].to_string(),
    })
}

/// `[A-Za-z0-9]{1,12}`
pub fn is_valid_player_name(name: &str) -> bool {
    (1..=12).contains(&name.len()) && name.chars().all(|c| c.is_ascii_alphanumeric())
}

/// `[A-Z0-9]{1,10}`
pub fn is_valid_session_code(code: &str) -> bool {
    (1..=10).contains(&code.len())
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// `[A-Za-z0-9]{1,12}`
pub fn is_valid_password(password: &str) -> bool {
    is_valid_player_name(password)
}

/// Decimal `2..=12`, no signs, no padding.
pub fn parse_max_players(raw: &str) -> Option<u8> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let value: u8 = raw.parse().ok()?;
    ((MIN_SESSION_PLAYERS..=MAX_SESSION_PLAYERS).contains(&value) && raw == value.to_string())
        .then_some(value)
}

/// `i:<name>:<name>...`: the session roster.
pub fn roster_message<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    let mut message = String::from(INFO);
    for name in names {
        message.push(':');
        message.push_str(name);
    }
    message
}

/// `i:<code>:<secret>`: relay session created (or refreshed).
pub fn relay_created_message(code: &str, secret: &str) -> String {
    format!("{INFO}:{code}:{secret}")
}

/// `s:<port>:<name:ip:port;...>`: the address-exchange payload for one
/// recipient: its own source port, then every other player's endpoint.
pub fn start_message<'a>(
    recipient_port: u16,
    peers: impl IntoIterator<Item = (&'a str, SocketAddr)>,
) -> String {
    let endpoints: Vec<String> = peers
        .into_iter()
        .map(|(name, addr)| format!("{}:{}:{}", name, addr.ip(), addr.port()))
        .collect();
    format!("{START}:{recipient_port}:{}", endpoints.join(";"))
}

/// `rc:<port>:<host-ip>:<host-port|wait>`: what a relay player needs to
/// reach its host, or `wait` while no port is assigned yet.
pub fn pairing_message(
    recipient_port: u16,
    host_addr: SocketAddr,
    host_port: Option<u16>,
) -> String {
    match host_port {
        Some(port) => format!("{RELAY_CONNECT}:{recipient_port}:{}:{port}", host_addr.ip()),
        None => format!("{RELAY_CONNECT}:{recipient_port}:{}:{WAIT}", host_addr.ip()),
    }
}

/// `nc:<name>:<ip>:<port>`: tells the relay host a player is waiting for a
/// port.
pub fn new_connection_message(name: &str, addr: SocketAddr) -> String {
    format!("{HOST_NEW_PORT}:{name}:{}:{}", addr.ip(), addr.port())
}

/// `ok:<name>`: acknowledges the host's port report for a player.
pub fn host_ack_message(name: &str) -> String {
    format!("{OK}:{name}")
}

/// `i:<entry>;<entry>...`: relay heartbeat reply. Confirmed players appear
/// as a bare name, players still waiting for a port as `name:ip:port`.
pub fn relay_status_message(players: &[RelayPlayer]) -> String {
    let entries: Vec<String> = players
        .iter()
        .map(|p| {
            if p.is_confirmed() {
                p.player.name.clone()
            } else {
                format!("{}:{}:{}", p.player.name, p.player.addr.ip(), p.player.addr.port())
            }
        })
        .collect();
    format!("{INFO}:{}", entries.join(";"))
}
