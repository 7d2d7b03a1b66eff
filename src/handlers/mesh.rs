//! Mesh Session Handlers
//!
//! The one-shot address-exchange flow: a host opens a session, players join
//! and keep-alive, the host starts, the server broadcasts every player's
//! endpoint to every other player until each one confirms, then the session
//! deletes itself.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::{debug, info};

use crate::handlers::{deliver, notify, reject, reply, HandleError, Handler, HandlerResult};
use crate::model::{MeshSession, Player};
use crate::net::protocol::{
    self, err, parse_connect_request, parse_host_request, parse_session_player_request,
};
use crate::net::send::Outgoing;
use crate::net::Outbound;
use crate::registry::SharedRegistry;

/// How many rounds the start broadcast resends addresses to unconfirmed
/// players.
pub const START_BROADCAST_ROUNDS: u32 = 8;

/// Delay between start-broadcast rounds.
pub const START_BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

fn roster_for(session: &MeshSession) -> String {
    protocol::roster_message(session.core.players().iter().map(|p| p.name.as_str()))
}

/// The roster message fanned out to every member, captured under the lock so
/// the sends can happen after it is released.
fn roster_fanout(session: &MeshSession) -> Vec<Outgoing> {
    let message = roster_for(session);
    session
        .core
        .players()
        .iter()
        .map(|p| reply(p.addr, message.clone()))
        .collect()
}

/// The address-exchange payload for one recipient: its own source port plus
/// every other player's endpoint.
fn start_payload_for(session: &MeshSession, recipient_name: &str, recipient_port: u16) -> String {
    protocol::start_message(
        recipient_port,
        session
            .core
            .players()
            .iter()
            .filter(|p| p.name != recipient_name)
            .map(|p| (p.name.as_str(), p.addr)),
    )
}

/// `h`: create a mesh session, or refresh one this address already hosts.
pub struct HostHandler {
    registry: SharedRegistry<MeshSession>,
    outbound: Outbound,
}

impl HostHandler {
    /// Wire the handler to its registry and sender.
    pub fn new(registry: SharedRegistry<MeshSession>, outbound: Outbound) -> Self {
        Self { registry, outbound }
    }
}

impl Handler for HostHandler {
    fn prefix(&self) -> &'static str {
        protocol::MESH_HOST
    }

    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let request = match parse_host_request(payload) {
                Ok(request) => request,
                Err(e) => return Err(reject(&self.outbound, from, e).await),
            };
            debug!(player = %request.player_name, max_players = request.max_players, %from, "host request");

            let roster = {
                let mut registry = self.registry.write().await;

                if registry.get_by_address(from).is_ok() {
                    // This address already hosts a session: refresh it, but
                    // only under the name that created it.
                    let session = match registry.get_by_address_mut(from) {
                        Ok(session) => session,
                        Err(_) => {
                            return Err(HandleError::Internal(format!(
                                "address {from} owns a session the code index cannot find"
                            )))
                        }
                    };

                    let host_name = session.core.host().map(|h| h.name.clone());
                    if host_name.as_deref() != Some(request.player_name.as_str()) {
                        debug!(%from, "host refresh under a name that is not the host's");
                        self.outbound.send(from, err::NOT_HOST).await;
                        return Err(HandleError::invalid("refresh from non-host name"));
                    }

                    if let Ok(host) = session.core.player_mut(&request.player_name) {
                        host.touch();
                    }
                    debug!(code = %session.core.code, "resending roster for existing session");
                    roster_for(session)
                } else {
                    match registry.create(
                        &request.player_name,
                        from,
                        request.max_players,
                        request.password.clone(),
                    ) {
                        Ok(session) => {
                            info!(code = %session.core.code, max_players = request.max_players, "created session");
                            roster_for(session)
                        }
                        Err(e) => {
                            return Err(HandleError::Internal(format!("create failed: {e}")))
                        }
                    }
                }
            };

            self.outbound.send(from, roster).await;
            Ok(())
        })
    }
}

/// `c`: join a mesh session.
pub struct ConnectHandler {
    registry: SharedRegistry<MeshSession>,
    outbound: Outbound,
}

impl ConnectHandler {
    /// Wire the handler to its registry and sender.
    pub fn new(registry: SharedRegistry<MeshSession>, outbound: Outbound) -> Self {
        Self { registry, outbound }
    }

    async fn fail(
        &self,
        from: SocketAddr,
        code: &'static str,
        reason: &'static str,
    ) -> HandlerResult {
        self.outbound.send(from, code).await;
        Err(HandleError::invalid(reason))
    }
}

impl Handler for ConnectHandler {
    fn prefix(&self) -> &'static str {
        protocol::MESH_CONNECT
    }

    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let request = match parse_connect_request(payload) {
                Ok(request) => request,
                Err(e) => return Err(reject(&self.outbound, from, e).await),
            };
            debug!(player = %request.player_name, code = %request.code, %from, "connect request");

            let (replies, result) = {
                let mut registry = self.registry.write().await;
                let session = match registry.get_mut(&request.code) {
                    Ok(session) => session,
                    Err(_) => {
                        debug!(code = %request.code, "connect to unknown session");
                        return self.fail(from, err::NO_SESSION, "no such session").await;
                    }
                };

                if !session.core.password_matches(request.password.as_deref()) {
                    debug!(code = %request.code, "session password does not match");
                    return self
                        .fail(from, err::PASSWORD_MISMATCH, "password mismatch")
                        .await;
                }

                match session.core.player(&request.player_name).map(|p| p.addr) {
                    Ok(stored_addr) => {
                        if stored_addr != from {
                            debug!(player = %request.player_name, "name in use from another address");
                            return self.fail(from, err::NAME_TAKEN, "name in use").await;
                        }
                        // Same player retrying its join: refresh and resend.
                        if let Ok(player) = session.core.player_mut(&request.player_name) {
                            player.touch();
                        }
                        (
                            vec![reply(from, roster_for(session))],
                            Err(HandleError::Ignored),
                        )
                    }
                    Err(_) => {
                        if session.has_started() {
                            // Started sessions admit nobody; to a joiner the
                            // room is simply closed.
                            debug!(code = %request.code, "connect to a started session");
                            return self.fail(from, err::FULL, "session started").await;
                        }
                        if session.core.is_full() {
                            debug!(code = %request.code, "session is full");
                            return self.fail(from, err::FULL, "session full").await;
                        }
                        session
                            .core
                            .add_player(Player::new(&request.player_name, from))
                            .map_err(|e| HandleError::Internal(format!("admission failed: {e}")))?;
                        info!(player = %request.player_name, code = %request.code, "player connected");
                        (roster_fanout(session), Ok(()))
                    }
                }
            };

            deliver(&self.outbound, replies).await;
            result
        })
    }
}

/// `p`: keep-alive; resends the roster, or the address payload once the
/// session has started (lost-start recovery).
pub struct PingHandler {
    registry: SharedRegistry<MeshSession>,
    outbound: Outbound,
}

impl PingHandler {
    /// Wire the handler to its registry and sender.
    pub fn new(registry: SharedRegistry<MeshSession>, outbound: Outbound) -> Self {
        Self { registry, outbound }
    }
}

impl Handler for PingHandler {
    fn prefix(&self) -> &'static str {
        protocol::MESH_PING
    }

    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let request = match parse_session_player_request(payload) {
                Ok(request) => request,
                Err(e) => return Err(reject(&self.outbound, from, e).await),
            };

            let reply_text = {
                let mut registry = self.registry.write().await;
                let session = match registry.get_mut(&request.code) {
                    Ok(session) => session,
                    Err(_) => {
                        self.outbound.send(from, err::NO_SESSION).await;
                        return Err(HandleError::invalid("no such session"));
                    }
                };

                let stored_addr = match session.core.player(&request.player_name).map(|p| p.addr) {
                    Ok(addr) => addr,
                    Err(_) => {
                        self.outbound.send(from, err::NO_PLAYER).await;
                        return Err(HandleError::invalid("no such player"));
                    }
                };

                if stored_addr != from {
                    debug!(player = %request.player_name, %from, "ping from a different address");
                    self.outbound.send(from, err::ADDRESS_MISMATCH).await;
                    return Err(HandleError::invalid("ping address mismatch"));
                }

                if let Ok(player) = session.core.player_mut(&request.player_name) {
                    player.touch();
                }

                if session.has_started() {
                    start_payload_for(session, &request.player_name, stored_addr.port())
                } else {
                    roster_for(session)
                }
            };

            self.outbound.send(from, reply_text).await;
            Ok(())
        })
    }
}

/// `s`: host starts the address exchange.
pub struct StartHandler {
    registry: SharedRegistry<MeshSession>,
    outbound: Outbound,
}

impl StartHandler {
    /// Wire the handler to its registry and sender.
    pub fn new(registry: SharedRegistry<MeshSession>, outbound: Outbound) -> Self {
        Self { registry, outbound }
    }
}

impl Handler for StartHandler {
    fn prefix(&self) -> &'static str {
        protocol::START
    }

    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let request = match parse_session_player_request(payload) {
                Ok(request) => request,
                Err(e) => return Err(reject(&self.outbound, from, e).await),
            };
            debug!(code = %request.code, %from, "start request");

            {
                let mut registry = self.registry.write().await;
                let session = match registry.get_mut(&request.code) {
                    Ok(session) => session,
                    Err(_) => {
                        self.outbound.send(from, err::NO_SESSION).await;
                        return Err(HandleError::invalid("no such session"));
                    }
                };

                if !session.core.is_host_addr(from) {
                    self.outbound.send(from, err::NOT_HOST).await;
                    return Err(HandleError::invalid("start from non-host"));
                }

                if session.has_started() {
                    debug!(code = %request.code, "session already started");
                    return Err(HandleError::Ignored);
                }

                if session.core.players().len() == 1 {
                    self.outbound.send(from, err::SINGLE_PLAYER).await;
                    return Err(HandleError::invalid("cannot start with one player"));
                }

                session.start();
                info!(code = %request.code, players = session.core.players().len(), "session started");
            }

            tokio::spawn(run_start_broadcast(
                self.registry.clone(),
                self.outbound.clone(),
                request.code,
            ));
            Ok(())
        })
    }
}

/// Resend the address payload to every unconfirmed player until all confirm
/// or the retry budget runs out, then delete the session.
///
/// The session is re-fetched by code every round: confirms shrink the player
/// set between rounds, and a sweep may delete the session out from under us,
/// in which case the broadcast stops quietly.
pub async fn run_start_broadcast(
    registry: SharedRegistry<MeshSession>,
    outbound: Outbound,
    code: String,
) {
    for _ in 0..START_BROADCAST_ROUNDS {
        let round: Vec<Outgoing> = {
            let registry = registry.read().await;
            match registry.get(&code) {
                // Someone else already tore the session down.
                Err(_) => return,
                Ok(session) => session
                    .core
                    .players()
                    .iter()
                    .map(|p| {
                        reply(
                            p.addr,
                            start_payload_for(session, &p.name, p.addr.port()),
                        )
                    })
                    .collect(),
            }
        };

        if round.is_empty() {
            // Every player confirmed.
            break;
        }

        deliver(&outbound, round).await;
        tokio::time::sleep(START_BROADCAST_INTERVAL).await;
    }

    let mut registry = registry.write().await;
    if registry.get(&code).is_ok() {
        registry.delete(&code);
        info!(%code, "address exchange finished, session closed");
    }
}

/// `y`: a player confirms it received the address payload.
pub struct ConfirmHandler {
    registry: SharedRegistry<MeshSession>,
    outbound: Outbound,
}

impl ConfirmHandler {
    /// Wire the handler to its registry and sender.
    pub fn new(registry: SharedRegistry<MeshSession>, outbound: Outbound) -> Self {
        Self { registry, outbound }
    }
}

impl Handler for ConfirmHandler {
    fn prefix(&self) -> &'static str {
        protocol::CONFIRM
    }

    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let request = match parse_session_player_request(payload) {
                Ok(request) => request,
                Err(e) => return Err(reject(&self.outbound, from, e).await),
            };

            {
                let mut registry = self.registry.write().await;
                let session = match registry.get_mut(&request.code) {
                    Ok(session) => session,
                    Err(_) => {
                        self.outbound.send(from, err::NO_SESSION).await;
                        return Err(HandleError::invalid("no such session"));
                    }
                };

                if !session.has_started() {
                    self.outbound.send(from, err::NOT_STARTED).await;
                    return Err(HandleError::invalid("confirm before start"));
                }

                if session.core.remove_player(&request.player_name).is_none() {
                    self.outbound.send(from, err::NO_PLAYER).await;
                    return Err(HandleError::invalid("no such player"));
                }
                info!(player = %request.player_name, code = %request.code, "player confirmed address reception");
            }
            Ok(())
        })
    }
}

/// `k`: host removes a player before start.
pub struct KickHandler {
    registry: SharedRegistry<MeshSession>,
    outbound: Outbound,
}

impl KickHandler {
    /// Wire the handler to its registry and sender.
    pub fn new(registry: SharedRegistry<MeshSession>, outbound: Outbound) -> Self {
        Self { registry, outbound }
    }
}

impl Handler for KickHandler {
    fn prefix(&self) -> &'static str {
        protocol::MESH_KICK
    }

    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let request = match parse_session_player_request(payload) {
                Ok(request) => request,
                Err(e) => return Err(reject(&self.outbound, from, e).await),
            };
            debug!(player = %request.player_name, code = %request.code, %from, "kick request");

            let replies = {
                let mut registry = self.registry.write().await;
                let session = match registry.get_mut(&request.code) {
                    Ok(session) => session,
                    Err(_) => {
                        self.outbound.send(from, err::NO_SESSION).await;
                        return Err(HandleError::invalid("no such session"));
                    }
                };

                if !session.core.is_host_addr(from) {
                    self.outbound.send(from, err::NOT_HOST).await;
                    return Err(HandleError::invalid("kick from non-host"));
                }

                if session.has_started() {
                    debug!(code = %request.code, "kick after start");
                    return Err(HandleError::invalid("kick after start"));
                }

                let was_host = session
                    .core
                    .host()
                    .is_some_and(|h| h.name == request.player_name);
                let kicked = match session.core.remove_player(&request.player_name) {
                    Some(kicked) => kicked,
                    None => {
                        self.outbound.send(from, err::NO_PLAYER).await;
                        return Err(HandleError::invalid("no such player"));
                    }
                };
                info!(player = %kicked.name, code = %request.code, "player kicked by host");

                let emptied = session.core.is_empty();
                let new_host_addr = session.core.host().map(|h| h.addr);
                let fanout = if emptied {
                    Vec::new()
                } else {
                    roster_fanout(session)
                };

                let mut replies = vec![notify(kicked.addr, err::KICKED)];
                if emptied {
                    registry.delete(&request.code);
                    info!(code = %request.code, "session emptied by kick, deleted");
                } else {
                    if was_host {
                        if let Some(new_addr) = new_host_addr {
                            let _ = registry.update_address_for(&request.code, new_addr);
                        }
                    }
                    replies.extend(fanout);
                }
                replies
            };

            deliver(&self.outbound, replies).await;
            Ok(())
        })
    }
}

/// `x`: a player leaves voluntarily before start.
pub struct ExitHandler {
    registry: SharedRegistry<MeshSession>,
    outbound: Outbound,
}

impl ExitHandler {
    /// Wire the handler to its registry and sender.
    pub fn new(registry: SharedRegistry<MeshSession>, outbound: Outbound) -> Self {
        Self { registry, outbound }
    }
}

impl Handler for ExitHandler {
    fn prefix(&self) -> &'static str {
        protocol::MESH_EXIT
    }

    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let request = match parse_session_player_request(payload) {
                Ok(request) => request,
                Err(e) => return Err(reject(&self.outbound, from, e).await),
            };
            debug!(player = %request.player_name, code = %request.code, %from, "exit request");

            let replies = {
                let mut registry = self.registry.write().await;
                let session = match registry.get_mut(&request.code) {
                    Ok(session) => session,
                    Err(_) => {
                        self.outbound.send(from, err::NO_SESSION).await;
                        return Err(HandleError::invalid("no such session"));
                    }
                };

                if session.has_started() {
                    debug!(code = %request.code, "exit after start");
                    return Err(HandleError::invalid("exit after start"));
                }

                let stored_addr = match session.core.player(&request.player_name).map(|p| p.addr) {
                    Ok(addr) => addr,
                    Err(_) => {
                        self.outbound.send(from, err::NO_PLAYER).await;
                        return Err(HandleError::invalid("no such player"));
                    }
                };

                if stored_addr != from {
                    self.outbound.send(from, err::ADDRESS_MISMATCH).await;
                    return Err(HandleError::invalid("exit address mismatch"));
                }

                let was_host = session.core.is_host_addr(from);
                session.core.remove_player(&request.player_name);
                info!(player = %request.player_name, code = %request.code, "player left session");

                let emptied = session.core.is_empty();
                let new_host_addr = session.core.host().map(|h| h.addr);
                let fanout = if emptied {
                    Vec::new()
                } else {
                    roster_fanout(session)
                };

                let mut replies = vec![reply(from, err::EXIT)];
                if emptied {
                    registry.delete(&request.code);
                    info!(code = %request.code, "session emptied by exit, deleted");
                } else {
                    if was_host {
                        if let Some(new_addr) = new_host_addr {
                            let _ = registry.update_address_for(&request.code, new_addr);
                        }
                    }
                    replies.extend(fanout);
                }
                replies
            };

            deliver(&self.outbound, replies).await;
            Ok(())
        })
    }
}
