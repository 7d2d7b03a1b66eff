//! Relay Session Handlers
//!
//! The host-relay flow: a host opens a session and receives a code plus a
//! secret, players join and are told to wait, the server notifies the host,
//! the host opens a local port per player and reports it (`nc`) from that
//! port, and the server completes the pairing by telling the player where to
//! reach its host. Only the host heartbeats the server afterwards.

use std::net::SocketAddr;

use futures_util::future::BoxFuture;
use tracing::{debug, error, info};

use crate::handlers::{deliver, reject, reply, HandleError, Handler, HandlerResult};
use crate::model::{RelayPlayer, RelaySession};
use crate::net::protocol::{
    self, err, parse_connect_request, parse_host_request, parse_session_player_request,
};
use crate::net::Outbound;
use crate::registry::SharedRegistry;

fn host_addr_of(session: &RelaySession) -> Result<SocketAddr, HandleError> {
    session
        .core
        .host()
        .map(|h| h.player.addr)
        .ok_or_else(|| HandleError::Internal("relay session has no host".into()))
}

/// `rh`: create a relay session, or refresh one this address already hosts.
/// Success hands the host the session code and its control secret.
pub struct HostHandler {
    registry: SharedRegistry<RelaySession>,
    outbound: Outbound,
}

impl HostHandler {
    /// Wire the handler to its registry and sender.
    pub fn new(registry: SharedRegistry<RelaySession>, outbound: Outbound) -> Self {
        Self { registry, outbound }
    }
}

impl Handler for HostHandler {
    fn prefix(&self) -> &'static str {
        protocol::RELAY_HOST
    }

    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let request = match parse_host_request(payload) {
                Ok(request) => request,
                Err(e) => return Err(reject(&self.outbound, from, e).await),
            };
            debug!(player = %request.player_name, max_players = request.max_players, %from, "relay host request");

            let created = {
                let mut registry = self.registry.write().await;

                if registry.get_by_address(from).is_ok() {
                    let session = match registry.get_by_address_mut(from) {
                        Ok(session) => session,
                        Err(_) => {
                            return Err(HandleError::Internal(format!(
                                "address {from} owns a session the code index cannot find"
                            )))
                        }
                    };

                    let host_name = session.core.host().map(|h| h.player.name.clone());
                    if host_name.as_deref() != Some(request.player_name.as_str()) {
                        debug!(%from, "relay host refresh under a name that is not the host's");
                        self.outbound.send(from, err::NOT_HOST).await;
                        return Err(HandleError::invalid("refresh from non-host name"));
                    }

                    if let Ok(host) = session.core.player_mut(&request.player_name) {
                        host.player.touch();
                    }
                    debug!(code = %session.core.code, "resending code and secret for existing relay session");
                    protocol::relay_created_message(&session.core.code, session.secret())
                } else {
                    match registry.create(
                        &request.player_name,
                        from,
                        request.max_players,
                        request.password.clone(),
                    ) {
                        Ok(session) => {
                            info!(code = %session.core.code, max_players = request.max_players, "created relay session");
                            protocol::relay_created_message(&session.core.code, session.secret())
                        }
                        Err(e) => {
                            return Err(HandleError::Internal(format!("create failed: {e}")))
                        }
                    }
                }
            };

            self.outbound.send(from, created).await;
            Ok(())
        })
    }
}

/// `rc`: join a relay session. The joiner is told to wait (or given the
/// host endpoint if already paired) and the host is told a player needs a
/// port.
pub struct ConnectHandler {
    registry: SharedRegistry<RelaySession>,
    outbound: Outbound,
}

impl ConnectHandler {
    /// Wire the handler to its registry and sender.
    pub fn new(registry: SharedRegistry<RelaySession>, outbound: Outbound) -> Self {
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
        protocol::RELAY_CONNECT
    }

    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let request = match parse_connect_request(payload) {
                Ok(request) => request,
                Err(e) => return Err(reject(&self.outbound, from, e).await),
            };
            debug!(player = %request.player_name, code = %request.code, %from, "relay connect request");

            let (replies, result) = {
                let mut registry = self.registry.write().await;
                let session = match registry.get_mut(&request.code) {
                    Ok(session) => session,
                    Err(_) => {
                        debug!(code = %request.code, "relay connect to unknown session");
                        return self.fail(from, err::NO_SESSION, "no such session").await;
                    }
                };

                if !session.core.password_matches(request.password.as_deref()) {
                    debug!(code = %request.code, "session password does not match");
                    return self
                        .fail(from, err::PASSWORD_MISMATCH, "password mismatch")
                        .await;
                }

                let host_addr = host_addr_of(session)?;

                match session
                    .core
                    .player(&request.player_name)
                    .map(|p| (p.player.addr, p.host_port))
                {
                    Ok((stored_addr, host_port)) => {
                        if stored_addr != from {
                            debug!(player = %request.player_name, "name in use from another address");
                            return self.fail(from, err::NAME_TAKEN, "name in use").await;
                        }

                        if let Ok(player) = session.core.player_mut(&request.player_name) {
                            player.player.touch();
                        }

                        let mut replies = vec![reply(
                            from,
                            protocol::pairing_message(stored_addr.port(), host_addr, host_port),
                        )];
                        if host_port.is_none() {
                            // Still unpaired: remind the host.
                            replies.push(reply(
                                host_addr,
                                protocol::new_connection_message(&request.player_name, stored_addr),
                            ));
                        }
                        (replies, Err(HandleError::Ignored))
                    }
                    Err(_) => {
                        if session.core.is_full() {
                            debug!(code = %request.code, "relay session is full");
                            return self.fail(from, err::FULL, "session full").await;
                        }
                        session
                            .core
                            .add_player(RelayPlayer::new(&request.player_name, from))
                            .map_err(|e| HandleError::Internal(format!("admission failed: {e}")))?;
                        info!(player = %request.player_name, code = %request.code, "player connected to relay session");
                        (
                            vec![
                                reply(
                                    from,
                                    protocol::pairing_message(from.port(), host_addr, None),
                                ),
                                reply(
                                    host_addr,
                                    protocol::new_connection_message(&request.player_name, from),
                                ),
                            ],
                            Ok(()),
                        )
                    }
                }
            };

            deliver(&self.outbound, replies).await;
            result
        })
    }
}

/// `nc`: the host reports, from a newly opened local port, which player
/// that port belongs to. The datagram's source port IS the assigned port.
pub struct NewPortHandler {
    registry: SharedRegistry<RelaySession>,
    outbound: Outbound,
}

impl NewPortHandler {
    /// Wire the handler to its registry and sender.
    pub fn new(registry: SharedRegistry<RelaySession>, outbound: Outbound) -> Self {
        Self { registry, outbound }
    }
}

impl Handler for NewPortHandler {
    fn prefix(&self) -> &'static str {
        protocol::HOST_NEW_PORT
    }

    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            // Same shape as a connect request, with the secret in the
            // password slot.
            let request = match parse_connect_request(payload) {
                Ok(request) => request,
                Err(e) => return Err(reject(&self.outbound, from, e).await),
            };
            debug!(player = %request.player_name, code = %request.code, %from, "host reports a new port");

            let replies = {
                let mut registry = self.registry.write().await;
                let session = match registry.get_mut(&request.code) {
                    Ok(session) => session,
                    Err(_) => {
                        self.outbound.send(from, err::NO_SESSION).await;
                        return Err(HandleError::invalid("no such session"));
                    }
                };

                if !session.secret_matches(request.password.as_deref()) {
                    debug!(code = %request.code, "session secret does not match");
                    self.outbound.send(from, err::SECRET_MISMATCH).await;
                    return Err(HandleError::invalid("secret mismatch"));
                }

                let host_addr = host_addr_of(session)?;

                match session.core.player_mut(&request.player_name) {
                    Err(_) => {
                        // The host is waiting on its main socket; report the
                        // miss there, not to the throwaway port.
                        self.outbound.send(host_addr, err::NO_PLAYER).await;
                        return Err(HandleError::invalid("no such player to pair"));
                    }
                    Ok(player) => {
                        if let Some(existing) = player.host_port {
                            if existing != from.port() {
                                // The host thinks this player lives on a port
                                // the server never recorded, or vice versa.
                                error!(
                                    player = %request.player_name,
                                    code = %request.code,
                                    existing,
                                    reported = from.port(),
                                    "host port does not match the one already assigned"
                                );
                                self.outbound.send(from, err::PORT_MISMATCH).await;
                                return Err(HandleError::invalid("host port mismatch"));
                            }
                        }

                        player.host_port = Some(from.port());
                        let player_addr = player.player.addr;
                        info!(
                            player = %request.player_name,
                            code = %request.code,
                            port = from.port(),
                            "host port paired"
                        );

                        vec![
                            reply(host_addr, protocol::host_ack_message(&request.player_name)),
                            reply(
                                player_addr,
                                protocol::pairing_message(
                                    player_addr.port(),
                                    host_addr,
                                    Some(from.port()),
                                ),
                            ),
                        ]
                    }
                }
            };

            deliver(&self.outbound, replies).await;
            Ok(())
        })
    }
}

/// `rp`: host heartbeat. Replies with the pairing status of every player:
/// confirmed players as a bare name, waiting players with their endpoint.
pub struct PingHandler {
    registry: SharedRegistry<RelaySession>,
    outbound: Outbound,
}

impl PingHandler {
    /// Wire the handler to its registry and sender.
    pub fn new(registry: SharedRegistry<RelaySession>, outbound: Outbound) -> Self {
        Self { registry, outbound }
    }
}

impl Handler for PingHandler {
    fn prefix(&self) -> &'static str {
        protocol::RELAY_PING
    }

    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let request = match parse_session_player_request(payload) {
                Ok(request) => request,
                Err(e) => return Err(reject(&self.outbound, from, e).await),
            };

            let status = {
                let mut registry = self.registry.write().await;
                let session = match registry.get_mut(&request.code) {
                    Ok(session) => session,
                    Err(_) => {
                        self.outbound.send(from, err::NO_SESSION).await;
                        return Err(HandleError::invalid("no such session"));
                    }
                };

                let stored_addr = match session
                    .core
                    .player(&request.player_name)
                    .map(|p| p.player.addr)
                {
                    Ok(addr) => addr,
                    Err(_) => {
                        self.outbound.send(from, err::NO_PLAYER).await;
                        return Err(HandleError::invalid("no such player"));
                    }
                };

                if !session.core.is_host_addr(from) || stored_addr != from {
                    debug!(code = %request.code, %from, "relay ping from a non-host address");
                    self.outbound.send(from, err::NOT_HOST).await;
                    return Err(HandleError::invalid("relay ping from non-host"));
                }

                if let Ok(host) = session.core.player_mut(&request.player_name) {
                    host.player.touch();
                }
                protocol::relay_status_message(session.core.players())
            };

            self.outbound.send(from, status).await;
            Ok(())
        })
    }
}

/// `rk`: host removes a player. No notifications; the host already knows,
/// and the player will learn when its pairing goes dead.
pub struct KickHandler {
    registry: SharedRegistry<RelaySession>,
    outbound: Outbound,
}

impl KickHandler {
    /// Wire the handler to its registry and sender.
    pub fn new(registry: SharedRegistry<RelaySession>, outbound: Outbound) -> Self {
        Self { registry, outbound }
    }
}

impl Handler for KickHandler {
    fn prefix(&self) -> &'static str {
        protocol::RELAY_KICK
    }

    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let request = match parse_session_player_request(payload) {
                Ok(request) => request,
                Err(e) => return Err(reject(&self.outbound, from, e).await),
            };
            debug!(player = %request.player_name, code = %request.code, %from, "relay kick request");

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
                    return Err(HandleError::invalid("kick from non-host"));
                }

                let was_host = session
                    .core
                    .host()
                    .is_some_and(|h| h.player.name == request.player_name);
                if session.core.remove_player(&request.player_name).is_none() {
                    self.outbound.send(from, err::NO_PLAYER).await;
                    return Err(HandleError::invalid("no such player"));
                }
                info!(player = %request.player_name, code = %request.code, "player kicked from relay session");

                let emptied = session.core.is_empty();
                let new_host_addr = session.core.host().map(|h| h.player.addr);
                if emptied {
                    registry.delete(&request.code);
                    info!(code = %request.code, "relay session emptied by kick, deleted");
                } else if was_host {
                    // The host kicked itself: hand the session to the next
                    // player and repoint the address index.
                    if let Some(new_addr) = new_host_addr {
                        let _ = registry.update_address_for(&request.code, new_addr);
                    }
                }
            }
            Ok(())
        })
    }
}

/// `rx`: host closes the whole session.
pub struct CloseHandler {
    registry: SharedRegistry<RelaySession>,
    outbound: Outbound,
}

impl CloseHandler {
    /// Wire the handler to its registry and sender.
    pub fn new(registry: SharedRegistry<RelaySession>, outbound: Outbound) -> Self {
        Self { registry, outbound }
    }
}

impl Handler for CloseHandler {
    fn prefix(&self) -> &'static str {
        protocol::RELAY_CLOSE
    }

    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let request = match parse_session_player_request(payload) {
                Ok(request) => request,
                Err(e) => return Err(reject(&self.outbound, from, e).await),
            };
            debug!(code = %request.code, %from, "relay close request");

            {
                let mut registry = self.registry.write().await;
                let session = match registry.get_mut(&request.code) {
                    Ok(session) => session,
                    Err(_) => {
                        self.outbound.send(from, err::NO_SESSION).await;
                        return Err(HandleError::invalid("no such session"));
                    }
                };

                if !session.core.has_player(&request.player_name) {
                    self.outbound.send(from, err::NO_PLAYER).await;
                    return Err(HandleError::invalid("no such player"));
                }

                let host_is_named = session
                    .core
                    .host()
                    .is_some_and(|h| h.player.name == request.player_name);
                if !session.core.is_host_addr(from) || !host_is_named {
                    self.outbound.send(from, err::NOT_HOST).await;
                    return Err(HandleError::invalid("close from non-host"));
                }

                registry.delete(&request.code);
                info!(code = %request.code, "relay session closed by host");
            }

            self.outbound.send(from, err::CLOSED).await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;
    use tokio::sync::RwLock;

    use super::*;
    use crate::net::send::Outgoing;
    use crate::registry::SessionRegistry;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    struct Rig {
        registry: SharedRegistry<RelaySession>,
        outbound: Outbound,
        rx: mpsc::Receiver<Outgoing>,
    }

    impl Rig {
        fn new() -> Self {
            let registry = Arc::new(RwLock::new(SessionRegistry::new()));
            let (outbound, rx) = Outbound::channel(64);
            Self {
                registry,
                outbound,
                rx,
            }
        }

        fn drain(&mut self) -> Vec<Outgoing> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }

        /// Create a relay session via the host handler; returns (code, secret)
        /// parsed from the reply.
        async fn host(&mut self, from: SocketAddr, payload: &str) -> (String, String) {
            let handler = HostHandler::new(self.registry.clone(), self.outbound.clone());
            handler.handle(payload, from).await.unwrap();
            let sent = self.drain();
            assert_eq!(sent.len(), 1);
            let fields: Vec<&str> = sent[0].text.split(':').collect();
            assert_eq!(fields[0], "i");
            assert_eq!(fields.len(), 3);
            (fields[1].to_string(), fields[2].to_string())
        }
    }

    #[tokio::test]
    async fn test_host_replies_code_and_secret() {
        let mut rig = Rig::new();
        let (code, secret) = rig.host(addr(5000), "ALICE:4").await;

        assert_eq!(secret.len(), 12);
        let registry = rig.registry.read().await;
        let session = registry.get(&code).unwrap();
        assert_eq!(session.secret(), secret);
        assert_eq!(session.core.players().len(), 1);
    }

    #[tokio::test]
    async fn test_host_refresh_resends_same_code_and_secret() {
        let mut rig = Rig::new();
        let (code, secret) = rig.host(addr(5000), "ALICE:4").await;

        let (again_code, again_secret) = rig.host(addr(5000), "ALICE:4").await;
        assert_eq!(again_code, code);
        assert_eq!(again_secret, secret);
        assert_eq!(rig.registry.read().await.len(), 1);

        let handler = HostHandler::new(rig.registry.clone(), rig.outbound.clone());
        let result = handler.handle("MALLORY:4", addr(5000)).await;
        assert!(matches!(result, Err(HandleError::Invalid(_))));
        assert_eq!(rig.drain()[0].text, err::NOT_HOST);
    }

    #[tokio::test]
    async fn test_connect_tells_player_to_wait_and_notifies_host() {
        let mut rig = Rig::new();
        let (code, _) = rig.host(addr(5000), "ALICE:4").await;
        let handler = ConnectHandler::new(rig.registry.clone(), rig.outbound.clone());

        handler
            .handle(&format!("{code}:BOB"), addr(5001))
            .await
            .unwrap();

        let sent = rig.drain();
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .any(|m| m.addr == addr(5001) && m.text == "rc:5001:127.0.0.1:wait"));
        assert!(sent
            .iter()
            .any(|m| m.addr == addr(5000) && m.text == "nc:BOB:127.0.0.1:5001"));
    }

    #[tokio::test]
    async fn test_connect_repeat_while_waiting_renotifies_host() {
        let mut rig = Rig::new();
        let (code, _) = rig.host(addr(5000), "ALICE:4").await;
        let handler = ConnectHandler::new(rig.registry.clone(), rig.outbound.clone());

        handler
            .handle(&format!("{code}:BOB"), addr(5001))
            .await
            .unwrap();
        rig.drain();

        let result = handler.handle(&format!("{code}:BOB"), addr(5001)).await;
        assert!(matches!(result, Err(HandleError::Ignored)));
        let sent = rig.drain();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().any(|m| m.text == "rc:5001:127.0.0.1:wait"));
        assert!(sent.iter().any(|m| m.text == "nc:BOB:127.0.0.1:5001"));

        // Name from another address is rejected.
        let result = handler.handle(&format!("{code}:BOB"), addr(5009)).await;
        assert!(matches!(result, Err(HandleError::Invalid(_))));
        assert_eq!(rig.drain()[0].text, err::NAME_TAKEN);
    }

    #[tokio::test]
    async fn test_connect_full_relay_session() {
        let mut rig = Rig::new();
        let (code, _) = rig.host(addr(5000), "ALICE:2").await;
        let handler = ConnectHandler::new(rig.registry.clone(), rig.outbound.clone());

        handler
            .handle(&format!("{code}:BOB"), addr(5001))
            .await
            .unwrap();
        rig.drain();

        let result = handler.handle(&format!("{code}:CAROL"), addr(5002)).await;
        assert!(matches!(result, Err(HandleError::Invalid(_))));
        assert_eq!(rig.drain()[0].text, err::FULL);
    }

    #[tokio::test]
    async fn test_new_port_pairs_player_and_informs_both_sides() {
        let mut rig = Rig::new();
        let (code, secret) = rig.host(addr(5000), "ALICE:4").await;
        ConnectHandler::new(rig.registry.clone(), rig.outbound.clone())
            .handle(&format!("{code}:BOB"), addr(5001))
            .await
            .unwrap();
        rig.drain();

        // The host reports from the port it just opened for BOB.
        let handler = NewPortHandler::new(rig.registry.clone(), rig.outbound.clone());
        handler
            .handle(&format!("{code}:BOB:{secret}"), addr(35001))
            .await
            .unwrap();

        let sent = rig.drain();
        assert!(sent
            .iter()
            .any(|m| m.addr == addr(5000) && m.text == "ok:BOB"));
        assert!(sent
            .iter()
            .any(|m| m.addr == addr(5001) && m.text == "rc:5001:127.0.0.1:35001"));

        let registry = rig.registry.read().await;
        let session = registry.get(&code).unwrap();
        assert_eq!(session.core.player("BOB").unwrap().host_port, Some(35001));
    }

    #[tokio::test]
    async fn test_new_port_rejects_wrong_secret_and_changed_port() {
        let mut rig = Rig::new();
        let (code, secret) = rig.host(addr(5000), "ALICE:4").await;
        ConnectHandler::new(rig.registry.clone(), rig.outbound.clone())
            .handle(&format!("{code}:BOB"), addr(5001))
            .await
            .unwrap();
        rig.drain();

        let handler = NewPortHandler::new(rig.registry.clone(), rig.outbound.clone());

        let result = handler
            .handle(&format!("{code}:BOB:badsecret"), addr(35001))
            .await;
        assert!(matches!(result, Err(HandleError::Invalid(_))));
        assert_eq!(rig.drain()[0].text, err::SECRET_MISMATCH);

        handler
            .handle(&format!("{code}:BOB:{secret}"), addr(35001))
            .await
            .unwrap();
        rig.drain();

        // Same pairing resent from the same port is idempotent.
        handler
            .handle(&format!("{code}:BOB:{secret}"), addr(35001))
            .await
            .unwrap();
        rig.drain();

        // A different port for an already-paired player is a desync.
        let result = handler
            .handle(&format!("{code}:BOB:{secret}"), addr(35002))
            .await;
        assert!(matches!(result, Err(HandleError::Invalid(_))));
        assert_eq!(rig.drain()[0].text, err::PORT_MISMATCH);
    }

    #[tokio::test]
    async fn test_new_port_for_unknown_player_reports_to_host() {
        let mut rig = Rig::new();
        let (code, secret) = rig.host(addr(5000), "ALICE:4").await;

        let handler = NewPortHandler::new(rig.registry.clone(), rig.outbound.clone());
        let result = handler
            .handle(&format!("{code}:GHOST:{secret}"), addr(35001))
            .await;
        assert!(matches!(result, Err(HandleError::Invalid(_))));

        let sent = rig.drain();
        assert_eq!(sent[0].addr, addr(5000));
        assert_eq!(sent[0].text, err::NO_PLAYER);
    }

    #[tokio::test]
    async fn test_connect_after_pairing_returns_host_endpoint() {
        let mut rig = Rig::new();
        let (code, secret) = rig.host(addr(5000), "ALICE:4").await;
        let connect = ConnectHandler::new(rig.registry.clone(), rig.outbound.clone());
        connect
            .handle(&format!("{code}:BOB"), addr(5001))
            .await
            .unwrap();
        NewPortHandler::new(rig.registry.clone(), rig.outbound.clone())
            .handle(&format!("{code}:BOB:{secret}"), addr(35001))
            .await
            .unwrap();
        rig.drain();

        // A repeat connect now gets the endpoint and the host is left alone.
        let result = connect.handle(&format!("{code}:BOB"), addr(5001)).await;
        assert!(matches!(result, Err(HandleError::Ignored)));
        let sent = rig.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "rc:5001:127.0.0.1:35001");
    }

    #[tokio::test]
    async fn test_ping_is_host_only_and_reports_pairing_status() {
        let mut rig = Rig::new();
        let (code, secret) = rig.host(addr(5000), "ALICE:4").await;
        ConnectHandler::new(rig.registry.clone(), rig.outbound.clone())
            .handle(&format!("{code}:BOB"), addr(5001))
            .await
            .unwrap();
        ConnectHandler::new(rig.registry.clone(), rig.outbound.clone())
            .handle(&format!("{code}:CAROL"), addr(5002))
            .await
            .unwrap();
        NewPortHandler::new(rig.registry.clone(), rig.outbound.clone())
            .handle(&format!("{code}:BOB:{secret}"), addr(35001))
            .await
            .unwrap();
        rig.drain();

        let handler = PingHandler::new(rig.registry.clone(), rig.outbound.clone());

        let result = handler.handle(&format!("{code}:BOB"), addr(5001)).await;
        assert!(matches!(result, Err(HandleError::Invalid(_))));
        assert_eq!(rig.drain()[0].text, err::NOT_HOST);

        handler
            .handle(&format!("{code}:ALICE"), addr(5000))
            .await
            .unwrap();
        let sent = rig.drain();
        // ALICE (the host) and BOB are paired; CAROL still carries her
        // endpoint.
        assert_eq!(sent[0].text, "i:ALICE:127.0.0.1:5000;BOB;CAROL:127.0.0.1:5002");
    }

    #[tokio::test]
    async fn test_kick_removes_silently_and_handles_self_kick() {
        let mut rig = Rig::new();
        let (code, _) = rig.host(addr(5000), "ALICE:4").await;
        ConnectHandler::new(rig.registry.clone(), rig.outbound.clone())
            .handle(&format!("{code}:BOB"), addr(5001))
            .await
            .unwrap();
        rig.drain();

        let handler = KickHandler::new(rig.registry.clone(), rig.outbound.clone());
        handler
            .handle(&format!("{code}:BOB"), addr(5000))
            .await
            .unwrap();
        assert!(rig.drain().is_empty());

        // The host kicking itself hands the session over.
        ConnectHandler::new(rig.registry.clone(), rig.outbound.clone())
            .handle(&format!("{code}:BOB"), addr(5001))
            .await
            .unwrap();
        rig.drain();
        handler
            .handle(&format!("{code}:ALICE"), addr(5000))
            .await
            .unwrap();

        let registry = rig.registry.read().await;
        let session = registry.get(&code).unwrap();
        assert_eq!(session.core.host().unwrap().player.name, "BOB");
        assert_eq!(
            registry.get_by_address(addr(5001)).unwrap().core.code,
            code
        );
    }

    #[tokio::test]
    async fn test_kick_emptying_session_deletes_it() {
        let mut rig = Rig::new();
        let (code, _) = rig.host(addr(5000), "ALICE:4").await;

        KickHandler::new(rig.registry.clone(), rig.outbound.clone())
            .handle(&format!("{code}:ALICE"), addr(5000))
            .await
            .unwrap();
        assert!(rig.registry.read().await.get(&code).is_err());
    }

    #[tokio::test]
    async fn test_close_is_host_only_and_deletes() {
        let mut rig = Rig::new();
        let (code, _) = rig.host(addr(5000), "ALICE:4").await;
        ConnectHandler::new(rig.registry.clone(), rig.outbound.clone())
            .handle(&format!("{code}:BOB"), addr(5001))
            .await
            .unwrap();
        rig.drain();

        let handler = CloseHandler::new(rig.registry.clone(), rig.outbound.clone());

        let result = handler.handle(&format!("{code}:BOB"), addr(5001)).await;
        assert!(matches!(result, Err(HandleError::Invalid(_))));
        assert_eq!(rig.drain()[0].text, err::NOT_HOST);

        handler
            .handle(&format!("{code}:ALICE"), addr(5000))
            .await
            .unwrap();
        assert_eq!(rig.drain()[0].text, err::CLOSED);
        assert!(rig.registry.read().await.get(&code).is_err());
    }
}
