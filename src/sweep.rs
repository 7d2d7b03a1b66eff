//! Cleanup Sweeps
//!
//! Periodic background passes over the registries, independent of inbound
//! traffic: expired sessions and silent players are removed and the affected
//! peers notified. Each sweep's per-tick body is a standalone function so it
//! can be exercised directly; the `run_*` loops just tick it on a fixed
//! period.
//!
//! Every body iterates a snapshot of session codes and re-fetches each
//! session under the lock before touching it, since handlers mutate the same
//! registry between ticks.

use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, info};

use crate::handlers::notify;
use crate::model::{MeshSession, RelaySession};
use crate::net::protocol::err;
use crate::net::send::Outgoing;
use crate::net::Outbound;
use crate::registry::SharedRegistry;

/// How often timed-out mesh sessions are reaped.
pub const MESH_SESSION_SWEEP_PERIOD: Duration = Duration::from_secs(5 * 60);

/// How often idle mesh players are reaped.
pub const MESH_PLAYER_SWEEP_PERIOD: Duration = Duration::from_secs(5);

/// How often over-age relay sessions are reaped.
pub const RELAY_SESSION_SWEEP_PERIOD: Duration = Duration::from_secs(60 * 60);

/// How often relay hosts are checked for missed heartbeats.
pub const RELAY_HOST_SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// Delete mesh sessions past their timeout and notify every member.
pub async fn expire_mesh_sessions(
    registry: &SharedRegistry<MeshSession>,
    outbound: &Outbound,
) -> usize {
    let codes = registry.read().await.list_codes();
    if !codes.is_empty() {
        debug!(sessions = codes.len(), "starting mesh session sweep");
    }

    let mut deleted = 0;
    for code in codes {
        let notifications: Vec<Outgoing> = {
            let mut registry = registry.write().await;
            let addrs = match registry.get(&code) {
                Ok(session) if session.is_timed_out() => session
                    .core
                    .players()
                    .iter()
                    .map(|p| p.addr)
                    .collect::<Vec<_>>(),
                _ => continue,
            };
            registry.delete(&code);
            info!(%code, "mesh session timed out, deleted");
            addrs
                .into_iter()
                .map(|addr| notify(addr, err::SESSION_TIMEOUT))
                .collect()
        };

        deleted += 1;
        for n in notifications {
            outbound.send_repeated(n.addr, n.text, n.repeats).await;
        }
    }
    deleted
}

/// Remove idle mesh players, transferring the host role (and repointing the
/// address index) when the host idled out, and deleting emptied sessions.
pub async fn expire_mesh_players(
    registry: &SharedRegistry<MeshSession>,
    outbound: &Outbound,
) -> usize {
    let codes = registry.read().await.list_codes();
    if !codes.is_empty() {
        debug!(sessions = codes.len(), "starting mesh player sweep");
    }

    let mut removed_total = 0;
    for code in codes {
        let notifications: Vec<Outgoing> = {
            let mut registry = registry.write().await;
            let session = match registry.get_mut(&code) {
                Ok(session) => session,
                Err(_) => continue,
            };

            let old_host = session.core.host().map(|h| h.name.clone());
            let timed_out: Vec<String> = session
                .core
                .players()
                .iter()
                .filter(|p| p.is_timed_out())
                .map(|p| p.name.clone())
                .collect();
            if timed_out.is_empty() {
                continue;
            }

            let mut notifications = Vec::new();
            for name in &timed_out {
                if let Some(player) = session.core.remove_player(name) {
                    info!(player = %name, %code, "player timed out, removed from session");
                    notifications.push(notify(player.addr, err::PLAYER_TIMEOUT));
                }
            }
            removed_total += timed_out.len();

            let emptied = session.core.is_empty();
            let new_host = session.core.host().map(|h| (h.name.clone(), h.addr));
            if emptied {
                registry.delete(&code);
                info!(%code, "no players left in mesh session, deleted");
            } else if let Some((new_name, new_addr)) = new_host {
                if old_host.as_deref() != Some(new_name.as_str()) {
                    let _ = registry.update_address_for(&code, new_addr);
                }
            }
            notifications
        };

        for n in notifications {
            outbound.send_repeated(n.addr, n.text, n.repeats).await;
        }
    }
    removed_total
}

/// Delete relay sessions past the absolute age cap and notify every member.
pub async fn expire_relay_sessions(
    registry: &SharedRegistry<RelaySession>,
    outbound: &Outbound,
) -> usize {
    let codes = registry.read().await.list_codes();
    if !codes.is_empty() {
        debug!(sessions = codes.len(), "starting relay session sweep");
    }

    let mut deleted = 0;
    for code in codes {
        let notifications: Vec<Outgoing> = {
            let mut registry = registry.write().await;
            let addrs = match registry.get(&code) {
                Ok(session) if session.is_timed_out() => session
                    .core
                    .players()
                    .iter()
                    .map(|p| p.player.addr)
                    .collect::<Vec<_>>(),
                _ => continue,
            };
            registry.delete(&code);
            info!(%code, "relay session exceeded its age cap, deleted");
            addrs
                .into_iter()
                .map(|addr| notify(addr, err::SESSION_TIMEOUT))
                .collect()
        };

        deleted += 1;
        for n in notifications {
            outbound.send_repeated(n.addr, n.text, n.repeats).await;
        }
    }
    deleted
}

/// Tear down relay sessions whose host stopped heartbeating. The whole
/// session goes: without its host there is nobody to open ports, so a role
/// transfer would leave every player stranded.
pub async fn expire_relay_hosts(
    registry: &SharedRegistry<RelaySession>,
    outbound: &Outbound,
) -> usize {
    let codes = registry.read().await.list_codes();
    if !codes.is_empty() {
        debug!(sessions = codes.len(), "starting relay host sweep");
    }

    let mut deleted = 0;
    for code in codes {
        let notifications: Vec<Outgoing> = {
            let mut registry = registry.write().await;
            let addrs = match registry.get(&code) {
                Ok(session) if session.host_is_timed_out() => session
                    .core
                    .players()
                    .iter()
                    .map(|p| p.player.addr)
                    .collect::<Vec<_>>(),
                _ => continue,
            };
            registry.delete(&code);
            info!(%code, "relay host went silent, session deleted");
            addrs
                .into_iter()
                .map(|addr| notify(addr, err::PLAYER_TIMEOUT))
                .collect()
        };

        deleted += 1;
        for n in notifications {
            outbound.send_repeated(n.addr, n.text, n.repeats).await;
        }
    }
    deleted
}

/// Tick [`expire_mesh_sessions`] forever.
pub async fn run_mesh_session_sweep(registry: SharedRegistry<MeshSession>, outbound: Outbound) {
    let mut ticker = interval(MESH_SESSION_SWEEP_PERIOD);
    loop {
        ticker.tick().await;
        expire_mesh_sessions(&registry, &outbound).await;
    }
}

/// Tick [`expire_mesh_players`] forever.
pub async fn run_mesh_player_sweep(registry: SharedRegistry<MeshSession>, outbound: Outbound) {
    let mut ticker = interval(MESH_PLAYER_SWEEP_PERIOD);
    loop {
        ticker.tick().await;
        expire_mesh_players(&registry, &outbound).await;
    }
}

/// Tick [`expire_relay_sessions`] forever.
pub async fn run_relay_session_sweep(registry: SharedRegistry<RelaySession>, outbound: Outbound) {
    let mut ticker = interval(RELAY_SESSION_SWEEP_PERIOD);
    loop {
        ticker.tick().await;
        expire_relay_sessions(&registry, &outbound).await;
    }
}

/// Tick [`expire_relay_hosts`] forever.
pub async fn run_relay_host_sweep(registry: SharedRegistry<RelaySession>, outbound: Outbound) {
    let mut ticker = interval(RELAY_HOST_SWEEP_PERIOD);
    loop {
        ticker.tick().await;
        expire_relay_hosts(&registry, &outbound).await;
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::{mpsc, RwLock};

    use super::*;
    use crate::handlers::NOTIFY_REPEATS;
    use crate::model::player::{MESH_PLAYER_TIMEOUT, RELAY_HOST_TIMEOUT};
    use crate::model::session::{
        MESH_SESSION_TIMEOUT, MESH_STARTED_TIMEOUT, RELAY_SESSION_MAX_AGE,
    };
    use crate::model::{Player, RelayPlayer};
    use crate::registry::SessionRegistry;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn channel() -> (Outbound, mpsc::Receiver<Outgoing>) {
        Outbound::channel(64)
    }

    fn drain(rx: &mut mpsc::Receiver<Outgoing>) -> Vec<Outgoing> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn mesh_session(
        registry: &SharedRegistry<MeshSession>,
        host_port: u16,
        peers: &[(&str, u16)],
    ) -> String {
        let mut reg = registry.write().await;
        let code = reg
            .create("ALICE", addr(host_port), 8, None)
            .unwrap()
            .core
            .code
            .clone();
        let session = reg.get_mut(&code).unwrap();
        for (name, port) in peers {
            session.core.add_player(Player::new(*name, addr(*port))).unwrap();
        }
        code
    }

    #[tokio::test]
    async fn test_mesh_session_sweep_only_expires_timed_out() {
        let registry = Arc::new(RwLock::new(SessionRegistry::new()));
        let (outbound, mut rx) = channel();

        let stale = mesh_session(&registry, 4000, &[("BOB", 4001)]).await;
        let fresh = mesh_session(&registry, 4100, &[]).await;
        registry
            .write()
            .await
            .get_mut(&stale)
            .unwrap()
            .backdate_created(MESH_SESSION_TIMEOUT + Duration::from_secs(1));

        let deleted = expire_mesh_sessions(&registry, &outbound).await;
        assert_eq!(deleted, 1);

        let reg = registry.read().await;
        assert!(reg.get(&stale).is_err());
        assert!(reg.get(&fresh).is_ok());

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|m| m.text == err::SESSION_TIMEOUT && m.repeats == NOTIFY_REPEATS));
    }

    #[tokio::test]
    async fn test_mesh_session_sweep_uses_started_clock_once_started() {
        let registry = Arc::new(RwLock::new(SessionRegistry::new()));
        let (outbound, _rx) = channel();

        let code = mesh_session(&registry, 4000, &[("BOB", 4001)]).await;
        {
            let mut reg = registry.write().await;
            let session = reg.get_mut(&code).unwrap();
            session.start();
            // Old by creation-time standards, but the started clock governs.
            session.backdate_created(MESH_SESSION_TIMEOUT + Duration::from_secs(1));
        }
        assert_eq!(expire_mesh_sessions(&registry, &outbound).await, 0);

        registry
            .write()
            .await
            .get_mut(&code)
            .unwrap()
            .backdate_started(MESH_STARTED_TIMEOUT + Duration::from_secs(1));
        assert_eq!(expire_mesh_sessions(&registry, &outbound).await, 1);
    }

    #[tokio::test]
    async fn test_mesh_player_sweep_removes_only_idle_players() {
        let registry = Arc::new(RwLock::new(SessionRegistry::new()));
        let (outbound, mut rx) = channel();

        let code = mesh_session(&registry, 4000, &[("BOB", 4001), ("CAROL", 4002)]).await;
        {
            let mut reg = registry.write().await;
            let session = reg.get_mut(&code).unwrap();
            session
                .core
                .player_mut("BOB")
                .unwrap()
                .backdate(MESH_PLAYER_TIMEOUT + Duration::from_secs(1));
        }

        let removed = expire_mesh_players(&registry, &outbound).await;
        assert_eq!(removed, 1);

        let reg = registry.read().await;
        let session = reg.get(&code).unwrap();
        assert!(!session.core.has_player("BOB"));
        assert!(session.core.has_player("CAROL"));
        assert_eq!(session.core.host().unwrap().name, "ALICE");

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].addr, addr(4001));
        assert_eq!(sent[0].text, err::PLAYER_TIMEOUT);
        assert_eq!(sent[0].repeats, NOTIFY_REPEATS);
    }

    #[tokio::test]
    async fn test_mesh_player_sweep_transfers_host_and_repoints() {
        let registry = Arc::new(RwLock::new(SessionRegistry::new()));
        let (outbound, _rx) = channel();

        let code = mesh_session(&registry, 4000, &[("BOB", 4001)]).await;
        registry
            .write()
            .await
            .get_mut(&code)
            .unwrap()
            .core
            .player_mut("ALICE")
            .unwrap()
            .backdate(MESH_PLAYER_TIMEOUT + Duration::from_secs(1));

        expire_mesh_players(&registry, &outbound).await;

        let reg = registry.read().await;
        let session = reg.get(&code).unwrap();
        assert_eq!(session.core.host().unwrap().name, "BOB");
        assert_eq!(reg.get_by_address(addr(4001)).unwrap().core.code, code);
        assert!(reg.get_by_address(addr(4000)).is_err());
    }

    #[tokio::test]
    async fn test_mesh_player_sweep_deletes_emptied_session() {
        let registry = Arc::new(RwLock::new(SessionRegistry::new()));
        let (outbound, _rx) = channel();

        let code = mesh_session(&registry, 4000, &[]).await;
        registry
            .write()
            .await
            .get_mut(&code)
            .unwrap()
            .core
            .player_mut("ALICE")
            .unwrap()
            .backdate(MESH_PLAYER_TIMEOUT + Duration::from_secs(1));

        expire_mesh_players(&registry, &outbound).await;
        assert!(registry.read().await.get(&code).is_err());
    }

    #[tokio::test]
    async fn test_relay_host_sweep_tears_down_session() {
        let registry: SharedRegistry<RelaySession> = Arc::new(RwLock::new(SessionRegistry::new()));
        let (outbound, mut rx) = channel();

        let code = {
            let mut reg = registry.write().await;
            let code = reg
                .create("ALICE", addr(5000), 4, None)
                .unwrap()
                .core
                .code
                .clone();
            let session = reg.get_mut(&code).unwrap();
            session
                .core
                .add_player(RelayPlayer::new("BOB", addr(5001)))
                .unwrap();
            session
                .core
                .player_mut("ALICE")
                .unwrap()
                .player
                .backdate(RELAY_HOST_TIMEOUT + Duration::from_secs(1));
            code
        };

        let deleted = expire_relay_hosts(&registry, &outbound).await;
        assert_eq!(deleted, 1);
        assert!(registry.read().await.get(&code).is_err());

        // Both the dead host and the stranded player hear about it.
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.text == err::PLAYER_TIMEOUT));
        assert!(sent.iter().any(|m| m.addr == addr(5001)));
    }

    #[tokio::test]
    async fn test_relay_host_sweep_leaves_live_hosts_alone() {
        let registry: SharedRegistry<RelaySession> = Arc::new(RwLock::new(SessionRegistry::new()));
        let (outbound, _rx) = channel();

        registry
            .write()
            .await
            .create("ALICE", addr(5000), 4, None)
            .unwrap();

        assert_eq!(expire_relay_hosts(&registry, &outbound).await, 0);
        assert_eq!(registry.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_relay_session_sweep_enforces_age_cap() {
        let registry: SharedRegistry<RelaySession> = Arc::new(RwLock::new(SessionRegistry::new()));
        let (outbound, _rx) = channel();

        let code = {
            let mut reg = registry.write().await;
            reg.create("ALICE", addr(5000), 4, None)
                .unwrap()
                .core
                .code
                .clone()
        };
        assert_eq!(expire_relay_sessions(&registry, &outbound).await, 0);

        registry
            .write()
            .await
            .get_mut(&code)
            .unwrap()
            .backdate_created(RELAY_SESSION_MAX_AGE + Duration::from_secs(1));
        assert_eq!(expire_relay_sessions(&registry, &outbound).await, 1);
        assert!(registry.read().await.get(&code).is_err());
    }
}
