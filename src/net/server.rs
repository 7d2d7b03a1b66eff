//! UDP Rendezvous Server
//!
//! Owns the socket and the receive loop: each datagram is decoded, split
//! once on `:` into `(prefix, payload)`, and routed through the static
//! handler table. A bad datagram never takes the server down: every failure
//! is reduced to a log line and, where a handler owed one, a single error
//! reply.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::handlers::{standard_table, HandleError, HandlerTable};
use crate::model::{MeshSession, RelaySession};
use crate::net::protocol::err;
use crate::net::{send, Outbound};
use crate::registry::{SessionRegistry, SharedRegistry};
use crate::sweep;

/// Largest datagram the server will read. The protocol's longest message
/// (a full 12-player address payload) fits comfortably.
const MAX_DATAGRAM: usize = 2048;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the UDP socket binds to.
    pub bind_addr: SocketAddr,
    /// Outbound queue depth between handlers and the socket pump.
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7575".parse().unwrap(),
            outbound_buffer: 256,
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind or read the UDP socket.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// The rendezvous server: one UDP socket, one mesh registry, one relay
/// registry, and the background sweeps.
pub struct RendezvousServer {
    config: ServerConfig,
    socket: Arc<UdpSocket>,
    mesh: SharedRegistry<MeshSession>,
    relay: SharedRegistry<RelaySession>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RendezvousServer {
    /// Bind the socket and set up the registries.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            socket,
            mesh: Arc::new(tokio::sync::RwLock::new(SessionRegistry::new())),
            relay: Arc::new(tokio::sync::RwLock::new(SessionRegistry::new())),
            shutdown_tx,
        })
    }

    /// The address the socket actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Handle to the mesh session registry.
    pub fn mesh_registry(&self) -> SharedRegistry<MeshSession> {
        self.mesh.clone()
    }

    /// Handle to the relay session registry.
    pub fn relay_registry(&self) -> SharedRegistry<RelaySession> {
        self.relay.clone()
    }

    /// Ask the receive loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the receive loop until shutdown. Spawns the outbound pump and the
    /// four cleanup sweeps; they are torn down when the loop exits.
    pub async fn run(&self) -> Result<(), ServerError> {
        info!(addr = %self.local_addr()?, "rendezvous server listening");

        let (outbound, outbound_rx) = Outbound::channel(self.config.outbound_buffer);
        let pump = tokio::spawn(send::pump(self.socket.clone(), outbound_rx));

        let table = standard_table(self.mesh.clone(), self.relay.clone(), outbound.clone());
        info!(handlers = table.len(), "request handlers registered");

        let sweeps = [
            tokio::spawn(sweep::run_mesh_session_sweep(
                self.mesh.clone(),
                outbound.clone(),
            )),
            tokio::spawn(sweep::run_mesh_player_sweep(
                self.mesh.clone(),
                outbound.clone(),
            )),
            tokio::spawn(sweep::run_relay_session_sweep(
                self.relay.clone(),
                outbound.clone(),
            )),
            tokio::spawn(sweep::run_relay_host_sweep(
                self.relay.clone(),
                outbound.clone(),
            )),
        ];

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            dispatch(&table, &outbound, &buf[..len], from).await;
                        }
                        Err(e) => {
                            error!(error = %e, "recv error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        for task in sweeps {
            task.abort();
        }
        pump.abort();
        Ok(())
    }
}

/// Route one datagram. All three recognized failure categories end here:
/// invalid requests are logged at debug (the handler already replied where a
/// reply was owed), ignored requests are dropped silently, and internal
/// inconsistencies are logged at error. Nothing escapes.
pub async fn dispatch(table: &HandlerTable, outbound: &Outbound, datagram: &[u8], from: SocketAddr) {
    let text = match std::str::from_utf8(datagram) {
        Ok(text) => text,
        Err(_) => {
            debug!(%from, "dropping non-UTF-8 datagram");
            return;
        }
    };
    debug!(%from, datagram = text, "received datagram");

    let (prefix, payload) = match text.split_once(':') {
        Some(parts) => parts,
        None => {
            debug!(%from, datagram = text, "malformed datagram");
            outbound.send(from, err::REQUEST).await;
            return;
        }
    };

    let handler = match table.get(prefix) {
        Some(handler) => handler,
        None => {
            debug!(%from, prefix, "no handler for prefix");
            return;
        }
    };

    match handler.handle(payload, from).await {
        Ok(()) => {}
        Err(HandleError::Ignored) => {}
        Err(HandleError::Invalid(reason)) => {
            debug!(%from, prefix, %reason, "invalid request");
        }
        Err(HandleError::Internal(reason)) => {
            error!(%from, prefix, %reason, "internal inconsistency while handling request");
        }
    }
}
