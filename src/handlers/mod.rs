//! Request Handlers
//!
//! One handler per message type. Each handler is a plain struct holding the
//! registry handle it operates on and the [`Outbound`] sender, and exposes
//! its prefix plus a `handle` entry point. The dispatcher routes datagrams
//! through a [`HandlerTable`] built once at startup.

pub mod mesh;
pub mod relay;

use std::collections::HashMap;
use std::net::SocketAddr;

use futures_util::future::BoxFuture;

use crate::model::{MeshSession, RelaySession};
use crate::net::protocol::ParseError;
use crate::net::Outbound;
use crate::registry::SharedRegistry;

/// How a handler disposed of a datagram, when not successfully.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    /// The request was recognizably wrong. Any error reply owed to the
    /// sender has already been sent; the dispatcher just logs at debug.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The request was valid but stale or duplicate; dropped with no reply
    /// beyond whatever refresh the handler already sent.
    #[error("ignored request")]
    Ignored,

    /// Registry state contradicted itself. Logged at error severity by the
    /// dispatcher; indicates a server bug, not a client mistake.
    #[error("internal inconsistency: {0}")]
    Internal(String),
}

impl HandleError {
    /// Shorthand for an [`HandleError::Invalid`] with a formatted reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        HandleError::Invalid(reason.into())
    }
}

/// Outcome of handling one datagram.
pub type HandlerResult = Result<(), HandleError>;

/// A routable message handler.
pub trait Handler: Send + Sync {
    /// The message prefix this handler owns.
    fn prefix(&self) -> &'static str;

    /// Validate and apply one datagram payload (everything after the first
    /// `:`).
    fn handle<'a>(&'a self, payload: &'a str, from: SocketAddr) -> BoxFuture<'a, HandlerResult>;
}

/// The static prefix-to-handler routing table.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<&'static str, Box<dyn Handler>>,
}

impl HandlerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its declared prefix.
    ///
    /// # Panics
    ///
    /// Panics if the prefix is already registered; two handlers claiming one
    /// prefix is a wiring bug that must fail at startup, not at runtime.
    pub fn register(&mut self, handler: Box<dyn Handler>) {
        let prefix = handler.prefix();
        if self.handlers.insert(prefix, handler).is_some() {
            panic!("duplicate handler registered for prefix {prefix:?}");
        }
    }

    /// Look up the handler for a prefix.
    pub fn get(&self, prefix: &str) -> Option<&dyn Handler> {
        self.handlers.get(prefix).map(|handler| handler.as_ref())
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Build the full routing table: every mesh and relay handler, wired to its
/// registry and the outbound sender.
pub fn standard_table(
    mesh: SharedRegistry<MeshSession>,
    relay: SharedRegistry<RelaySession>,
    outbound: Outbound,
) -> HandlerTable {
    let mut table = HandlerTable::new();

    table.register(Box::new(mesh::HostHandler::new(
        mesh.clone(),
        outbound.clone(),
    )));
    table.register(Box::new(mesh::ConnectHandler::new(
        mesh.clone(),
        outbound.clone(),
    )));
    table.register(Box::new(mesh::PingHandler::new(
        mesh.clone(),
        outbound.clone(),
    )));
    table.register(Box::new(mesh::StartHandler::new(
        mesh.clone(),
        outbound.clone(),
    )));
    table.register(Box::new(mesh::ConfirmHandler::new(
        mesh.clone(),
        outbound.clone(),
    )));
    table.register(Box::new(mesh::KickHandler::new(
        mesh.clone(),
        outbound.clone(),
    )));
    table.register(Box::new(mesh::ExitHandler::new(mesh, outbound.clone())));

    table.register(Box::new(relay::HostHandler::new(
        relay.clone(),
        outbound.clone(),
    )));
    table.register(Box::new(relay::ConnectHandler::new(
        relay.clone(),
        outbound.clone(),
    )));
    table.register(Box::new(relay::NewPortHandler::new(
        relay.clone(),
        outbound.clone(),
    )));
    table.register(Box::new(relay::PingHandler::new(
        relay.clone(),
        outbound.clone(),
    )));
    table.register(Box::new(relay::KickHandler::new(
        relay.clone(),
        outbound.clone(),
    )));
    table.register(Box::new(relay::CloseHandler::new(relay, outbound)));

    table
}

/// Send the violation's error code back and turn it into the
/// [`HandleError`] the dispatcher logs.
pub(crate) async fn reject(outbound: &Outbound, addr: SocketAddr, error: ParseError) -> HandleError {
    outbound.send(addr, error.reply_code()).await;
    HandleError::invalid(error.to_string())
}

/// Notifications without an application-level ack get this many sends.
pub(crate) const NOTIFY_REPEATS: u32 = 3;

/// A single reply, queued while the registry lock is held and sent after it
/// is released.
pub(crate) fn reply(addr: SocketAddr, text: impl Into<String>) -> crate::net::send::Outgoing {
    crate::net::send::Outgoing {
        addr,
        text: text.into(),
        repeats: 1,
    }
}

/// Like [`reply`], but repeated [`NOTIFY_REPEATS`] times.
pub(crate) fn notify(addr: SocketAddr, text: impl Into<String>) -> crate::net::send::Outgoing {
    crate::net::send::Outgoing {
        addr,
        text: text.into(),
        repeats: NOTIFY_REPEATS,
    }
}

/// Queue a batch of replies built under the registry lock.
pub(crate) async fn deliver(outbound: &Outbound, replies: Vec<crate::net::send::Outgoing>) {
    for r in replies {
        outbound.send_repeated(r.addr, r.text, r.repeats).await;
    }
}
