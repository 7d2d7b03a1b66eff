//! Networking: wire protocol, outbound sending, and the UDP server loop.

pub mod protocol;
pub mod send;
pub mod server;

pub use send::Outbound;
pub use server::{RendezvousServer, ServerConfig, ServerError};
