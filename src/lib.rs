//! # Rendezvous Server
//!
//! UDP rendezvous server for NAT-traversal game sessions. Players exchange
//! short text datagrams with the server to discover each other's addresses
//! (mesh sessions) or to be paired with ports a session host opens for them
//! (relay sessions).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   RENDEZVOUS SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  codes.rs        - Collision-free session-code allocator     │
//! │                                                              │
//! │  model/          - Data model                                │
//! │  ├── player.rs   - Player / RelayPlayer, idle tracking       │
//! │  └── session.rs  - MeshSession / RelaySession                │
//! │                                                              │
//! │  registry.rs     - code→session and address→code indices     │
//! │                                                              │
//! │  net/            - Transport and wire protocol               │
//! │  ├── protocol.rs - Prefixes, error codes, parsers            │
//! │  ├── send.rs     - Reliable-send (fixed-interval repeats)    │
//! │  └── server.rs   - UDP socket loop + dispatcher              │
//! │                                                              │
//! │  handlers/       - Per-message state machines                │
//! │  ├── mesh.rs     - h/c/p/s/y/k/x                             │
//! │  └── relay.rs    - rh/rc/rp/rk/rx/nc                         │
//! │                                                              │
//! │  sweep.rs        - Session/player timeout sweeps             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery model
//!
//! Everything rides a single UDP socket. Requests are answered once;
//! notifications without an application-level ack (timeouts, kicks) are
//! resent a few times at a fixed interval, and the mesh start broadcast
//! retries until every player confirms or its budget runs out. All state is
//! in-memory and intentionally lost on restart.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod codes;
pub mod handlers;
pub mod model;
pub mod net;
pub mod registry;
pub mod sweep;

// Re-export commonly used types
pub use model::{MeshSession, Player, RelayPlayer, RelaySession};
pub use net::{Outbound, RendezvousServer, ServerConfig, ServerError};
pub use registry::{RegistryError, SessionRegistry, SharedRegistry};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
