//! Session Registry
//!
//! Owns every live session of one variant and the two indices over them:
//! session code to session, and host address to session code. One registry
//! instance exists per variant (mesh, relay); both are constructed at
//! startup and handed by reference into every handler and sweep.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::error;

use crate::codes::CodeAllocator;
use crate::model::{MeshSession, RelaySession};

/// Registry lookup/creation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The source address already owns a session in this registry.
    #[error("address already owns a session")]
    AddressInUse,

    /// No session with the given code (or address) exists.
    #[error("no such session")]
    NoSuchSession,
}

/// A registry handle shared between handlers and sweeps.
pub type SharedRegistry<S> = Arc<RwLock<SessionRegistry<S>>>;

/// Construction and code access, implemented by each session variant so the
/// registry can manage either.
pub trait RegistrySession: Sized {
    /// Build a session of this variant with its host as the only player.
    fn open(
        code: String,
        host_name: &str,
        host_addr: SocketAddr,
        max_players: u8,
        password: Option<String>,
    ) -> Self;

    /// The allocator-assigned session code.
    fn code(&self) -> &str;
}

impl RegistrySession for MeshSession {
    fn open(
        code: String,
        host_name: &str,
        host_addr: SocketAddr,
        max_players: u8,
        password: Option<String>,
    ) -> Self {
        MeshSession::open(code, host_name, host_addr, max_players, password)
    }

    fn code(&self) -> &str {
        &self.core.code
    }
}

impl RegistrySession for RelaySession {
    fn open(
        code: String,
        host_name: &str,
        host_addr: SocketAddr,
        max_players: u8,
        password: Option<String>,
    ) -> Self {
        RelaySession::open(code, host_name, host_addr, max_players, password)
    }

    fn code(&self) -> &str {
        &self.core.code
    }
}

/// All live sessions of one variant.
#[derive(Debug, Default)]
pub struct SessionRegistry<S> {
    codes: CodeAllocator,
    by_code: HashMap<String, S>,
    by_addr: HashMap<SocketAddr, String>,
}

impl<S: RegistrySession> SessionRegistry<S> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            codes: CodeAllocator::new(),
            by_code: HashMap::new(),
            by_addr: HashMap::new(),
        }
    }

    /// Create a session for the given host. Fails with
    /// [`RegistryError::AddressInUse`] if the host address already owns a
    /// session here; both indices are updated together.
    pub fn create(
        &mut self,
        host_name: &str,
        host_addr: SocketAddr,
        max_players: u8,
        password: Option<String>,
    ) -> Result<&S, RegistryError> {
        if self.by_addr.contains_key(&host_addr) {
            return Err(RegistryError::AddressInUse);
        }

        let mut code = self.codes.allocate();
        while self.by_code.contains_key(&code) {
            // The allocator guarantees this cannot happen; a collision here
            // means its issued set and the registry disagree.
            error!(%code, "allocator produced a live session code, redrawing");
            code = self.codes.allocate();
        }

        let session = S::open(
            code.clone(),
            host_name,
            host_addr,
            max_players,
            password,
        );
        self.by_addr.insert(host_addr, code.clone());
        Ok(self.by_code.entry(code).or_insert(session))
    }

    /// Look up a session by code.
    pub fn get(&self, code: &str) -> Result<&S, RegistryError> {
        self.by_code.get(code).ok_or(RegistryError::NoSuchSession)
    }

    /// Look up a session by code, mutably.
    pub fn get_mut(&mut self, code: &str) -> Result<&mut S, RegistryError> {
        self.by_code
            .get_mut(code)
            .ok_or(RegistryError::NoSuchSession)
    }

    /// Look up the session owned by a source address.
    pub fn get_by_address(&self, addr: SocketAddr) -> Result<&S, RegistryError> {
        let code = self.by_addr.get(&addr).ok_or(RegistryError::NoSuchSession)?;
        match self.by_code.get(code) {
            Some(session) => Ok(session),
            None => {
                // Both indices are updated together, so this is a registry
                // bug, not a client error.
                error!(%code, %addr, "address index names a session the code index lacks");
                Err(RegistryError::NoSuchSession)
            }
        }
    }

    /// Like [`Self::get_by_address`], mutably.
    pub fn get_by_address_mut(&mut self, addr: SocketAddr) -> Result<&mut S, RegistryError> {
        let code = self
            .by_addr
            .get(&addr)
            .ok_or(RegistryError::NoSuchSession)?
            .clone();
        self.get_mut(&code)
    }

    /// Snapshot of all live session codes, for sweeps that mutate the
    /// registry while iterating.
    pub fn list_codes(&self) -> Vec<String> {
        self.by_code.keys().cloned().collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Delete a session: drop it from both indices and return its code to
    /// the allocator. Deleting an absent code is a silent no-op.
    pub fn delete(&mut self, code: &str) {
        if self.by_code.remove(code).is_some() {
            self.by_addr.retain(|_, owned| owned != code);
        }
        self.codes.release(code);
    }

    /// Repoint the address index after a host transfer, so the new host's
    /// address owns the session.
    pub fn update_address_for(
        &mut self,
        code: &str,
        new_addr: SocketAddr,
    ) -> Result<(), RegistryError> {
        if !self.by_code.contains_key(code) {
            return Err(RegistryError::NoSuchSession);
        }
        self.by_addr.retain(|_, owned| owned != code);
        self.by_addr.insert(new_addr, code.to_string());
        Ok(())
    }
}
