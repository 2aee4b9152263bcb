//! Live validator connections on a proposer
//!
//! The registry lives as long as the proposer's server. A session is added
//! when a stream is accepted, bound to a signer after a successful login, and
//! removed when the stream closes.
//!
//! A login is single-use: each `(account, timestamp)` pair binds at most one
//! stream, and a fresh login for an account displaces its previous stream.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy::primitives::Address;
use tokio::sync::{mpsc, RwLock};

/// Lines buffered per stream before a slow reader starts losing proposals
pub const OUTBOUND_QUEUE: usize = 256;

/// Identity of one accepted stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
struct Session {
    peer: SocketAddr,
    signer: Option<Address>,
    outbound: mpsc::Sender<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
    #[error("login was already used")]
    Replayed,
    #[error("stream is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct Registry {
    sessions: HashMap<ConnectionId, Session>,
    used_logins: HashSet<(Address, u64)>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new stream; lines sent to `outbound` are written to it
    pub async fn register(
        &self,
        peer: SocketAddr,
        outbound: mpsc::Sender<String>,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner.write().await.sessions.insert(
            id,
            Session {
                peer,
                signer: None,
                outbound,
            },
        );
        id
    }

    /// Consume the login `(signer, timestamp)` and bind the stream to
    /// `signer`. Logins with a timestamp before `oldest_valid` can no longer
    /// pass the freshness check and are forgotten. Returns the stream this
    /// login displaced, if the account was bound elsewhere.
    pub async fn claim_login(
        &self,
        id: ConnectionId,
        signer: Address,
        timestamp: u64,
        oldest_valid: u64,
    ) -> Result<Option<ConnectionId>, ClaimError> {
        let mut registry = self.inner.write().await;
        registry.used_logins.retain(|(_, ts)| *ts >= oldest_valid);
        if !registry.sessions.contains_key(&id) {
            return Err(ClaimError::Closed);
        }
        if !registry.used_logins.insert((signer, timestamp)) {
            return Err(ClaimError::Replayed);
        }

        let displaced = registry
            .sessions
            .iter()
            .find(|(other, s)| **other != id && s.signer == Some(signer))
            .map(|(other, _)| *other);
        if let Some(other) = displaced {
            registry.sessions.remove(&other);
        }
        if let Some(session) = registry.sessions.get_mut(&id) {
            session.signer = Some(signer);
        }
        Ok(displaced)
    }

    pub async fn signer(&self, id: ConnectionId) -> Option<Address> {
        self.inner.read().await.sessions.get(&id).and_then(|s| s.signer)
    }

    pub async fn peer(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.inner.read().await.sessions.get(&id).map(|s| s.peer)
    }

    pub async fn remove(&self, id: ConnectionId) {
        self.inner.write().await.sessions.remove(&id);
    }

    /// Queue a line on every authenticated stream; returns how many took it.
    /// A stream whose queue is full skips this line.
    pub async fn broadcast_authenticated(&self, line: &str) -> usize {
        let registry = self.inner.read().await;
        registry
            .sessions
            .values()
            .filter(|s| s.signer.is_some())
            .filter(|s| s.outbound.try_send(line.to_string()).is_ok())
            .count()
    }

    pub async fn authenticated_count(&self) -> usize {
        self.inner
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.signer.is_some())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
