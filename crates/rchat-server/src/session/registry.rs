//! Registry of admitted sessions.
//!
//! Every admitted session registers its outbound queue and close signal here.
//! Broadcast fans chat and file frames out to the other authenticated
//! sessions; shutdown closes everything registered.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info};

/// Outbound side of one session, as seen by the rest of the server.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    addr: SocketAddr,
    outbound: mpsc::Sender<String>,
    closer: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    pub fn new(
        addr: SocketAddr,
        outbound: mpsc::Sender<String>,
        closer: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            addr,
            outbound,
            closer,
        }
    }

    /// Queue a wire line for this session. `false` once its writer is gone.
    pub async fn send(&self, line: String) -> bool {
        self.outbound.send(line).await.is_ok()
    }

    /// Queue a line without waiting. `false` if the queue is full or gone.
    pub fn try_send(&self, line: String) -> bool {
        match self.outbound.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(remote = %self.addr, "outbound queue full, line dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the session to end. Idempotent.
    pub fn close(&self) {
        self.closer.send_replace(true);
    }
}

#[derive(Debug)]
struct Entry {
    handle: SessionHandle,
    /// Set once the session has authenticated.
    username: Option<String>,
}

/// Snapshot of a registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub addr: SocketAddr,
    pub username: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<SocketAddr, Entry>,
    /// Set by `close_all`; no registrations afterwards.
    closed: bool,
}

/// Live sessions keyed by remote address.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Refused (`false`) after [`SessionRegistry::close_all`].
    pub async fn register(&self, handle: SessionHandle) -> bool {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return false;
        }
        let addr = handle.addr;
        inner.sessions.insert(
            addr,
            Entry {
                handle,
                username: None,
            },
        );
        debug!(remote = %addr, total = inner.sessions.len(), "session registered");
        true
    }

    /// Mark a registered session as authenticated, making it a broadcast target.
    pub async fn activate(&self, addr: SocketAddr, username: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(&addr) {
            Some(entry) => {
                entry.username = Some(username.to_string());
                true
            }
            None => false,
        }
    }

    /// Remove a session. Removing an unknown address is a no-op.
    pub async fn deregister(&self, addr: SocketAddr) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner.sessions.remove(&addr).is_some();
        if removed {
            debug!(remote = %addr, total = inner.sessions.len(), "session deregistered");
        }
        removed
    }

    /// Deliver `line` to every authenticated session except `exclude`.
    ///
    /// Recipients are snapshotted first so a slow queue does not hold the
    /// registry lock. Returns how many sessions accepted the line.
    pub async fn broadcast(&self, line: &str, exclude: SocketAddr) -> usize {
        let targets = self.authenticated_except(Some(exclude)).await;
        let mut delivered = 0;
        for handle in targets {
            if handle.send(line.to_string()).await {
                delivered += 1;
            } else {
                debug!(remote = %handle.addr, "broadcast target already gone");
            }
        }
        delivered
    }

    async fn authenticated_except(&self, exclude: Option<SocketAddr>) -> Vec<SessionHandle> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .filter(|e| e.username.is_some() && Some(e.handle.addr) != exclude)
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Refuse further registrations, queue `farewell` (if any) for each
    /// authenticated session, then signal every session to close.
    ///
    /// Never waits on a session: a full outbound queue misses the farewell.
    /// Returns how many sessions were signalled.
    pub async fn close_all(&self, farewell: Option<String>) -> usize {
        let mut inner = self.inner.write().await;
        inner.closed = true;

        for entry in inner.sessions.values() {
            if let (Some(line), Some(_)) = (&farewell, &entry.username) {
                entry.handle.try_send(line.clone());
            }
            entry.handle.close();
        }
        info!(count = inner.sessions.len(), "closed all sessions");
        inner.sessions.len()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .map(|e| SessionInfo {
                addr: e.handle.addr,
                username: e.username.clone(),
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}
