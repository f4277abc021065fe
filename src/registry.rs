//! Server-side registry of connected clients.
//!
//! A single coarse lock guards the map from peer address to registered
//! client, so username reservation, roster snapshots and broadcast
//! enumeration each see one consistent membership. Broadcasts only enqueue
//! onto per-connection queues while holding the lock; the actual socket
//! writes happen in each session's own loop, so a slow peer cannot stall
//! logins. The queues are unbounded: a peer that stops reading grows its
//! queue for as long as its connection lives, trading memory for never
//! blocking under the lock.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::debug;

use crate::envelope::ServerEnvelope;

/// Sending side of a session's outbound queue. The session's select loop is
/// the only writer on its socket; everyone else delivers through this.
pub type Outbound = UnboundedSender<ServerEnvelope>;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("username already taken")]
    UsernameTaken,
}

#[derive(Debug, Default)]
pub struct Registry {
    clients: Mutex<HashMap<SocketAddr, RegisteredClient>>,
}

#[derive(Debug)]
struct RegisteredClient {
    username: String,
    outbound: Outbound,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `username` for the connection at `addr`. Usernames are compared
    /// byte for byte; at most one connection holds a given name at any time.
    pub async fn register(
        &self,
        addr: SocketAddr,
        username: &str,
        outbound: Outbound,
    ) -> Result<(), RegisterError> {
        let mut clients = self.clients.lock().await;
        if clients.values().any(|client| client.username == username) {
            return Err(RegisterError::UsernameTaken);
        }
        clients.insert(
            addr,
            RegisteredClient {
                username: username.to_string(),
                outbound,
            },
        );
        Ok(())
    }

    /// Removes the connection if present and returns its username. A second
    /// call for the same address is a no-op.
    pub async fn unregister(&self, addr: SocketAddr) -> Option<String> {
        let mut clients = self.clients.lock().await;
        clients.remove(&addr).map(|client| client.username)
    }

    /// Every registered username at a single instant, sorted so displays and
    /// tests see a stable order.
    pub async fn snapshot(&self) -> Vec<String> {
        let clients = self.clients.lock().await;
        let mut users: Vec<String> = clients
            .values()
            .map(|client| client.username.clone())
            .collect();
        users.sort();
        users
    }

    /// Queues `envelope` to every registered connection except `exclude`.
    ///
    /// A connection whose queue is closed is evicted here without a
    /// `user_left` notice; emitting that notice stays the job of the evicted
    /// connection's own session cleanup, which runs exactly once.
    pub async fn broadcast(&self, envelope: ServerEnvelope, exclude: Option<SocketAddr>) {
        let mut clients = self.clients.lock().await;
        let mut unreachable = Vec::new();
        for (addr, client) in clients.iter() {
            if Some(*addr) == exclude {
                continue;
            }
            if client.outbound.send(envelope.clone()).is_err() {
                unreachable.push(*addr);
            }
        }
        for addr in unreachable {
            if let Some(client) = clients.remove(&addr) {
                debug!(%addr, username = %client.username, "evicting unreachable client");
            }
        }
    }
}
