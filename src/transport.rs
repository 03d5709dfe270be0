//! Peer connection pool.
//!
//! Each peer server connection is owned by the pool; a `parking_lot`
//! mutex around the connection's write half serializes concurrent sends
//! from different tasks, while reads are driven by whichever task holds
//! the connection's read half at the time it was established. A broken
//! connection causes the in-flight send to fail; the pool drops the
//! entry and lazily re-dials on the next send, rather than retrying
//! immediately.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::Framed;
use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::geometry::ServerId;
use crate::message::{Message, MessageCodec};

type Connection = Framed<TcpStream, MessageCodec>;

/// Maps cluster server ids to socket addresses and owns a lazily
/// established connection per peer.
pub struct ConnectionPool {
    peers: HashMap<ServerId, SocketAddr>,
    connections: dashmap::DashMap<ServerId, Arc<AsyncMutex<Connection>>>,
}

impl ConnectionPool {
    pub fn new(peers: HashMap<ServerId, SocketAddr>) -> Self {
        Self {
            peers,
            connections: dashmap::DashMap::new(),
        }
    }

    /// Sends `message` to `server_id`, dialing a fresh connection if
    /// none is cached or the cached one has gone bad.
    #[instrument(skip(self, message), fields(server_id))]
    pub async fn send(&self, server_id: ServerId, message: Message) -> Result<()> {
        let conn = self.get_or_connect(server_id).await?;
        let mut guard = conn.lock().await;
        if let Err(err) = guard.send(message).await {
            warn!(server_id, %err, "send failed, dropping connection");
            drop(guard);
            self.connections.remove(&server_id);
            return Err(err);
        }
        Ok(())
    }

    async fn get_or_connect(&self, server_id: ServerId) -> Result<Arc<AsyncMutex<Connection>>> {
        if let Some(conn) = self.connections.get(&server_id) {
            return Ok(conn.clone());
        }
        let addr = *self
            .peers
            .get(&server_id)
            .ok_or(Error::UnknownServer(server_id))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| Error::Transport { server_id, source })?;
        let framed = Framed::new(stream, MessageCodec);
        let conn = Arc::new(AsyncMutex::new(framed));
        self.connections.insert(server_id, conn.clone());
        Ok(conn)
    }

    /// Drops a cached connection, forcing the next send to re-dial.
    pub fn invalidate(&self, server_id: ServerId) {
        self.connections.remove(&server_id);
    }
}
