//! Connected viewers, owned by the transmission worker.
//!
//! The registry is mutated only from the worker task, so it needs no
//! locking. Other tasks read the live client count through a shared
//! atomic handle.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::sink::FrameSink;
use crate::ws::{ConnectionState, Deflater};

// ── ClientId ─────────────────────────────────────────────────────

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

impl ClientId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ClientId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

// ── Client ───────────────────────────────────────────────────────

/// One registered viewer.
pub struct Client {
    pub id: ClientId,
    pub peer: Option<SocketAddr>,
    pub state: ConnectionState,
    pub sink: Box<dyn FrameSink>,
    /// Outbound permessage-deflate stream, when negotiated.
    pub deflater: Option<Deflater>,
    /// Last frame this client received in full, for delta encoding.
    pub reference: Option<Vec<u8>>,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    /// Sends in a row that timed out before writing anything.
    pub stalled_sends: u32,
    /// Stops the connection's reader when the client is dropped.
    pub conn: CancellationToken,
}

impl Client {
    /// A freshly upgraded client. It opens once the worker registers it.
    pub fn new(id: ClientId, sink: Box<dyn FrameSink>) -> Self {
        let now = Instant::now();
        Self {
            id,
            peer: None,
            state: ConnectionState::Connecting,
            sink,
            deflater: None,
            reference: None,
            connected_at: now,
            last_activity: now,
            frames_sent: 0,
            bytes_sent: 0,
            stalled_sends: 0,
            conn: CancellationToken::new(),
        }
    }

    /// Tie the client to the token its reader task watches.
    pub fn with_connection(mut self, conn: CancellationToken) -> Self {
        self.conn = conn;
        self
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_deflater(mut self, deflater: Option<Deflater>) -> Self {
        self.deflater = deflater;
        self
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Mark the client closed, stop its reader and shut the write half.
    pub async fn teardown(&mut self) {
        self.state.force_close();
        self.conn.cancel();
        self.sink.shutdown().await;
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("deflate", &self.deflater.is_some())
            .field("frames_sent", &self.frames_sent)
            .finish()
    }
}

// ── ClientRegistry ───────────────────────────────────────────────

/// Bounded list of clients in registration order.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: Vec<Client>,
    capacity: usize,
    count: Arc<AtomicUsize>,
}

impl ClientRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: Vec::with_capacity(capacity),
            capacity,
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared view of [`len`](Self::len) for other tasks.
    pub fn count_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.count)
    }

    /// Add a client. Hands it back when full or when the id is taken.
    pub fn insert(&mut self, client: Client) -> Result<(), Client> {
        if self.is_full() || self.contains(client.id) {
            return Err(client);
        }
        self.clients.push(client);
        self.sync_count();
        Ok(())
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        let pos = self.clients.iter().position(|c| c.id == id)?;
        let client = self.clients.remove(pos);
        self.sync_count();
        Some(client)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.id == id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.iter().any(|c| c.id == id)
    }

    /// Ids in registration order, appended to `out`.
    pub fn ids_into(&self, out: &mut Vec<ClientId>) {
        out.extend(self.clients.iter().map(|c| c.id));
    }

    /// Remove every client.
    pub fn drain(&mut self) -> Vec<Client> {
        let all = std::mem::take(&mut self.clients);
        self.sync_count();
        all
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.capacity
    }

    fn sync_count(&self) {
        self.count.store(self.clients.len(), Ordering::Release);
    }
}
