//! Client transports
//!
//! The pump never touches sockets itself. Each client is served through the
//! [`Transport`] registered for its [`TransportKind`].

use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::camera::ConnectionId;
use crate::error::StreamStatus;
use crate::protocol::SEND_TIMEOUT;

/// Which transport a client connected through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Direct TCP from the native client
    Native,
    /// Tunnelled through a P2P relay
    P2p,
}

/// Delivery side of a client connection.
pub trait Transport: Send + Sync {
    /// Write one complete buffer, failing if it cannot finish within `timeout`.
    fn send(&self, conn: ConnectionId, data: &[u8], timeout: Duration) -> Result<()>;

    /// Release the connection.
    fn close(&self, conn: ConnectionId) -> Result<()>;

    /// Report a request outcome, optionally closing afterwards.
    fn respond(&self, status: StreamStatus, conn: ConnectionId, close_after: bool) -> Result<()>;
}

/// Transports by kind.
#[derive(Default, Clone)]
pub struct TransportTable {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl TransportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with(mut self, kind: TransportKind, transport: Arc<dyn Transport>) -> Self {
        self.register(kind, transport);
        self
    }

    pub fn register(&mut self, kind: TransportKind, transport: Arc<dyn Transport>) {
        self.transports.insert(kind, transport);
    }

    pub fn get(&self, kind: TransportKind) -> Option<&Arc<dyn Transport>> {
        self.transports.get(&kind)
    }
}

impl std::fmt::Debug for TransportTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.transports.keys()).finish()
    }
}

// ========== TCP ==========

/// Blocking TCP transport keyed by connection id.
///
/// Every connection should own its socket: closing one shuts the socket down
/// for every handle cloned from it.
#[derive(Debug, Default)]
pub struct TcpTransport {
    streams: Mutex<HashMap<ConnectionId, Arc<TcpStream>>>,
    next_id: AtomicU64,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of an accepted socket.
    pub fn register(&self, stream: TcpStream) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let _ = stream.set_nodelay(true);
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(stream));
        id
    }

    pub fn connections(&self) -> usize {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    // Writes happen outside the map lock so one slow client never blocks the others.
    fn handle(&self, conn: ConnectionId) -> Result<Arc<TcpStream>> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&conn)
            .cloned()
            .with_context(|| format!("Unknown connection {}", conn))
    }
}

/// Write all of `data` before `timeout` runs out, however the writes split.
fn write_within(stream: &TcpStream, mut data: &[u8], timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut writer = stream;
    while !data.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            anyhow::bail!("timed out with {} bytes unsent", data.len());
        }
        stream.set_write_timeout(Some(remaining))?;
        match writer.write(data) {
            Ok(0) => anyhow::bail!("connection closed by peer"),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

impl Transport for TcpTransport {
    fn send(&self, conn: ConnectionId, data: &[u8], timeout: Duration) -> Result<()> {
        let stream = self.handle(conn)?;
        write_within(&stream, data, timeout).with_context(|| format!("Send to {} failed", conn))
    }

    fn close(&self, conn: ConnectionId) -> Result<()> {
        let stream = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&conn);
        match stream {
            Some(stream) => {
                debug!(%conn, "Closing TCP connection");
                // Peer may already be gone
                let _ = stream.shutdown(Shutdown::Both);
                Ok(())
            }
            None => anyhow::bail!("Unknown connection {}", conn),
        }
    }

    fn respond(&self, status: StreamStatus, conn: ConnectionId, close_after: bool) -> Result<()> {
        let stream = self.handle(conn)?;
        let line = format!("STATUS {} {}\n", status.as_u8(), status);
        let result = write_within(&stream, line.as_bytes(), SEND_TIMEOUT)
            .with_context(|| format!("Respond to {} failed", conn));
        if close_after {
            self.close(conn)?;
        }
        result
    }
}

// ========== In-memory ==========

/// Something a [`MemoryTransport`] was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Sent { conn: ConnectionId, data: Bytes },
    Closed { conn: ConnectionId },
    Responded { conn: ConnectionId, status: StreamStatus, close_after: bool },
}

impl TransportEvent {
    pub fn conn(&self) -> ConnectionId {
        match self {
            TransportEvent::Sent { conn, .. }
            | TransportEvent::Closed { conn }
            | TransportEvent::Responded { conn, .. } => *conn,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    events: Vec<TransportEvent>,
    failing: Vec<ConnectionId>,
}

/// Transport that records everything in order instead of sending it.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    changed: Condvar,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later send on `conn` fail.
    pub fn fail_sends(&self, conn: ConnectionId) {
        self.lock().failing.push(conn);
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.lock().events.clone()
    }

    /// Events concerning one connection.
    pub fn events_for(&self, conn: ConnectionId) -> Vec<TransportEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.conn() == conn)
            .cloned()
            .collect()
    }

    /// Buffers sent on one connection.
    pub fn sent(&self, conn: ConnectionId) -> Vec<Bytes> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Sent { conn: c, data } if *c == conn => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Statuses reported to one connection.
    pub fn responses(&self, conn: ConnectionId) -> Vec<StreamStatus> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Responded { conn: c, status, .. } if *c == conn => Some(*status),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self, conn: ConnectionId) -> bool {
        self.lock()
            .events
            .iter()
            .any(|e| matches!(e, TransportEvent::Closed { conn: c } if *c == conn))
    }

    /// Block until `predicate` holds over the recorded events or `timeout` passes.
    pub fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&[TransportEvent]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if predicate(&state.events) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, event: TransportEvent) {
        self.lock().events.push(event);
        self.changed.notify_all();
    }
}

impl Transport for MemoryTransport {
    fn send(&self, conn: ConnectionId, data: &[u8], _timeout: Duration) -> Result<()> {
        if self.lock().failing.contains(&conn) {
            anyhow::bail!("Send to {} failed: connection reset", conn);
        }
        self.record(TransportEvent::Sent {
            conn,
            data: Bytes::copy_from_slice(data),
        });
        Ok(())
    }

    fn close(&self, conn: ConnectionId) -> Result<()> {
        self.record(TransportEvent::Closed { conn });
        Ok(())
    }

    fn respond(&self, status: StreamStatus, conn: ConnectionId, close_after: bool) -> Result<()> {
        self.record(TransportEvent::Responded {
            conn,
            status,
            close_after,
        });
        if close_after {
            self.close(conn)?;
        }
        Ok(())
    }
}
