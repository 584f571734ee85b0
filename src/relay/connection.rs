use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::{RelayError, RelayResult};

/// Outcome of queueing one message for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The peer's queue was full; this message was skipped for it.
    Dropped,
    /// The peer's writer is gone.
    Closed,
}

/// One live WebSocket peer.
///
/// The socket itself belongs to the server task; the registry only holds
/// the sending half of the peer's outbound queue. A single writer task
/// drains that queue, which gives per-peer FIFO ordering.
pub struct Connection {
    id: Uuid,
    remote: SocketAddr,
    connected_at: DateTime<Utc>,
    open: AtomicBool,
    last_activity: Mutex<DateTime<Utc>>,
    client: Mutex<Option<String>>,
    outbound: mpsc::Sender<Arc<str>>,
}

impl Connection {
    /// New connection plus the receiving end its writer task drains.
    pub fn new(remote: SocketAddr, queue_depth: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let now = Utc::now();
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            remote,
            connected_at: now,
            open: AtomicBool::new(true),
            last_activity: Mutex::new(now),
            client: Mutex::new(None),
            outbound: tx,
        });
        (conn, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_client(&self, name: Option<String>) {
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = name;
    }

    pub fn client(&self) -> Option<String> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Queue without waiting.
    pub fn try_deliver(&self, message: Arc<str>) -> Delivery {
        if !self.open.load(Ordering::Acquire) {
            return Delivery::Closed;
        }
        match self.outbound.try_send(message) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Queue a direct reply to this peer.
    pub fn send(&self, message: impl Into<Arc<str>>) -> RelayResult<()> {
        match self.try_deliver(message.into()) {
            Delivery::Queued => Ok(()),
            Delivery::Dropped => Err(RelayError::DeliveryFailure(format!(
                "outbound queue full for {}",
                self.remote
            ))),
            Delivery::Closed => Err(RelayError::DeliveryFailure(format!(
                "connection {} is closed",
                self.remote
            ))),
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            remote: self.remote.to_string(),
            client: self.client(),
            connected_at: self.connected_at,
            last_activity: self.last_activity(),
        }
    }
}

/// Serializable view of a connection for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub remote: String,
    pub client: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}
