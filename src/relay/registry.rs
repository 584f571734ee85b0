//! Active connection set and broadcast fan-out

use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::connection::{Connection, ConnectionInfo, Delivery};
use super::protocol::CONNECTED_ACK;
use crate::buffer::BoundedBuffer;
use crate::errors::{RelayError, RelayResult};

/// Subscriber to relayed media messages (raw wire text).
pub type MediaTap = Arc<BoundedBuffer<Arc<str>>>;

/// Per-call result of [`Registry::broadcast`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub pruned: usize,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    pruned: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RelayStats {
    pub accepted: u64,
    pub broadcasts: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub pruned: u64,
}

/// The set of live peers. Only ever locked briefly and never across an
/// `.await`; delivery is a non-blocking queue push.
pub struct Registry {
    connections: Mutex<HashMap<Uuid, Arc<Connection>>>,
    taps: Mutex<Vec<MediaTap>>,
    max_connections: usize,
    counters: Counters,
}

impl Registry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            taps: Mutex::new(Vec::new()),
            max_connections: max_connections.max(1),
            counters: Counters::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a peer and queue the connection acknowledgement.
    pub fn register(&self, conn: Arc<Connection>) -> RelayResult<()> {
        {
            let mut connections = self.lock();
            if connections.len() >= self.max_connections {
                return Err(RelayError::DeliveryFailure(format!(
                    "connection limit of {} reached, refusing {}",
                    self.max_connections,
                    conn.remote()
                )));
            }
            connections.insert(conn.id(), conn.clone());
        }
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        log::info!("Client connected: {} ({})", conn.remote(), conn.id());
        conn.send(CONNECTED_ACK)
    }

    /// Remove a peer. Idempotent; returns whether it was present.
    pub fn unregister(&self, id: Uuid) -> bool {
        match self.lock().remove(&id) {
            Some(conn) => {
                conn.mark_closed();
                log::info!("Client disconnected: {} ({})", conn.remote(), id);
                true
            }
            None => false,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.lock().len() < self.max_connections
    }

    /// Queue `message` for every peer except the one at `exclude`.
    ///
    /// A peer whose queue is full misses this message but stays connected.
    /// A peer whose writer is gone is removed after the pass.
    pub fn broadcast(&self, message: Arc<str>, exclude: Option<SocketAddr>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut failed: Vec<Uuid> = Vec::new();

        let mut connections = self.lock();
        for (id, conn) in connections.iter() {
            if Some(conn.remote()) == exclude {
                continue;
            }
            match conn.try_deliver(message.clone()) {
                Delivery::Queued => report.delivered += 1,
                Delivery::Dropped => {
                    log::debug!("Outbound queue full for {}, dropping message", conn.remote());
                    report.dropped += 1;
                }
                Delivery::Closed => {
                    log::warn!(
                        "{}",
                        RelayError::DeliveryFailure(format!("{} is no longer reachable", conn.remote()))
                    );
                    failed.push(*id);
                }
            }
        }
        for id in failed {
            if let Some(conn) = connections.remove(&id) {
                conn.mark_closed();
                report.pruned += 1;
            }
        }
        drop(connections);

        self.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.counters
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.counters
            .pruned
            .fetch_add(report.pruned as u64, Ordering::Relaxed);
        report
    }

    /// Relay a media message to peers and local taps.
    pub fn publish_media(&self, message: Arc<str>, sender: Option<SocketAddr>) -> BroadcastReport {
        {
            let mut taps = self.taps.lock().unwrap_or_else(PoisonError::into_inner);
            taps.retain(|tap| !tap.is_closed());
            for tap in taps.iter() {
                tap.push(message.clone());
            }
        }
        self.broadcast(message, sender)
    }

    /// Subscribe to media messages. Closing the returned buffer unsubscribes.
    pub fn tap(&self, capacity: usize) -> MediaTap {
        let tap: MediaTap = Arc::new(BoundedBuffer::new(capacity));
        self.taps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tap.clone());
        tap
    }

    /// Close every tap so their consumers exit.
    pub fn close_taps(&self) {
        for tap in self.taps.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            tap.close();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self.lock().values().map(|c| c.info()).collect();
        infos.sort_by_key(|c| c.connected_at);
        infos
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.lock().get(&id).cloned()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            broadcasts: self.counters.broadcasts.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            pruned: self.counters.pruned.load(Ordering::Relaxed),
        }
    }
}
