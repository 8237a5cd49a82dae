//! Registry of live client connections.
//!
//! A user may be connected from several devices at once; each socket gets
//! its own [`ConnectionId`] and [`ConnectionHandle`]. Users are spread over
//! independently locked shards so that fan-out to one user never waits on
//! registration traffic for another.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info};

use courier_shared::UserId;

const SHARD_COUNT: usize = 16;

/// Identifies one physical socket. Embeds the owning user so lookups by id
/// touch a single shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    user: UserId,
    seq: u64,
}

impl ConnectionId {
    pub fn user(&self) -> UserId {
        self.user
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.user, self.seq)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// Sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Arc<str>>,
    closed: Arc<Notify>,
}

/// Receiving half, drained by the socket's writer task.
pub struct OutboundQueue {
    rx: mpsc::Receiver<Arc<str>>,
    closed: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn channel(capacity: usize) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = Arc::new(Notify::new());
        (
            Self {
                tx,
                closed: closed.clone(),
            },
            OutboundQueue { rx, closed },
        )
    }

    /// Queue one serialized frame, waiting at most `timeout` for room.
    pub async fn write(&self, frame: Arc<str>, timeout: Duration) -> Result<(), DeliveryError> {
        match self.tx.send_timeout(frame, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed),
            Err(SendTimeoutError::Timeout(_)) => Err(DeliveryError::Timeout(timeout)),
        }
    }

    /// Ask the writer task to close the socket. Frames still queued are dropped.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl OutboundQueue {
    /// Next frame to send, or `None` once the handle was closed or every
    /// sender is gone.
    pub async fn next(&mut self) -> Option<Arc<str>> {
        tokio::select! {
            biased;
            _ = self.closed.notified() => None,
            frame = self.rx.recv() => frame,
        }
    }
}

struct Session {
    handle: ConnectionHandle,
    /// Milliseconds since the registry epoch.
    last_activity: AtomicI64,
}

type Shard = RwLock<HashMap<UserId, BTreeMap<ConnectionId, Arc<Session>>>>;

pub struct ConnectionRegistry {
    shards: Vec<Shard>,
    next_seq: AtomicU64,
    epoch: Instant,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            next_seq: AtomicU64::new(1),
            epoch: Instant::now(),
        }
    }

    fn shard(&self, user: UserId) -> &Shard {
        &self.shards[(user.0 as u64 % SHARD_COUNT as u64) as usize]
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    pub async fn register(&self, user: UserId, handle: ConnectionHandle) -> ConnectionId {
        let id = ConnectionId {
            user,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let session = Arc::new(Session {
            handle,
            last_activity: AtomicI64::new(self.now_ms()),
        });

        let mut shard = self.shard(user).write().await;
        let sessions = shard.entry(user).or_default();
        sessions.insert(id, session);
        debug!(user = %user, conn = %id, devices = sessions.len(), "Connection registered");
        id
    }

    /// Remove a connection and close its handle. Returns `false` if it was
    /// already gone.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let mut shard = self.shard(id.user).write().await;
        let Some(sessions) = shard.get_mut(&id.user) else {
            return false;
        };
        let Some(session) = sessions.remove(&id) else {
            return false;
        };
        if sessions.is_empty() {
            shard.remove(&id.user);
        }
        drop(shard);

        session.handle.close();
        debug!(user = %id.user, conn = %id, "Connection unregistered");
        true
    }

    /// Every live connection for `user`, ordered by connection id.
    pub async fn active_connections(&self, user: UserId) -> Vec<(ConnectionId, ConnectionHandle)> {
        let shard = self.shard(user).read().await;
        shard
            .get(&user)
            .map(|sessions| {
                sessions
                    .iter()
                    .map(|(id, s)| (*id, s.handle.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record activity on a connection.
    pub async fn touch(&self, id: ConnectionId) -> bool {
        let shard = self.shard(id.user).read().await;
        match shard.get(&id.user).and_then(|s| s.get(&id)) {
            Some(session) => {
                session.last_activity.store(self.now_ms(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Evict and close every connection idle for longer than `max_idle`,
    /// along with any whose writer has already gone away.
    pub async fn sweep_stale(&self, max_idle: Duration) -> usize {
        let cutoff = self.now_ms() - max_idle.as_millis() as i64;
        let mut evicted = Vec::new();

        for shard in &self.shards {
            let mut shard = shard.write().await;
            shard.retain(|_, sessions| {
                sessions.retain(|id, session| {
                    let idle = session.last_activity.load(Ordering::Relaxed) < cutoff
                        || session.handle.is_closed();
                    if idle {
                        evicted.push((*id, session.handle.clone()));
                    }
                    !idle
                });
                !sessions.is_empty()
            });
        }

        for (id, handle) in &evicted {
            handle.close();
            debug!(user = %id.user, conn = %id, "Evicted stale connection");
        }
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "Stale connection sweep finished");
        }
        evicted.len()
    }

    pub async fn connection_count(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.values().map(BTreeMap::len).sum::<usize>();
        }
        total
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users = Vec::new();
        for shard in &self.shards {
            users.extend(shard.read().await.keys().copied());
        }
        users.sort();
        users
    }

    /// Drop and close every connection. Used on shutdown.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for shard in &self.shards {
            let drained: Vec<_> = shard.write().await.drain().collect();
            for (_, sessions) in drained {
                for session in sessions.into_values() {
                    session.handle.close();
                    closed += 1;
                }
            }
        }
        if closed > 0 {
            info!(closed, "Closed all connections");
        }
        closed
    }
}
