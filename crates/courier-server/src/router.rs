//! Message delivery: persist first, then push to whoever is online.
//!
//! The ledger commit is the point of no return. Once it succeeds the message
//! exists for every recipient (their unread counters were bumped in the same
//! transaction), so a failed or missing live push only costs latency, never
//! the message. Pushes to a single sender→target stream are serialized so
//! recipients observe messages in commit order.
//!
//! Commit and fan-out run in their own task. A caller that stops waiting
//! (a dropped HTTP request, a closed socket) does not cancel them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use courier_shared::protocol::{SendRequest, ServerFrame};
use courier_shared::{Target, UserId};
use courier_store::{Message, NewMessage, PostedMessage};

use crate::connections::{ConnectionId, ConnectionRegistry};
use crate::db::SharedDb;
use crate::error::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Every recipient had a live connection and every push succeeded.
    Delivered,
    /// Persisted, but at least one recipient was offline or a push failed.
    /// Those recipients pick the message up from their unread counters.
    PartiallyDelivered,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub message: Message,
    pub status: DeliveryStatus,
    pub online_recipients: Vec<UserId>,
    pub offline_recipients: Vec<UserId>,
    pub delivered_connections: usize,
    pub failed_connections: usize,
}

type StreamKey = (UserId, Target);

pub struct DeliveryRouter {
    db: SharedDb,
    registry: Arc<ConnectionRegistry>,
    push_timeout: Duration,
    streams: Mutex<HashMap<StreamKey, Arc<AsyncMutex<()>>>>,
}

/// Exclusive turn on one sender→target stream. Dropping it releases the
/// turn and forgets the stream once nobody else is waiting on it.
struct StreamTurn<'a> {
    router: &'a DeliveryRouter,
    key: StreamKey,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for StreamTurn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        if let Ok(mut streams) = self.router.streams.lock() {
            // One count for the map, one for us.
            if Arc::strong_count(&self.lock) == 2 {
                streams.remove(&self.key);
            }
        }
    }
}

impl DeliveryRouter {
    pub fn new(db: SharedDb, registry: Arc<ConnectionRegistry>, push_timeout: Duration) -> Self {
        Self {
            db,
            registry,
            push_timeout,
            streams: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    async fn take_turn(&self, key: StreamKey) -> Result<StreamTurn<'_>, ServerError> {
        let lock = {
            let mut streams = self
                .streams
                .lock()
                .map_err(|_| ServerError::Internal("Stream lock table poisoned".into()))?;
            streams.entry(key).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        Ok(StreamTurn {
            router: self,
            key,
            lock,
            guard: Some(guard),
        })
    }

    /// Validate, persist and fan out one message from `from`.
    ///
    /// Errors mean nothing was persisted. Once persisted, delivery problems
    /// are reported in the [`DeliveryReport`] instead. Dropping the returned
    /// future after validation does not stop the message.
    pub async fn send(
        self: &Arc<Self>,
        from: UserId,
        request: SendRequest,
    ) -> Result<DeliveryReport, ServerError> {
        let target = request.validate()?;
        let new = NewMessage {
            from_user_id: from,
            target,
            content: request.content,
            msg_type: request.msg_type,
            attachments: request.attachments,
        };

        let router = Arc::clone(self);
        tokio::spawn(async move {
            let _turn = router.take_turn((from, target)).await?;
            let posted = router.db.call(move |db| db.post_message(&new)).await?;
            router.fan_out(posted).await
        })
        .await
        .map_err(|e| ServerError::Internal(format!("Delivery task failed: {e}")))?
    }

    async fn fan_out(&self, posted: PostedMessage) -> Result<DeliveryReport, ServerError> {
        let PostedMessage {
            message,
            recipients,
        } = posted;

        let frame: Arc<str> = ServerFrame::Message(message.to_event())
            .to_json()
            .map_err(|e| ServerError::Internal(format!("Failed to encode message event: {e}")))?
            .into();

        let mut online_recipients = Vec::new();
        let mut offline_recipients = Vec::new();
        let mut pushes = Vec::new();

        for recipient in recipients {
            let connections = self.registry.active_connections(recipient).await;
            if connections.is_empty() {
                offline_recipients.push(recipient);
                continue;
            }
            online_recipients.push(recipient);
            for (id, handle) in connections {
                let frame = frame.clone();
                let timeout = self.push_timeout;
                pushes.push(async move { (id, handle.write(frame, timeout).await) });
            }
        }

        let mut delivered_connections = 0;
        let mut failed: Vec<ConnectionId> = Vec::new();
        for (id, result) in join_all(pushes).await {
            match result {
                Ok(()) => delivered_connections += 1,
                Err(e) => {
                    warn!(user = %id.user(), conn = %id, msg = %message.id, error = %e, "Push failed, evicting connection");
                    failed.push(id);
                }
            }
        }
        for id in &failed {
            self.registry.unregister(*id).await;
        }

        let status = if offline_recipients.is_empty() && failed.is_empty() {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::PartiallyDelivered
        };

        debug!(
            msg = %message.id,
            from = %message.from_user_id,
            target = %message.target,
            online = online_recipients.len(),
            offline = offline_recipients.len(),
            delivered = delivered_connections,
            failed = failed.len(),
            "Message routed"
        );

        Ok(DeliveryReport {
            message,
            status,
            online_recipients,
            offline_recipients,
            delivered_connections,
            failed_connections: failed.len(),
        })
    }
}
