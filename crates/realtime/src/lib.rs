//! Realtime pub/sub transports for the RPA orchestrator (spec §4.6).
//!
//! Generalizes the transactional-outbox idea the teacher crate's name
//! promised — "reliably publish alongside a durable write" — into two
//! concrete [`rpa_orchestrator_core::realtime::RealtimeChannel`]
//! implementations:
//!
//! - [`InProcessChannel`]: a `tokio::sync::broadcast` fan-out for a
//!   single-process orchestrator or tests, grounded on the teacher's own
//!   `EventBus` (broadcast-channel-per-topic, at-most-once, lagged
//!   subscribers drop events rather than block the publisher).
//! - [`PgListenChannel`]: `LISTEN`/`NOTIFY` over a dedicated
//!   `sqlx::postgres::PgListener` connection, for orchestrator instances
//!   that must observe jobs claimed/settled by peers.
//!
//! Both degrade to "publish is advisory" (spec §4.6): a publish failure is
//! logged, never propagated to the caller that triggered the state change.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rpa_orchestrator_core::error::RealtimeError;
use rpa_orchestrator_core::realtime::{RealtimeChannel, RealtimeEvent, Subscription};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// In-memory broadcast fan-out, one `broadcast::Sender` per topic created
/// on first use. Suitable for a single orchestrator process or tests; does
/// not cross process boundaries.
pub struct InProcessChannel {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<RealtimeEvent>>>,
}

impl InProcessChannel {
    pub fn new() -> Self {
        InProcessChannel::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        InProcessChannel {
            capacity,
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<RealtimeEvent> {
        let mut topics = self.topics.lock().expect("realtime topic map poisoned");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InProcessChannel {
    fn default() -> Self {
        Self::new()
    }
}

struct InProcessSubscription {
    rx: broadcast::Receiver<RealtimeEvent>,
}

#[async_trait]
impl Subscription for InProcessSubscription {
    async fn recv(&mut self) -> Result<RealtimeEvent, RealtimeError> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                // At-most-once delivery (spec §4.6): a lagged subscriber
                // skips the events it missed rather than erroring out.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "realtime subscriber lagged, dropping skipped events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(RealtimeError::Closed),
            }
        }
    }
}

#[async_trait]
impl RealtimeChannel for InProcessChannel {
    async fn publish(&self, event: RealtimeEvent) -> Result<(), RealtimeError> {
        let sender = self.sender_for(event.topic());
        // No subscribers is not an error: publish is fire-and-forget.
        let _ = sender.send(event);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, RealtimeError> {
        let sender = self.sender_for(topic);
        Ok(Box::new(InProcessSubscription { rx: sender.subscribe() }))
    }
}

/// `LISTEN`/`NOTIFY`-backed channel for multi-instance orchestrator
/// deployments. Payloads are JSON-encoded [`RealtimeEvent`]s; publishing
/// uses `pg_notify` so it composes inside a transaction the way the
/// outbox pattern intends, without a separate outbox table.
pub struct PgListenChannel {
    pool: sqlx::PgPool,
}

impl PgListenChannel {
    pub fn new(pool: sqlx::PgPool) -> Self {
        PgListenChannel { pool }
    }
}

struct PgListenSubscription {
    listener: sqlx::postgres::PgListener,
}

#[async_trait]
impl Subscription for PgListenSubscription {
    async fn recv(&mut self) -> Result<RealtimeEvent, RealtimeError> {
        loop {
            let notification = self
                .listener
                .recv()
                .await
                .map_err(|e| RealtimeError::Transient(e.into()))?;
            match serde_json::from_str::<RealtimeEvent>(notification.payload()) {
                Ok(event) => return Ok(event),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed realtime notification payload");
                    continue;
                }
            }
        }
    }
}

#[async_trait]
impl RealtimeChannel for PgListenChannel {
    async fn publish(&self, event: RealtimeEvent) -> Result<(), RealtimeError> {
        let payload = serde_json::to_string(&event).map_err(|e| RealtimeError::Transient(e.into()))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(event.topic())
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| RealtimeError::Transient(e.into()))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, RealtimeError> {
        let mut listener = sqlx::postgres::PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| RealtimeError::Transient(e.into()))?;
        listener.listen(topic).await.map_err(|e| RealtimeError::Transient(e.into()))?;
        Ok(Box::new(PgListenSubscription { listener }))
    }
}
