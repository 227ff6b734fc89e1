//! The change-stream consumer.
//!
//! The management API publishes a JSON event on the `event` channel
//! for every zone and record mutation.  This consumer translates each
//! one into cache invalidations and filter updates, so the query plane
//! converges on control-plane edits without polling the store.
//!
//! Record edits only ever invalidate.  Zone creations insert into the
//! filter additively.  Zone deletions cannot be removed from a Bloom
//! filter, so they schedule a rebuild instead: immediately once enough
//! deletions pile up, otherwise after a quiet period, whichever comes
//! first.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, sleep_until, Instant};

use crate::cache::ZoneCache;
use crate::filter::ZoneFilter;
use crate::store::ZoneStore;

/// The pub/sub channel the control plane publishes on.
pub const EVENT_CHANNEL: &str = "event";

/// Rebuild the filter as soon as this many deletions have accumulated.
pub const REBUILD_DELETION_THRESHOLD: u32 = 10;

/// Otherwise rebuild once deletions have been quiet for this long.
pub const REBUILD_DEBOUNCE: Duration = Duration::from_secs(10);

/// How long to wait before redialling a lost subscription.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// A single change-stream message.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub zone_name: String,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DnsRecordCreate,
    DnsRecordUpdate,
    DnsRecordDelete,
    ZoneCreate,
    ZoneUpdate,
    ZoneDelete,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event bus operation failed: {0}")]
    Bus(#[from] redis::RedisError),

    #[error("could not encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The publishing half, used by the activation checker to announce
/// zones it has flipped active.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &ChangeEvent) -> Result<(), EventError>;
}

/// Publishes events on the same channel the consumer subscribes to.
#[derive(Clone)]
pub struct RedisEventPublisher {
    connection: redis::aio::ConnectionManager,
}

impl RedisEventPublisher {
    pub fn new(connection: redis::aio::ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl EventPublisher for RedisEventPublisher {
    async fn publish(&self, event: &ChangeEvent) -> Result<(), EventError> {
        let payload = serde_json::to_vec(event)?;
        let mut connection = self.connection.clone();
        redis::AsyncCommands::publish::<_, _, ()>(&mut connection, EVENT_CHANNEL, payload).await?;
        Ok(())
    }
}

/// The long-running consumer task.  Owns the deletion counter and the
/// debounce deadline, so rebuild triggers are naturally serialized.
pub struct EventConsumer {
    client: redis::Client,
    cache: Arc<ZoneCache>,
    filter: Arc<ZoneFilter>,
    store: Arc<dyn ZoneStore>,
    deletions: u32,
    rebuild_deadline: Option<Instant>,
}

impl EventConsumer {
    pub fn new(
        client: redis::Client,
        cache: Arc<ZoneCache>,
        filter: Arc<ZoneFilter>,
        store: Arc<dyn ZoneStore>,
    ) -> Self {
        Self {
            client,
            cache,
            filter,
            store,
            deletions: 0,
            rebuild_deadline: None,
        }
    }

    /// Consume for the lifetime of the process, redialling the bus
    /// whenever the subscription drops.
    pub async fn run(mut self) {
        loop {
            match self.subscribe_and_consume().await {
                Ok(()) => tracing::warn!("event subscription closed"),
                Err(error) => tracing::warn!(?error, "event subscription lost"),
            }
            sleep(RESUBSCRIBE_DELAY).await;
        }
    }

    async fn subscribe_and_consume(&mut self) -> Result<(), redis::RedisError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(EVENT_CHANNEL).await?;
        tracing::info!(channel = EVENT_CHANNEL, "subscribed to change stream");

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                message = messages.next() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    self.handle_payload(message.get_payload_bytes()).await;
                }

                () = wait_for(self.rebuild_deadline) => {
                    self.rebuild().await;
                }
            }
        }
    }

    async fn handle_payload(&mut self, payload: &[u8]) {
        match serde_json::from_slice::<ChangeEvent>(payload) {
            Ok(event) => self.apply(event).await,
            Err(error) => {
                tracing::warn!(?error, "skipping malformed change event");
            }
        }
    }

    /// Apply one event.  Public so the policy can be tested without a
    /// running bus.
    pub async fn apply(&mut self, event: ChangeEvent) {
        tracing::debug!(kind = ?event.kind, zone_name = %event.zone_name, "change event");

        match event.kind {
            EventKind::DnsRecordCreate | EventKind::DnsRecordUpdate | EventKind::DnsRecordDelete => {
                self.cache.invalidate(&event.zone_name);
            }
            EventKind::ZoneCreate => {
                self.filter.insert(&event.zone_name);
            }
            EventKind::ZoneUpdate => {
                self.cache.invalidate(&event.zone_name);
            }
            EventKind::ZoneDelete => {
                self.cache.invalidate(&event.zone_name);
                self.deletions += 1;
                if self.deletions >= REBUILD_DELETION_THRESHOLD {
                    self.rebuild().await;
                } else {
                    self.rebuild_deadline = Some(Instant::now() + REBUILD_DEBOUNCE);
                }
            }
        }
    }

    /// Rebuild the filter from a fresh store scan and reset both
    /// rebuild triggers.
    async fn rebuild(&mut self) {
        self.deletions = 0;
        self.rebuild_deadline = None;

        match self.store.active_zone_names().await {
            Ok(names) => {
                let count = names.len();
                self.filter.replace_with(names);
                tracing::info!(zones = count, "rebuilt zone filter");
            }
            Err(error) => {
                // leave the stale filter in place and try again after
                // another quiet period
                tracing::error!(?error, "could not rebuild zone filter");
                self.rebuild_deadline = Some(Instant::now() + REBUILD_DEBOUNCE);
            }
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
