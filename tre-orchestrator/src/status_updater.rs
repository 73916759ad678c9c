//! Generic status update loop
//!
//! A [`StatusUpdater`] drains one inbound queue: it leases a message,
//! decodes it into its handler's event type, lets the handler apply it and
//! then settles the message. Malformed messages are dead-lettered, events
//! that no longer apply are acknowledged and dropped, and anything that
//! failed for a transient reason is left unacknowledged so the lease
//! expires and the channel redelivers it.
//!
//! Shutdown is only observed while waiting for the next message. A message
//! that has been received is always processed to the end.

use crate::channel::{MessageChannel, ReceivedMessage};
use crate::error::{OrchestratorError, Result};
use crate::operation::decode_event;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What a handler did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The event is stale or no longer applies. The reason is logged.
    Discarded(String),
}

/// How a received message was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    Acknowledged,
    DeadLettered,
    /// Left for redelivery after the lease expires
    Unacknowledged,
}

#[async_trait]
pub trait StatusHandler: Send + Sync {
    type Event: DeserializeOwned + Send + Sync + fmt::Debug;

    /// Short name used in log events
    fn name(&self) -> &'static str;

    /// Apply one decoded event. `NotFound` is treated as a discard; other
    /// errors leave the message for redelivery.
    async fn apply(&self, event: &Self::Event) -> Result<Outcome>;
}

#[derive(Debug, Default)]
pub struct UpdaterStats {
    received: AtomicU64,
    applied: AtomicU64,
    discarded: AtomicU64,
    dead_lettered: AtomicU64,
    unacknowledged: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdaterStatsSnapshot {
    pub received: u64,
    pub applied: u64,
    pub discarded: u64,
    pub dead_lettered: u64,
    pub unacknowledged: u64,
}

impl UpdaterStats {
    pub fn snapshot(&self) -> UpdaterStatsSnapshot {
        UpdaterStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            unacknowledged: self.unacknowledged.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct StatusUpdater<H> {
    channel: Arc<dyn MessageChannel>,
    queue: String,
    handler: H,
    stats: Arc<UpdaterStats>,
    error_backoff: Duration,
}

impl<H: StatusHandler> StatusUpdater<H> {
    pub fn new(channel: Arc<dyn MessageChannel>, queue: impl Into<String>, handler: H) -> Self {
        Self {
            channel,
            queue: queue.into(),
            handler,
            stats: Arc::new(UpdaterStats::default()),
            error_backoff: Duration::from_secs(1),
        }
    }

    /// Pause after the channel itself fails to deliver
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Counters shared with the running loop
    pub fn stats(&self) -> Arc<UpdaterStats> {
        self.stats.clone()
    }

    /// Process one leased message to completion.
    pub async fn process(&self, message: ReceivedMessage) -> MessageDisposition {
        UpdaterStats::bump(&self.stats.received);
        let handler = self.handler.name();

        let event: H::Event = match decode_event(&message.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    handler,
                    message_id = %message.id,
                    error = %e,
                    "Dead-lettering malformed message"
                );
                return match self.channel.dead_letter(&message, &e.to_string()).await {
                    Ok(()) => {
                        UpdaterStats::bump(&self.stats.dead_lettered);
                        MessageDisposition::DeadLettered
                    }
                    Err(dl_error) => {
                        error!(
                            handler,
                            message_id = %message.id,
                            error = %dl_error,
                            "Failed to dead-letter message"
                        );
                        UpdaterStats::bump(&self.stats.unacknowledged);
                        MessageDisposition::Unacknowledged
                    }
                };
            }
        };

        debug!(
            handler,
            message_id = %message.id,
            delivery = message.delivery_count,
            ?event,
            "Applying event"
        );

        match self.handler.apply(&event).await {
            Ok(Outcome::Applied) => {
                UpdaterStats::bump(&self.stats.applied);
            }
            Ok(Outcome::Discarded(reason)) => {
                warn!(handler, message_id = %message.id, %reason, "Discarding event");
                UpdaterStats::bump(&self.stats.discarded);
            }
            Err(OrchestratorError::NotFound(what)) => {
                warn!(
                    handler,
                    message_id = %message.id,
                    %what,
                    "Discarding event for unknown target"
                );
                UpdaterStats::bump(&self.stats.discarded);
            }
            Err(e) => {
                error!(
                    handler,
                    message_id = %message.id,
                    delivery = message.delivery_count,
                    error = %e,
                    "Failed to apply event, leaving it for redelivery"
                );
                UpdaterStats::bump(&self.stats.unacknowledged);
                return MessageDisposition::Unacknowledged;
            }
        }

        match self.channel.acknowledge(&message).await {
            Ok(()) => MessageDisposition::Acknowledged,
            Err(e) => {
                // Redelivery re-applies an idempotent update
                warn!(
                    handler,
                    message_id = %message.id,
                    error = %e,
                    "Failed to acknowledge message"
                );
                UpdaterStats::bump(&self.stats.unacknowledged);
                MessageDisposition::Unacknowledged
            }
        }
    }

    /// Receive and process messages until `shutdown` turns true or its
    /// sender goes away. Returns the final counters.
    ///
    /// A message already being processed finishes before the loop exits.
    /// Shutdown that lands while `receive` is claiming a message drops the
    /// claim half-way: the message stays leased with its delivery count
    /// bumped and only comes back once the lease expires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> UpdaterStatsSnapshot {
        let handler = self.handler.name();
        info!(handler, queue = %self.queue, "Status updater started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let received = tokio::select! {
                result = self.channel.receive(&self.queue) => result,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match received {
                Ok(message) => {
                    self.process(message).await;
                }
                Err(e) => {
                    error!(handler, queue = %self.queue, error = %e, "Failed to receive message");
                    tokio::select! {
                        _ = tokio::time::sleep(self.error_backoff) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(handler, queue = %self.queue, ?stats, "Status updater stopped");
        stats
    }
}
