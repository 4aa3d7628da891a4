// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broadcast-based event bus for decoupled [`PlatformEvent`] distribution.
//!
//! Delivery is at-most-once per subscriber; durability is not required
//! because every fact an event describes is also persisted. Subscribers
//! that need durability (audit, webhooks) keep their own queues.
//!
//! Publication happens only after the originating transaction commits:
//! transactional code pushes into an [`EventBuffer`] and the commit path
//! flushes the buffer into the bus.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use fbp_core::PlatformEvent;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 256;

/// Shared statistics counters for an [`EventBus`].
#[derive(Debug, Default)]
struct StatsInner {
    total_published: AtomicU64,
    dropped_events: AtomicU64,
}

/// Broadcast-based event bus for distributing [`PlatformEvent`]s to
/// multiple subscribers with built-in statistics tracking.
pub struct EventBus {
    tx: broadcast::Sender<PlatformEvent>,
    stats: Arc<StatsInner>,
}

impl EventBus {
    /// Create a new event bus with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with the given channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Create a new [`EventSubscription`] that receives future events.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Subscribe to events scoped to one device.
    #[must_use]
    pub fn subscribe_device(&self, device_id: impl Into<String>) -> FilteredSubscription {
        let device_id = device_id.into();
        FilteredSubscription::new(
            self.subscribe(),
            Box::new(move |event| event.device_id() == Some(device_id.as_str())),
        )
    }

    /// Publish an event to all current subscribers.
    ///
    /// If no subscribers are listening the event is silently dropped and
    /// counted in [`EventBusStats::dropped_events`].
    pub fn publish(&self, event: PlatformEvent) {
        self.stats.total_published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(event).is_err() {
            self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Return the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Return a snapshot of the current bus statistics.
    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            total_published: self.stats.total_published.load(Ordering::Relaxed),
            active_subscribers: self.tx.receiver_count(),
            dropped_events: self.stats.dropped_events.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle for receiving events from an [`EventBus`].
pub struct EventSubscription {
    rx: broadcast::Receiver<PlatformEvent>,
    stats: Arc<StatsInner>,
}

impl EventSubscription {
    /// Receive the next event, waiting asynchronously.
    ///
    /// Returns `None` when the bus is closed. Lagged events are counted in
    /// [`EventBusStats::dropped_events`] and reception continues.
    pub async fn recv(&mut self) -> Option<PlatformEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.dropped_events.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<PlatformEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                self.stats.dropped_events.fetch_add(n, Ordering::Relaxed);
                self.rx.try_recv().ok()
            }
            Err(_) => None,
        }
    }
}

/// Wraps an [`EventSubscription`] with a predicate filter so that only
/// matching events are yielded.
pub struct FilteredSubscription {
    inner: EventSubscription,
    filter: Box<dyn Fn(&PlatformEvent) -> bool + Send + Sync>,
}

impl FilteredSubscription {
    /// Create a filtered subscription that only yields events where
    /// `filter` returns `true`.
    pub fn new(
        sub: EventSubscription,
        filter: Box<dyn Fn(&PlatformEvent) -> bool + Send + Sync>,
    ) -> Self {
        Self { inner: sub, filter }
    }

    /// Receive the next matching event, waiting asynchronously.
    pub async fn recv(&mut self) -> Option<PlatformEvent> {
        loop {
            match self.inner.recv().await {
                Some(event) if (self.filter)(&event) => return Some(event),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

/// Snapshot of event bus statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusStats {
    /// Total number of events published to the bus.
    pub total_published: u64,
    /// Number of subscribers currently listening.
    pub active_subscribers: usize,
    /// Events lost because no subscribers were listening or a subscriber
    /// lagged.
    pub dropped_events: u64,
}

// ---------------------------------------------------------------------------
// EventBuffer
// ---------------------------------------------------------------------------

/// Collects events produced inside a transaction for publication after
/// commit.
///
/// A buffer dropped without [`EventBuffer::flush_into`] discards its
/// events, which is exactly right for a rolled-back transaction.
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Vec<PlatformEvent>,
}

impl EventBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event for post-commit publication.
    pub fn push(&mut self, event: PlatformEvent) {
        self.events.push(event);
    }

    /// Number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Publish all buffered events in order. Call only after commit.
    pub fn flush_into(self, bus: &EventBus) {
        for event in self.events {
            bus.publish(event);
        }
    }
}
