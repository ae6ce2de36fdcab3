//! Fan-out event bus.
//!
//! Subscribers get bounded queues. Events are assigned a durable,
//! monotonically increasing `seq` at publish time and appended to the
//! store's event log before fan-out, so any subscriber can replay from a
//! prior seq. A subscriber that overflows its queue is disconnected: the
//! final item it receives is a `lost{last_seen_seq}` sentinel, after
//! which it may reconnect and take a compacted resync (full snapshot)
//! instead of the individual missed events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use creditmesh_core::constants::DEFAULT_SUBSCRIBER_QUEUE_CAPACITY;
use creditmesh_core::error::MeshError;
use creditmesh_core::event::{Event, EventKind, EventPayload, LostPayload};
use creditmesh_core::types::{EventSeq, Timestamp};
use creditmesh_store::{HubSnapshot, Store};

struct QueueState {
    items: VecDeque<Event>,
    /// Seq of the newest event ever enqueued; replay/live dedup boundary.
    last_enqueued: EventSeq,
    /// Set when the subscriber overflowed and got its sentinel.
    lost: bool,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(capacity: usize, last_seen: EventSeq) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                last_enqueued: last_seen,
                lost: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Push one event. Returns false when the subscriber is gone (lost)
    /// and should be dropped from the fan-out list.
    fn push(&self, event: &Event) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.lost {
            return false;
        }
        if event.seq <= state.last_enqueued {
            return true; // replay overlap; already queued
        }
        if state.items.len() >= self.capacity {
            let last_seen = state.last_enqueued;
            state.lost = true;
            state.items.push_back(Event {
                seq: event.seq,
                ts: event.ts,
                kind: EventKind::Lost,
                payload: EventPayload::Lost(LostPayload {
                    last_seen_seq: last_seen,
                }),
            });
            // notify_one stores a permit, so a consumer racing between its
            // empty-check and its await never misses the wakeup.
            self.notify.notify_one();
            return false;
        }
        state.last_enqueued = event.seq;
        state.items.push_back(event.clone());
        self.notify.notify_one();
        true
    }

    fn pop(&self) -> Option<Event> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.items.pop_front()
    }
}

/// A live subscription handle. Dropping it detaches the subscriber.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Next event, waiting if the queue is empty. Returns `None` once the
    /// subscriber was disconnected and its sentinel consumed.
    pub async fn next(&self) -> Option<Event> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            {
                let state = self.queue.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.lost && state.items.is_empty() {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking pop, for tests and polling consumers.
    pub fn try_next(&self) -> Option<Event> {
        self.queue.pop()
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(event) = self.try_next() {
            out.push(event);
        }
        out
    }
}

/// The hub-wide bus. One instance, shared by every emitting engine.
pub struct EventBus {
    store: Arc<Store>,
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    capacity: usize,
    next_subscriber: AtomicU64,
}

impl EventBus {
    pub fn new(store: Arc<Store>) -> Self {
        Self::with_capacity(store, DEFAULT_SUBSCRIBER_QUEUE_CAPACITY)
    }

    pub fn with_capacity(store: Arc<Store>, capacity: usize) -> Self {
        Self {
            store,
            subscribers: Mutex::new(Vec::new()),
            capacity,
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Assign the next seq, append to the durable log, and fan out.
    /// Callers invoke this only after the originating commit is durable.
    /// The whole step runs under the subscriber lock so concurrent
    /// publishers cannot interleave seqs out of order.
    pub fn publish(
        &self,
        ts: Timestamp,
        kind: EventKind,
        payload: EventPayload,
    ) -> Result<Event, MeshError> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let seq = self.store.db.next_event_seq()?;
        let event = Event {
            seq,
            ts,
            kind,
            payload,
        };
        self.store.db.append_event(&event)?;

        subscribers.retain(|queue| {
            let alive = queue.push(&event);
            if !alive {
                warn!(seq, "subscriber overflowed; disconnected with lost sentinel");
            }
            alive
        });
        Ok(event)
    }

    /// Subscribe live, optionally replaying the log from `last_seen_seq`.
    /// The replay and the registration happen under one lock so no event
    /// can slip between them.
    pub fn subscribe(&self, last_seen_seq: Option<EventSeq>) -> Result<Subscription, MeshError> {
        let _id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let from = last_seen_seq.unwrap_or_else(|| self.current_seq());
        let queue = Arc::new(SubscriberQueue::new(self.capacity, from));
        if last_seen_seq.is_some() {
            for event in self.store.db.read_events_after(from, usize::MAX)? {
                queue.push(&event);
            }
        }
        subscribers.push(Arc::clone(&queue));
        Ok(Subscription { queue })
    }

    /// Compacted resync for a subscriber that was disconnected: a full
    /// snapshot of current state plus a live subscription from now.
    pub fn resync(&self) -> Result<(HubSnapshot, Subscription), MeshError> {
        let snapshot = self.store.snapshot(None)?;
        let subscription = self.subscribe(None)?;
        Ok((snapshot, subscription))
    }

    fn current_seq(&self) -> EventSeq {
        self.store
            .db
            .get_meta("event_seq")
            .ok()
            .flatten()
            .map(|b| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&b[..8]);
                u64::from_be_bytes(arr)
            })
            .unwrap_or(0)
    }
}
