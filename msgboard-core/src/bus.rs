//! Topic-based fan-out from the store to observer sessions.
//!
//! ```text
//!                 ┌──────────────────── Registry ───────────────────┐
//! publish(event) ─┤ message-added   → { session A, session B }      │
//!                 │ message-updated → { session B }                 │
//!                 │ message-deleted → { }                           │
//!                 └───────────────┬─────────────────────────────────┘
//!                                 │ try_send (never waits)
//!                       ┌─────────┴─────────┐
//!                       ▼                   ▼
//!                 queue A (bounded)   queue B (bounded)
//! ```
//!
//! Fan-out only ever does a non-blocking enqueue. A session whose queue is
//! full is closed with `Overflow` and evicted; nobody else notices. The bus
//! only holds the sending half, so the evicted session's buffer is released
//! by its owner on the next retrieval (see [`crate::session`]).
//!
//! The registry lock is held for the whole fan-out, so `unsubscribe` and
//! `unsubscribe_all` wait for an in-flight publish and nothing is delivered
//! to a session after they return.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::BoardError;
use crate::message::{DomainEvent, Topic};
use crate::session::{CloseReason, SessionId, SessionShared, SubscriptionSession};

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Events buffered per session before it is closed with `Overflow`
    pub session_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            session_capacity: 256,
        }
    }
}

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub events_published: u64,
    pub events_delivered: u64,
    pub sessions_opened: u64,
    pub sessions_overflowed: u64,
}

struct AtomicBusStats {
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_overflowed: AtomicU64,
}

impl AtomicBusStats {
    fn new() -> Self {
        Self {
            events_published: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_overflowed: AtomicU64::new(0),
        }
    }
}

#[derive(Default)]
struct Registry {
    by_topic: HashMap<Topic, HashMap<SessionId, Arc<SessionShared>>>,
    by_session: HashMap<SessionId, BTreeSet<Topic>>,
}

impl Registry {
    fn insert(&mut self, shared: &Arc<SessionShared>, topic: Topic) -> bool {
        let added = self
            .by_topic
            .entry(topic)
            .or_default()
            .insert(shared.id, Arc::clone(shared))
            .is_none();
        self.by_session.entry(shared.id).or_default().insert(topic);
        shared.set_active(true);
        added
    }

    fn remove(&mut self, id: &SessionId, topic: Topic) -> bool {
        let Some(shared) = self.by_topic.get_mut(&topic).and_then(|subs| subs.remove(id)) else {
            return false;
        };
        if let Some(topics) = self.by_session.get_mut(id) {
            topics.remove(&topic);
            if topics.is_empty() {
                self.by_session.remove(id);
                shared.set_active(false);
            }
        }
        true
    }

    fn remove_all(&mut self, id: &SessionId) -> usize {
        let Some(topics) = self.by_session.remove(id) else {
            return 0;
        };
        for topic in &topics {
            if let Some(shared) = self.by_topic.get_mut(topic).and_then(|subs| subs.remove(id)) {
                shared.set_active(false);
            }
        }
        topics.len()
    }

    fn live(&self, topic: Topic) -> impl Iterator<Item = &Arc<SessionShared>> {
        self.by_topic
            .get(&topic)
            .into_iter()
            .flat_map(|subs| subs.values())
            .filter(|shared| !shared.is_closed())
    }
}

struct BusInner {
    registry: Mutex<Registry>,
    config: BusConfig,
    stats: AtomicBusStats,
}

/// Publish/subscribe router between the store and observer sessions.
///
/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: Mutex::new(Registry::default()),
                config,
                stats: AtomicBusStats::new(),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Attach a new observer. The session starts `Open` with no topics.
    pub fn open_session(&self) -> SubscriptionSession {
        self.inner.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        let session = SubscriptionSession::new(self.clone(), self.inner.config.session_capacity);
        log::debug!("Session {} opened", session.id());
        session
    }

    /// Register `session` for `topic`. Idempotent; returns `true` if newly added.
    pub async fn subscribe(&self, session: &SubscriptionSession, topic: Topic) -> Result<bool, BoardError> {
        let mut registry = self.inner.registry.lock().await;
        if session.is_closed() {
            return Err(BoardError::SessionClosed);
        }
        let added = registry.insert(session.shared(), topic);
        if added {
            log::debug!("Session {} subscribed to {topic}", session.id());
        }
        Ok(added)
    }

    /// Remove one registration. Returns `false` if it did not exist.
    pub async fn unsubscribe(&self, session: &SubscriptionSession, topic: Topic) -> bool {
        let removed = self.inner.registry.lock().await.remove(&session.id(), topic);
        if removed {
            log::debug!("Session {} unsubscribed from {topic}", session.id());
        }
        removed
    }

    /// Remove every registration of `session`. Returns how many were removed.
    pub async fn unsubscribe_all(&self, session: &SubscriptionSession) -> usize {
        self.inner.registry.lock().await.remove_all(&session.id())
    }

    /// Best-effort removal from synchronous contexts (drop).
    ///
    /// If the registry is busy, the closed session is pruned by the next publish.
    pub(crate) fn forget(&self, id: SessionId) {
        if let Ok(mut registry) = self.inner.registry.try_lock() {
            registry.remove_all(&id);
        }
    }

    pub(crate) async fn topics_of(&self, id: SessionId) -> BTreeSet<Topic> {
        self.inner
            .registry
            .lock()
            .await
            .by_session
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Take exclusive publish rights.
    ///
    /// The store acquires this while still holding its own lock, then releases
    /// its lock before fanning out, so events leave in mutation order.
    pub async fn begin_publish(&self) -> PublishPermit<'_> {
        PublishPermit {
            registry: self.inner.registry.lock().await,
            stats: &self.inner.stats,
        }
    }

    /// Deliver `event` to every session subscribed to its topic.
    ///
    /// Returns the number of sessions the event was enqueued for.
    pub async fn publish(&self, event: DomainEvent) -> usize {
        self.begin_publish().await.publish(event)
    }

    /// Live sessions registered for `topic`.
    pub async fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner.registry.lock().await.live(topic).count()
    }

    /// Live sessions registered for at least one topic.
    pub async fn session_count(&self) -> usize {
        let registry = self.inner.registry.lock().await;
        let ids: HashSet<SessionId> = Topic::ALL
            .into_iter()
            .flat_map(|topic| registry.live(topic).map(|shared| shared.id))
            .collect();
        ids.len()
    }

    pub fn stats(&self) -> BusStats {
        let stats = &self.inner.stats;
        BusStats {
            events_published: stats.events_published.load(Ordering::Relaxed),
            events_delivered: stats.events_delivered.load(Ordering::Relaxed),
            sessions_opened: stats.sessions_opened.load(Ordering::Relaxed),
            sessions_overflowed: stats.sessions_overflowed.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive right to publish one event.
pub struct PublishPermit<'a> {
    registry: MutexGuard<'a, Registry>,
    stats: &'a AtomicBusStats,
}

impl PublishPermit<'_> {
    /// Fan `event` out and release the permit.
    pub fn publish(mut self, event: DomainEvent) -> usize {
        let topic = event.topic();
        let mut delivered = 0usize;
        let mut evicted = Vec::new();

        if let Some(subscribers) = self.registry.by_topic.get(&topic) {
            for (id, shared) in subscribers {
                if shared.is_closed() {
                    evicted.push(*id);
                    continue;
                }
                match shared.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        log::warn!("Session {id} fell behind on {topic}, closing with overflow");
                        shared.close(CloseReason::Overflow);
                        self.stats.sessions_overflowed.fetch_add(1, Ordering::Relaxed);
                        evicted.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        shared.close(CloseReason::Requested);
                        evicted.push(*id);
                    }
                }
            }
        }

        for id in &evicted {
            self.registry.remove_all(id);
        }

        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        self.stats
            .events_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        log::trace!("Published {topic} to {delivered} sessions");
        delivered
    }
}
