//! Per-observer delivery state.
//!
//! Lifecycle:
//! ```text
//!   open_session()        subscribe()             close() / drop / overflow
//!  ──────────────► Open ─────────────► Active ──────────────────────────► Closed
//!                   ▲                    │
//!                   └── last unsubscribe ┘
//! ```
//!
//! A session owns the receiving half of a bounded queue; the bus holds the
//! sending half in its registry. Once a session is closed every buffered
//! event is discarded and retrieval reports end-of-stream, or `Overflow`
//! exactly once when the bus closed it for falling behind.
//!
//! Only the owner can empty the queue. When the bus closes a session for
//! overflow, the buffered events stay allocated until the owner's next
//! `recv`/`drain`/`close` or until the session is dropped, whichever comes
//! first. None of them is ever handed out after the close.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::error::BoardError;
use crate::message::{DomainEvent, Topic};

pub type SessionId = Uuid;

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Attached, no topics yet
    Open = 0,
    /// Subscribed to at least one topic
    Active = 1,
    /// Terminal
    Closed = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Active,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Requested,
    Overflow,
}

/// State shared between a session and the bus registry.
pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    pub(crate) tx: mpsc::Sender<DomainEvent>,
    /// `SessionState` as u8, or `CLOSED_OVERFLOW`
    state: AtomicU8,
    wake: Notify,
}

/// Closed by the bus for falling behind. Reads as `SessionState::Closed`.
const CLOSED_OVERFLOW: u8 = 3;

impl SessionShared {
    fn new(id: SessionId, tx: mpsc::Sender<DomainEvent>) -> Self {
        Self {
            id,
            tx,
            state: AtomicU8::new(SessionState::Open as u8),
            wake: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Switch between Open and Active. Never reopens a closed session.
    pub(crate) fn set_active(&self, active: bool) {
        let next = if active { SessionState::Active } else { SessionState::Open } as u8;
        let _ = self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            (current < SessionState::Closed as u8).then_some(next)
        });
    }

    /// Mark the session closed and wake its consumer.
    ///
    /// Returns `true` only for the call that performed the transition; the
    /// reason recorded is always that call's reason.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        let target = match reason {
            CloseReason::Requested => SessionState::Closed as u8,
            CloseReason::Overflow => CLOSED_OVERFLOW,
        };
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current >= SessionState::Closed as u8 {
                return false;
            }
            match self
                .state
                .compare_exchange(current, target, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        // A single consumer exists, so a stored permit is never lost.
        self.wake.notify_one();
        true
    }

    fn overflowed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CLOSED_OVERFLOW
    }
}

/// One observer's subscription state and private delivery queue.
pub struct SubscriptionSession {
    shared: Arc<SessionShared>,
    rx: mpsc::Receiver<DomainEvent>,
    bus: EventBus,
    overflow_reported: bool,
}

impl SubscriptionSession {
    pub(crate) fn new(bus: EventBus, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            shared: Arc::new(SessionShared::new(Uuid::new_v4(), tx)),
            rx,
            bus,
            overflow_reported: false,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Closed for overflow and not yet reported to the consumer.
    pub(crate) fn overflow_pending(&self) -> bool {
        self.shared.overflowed() && !self.overflow_reported
    }

    /// Subscribe to `topic`. Returns `false` if already subscribed.
    pub async fn subscribe(&self, topic: Topic) -> Result<bool, BoardError> {
        self.bus.subscribe(self, topic).await
    }

    /// Stop receiving `topic`. Events already queued stay deliverable.
    pub async fn unsubscribe(&self, topic: Topic) -> bool {
        self.bus.unsubscribe(self, topic).await
    }

    /// Topics this session is currently registered for.
    pub async fn topics(&self) -> BTreeSet<Topic> {
        self.bus.topics_of(self.id()).await
    }

    /// Wait for the next event.
    ///
    /// Returns `Ok(None)` once the session is closed. Closure wakes a pending
    /// call promptly, so this only waits while the session is live.
    pub async fn recv(&mut self) -> Result<Option<DomainEvent>, BoardError> {
        if self.shared.is_closed() {
            return self.finish();
        }
        tokio::select! {
            biased;
            () = self.shared.wake.notified() => self.finish(),
            event = self.rx.recv() => match event {
                Some(event) if !self.shared.is_closed() => Ok(Some(event)),
                _ => self.finish(),
            },
        }
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<DomainEvent>, BoardError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| BoardError::Timeout)?
    }

    /// Take up to `max` queued events without waiting.
    pub fn drain(&mut self, max: usize) -> Result<Vec<DomainEvent>, BoardError> {
        let mut batch = Vec::new();
        while batch.len() < max && !self.shared.is_closed() {
            match self.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        if self.shared.is_closed() {
            return self.finish().map(|_| Vec::new());
        }
        Ok(batch)
    }

    /// Close the session: release bus registrations and discard the queue.
    ///
    /// Idempotent.
    pub async fn close(&mut self) {
        if self.shared.close(CloseReason::Requested) {
            log::debug!("Session {} closed", self.id());
        }
        self.bus.unsubscribe_all(self).await;
        self.discard_queue();
    }

    /// Turn the session into a stream of events.
    ///
    /// The stream ends when the session closes; an overflow is yielded as a
    /// final `Err`. Dropping the stream closes the session.
    pub fn into_stream(self) -> impl Stream<Item = Result<DomainEvent, BoardError>> + Send {
        futures_util::stream::unfold(self, |mut session| async move {
            match session.recv().await {
                Ok(Some(event)) => Some((Ok(event), session)),
                Ok(None) => None,
                Err(err) => Some((Err(err), session)),
            }
        })
    }

    fn finish(&mut self) -> Result<Option<DomainEvent>, BoardError> {
        self.discard_queue();
        if self.shared.overflowed() && !self.overflow_reported {
            self.overflow_reported = true;
            return Err(BoardError::Overflow(self.id()));
        }
        Ok(None)
    }

    fn discard_queue(&mut self) {
        self.rx.close();
        let mut discarded = 0usize;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            log::trace!("Session {} discarded {discarded} buffered events", self.id());
        }
    }
}

impl Drop for SubscriptionSession {
    fn drop(&mut self) {
        if self.shared.close(CloseReason::Requested) {
            log::debug!("Session {} dropped", self.id());
        }
        self.bus.forget(self.id());
    }
}

impl std::fmt::Debug for SubscriptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSession")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
