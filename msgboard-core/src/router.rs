//! Dispatch of incoming board operations.
//!
//! Two paths:
//! - request/response (`listMessages`, `getMessage`, `addMessage`,
//!   `updateMessage`, `deleteMessage`) goes straight to the store;
//! - observation (`observe`, `unobserve`) creates or reuses the caller's
//!   [`SubscriptionSession`] and edits its bus registrations.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::BoardError;
use crate::message::{Message, Topic};
use crate::session::{SessionId, SubscriptionSession};
use crate::store::MessageStore;

/// Operations a transport can forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Request {
    ListMessages,
    GetMessage { id: String },
    AddMessage { content: String },
    UpdateMessage { id: String, content: String },
    DeleteMessage { id: String },
    Observe { topics: BTreeSet<Topic> },
    Unobserve { topics: BTreeSet<Topic> },
}

/// Successful results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Response {
    Messages(Vec<Message>),
    Message(Message),
    /// Current registrations of the caller's session
    Subscribed {
        session_id: SessionId,
        topics: BTreeSet<Topic>,
    },
}

/// Which path an operation takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    RequestResponse,
    Observation,
}

impl Request {
    pub fn dispatch(&self) -> Dispatch {
        match self {
            Self::ListMessages
            | Self::GetMessage { .. }
            | Self::AddMessage { .. }
            | Self::UpdateMessage { .. }
            | Self::DeleteMessage { .. } => Dispatch::RequestResponse,
            Self::Observe { .. } | Self::Unobserve { .. } => Dispatch::Observation,
        }
    }
}

/// Entry point for transports. Holds the injected store.
pub struct TransportRouter {
    store: Arc<MessageStore>,
}

impl TransportRouter {
    pub fn new(store: Arc<MessageStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Handle one request.
    ///
    /// `session` is the caller's observation slot; observation requests fill
    /// or reuse it. A closed session in the slot is replaced by a fresh one,
    /// unless it still owes its consumer an `Overflow`: then `observe` fails
    /// with `SessionClosed` and the session stays in the slot.
    pub async fn handle(
        &self,
        request: Request,
        session: &mut Option<SubscriptionSession>,
    ) -> Result<Response, BoardError> {
        match request {
            Request::ListMessages => Ok(Response::Messages(self.list_messages().await)),
            Request::GetMessage { id } => self.get_message(&id).await.map(Response::Message),
            Request::AddMessage { content } => self.add_message(content).await.map(Response::Message),
            Request::UpdateMessage { id, content } => {
                self.update_message(&id, content).await.map(Response::Message)
            }
            Request::DeleteMessage { id } => self.delete_message(&id).await.map(Response::Message),
            Request::Observe { topics } => self.attach(session, topics).await,
            Request::Unobserve { topics } => Self::detach(session, topics).await,
        }
    }

    pub async fn list_messages(&self) -> Vec<Message> {
        self.store.list().await
    }

    pub async fn get_message(&self, id: &str) -> Result<Message, BoardError> {
        self.store.get(id).await
    }

    pub async fn add_message(&self, content: impl Into<String>) -> Result<Message, BoardError> {
        self.store.add(content).await
    }

    pub async fn update_message(&self, id: &str, content: impl Into<String>) -> Result<Message, BoardError> {
        self.store.update(id, content).await
    }

    pub async fn delete_message(&self, id: &str) -> Result<Message, BoardError> {
        self.store.remove(id).await
    }

    /// Open a new session subscribed to `topics`.
    ///
    /// Use [`SubscriptionSession::into_stream`] for a cancellable stream.
    pub async fn observe(
        &self,
        topics: impl IntoIterator<Item = Topic>,
    ) -> Result<SubscriptionSession, BoardError> {
        let topics: BTreeSet<Topic> = topics.into_iter().collect();
        if topics.is_empty() {
            return Err(BoardError::InvalidInput(
                "observe requires at least one topic".to_string(),
            ));
        }
        let session = self.store.bus().open_session();
        for topic in &topics {
            session.subscribe(*topic).await?;
        }
        Ok(session)
    }

    async fn attach(
        &self,
        slot: &mut Option<SubscriptionSession>,
        topics: BTreeSet<Topic>,
    ) -> Result<Response, BoardError> {
        if topics.is_empty() {
            return Err(BoardError::InvalidInput(
                "observe requires at least one topic".to_string(),
            ));
        }
        let session = match slot.take() {
            Some(existing) if !existing.is_closed() => existing,
            // Leave it for the transport to report the overflow first
            Some(existing) if existing.overflow_pending() => {
                *slot = Some(existing);
                return Err(BoardError::SessionClosed);
            }
            _ => self.store.bus().open_session(),
        };
        for topic in &topics {
            if let Err(err) = session.subscribe(*topic).await {
                *slot = Some(session);
                return Err(err);
            }
        }
        let response = Response::Subscribed {
            session_id: session.id(),
            topics: session.topics().await,
        };
        *slot = Some(session);
        Ok(response)
    }

    async fn detach(
        slot: &mut Option<SubscriptionSession>,
        topics: BTreeSet<Topic>,
    ) -> Result<Response, BoardError> {
        let Some(session) = slot.as_ref().filter(|s| !s.is_closed()) else {
            return Err(BoardError::SessionClosed);
        };
        for topic in &topics {
            session.unsubscribe(*topic).await;
        }
        Ok(Response::Subscribed {
            session_id: session.id(),
            topics: session.topics().await,
        })
    }
}
