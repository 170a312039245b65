//! Authoritative in-memory message collection.
//!
//! Every mutation runs under the store lock, takes the bus publish permit
//! before letting go of it, and fans out after. Readers therefore never see
//! a half-applied change, and events leave in the order mutations happened.

use tokio::sync::{Mutex, MutexGuard};

use crate::bus::EventBus;
use crate::error::BoardError;
use crate::message::{DomainEvent, Message};

struct StoreInner {
    messages: Vec<Message>,
    /// Last id handed out; ids are never reused
    last_id: u64,
}

/// The only writer of board state.
pub struct MessageStore {
    inner: Mutex<StoreInner>,
    bus: EventBus,
}

impl MessageStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                messages: Vec::new(),
                last_id: 0,
            }),
            bus,
        }
    }

    /// Bus that receives this store's events.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Snapshot of all messages in insertion order.
    pub async fn list(&self) -> Vec<Message> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn get(&self, id: &str) -> Result<Message, BoardError> {
        self.inner
            .lock()
            .await
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| BoardError::NotFound(id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.messages.is_empty()
    }

    /// Append a new message and emit `Added`.
    pub async fn add(&self, content: impl Into<String>) -> Result<Message, BoardError> {
        let content = content.into();
        validate_content(&content)?;

        let mut inner = self.inner.lock().await;
        inner.last_id += 1;
        let message = Message::new(inner.last_id.to_string(), content);
        inner.messages.push(message.clone());

        log::debug!("Added message {}", message.id);
        self.commit(inner, DomainEvent::Added(message.clone())).await;
        Ok(message)
    }

    /// Replace a message's content in place and emit `Updated`.
    pub async fn update(&self, id: &str, content: impl Into<String>) -> Result<Message, BoardError> {
        let content = content.into();
        let mut inner = self.inner.lock().await;
        let Some(message) = inner.messages.iter_mut().find(|m| m.id == id) else {
            return Err(BoardError::NotFound(id.to_string()));
        };
        validate_content(&content)?;
        message.content = content;
        let message = message.clone();

        log::debug!("Updated message {id}");
        self.commit(inner, DomainEvent::Updated(message.clone())).await;
        Ok(message)
    }

    /// Remove a message, keeping the order of the rest, and emit `Deleted`.
    pub async fn remove(&self, id: &str) -> Result<Message, BoardError> {
        let mut inner = self.inner.lock().await;
        let Some(index) = inner.messages.iter().position(|m| m.id == id) else {
            return Err(BoardError::NotFound(id.to_string()));
        };
        let message = inner.messages.remove(index);

        log::debug!("Deleted message {id}");
        self.commit(inner, DomainEvent::Deleted(message.clone())).await;
        Ok(message)
    }

    /// Hand the event to the bus and release the store lock before fan-out.
    async fn commit(&self, inner: MutexGuard<'_, StoreInner>, event: DomainEvent) {
        let permit = self.bus.begin_publish().await;
        drop(inner);
        permit.publish(event);
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

fn validate_content(content: &str) -> Result<(), BoardError> {
    if content.trim().is_empty() {
        return Err(BoardError::InvalidInput(
            "message content must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Topic;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ids_never_reused() {
        let store = MessageStore::default();

        let a = store.add("A").await.unwrap();
        let b = store.add("B").await.unwrap();
        assert_eq!(a.id, "1");
        assert_eq!(b.id, "2");

        store.remove("1").await.unwrap();
        assert_eq!(store.list().await, vec![Message::new("2", "B")]);

        let c = store.add("C").await.unwrap();
        assert_eq!(c.id, "3");
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let store = MessageStore::default();
        let session = store.bus().open_session();
        session.subscribe(Topic::MessageAdded).await.unwrap();

        assert!(matches!(store.add("").await, Err(BoardError::InvalidInput(_))));
        assert!(matches!(store.add("   ").await, Err(BoardError::InvalidInput(_))));

        assert!(store.is_empty().await);
        assert_eq!(store.bus().subscriber_count(Topic::MessageAdded).await, 1);
        assert_eq!(store.bus().stats().events_published, 0);
    }

    #[tokio::test]
    async fn test_content_kept_as_given() {
        let store = MessageStore::default();
        let msg = store.add("  padded  ").await.unwrap();
        assert_eq!(msg.content, "  padded  ");
    }

    #[tokio::test]
    async fn test_update_in_place() {
        let store = MessageStore::default();
        store.add("first").await.unwrap();
        store.add("second").await.unwrap();

        let updated = store.update("1", "edited").await.unwrap();
        assert_eq!(updated, Message::new("1", "edited"));
        assert_eq!(
            store.list().await,
            vec![Message::new("1", "edited"), Message::new("2", "second")]
        );
        assert_eq!(store.get("1").await.unwrap().content, "edited");
    }

    #[tokio::test]
    async fn test_update_errors_leave_state() {
        let store = MessageStore::default();
        store.add("keep").await.unwrap();

        assert_eq!(
            store.update("9", "x").await,
            Err(BoardError::NotFound("9".into()))
        );
        assert!(matches!(store.update("1", " ").await, Err(BoardError::InvalidInput(_))));
        assert_eq!(store.get("1").await.unwrap().content, "keep");
        assert_eq!(store.bus().stats().events_published, 1);
    }

    #[tokio::test]
    async fn test_remove_unknown() {
        let store = MessageStore::default();
        assert_eq!(store.remove("1").await, Err(BoardError::NotFound("1".into())));
        assert_eq!(store.get("1").await, Err(BoardError::NotFound("1".into())));
        assert_eq!(store.bus().stats().events_published, 0);
    }

    #[tokio::test]
    async fn test_remove_preserves_order() {
        let store = MessageStore::default();
        for content in ["a", "b", "c", "d"] {
            store.add(content).await.unwrap();
        }
        store.remove("2").await.unwrap();

        let ids: Vec<String> = store.list().await.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["1", "3", "4"]);
    }

    #[tokio::test]
    async fn test_mutations_emit_events() {
        let store = MessageStore::default();
        let mut session = store.bus().open_session();
        for topic in Topic::ALL {
            session.subscribe(topic).await.unwrap();
        }

        store.add("hello").await.unwrap();
        store.update("1", "hi").await.unwrap();
        store.remove("1").await.unwrap();

        let events = session.drain(10).unwrap();
        assert_eq!(
            events,
            vec![
                DomainEvent::Added(Message::new("1", "hello")),
                DomainEvent::Updated(Message::new("1", "hi")),
                DomainEvent::Deleted(Message::new("1", "hi")),
            ]
        );
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_add() {
        let store = MessageStore::default();
        let mut early = store.bus().open_session();
        early.subscribe(Topic::MessageAdded).await.unwrap();

        store.add("hello").await.unwrap();

        let mut late = store.bus().open_session();
        late.subscribe(Topic::MessageAdded).await.unwrap();

        assert_eq!(
            early.drain(10).unwrap(),
            vec![DomainEvent::Added(Message::new("1", "hello"))]
        );
        assert!(late.drain(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_adds_publish_in_id_order() {
        let store = Arc::new(MessageStore::default());
        let mut session = store.bus().open_session();
        session.subscribe(Topic::MessageAdded).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.add(format!("msg {i}")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let ids: Vec<u64> = session
            .drain(100)
            .unwrap()
            .into_iter()
            .map(|e| e.into_message().id.parse().unwrap())
            .collect();
        let expected: Vec<u64> = (1..=50).collect();
        assert_eq!(ids, expected);
        assert_eq!(store.len().await, 50);
    }
}
