//! WebSocket client for the board server.
//!
//! Requests are correlated with replies by a per-client id, so several can
//! be in flight from different tasks. Observation events are delivered on a
//! separate channel obtained with [`BoardClient::take_event_rx`].
//!
//! The reader task never waits on that channel. If the application stops
//! draining it, the observation ends the way a server session does: one
//! `ObservationClosed` with an `overflow` error, the server is told to stop
//! sending, and later changes are dropped until the next `observe`. Replies
//! keep flowing either way.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use msgboard_core::{DomainEvent, ErrorKind, Message, Request, Response, SessionId, Topic};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::{ClientFrame, Encoding, ProtocolError, ServerFrame, WireError};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Response, WireError>>>>>;

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Id of requests the client sends on its own. Caller ids start at 1.
const INTERNAL_REQUEST_ID: u64 = 0;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardEvent {
    /// Connection established
    Connected,
    /// A board change this client observes
    Change(DomainEvent),
    /// The server ended this client's observation
    ObservationClosed(Option<WireError>),
    /// Connection lost
    Disconnected,
}

/// The board client.
pub struct BoardClient {
    server_url: String,
    encoding: Encoding,
    request_timeout: Duration,
    state: Arc<RwLock<ConnectionState>>,
    next_id: AtomicU64,
    pending: Pending,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<WsMessage>>,
    event_tx: mpsc::Sender<BoardEvent>,
    event_rx: Option<mpsc::Receiver<BoardEvent>>,
    /// Set when the event receiver filled up; cleared by `observe`
    lagged: Arc<AtomicBool>,
}

impl BoardClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            server_url: server_url.into(),
            encoding: Encoding::Json,
            request_timeout: Duration::from_secs(10),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            next_id: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            lagged: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Events buffered for the application before the observation is ended.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        let (event_tx, event_rx) = mpsc::channel(capacity.max(2));
        self.event_tx = event_tx;
        self.event_rx = Some(event_rx);
        self
    }

    /// Encoding used for outgoing frames. The server answers in kind.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<BoardEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect to the server and spawn the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(256);
        self.outgoing_tx = Some(out_tx.clone());

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        self.lagged.store(false, Ordering::SeqCst);
        let events = EventSink {
            tx: self.event_tx.clone(),
            lagged: Arc::clone(&self.lagged),
            outgoing: out_tx,
            encoding: self.encoding,
        };
        events.notify(BoardEvent::Connected);
        log::info!("Connected to {}", self.server_url);

        let state = Arc::clone(&self.state);
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(msg @ (WsMessage::Text(_) | WsMessage::Binary(_))) => {
                        match ServerFrame::decode(&msg) {
                            Ok(Some((frame, _))) => route(frame, &pending, &events).await,
                            Ok(None) => {}
                            Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("WebSocket read error: {e}");
                        break;
                    }
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            // Dropping the senders fails every outstanding request
            pending.lock().await.clear();
            events.notify(BoardEvent::Disconnected);
        });

        Ok(())
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(WsMessage::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send one request and wait for its reply.
    pub async fn request(&self, request: Request) -> Result<Response, ProtocolError> {
        let Some(tx) = self.outgoing_tx.as_ref() else {
            return Err(ProtocolError::ConnectionClosed);
        };
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = ClientFrame { id, request }.encode(self.encoding)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(id, reply_tx);

        if tx.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ProtocolError::ConnectionClosed);
        }

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(wire))) => Err(ProtocolError::Rejected(wire)),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::Timeout)
            }
        }
    }

    pub async fn list_messages(&self) -> Result<Vec<Message>, ProtocolError> {
        match self.request(Request::ListMessages).await? {
            Response::Messages(messages) => Ok(messages),
            _ => Err(ProtocolError::UnexpectedReply),
        }
    }

    pub async fn get_message(&self, id: impl Into<String>) -> Result<Message, ProtocolError> {
        expect_message(self.request(Request::GetMessage { id: id.into() }).await?)
    }

    pub async fn add_message(&self, content: impl Into<String>) -> Result<Message, ProtocolError> {
        expect_message(
            self.request(Request::AddMessage {
                content: content.into(),
            })
            .await?,
        )
    }

    pub async fn update_message(
        &self,
        id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Message, ProtocolError> {
        expect_message(
            self.request(Request::UpdateMessage {
                id: id.into(),
                content: content.into(),
            })
            .await?,
        )
    }

    pub async fn delete_message(&self, id: impl Into<String>) -> Result<Message, ProtocolError> {
        expect_message(self.request(Request::DeleteMessage { id: id.into() }).await?)
    }

    /// Start (or extend) this connection's observation.
    ///
    /// Returns the server-side session id and its full topic set.
    pub async fn observe(
        &self,
        topics: impl IntoIterator<Item = Topic>,
    ) -> Result<(SessionId, BTreeSet<Topic>), ProtocolError> {
        let topics = topics.into_iter().collect();
        self.lagged.store(false, Ordering::SeqCst);
        expect_subscribed(self.request(Request::Observe { topics }).await?)
    }

    pub async fn unobserve(
        &self,
        topics: impl IntoIterator<Item = Topic>,
    ) -> Result<(SessionId, BTreeSet<Topic>), ProtocolError> {
        let topics = topics.into_iter().collect();
        expect_subscribed(self.request(Request::Unobserve { topics }).await?)
    }
}

/// Reader-side handoff of pushed frames to the application. Never waits.
struct EventSink {
    tx: mpsc::Sender<BoardEvent>,
    lagged: Arc<AtomicBool>,
    outgoing: mpsc::Sender<WsMessage>,
    encoding: Encoding,
}

impl EventSink {
    fn notify(&self, event: BoardEvent) {
        if let Err(TrySendError::Full(event)) = self.tx.try_send(event) {
            log::warn!("Event receiver full, dropping {event:?}");
        }
    }

    fn change(&self, event: DomainEvent) {
        if self.lagged.load(Ordering::SeqCst) {
            return;
        }
        // The last slot is kept for the closing notice
        if self.tx.capacity() > 1 {
            match self.tx.try_send(BoardEvent::Change(event)) {
                Ok(()) | Err(TrySendError::Closed(_)) => return,
                Err(TrySendError::Full(_)) => {}
            }
        }
        self.end_observation();
    }

    fn end_observation(&self) {
        self.lagged.store(true, Ordering::SeqCst);
        log::warn!("Event receiver is not drained, ending observation");

        let notice = WireError {
            kind: ErrorKind::Overflow,
            message: "client event receiver is full".to_string(),
        };
        let _ = self.tx.try_send(BoardEvent::ObservationClosed(Some(notice)));

        let stop = ClientFrame {
            id: INTERNAL_REQUEST_ID,
            request: Request::Unobserve {
                topics: Topic::ALL.into_iter().collect(),
            },
        };
        match stop.encode(self.encoding) {
            Ok(frame) => {
                let _ = self.outgoing.try_send(frame);
            }
            Err(e) => log::warn!("Failed to encode unobserve: {e}"),
        }
    }
}

async fn route(frame: ServerFrame, pending: &Pending, events: &EventSink) {
    match frame {
        ServerFrame::Reply { id, result } => match pending.lock().await.remove(&id) {
            Some(reply_tx) => {
                let _ = reply_tx.send(result);
            }
            None => log::debug!("Reply {id} has no waiting request"),
        },
        ServerFrame::Event { event } => events.change(event),
        ServerFrame::Closed { error } => events.notify(BoardEvent::ObservationClosed(error)),
    }
}

fn expect_message(response: Response) -> Result<Message, ProtocolError> {
    match response {
        Response::Message(message) => Ok(message),
        _ => Err(ProtocolError::UnexpectedReply),
    }
}

fn expect_subscribed(response: Response) -> Result<(SessionId, BTreeSet<Topic>), ProtocolError> {
    match response {
        Response::Subscribed { session_id, topics } => Ok((session_id, topics)),
        _ => Err(ProtocolError::UnexpectedReply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_initial_state() {
        let mut client = BoardClient::new("ws://127.0.0.1:1");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_request_without_connection() {
        let client = BoardClient::new("ws://127.0.0.1:1");
        assert_eq!(
            client.list_messages().await,
            Err(ProtocolError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_event_sink_ends_observation_when_full() {
        let (tx, mut rx) = mpsc::channel(4);
        let (outgoing, mut sent) = mpsc::channel(4);
        let lagged = Arc::new(AtomicBool::new(false));
        let sink = EventSink {
            tx,
            lagged: Arc::clone(&lagged),
            outgoing,
            encoding: Encoding::Json,
        };

        for i in 1..=10 {
            sink.change(DomainEvent::Added(Message::new(i.to_string(), "x")));
        }
        assert!(lagged.load(Ordering::SeqCst));

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), 4);
        assert!(received[..3].iter().all(|e| matches!(e, BoardEvent::Change(_))));
        assert!(matches!(
            &received[3],
            BoardEvent::ObservationClosed(Some(e)) if e.kind == ErrorKind::Overflow
        ));

        let (stop, _) = ClientFrame::decode(&sent.try_recv().unwrap()).unwrap().unwrap();
        assert_eq!(stop.id, INTERNAL_REQUEST_ID);
        assert!(matches!(stop.request, Request::Unobserve { .. }));
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_closed_frame() {
        let (tx, mut rx) = mpsc::channel(4);
        let (outgoing, _sent) = mpsc::channel(4);
        let sink = EventSink {
            tx,
            lagged: Arc::new(AtomicBool::new(false)),
            outgoing,
            encoding: Encoding::Json,
        };
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let error = WireError {
            kind: ErrorKind::Overflow,
            message: "overflowed".into(),
        };

        route(ServerFrame::Closed { error: Some(error.clone()) }, &pending, &sink).await;
        assert_eq!(rx.try_recv().unwrap(), BoardEvent::ObservationClosed(Some(error)));
    }

    #[test]
    fn test_expect_helpers() {
        let msg = Message::new("1", "a");
        assert_eq!(expect_message(Response::Message(msg.clone())), Ok(msg));
        assert_eq!(
            expect_message(Response::Messages(Vec::new())),
            Err(ProtocolError::UnexpectedReply)
        );
        assert_eq!(
            expect_subscribed(Response::Messages(Vec::new())),
            Err(ProtocolError::UnexpectedReply)
        );
    }
}
