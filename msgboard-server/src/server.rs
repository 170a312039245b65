//! WebSocket board server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── MessageStore ── EventBus
//!             ├── Connection task ──────┤                     │
//! Client B ──┘   (one per socket)      └── TransportRouter    │
//!                     ▲                                       │
//!                     └──── SubscriptionSession queue ◄───────┘
//! ```
//!
//! Each connection owns at most one [`SubscriptionSession`], created by its
//! first `observe` request and closed when the socket goes away. Requests are
//! answered in order on the same socket; events are interleaved as they
//! arrive.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use msgboard_core::{
    BoardError, BusConfig, DomainEvent, EventBus, MessageStore, SubscriptionSession,
    TransportRouter,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::ServerConfig;
use crate::protocol::{ClientFrame, Encoding, ServerFrame, WireError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub events_forwarded: u64,
}

/// The board server.
pub struct BoardServer {
    config: ServerConfig,
    router: Arc<TransportRouter>,
    stats: Arc<RwLock<ServerStats>>,
    /// One permit per open connection, taken at accept time
    slots: Arc<Semaphore>,
}

impl BoardServer {
    /// Create a server with a fresh, empty board.
    pub fn new(config: ServerConfig) -> Self {
        let bus = EventBus::new(BusConfig {
            session_capacity: config.session_capacity,
        });
        let store = Arc::new(MessageStore::new(bus));
        let slots = Arc::new(Semaphore::new(config.max_connections.min(Semaphore::MAX_PERMITS)));
        Self {
            slots,
            config,
            router: Arc::new(TransportRouter::new(store)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Router shared by every connection. Useful for in-process access.
    pub fn router(&self) -> &Arc<TransportRouter> {
        &self.router
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Listen on the configured address until the process ends.
    pub async fn run(&self) -> Result<(), BoxError> {
        self.run_until(std::future::pending()).await
    }

    /// Listen on the configured address until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Board server listening on {}", self.config.bind_addr);
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then
    /// close every connection and wait for them to finish.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), BoxError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    log::info!("Shutdown requested, draining {} connections", connections.len());
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let Ok(slot) = Arc::clone(&self.slots).try_acquire_owned() else {
                        log::warn!("Refusing {addr}: {} connections open", self.config.max_connections);
                        self.stats.write().await.rejected_connections += 1;
                        drop(stream);
                        continue;
                    };

                    let connection = Connection {
                        addr,
                        router: Arc::clone(&self.router),
                        stats: Arc::clone(&self.stats),
                        session: None,
                        encoding: Encoding::default(),
                    };
                    let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
                    let shutdown_rx = shutdown_rx.clone();
                    connections.spawn(async move {
                        if let Err(e) = connection.handle(stream, slot, heartbeat, shutdown_rx).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        let _ = shutdown_tx.send(true);
        while connections.join_next().await.is_some() {}
        log::info!("Board server stopped");
        Ok(())
    }
}

/// State for one WebSocket connection.
struct Connection {
    addr: SocketAddr,
    router: Arc<TransportRouter>,
    stats: Arc<RwLock<ServerStats>>,
    session: Option<SubscriptionSession>,
    /// Encoding of the client's most recent frame
    encoding: Encoding,
}

impl Connection {
    async fn handle(
        mut self,
        stream: TcpStream,
        // Released on every return path, including a failed handshake
        _slot: OwnedSemaphorePermit,
        heartbeat: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {}", self.addr);

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = self
            .serve(&mut ws_sender, ws_receiver, heartbeat, shutdown)
            .await;

        if let Some(mut session) = self.session.take() {
            session.close().await;
            log::debug!("Released session {} for {}", session.id(), self.addr);
        }
        self.stats.write().await.active_connections -= 1;
        log::info!("Connection from {} closed", self.addr);
        result
    }

    async fn serve(
        &mut self,
        ws_sender: &mut WsSink,
        mut ws_receiver: WsSource,
        heartbeat: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        if self.session.is_some() {
                            let frame = ServerFrame::Closed { error: None };
                            ws_sender.send(frame.encode(self.encoding)?).await?;
                        }
                        ws_sender.send(Message::Close(None)).await?;
                        return Ok(());
                    }
                }
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                            match ClientFrame::decode(&msg) {
                                Ok(Some((frame, encoding))) => {
                                    self.encoding = encoding;
                                    let reply = self.dispatch(frame).await;
                                    ws_sender.send(reply.encode(self.encoding)?).await?;
                                }
                                Ok(None) => {}
                                Err(e) => log::warn!("Dropping undecodable frame from {}: {e}", self.addr),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Peer {} disconnected", self.addr);
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", self.addr);
                            return Ok(());
                        }
                    }
                }
                delivery = next_event(&mut self.session) => {
                    match delivery {
                        Ok(Some(event)) => {
                            let frame = ServerFrame::Event { event };
                            ws_sender.send(frame.encode(self.encoding)?).await?;
                            self.stats.write().await.events_forwarded += 1;
                        }
                        Ok(None) => self.session = None,
                        Err(err) => {
                            log::warn!("Observation for {} ended: {err}", self.addr);
                            self.session = None;
                            let frame = ServerFrame::Closed { error: Some(WireError::from(&err)) };
                            ws_sender.send(frame.encode(self.encoding)?).await?;
                        }
                    }
                }
                _ = ticker.tick() => {
                    ws_sender.send(Message::Ping(Vec::<u8>::new().into())).await?;
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: ClientFrame) -> ServerFrame {
        let ClientFrame { id, request } = frame;
        log::debug!("Request {id} from {}: {request:?}", self.addr);

        let result = self.router.handle(request, &mut self.session).await;
        {
            let mut s = self.stats.write().await;
            s.total_requests += 1;
            if result.is_err() {
                s.failed_requests += 1;
            }
        }
        if let Err(e) = &result {
            log::debug!("Request {id} from {} failed: {e}", self.addr);
        }

        ServerFrame::Reply {
            id,
            result: result.map_err(|e| WireError::from(&e)),
        }
    }
}

/// Next event of the connection's session. Never resolves without one.
async fn next_event(
    session: &mut Option<SubscriptionSession>,
) -> Result<Option<DomainEvent>, BoardError> {
    match session.as_mut() {
        Some(session) => session.recv().await,
        None => std::future::pending().await,
    }
}
