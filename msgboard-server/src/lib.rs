//! # msgboard-server — WebSocket transport for the message board
//!
//! Exposes the board core over a single WebSocket per client:
//!
//! ```text
//! ┌─────────────┐  ClientFrame {id, request}   ┌─────────────┐
//! │ BoardClient │ ───────────────────────────► │ BoardServer │──► TransportRouter
//! │             │ ◄─────────────────────────── │ (per conn.) │        │
//! └─────────────┘  Reply / Event / Closed      └──────┬──────┘        ▼
//!                                                     │          MessageStore
//!                                          SubscriptionSession ◄── EventBus
//! ```
//!
//! Text frames carry JSON, binary frames carry bincode; the server answers
//! in whichever encoding the client last used.
//!
//! ## Modules
//!
//! - [`config`] — `ServerConfig` and environment overrides
//! - [`protocol`] — wire frames and encodings
//! - [`server`] — connection handling, heartbeat and graceful drain
//! - [`client`] — async client with request correlation

pub mod client;
pub mod config;
pub mod protocol;
pub mod server;

pub use client::{BoardClient, BoardEvent, ConnectionState};
pub use config::ServerConfig;
pub use protocol::{ClientFrame, Encoding, ProtocolError, ServerFrame, WireError};
pub use server::{BoardServer, ServerStats};
