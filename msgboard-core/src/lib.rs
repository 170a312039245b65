//! # msgboard-core — Change notification core for the message board
//!
//! Keeps the authoritative list of board messages and fans every change out
//! to the observers currently attached.
//!
//! ## Architecture
//!
//! ```text
//!  request ──► TransportRouter ──► MessageStore ──(DomainEvent)──► EventBus
//!                   │               (lock-guarded)                   │
//!                   │ observe                                 fan-out by topic
//!                   ▼                                                ▼
//!           SubscriptionSession ◄──────────── bounded queue ◄────────┘
//!           (one per observer)
//! ```
//!
//! ## Modules
//!
//! - [`message`] — `Message`, `Topic`, `DomainEvent`
//! - [`store`] — authoritative collection and mutations
//! - [`bus`] — topic registry and non-blocking fan-out
//! - [`session`] — per-observer queue and lifecycle
//! - [`router`] — request/response vs observation dispatch
//! - [`error`] — `BoardError`

pub mod bus;
pub mod error;
pub mod message;
pub mod router;
pub mod session;
pub mod store;

pub use bus::{BusConfig, BusStats, EventBus, PublishPermit};
pub use error::{BoardError, ErrorKind};
pub use message::{DomainEvent, Message, Topic};
pub use router::{Dispatch, Request, Response, TransportRouter};
pub use session::{SessionId, SessionState, SubscriptionSession};
pub use store::MessageStore;
