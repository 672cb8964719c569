//! # logos-sync — Resilient connection and document sync for Logos clients
//!
//! Keeps one multiplexed WebSocket session to the sync authority alive and
//! replicates CRDT documents over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  local edits   ┌──────────────────┐
//! │ Editor       │ ─────────────► │ DocumentSync     │  sync gate + FIFO queue
//! │ (yrs::Doc)   │ ◄───────────── │ (SyncDriver)     │
//! └──────────────┘  watch status  └────────┬─────────┘
//!                                          │ ChannelHandle(collaboration)
//!                                          ▼
//! ┌──────────────┐  watch status  ┌──────────────────┐
//! │ Supervisor   │ ◄───────────── │ConnectionManager │  backoff, breaker,
//! │ (UI state)   │ ─────────────► │ (actor)          │  health, credentials
//! └──────────────┘   connect()    └────────┬─────────┘
//!                                          │ chat │ collaboration │ presence
//!                                          ▼
//!                                 ┌──────────────────┐
//!                                 │ WsTransport      │  one socket, bincode
//!                                 └──────────────────┘  Envelope frames
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire frames and the bincode envelope
//! - [`transport`] — WebSocket multiplexing into logical sub-channels
//! - [`memory`] — In-process transport for tests
//! - [`connection`] — Session actor: reconnection, circuit breaker, health checks
//! - [`backoff`] — Exponential backoff with jitter and the circuit breaker
//! - [`credential`] — Credential source and JWT expiry inspection
//! - [`channel`] — Per-sub-channel send/receive handle
//! - [`document`] — CRDT replicas and the sync gate
//! - [`bridge`] — Wires document sync to the collaboration sub-channel
//! - [`supervisor`] — Presentation-level connection state machine
//! - [`presence`] — Per-document peer roster

pub mod backoff;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod connection;
pub mod credential;
pub mod document;
pub mod error;
pub mod memory;
pub mod presence;
pub mod protocol;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use backoff::{Backoff, CircuitBreaker, CircuitState};
pub use bridge::{ChannelSink, DocumentSync, SyncDriver};
pub use channel::ChannelHandle;
pub use config::{ConnectionConfig, TransportConfig};
pub use connection::{ConnectionManager, ConnectionMetrics, ConnectionStatus, SessionSnapshot};
pub use credential::{CredentialSource, StaticCredential};
pub use document::{
    ActiveView, DocumentHandle, DocumentSyncManager, ReplicaStatus, SyncPhase, UpdateSink,
};
pub use error::{AuthError, ConnectError, FetchError};
pub use memory::{MemoryPeer, MemoryTransport, OpenOutcome};
pub use presence::PresenceRoster;
pub use protocol::{
    Channel, ClientFrame, DocumentId, Envelope, ErrorCategory, PeerInfo, ProtocolError,
    ServerFrame,
};
pub use supervisor::{ConnectionState, ConnectionStateMachine, Supervisor, SupervisorHandle};
pub use transport::{ChannelLink, Transport, WsTransport};
