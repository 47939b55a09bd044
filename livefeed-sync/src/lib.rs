//! # livefeed-sync: push-stream replica synchronization
//!
//! Keeps an in-memory replica of remote state current by consuming a
//! server-sent-events feed of incremental deltas.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  text/event-stream  ┌─────────────────────┐
//! │ upstream feed    │ ──────────────────► │ ConnectionManager   │
//! └──────────────────┘                     │ (reconnect, reset)  │
//!                                          └──────────┬──────────┘
//!                                                     ▼
//!                      ┌──────────────┐     ┌─────────────────────┐
//!                      │ChunkAssembler│ ◄── │ Pipeline            │
//!                      └──────────────┘     │ envelope → Delta    │
//!                                           └──────────┬──────────┘
//!                                                      ▼
//! ┌──────────────────┐   (delta, replica)   ┌─────────────────────┐
//! │ ListenerRegistry │ ◄─────────────────── │ apply_delta         │
//! └──────────────────┘                      │ onto Replica        │
//!                                           └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`sse`]: Incremental `text/event-stream` decoder
//! - [`chunk`]: Fragment reassembly with bounded buffers
//! - [`envelope`]: `BASE64/GZIP:` envelope decoding
//! - [`delta`]: Parsed delta model (`deleted`/`invalidated` separated out)
//! - [`replica`]: Shared replica with stable record identity
//! - [`merge`]: Identity-preserving merge
//! - [`listener`]: Post-merge fan-out with failure isolation
//! - [`pipeline`]: Per-message handling and the once-per-session reset
//! - [`connection`]: Subscription lifecycle and reconnect timer
//! - [`transport`]: `EventSource` seam and the HTTP implementation
//! - [`config`]: Connection configuration and endpoint negotiation

pub mod chunk;
pub mod config;
pub mod connection;
pub mod delta;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod merge;
pub mod pipeline;
pub mod replica;
pub mod sse;
pub mod transport;

// Re-exports for convenience
pub use chunk::{AssemblerStats, AssemblyError, AssemblyPolicy, ChunkAssembler, Fragment};
pub use config::SyncConfig;
pub use connection::{ConnectionHandle, ConnectionManager, ConnectionState, ReconnectTimer};
pub use delta::{Delta, DeltaNode, DeltaValue};
pub use envelope::{encode_envelope, open_envelope, Opened, ENVELOPE_PREFIX};
pub use error::{ConfigError, DecodeError, SyncError};
pub use listener::{Listener, ListenerError, ListenerId, ListenerRegistry, ListenerStats, NotifyReport};
pub use merge::{apply_delta, MergeStats};
pub use pipeline::{Inbound, Outcome, Pipeline, ResetFlag};
pub use replica::{Record, Replica, Slot};
pub use sse::{SseDecoder, SseEvent};
pub use transport::{EventSource, EventStream, HttpEventSource, TransportError};
