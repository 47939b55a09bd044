//! Per-message handling for one subscription.
//!
//! ```text
//! SseEvent ─► classify ─┬─ Fragment ─► ChunkAssembler ─┐
//!                       └─ Message ────────────────────┴─► open_envelope
//!                                                           │
//!          notify ◄─ apply_delta (+ stamp) ◄─ reset? ◄─ Delta::parse
//! ```
//!
//! The pipeline owns the session-scoped state (assembler and reset flag); the
//! connection manager calls [`Pipeline::begin_session`] whenever a new
//! subscription opens.

use std::time::Instant;

use crate::chunk::{AssemblyPolicy, ChunkAssembler, Fragment};
use crate::delta::Delta;
use crate::envelope::open_envelope;
use crate::error::SyncError;
use crate::listener::{ListenerRegistry, NotifyReport};
use crate::merge::apply_delta;
use crate::replica::Replica;
use crate::sse::SseEvent;

/// SSE event name used for fragment records.
pub const CHUNK_EVENT: &str = "chunk";

/// What an inbound event carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Fragment(Fragment),
    Message(String),
}

impl Inbound {
    /// Classify an event. A `chunk` event must be a fragment record; other
    /// events are fragments only if they parse as an object carrying both
    /// `chunkId` and `payload`.
    pub fn classify(event: SseEvent) -> Result<Self, SyncError> {
        if event.name() == CHUNK_EVENT {
            return Ok(Self::Fragment(Fragment::parse(&event.data)?));
        }
        if looks_like_fragment(&event.data) {
            if let Ok(fragment) = Fragment::parse(&event.data) {
                if fragment.chunk_id.is_some() && fragment.payload.is_some() {
                    return Ok(Self::Fragment(fragment));
                }
            }
        }
        Ok(Self::Message(event.data))
    }
}

fn looks_like_fragment(data: &str) -> bool {
    data.trim_start().starts_with('{') && data.contains("\"chunkId\"")
}

/// Whether the next decoded message clears the replica first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResetFlag {
    Armed,
    #[default]
    Disarmed,
}

/// Result of handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A fragment was buffered; the message is not complete yet
    Pending,
    /// The message decoded to an empty delta; nothing was merged
    Empty,
    /// The delta was merged and listeners were notified
    Applied(NotifyReport),
}

pub struct Pipeline {
    replica: Replica,
    listeners: ListenerRegistry,
    assembler: ChunkAssembler,
    reset: ResetFlag,
}

impl Pipeline {
    pub fn new(replica: Replica, listeners: ListenerRegistry, policy: AssemblyPolicy) -> Self {
        Self {
            replica,
            listeners,
            assembler: ChunkAssembler::new(policy),
            reset: ResetFlag::Disarmed,
        }
    }

    /// A new subscription opened: arm the reset and start a fresh chunk id
    /// space.
    pub fn begin_session(&mut self) {
        self.reset = ResetFlag::Armed;
        self.assembler.reset();
    }

    pub fn reset_flag(&self) -> ResetFlag {
        self.reset
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn assembler(&self) -> &ChunkAssembler {
        &self.assembler
    }

    /// Drop incomplete sequences that outlived the policy's max age.
    pub fn sweep(&mut self) -> usize {
        self.assembler.evict_expired(Instant::now())
    }

    /// Handle one SSE event end to end.
    pub fn handle_event(&mut self, event: SseEvent) -> Result<Outcome, SyncError> {
        match Inbound::classify(event)? {
            Inbound::Fragment(fragment) => match self.assembler.push(fragment)? {
                Some(text) => self.handle_text(text),
                None => Ok(Outcome::Pending),
            },
            Inbound::Message(text) => self.handle_text(text),
        }
    }

    /// Handle one complete message.
    pub fn handle_text(&mut self, text: String) -> Result<Outcome, SyncError> {
        let opened = open_envelope(text)?;
        let delta = Delta::parse(&opened.text)?;
        log::debug!(
            "[sync] message decoded: {} bytes, compressed={}",
            opened.text.len(),
            opened.compressed
        );

        if self.reset == ResetFlag::Armed {
            log::info!("[sync] first message of session, resetting replica");
            self.replica.clear();
            self.reset = ResetFlag::Disarmed;
        }

        if delta.is_empty() {
            log::debug!("[sync] empty delta skipped");
            return Ok(Outcome::Empty);
        }

        let stats = apply_delta(&self.replica, &delta);
        log::debug!(
            "[sync] merged: deleted={} invalidated={} merged={} assigned={}",
            stats.deleted,
            stats.invalidated,
            stats.merged,
            stats.assigned
        );

        let report = self.listeners.notify(&delta, &self.replica);
        Ok(Outcome::Applied(report))
    }
}
