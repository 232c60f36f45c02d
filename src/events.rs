//! Notifications emitted to the owning application
//!
//! The engine pushes every protocol milestone into an [`EventSink`]
//! injected at construction. Emission is synchronous, in the same call
//! stack as the packet or API call that triggered it; the sink must not
//! call back into the engine.

use crate::crypto::{FinalResult, GenerationId};
use crate::transport::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A generation record was created, locally or from an inbound INIT.
    Init {
        id: GenerationId,
        participants: usize,
    },

    /// A commitment was collected; `have` of `total` are now on record.
    Commit {
        id: GenerationId,
        have: usize,
        total: usize,
    },

    /// A secret was collected (or the local one broadcast).
    Secret {
        id: GenerationId,
        have: usize,
        total: usize,
    },

    /// A revealed secret did not match its commitment. The offending
    /// secret was discarded; the generation keeps running but cannot
    /// complete without a valid reveal from this participant.
    ValidationError { id: GenerationId, peer: PeerId },

    /// Every secret validated; the combined result is cached and
    /// queryable from now on.
    Done {
        id: GenerationId,
        result: FinalResult,
    },
}

/// Receives engine events.
pub trait EventSink {
    fn on_event(&mut self, event: Event);
}

/// Sink for hosts that do not care about events.
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&mut self, _event: Event) {}
}
