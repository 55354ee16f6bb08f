//! Change notifications broadcast by the conversation controller.
//!
//! Views subscribe and re-derive what they show; they never mutate the
//! transcript directly.

use crate::core::chat_stream::StreamProgress;
use crate::core::message::Message;

/// Broadcast buffer per subscriber. Slow subscribers see `Lagged` and should
/// re-read the controller state.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    Streaming,
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// The active transcript was replaced or structurally changed.
    TranscriptChanged {
        session_id: String,
        messages: Vec<Message>,
    },
    /// The streaming reply at `index` now reads `progress`.
    Progress {
        session_id: String,
        index: usize,
        progress: StreamProgress,
    },
    GenerationChanged(GenerationState),
    ActiveSessionChanged(Option<String>),
    SessionsChanged,
}
