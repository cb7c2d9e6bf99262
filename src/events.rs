use crate::context::{ConnectionId, ContextState};
use crate::protocol::WordTiming;

use tokio::sync::broadcast;

/// Capacity of the event channel; slow subscribers lose the oldest events.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    ConnectionReady {
        connection: ConnectionId,
    },
    ConnectionStale {
        connection: ConnectionId,
        reason: String,
    },
    ContextStarted {
        connection: ConnectionId,
        context_id: String,
    },
    ContextFinished {
        connection: ConnectionId,
        context_id: String,
        state: ContextState,
    },
    Words {
        context_id: String,
        words: Vec<WordTiming>,
    },
    Interrupted {
        from: ConnectionId,
        to: ConnectionId,
        canceled: Option<String>,
    },
    PoolExhausted {
        fallback: ConnectionId,
    },
}

pub type EventSender = broadcast::Sender<SpeechEvent>;

pub fn channel() -> EventSender {
    broadcast::channel(EVENT_CAPACITY).0
}

/// Send without caring whether anyone listens.
pub fn emit(events: &EventSender, event: SpeechEvent) {
    let _ = events.send(event);
}
