use std::pin::Pin;

use futures::Stream;

use crate::errors::BackendError;

/// One step of a backend token stream. Contract per pull:
///
/// Delta* → (Done | Error)
///
/// `Done` and `Error` are terminal; nothing follows them.
#[derive(Clone, Debug)]
pub enum ChunkEvent {
    /// An incremental text fragment of the model's response.
    Delta { delta: String },
    /// The backend signalled completion (or the stream ended cleanly).
    Done,
    /// Terminal failure, injected in-stream so the consumer can forward a
    /// user-visible error without the stream call itself failing.
    Error { error: BackendError },
}

impl ChunkEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/// A lazy, finite sequence of chunk events from one backend request.
pub type ChunkStream = Pin<Box<dyn Stream<Item = ChunkEvent> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(ChunkEvent::Done.is_terminal());
        assert!(ChunkEvent::Error {
            error: BackendError::Unreachable("down".into())
        }
        .is_terminal());
        assert!(!ChunkEvent::Delta { delta: "x".into() }.is_terminal());
    }
}
