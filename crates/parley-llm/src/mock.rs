use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;

use parley_core::backend::ChatBackend;
use parley_core::chat::ChatTurn;
use parley_core::errors::BackendError;
use parley_core::stream::{ChunkEvent, ChunkStream};

/// Pre-programmed stream outcomes for deterministic testing without a
/// running model server.
pub enum MockStream {
    /// Yield a fixed sequence of chunk events.
    Events(Vec<ChunkEvent>),
    /// Never yield anything — for cancellation tests.
    Pending,
    /// Wait a duration, then yield the inner stream's events.
    Delay(Duration, Box<MockStream>),
}

impl MockStream {
    /// Convenience: a stream of text fragments ending normally.
    pub fn fragments(parts: &[&str]) -> Self {
        let mut events: Vec<ChunkEvent> = parts
            .iter()
            .map(|p| ChunkEvent::Delta {
                delta: (*p).to_string(),
            })
            .collect();
        events.push(ChunkEvent::Done);
        Self::Events(events)
    }

    /// Convenience: a stream whose first element is a terminal error.
    pub fn fail(error: BackendError) -> Self {
        Self::Events(vec![ChunkEvent::Error { error }])
    }

    /// Convenience: fragments followed by a terminal error mid-stream.
    pub fn fragments_then_fail(parts: &[&str], error: BackendError) -> Self {
        let mut events: Vec<ChunkEvent> = parts
            .iter()
            .map(|p| ChunkEvent::Delta {
                delta: (*p).to_string(),
            })
            .collect();
        events.push(ChunkEvent::Error { error });
        Self::Events(events)
    }

    fn into_stream(self) -> ChunkStream {
        match self {
            Self::Events(events) => Box::pin(stream::iter(events)),
            Self::Pending => Box::pin(stream::pending()),
            Self::Delay(duration, inner) => {
                let delayed = async move {
                    tokio::time::sleep(duration).await;
                    inner.into_stream()
                };
                Box::pin(stream::once(delayed).flatten())
            }
        }
    }
}

/// A scripted request as the backend saw it.
#[derive(Clone, Debug)]
pub struct SeenRequest {
    pub history: Vec<ChatTurn>,
    pub prompt: String,
}

/// Mock backend that plays scripted streams in order and records the
/// requests it received.
pub struct MockBackend {
    scripts: Mutex<VecDeque<MockStream>>,
    seen: Mutex<Vec<SeenRequest>>,
    calls: AtomicUsize,
}

impl MockBackend {
    pub fn new(scripts: Vec<MockStream>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Requests received so far, oldest first.
    pub fn seen_requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, history: &[ChatTurn], prompt: &str) -> ChunkStream {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.seen.lock().push(SeenRequest {
            history: history.to_vec(),
            prompt: prompt.to_string(),
        });

        match self.scripts.lock().pop_front() {
            Some(script) => script.into_stream(),
            None => Box::pin(stream::iter([ChunkEvent::Error {
                error: BackendError::Unreachable("no scripted response".into()),
            }])),
        }
    }
}
