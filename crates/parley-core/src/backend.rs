use async_trait::async_trait;

use crate::chat::ChatTurn;
use crate::stream::ChunkStream;

/// A chat-completion backend that streams its response as text fragments.
///
/// `stream` never fails: connection or status failures arrive as a single
/// terminal [`crate::stream::ChunkEvent::Error`] inside the returned
/// sequence, so callers forward a user-visible error instead of unwinding.
/// Implementations must not retry internally; retry policy belongs to the
/// caller.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Open a streamed completion for `history` (oldest-first, already
    /// bounded by the caller) plus the new `prompt` appended last.
    async fn stream(&self, history: &[ChatTurn], prompt: &str) -> ChunkStream;
}
