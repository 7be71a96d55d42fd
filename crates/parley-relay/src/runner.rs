use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use parley_core::backend::ChatBackend;
use parley_core::chat::{MessageRecord, Role};
use parley_core::events::ChatEvent;
use parley_core::ids::{ConversationId, TurnId};
use parley_core::stream::ChunkEvent;
use parley_store::conversations::ConversationRepo;
use parley_store::messages::MessageRepo;
use parley_store::Database;

use crate::error::RelayError;
use crate::turn::StreamingTurn;

const DEFAULT_HISTORY_WINDOW: usize = 20;

/// Configuration for the relay runner.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// How many recent messages accompany each prompt to the backend.
    pub history_window: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

/// Runs one relay turn: persist the user message → notify the session →
/// stream the backend response → fan out fragments → persist the result.
///
/// `run` returns `Err` instead of broadcasting failures itself; the
/// spawning orchestrator owns the single `error` + `aiThinking(false)`
/// broadcast so a failed turn produces exactly one of each.
pub struct TurnRunner {
    backend: Arc<dyn ChatBackend>,
    conversations: ConversationRepo,
    messages: MessageRepo,
    event_tx: broadcast::Sender<ChatEvent>,
    config: RelayConfig,
}

impl TurnRunner {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        db: Database,
        config: RelayConfig,
        event_tx: broadcast::Sender<ChatEvent>,
    ) -> Self {
        Self {
            backend,
            conversations: ConversationRepo::new(db.clone()),
            messages: MessageRepo::new(db),
            event_tx,
            config,
        }
    }

    fn send_event(&self, event: ChatEvent) {
        if self.event_tx.send(event).is_err() {
            warn!("no event receivers, event dropped");
        }
    }

    /// The message write is the turn's durability point; the conversation
    /// timestamp bump is secondary and must not fail the turn.
    fn touch_conversation(&self, conversation_id: &ConversationId) {
        if let Err(e) = self.conversations.touch(conversation_id) {
            warn!(conversation_id = %conversation_id, error = %e, "failed to bump conversation timestamp");
        }
    }

    /// Execute one full turn for `(conversation_id, text)`. `turn_id`
    /// identifies the ephemeral assistant stream on the wire and in the
    /// orchestrator's active-turn map.
    #[instrument(skip(self, text, cancel), fields(conversation_id = %conversation_id, turn_id = %turn_id))]
    pub async fn run(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        turn_id: TurnId,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        // Idle → UserMessagePersisted. A rejected write (conversation
        // missing, storage fault) fails the turn before any inference.
        let user_message = self.messages.create(conversation_id, Role::User, text, None)?;
        self.touch_conversation(conversation_id);

        // UserMessagePersisted → Thinking
        self.send_event(ChatEvent::MessageReceived {
            message: user_message.clone(),
        });
        self.send_event(ChatEvent::AiThinking {
            conversation_id: conversation_id.clone(),
            thinking: true,
        });

        // Thinking → Streaming
        self.send_event(ChatEvent::StreamStart {
            id: turn_id.clone(),
            conversation_id: conversation_id.clone(),
            role: Role::Assistant,
        });

        // The freshly persisted user message is excluded from the window;
        // it goes to the backend as the prompt, not as history.
        let history: Vec<_> = self
            .messages
            .recent_window(conversation_id, self.config.history_window, Some(&user_message.id))?
            .iter()
            .map(MessageRecord::to_turn)
            .collect();

        let mut stream = self.backend.stream(&history, text).await;
        let mut turn = StreamingTurn::new(turn_id);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    turn.fail();
                    return Err(RelayError::Cancelled);
                }
                event = stream.next() => event,
            };

            match event {
                Some(ChunkEvent::Delta { delta }) => {
                    turn.append(&delta);
                    self.send_event(ChatEvent::StreamChunk {
                        id: turn.id().clone(),
                        conversation_id: conversation_id.clone(),
                        content: delta,
                    });
                }
                Some(ChunkEvent::Error { error }) => {
                    turn.fail();
                    return Err(RelayError::Backend(error));
                }
                // A clean end without `done` is treated like completion.
                Some(ChunkEvent::Done) | None => break,
            }
        }

        if cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        // Streaming → Finalizing. Zero fragments still persist an empty
        // assistant message; the turn happened even if the model was mute.
        let metadata = serde_json::json!({ "model": self.backend.model() }).to_string();
        let assistant_message = self.messages.create(
            conversation_id,
            Role::Assistant,
            &turn.finish(),
            Some(&metadata),
        )?;
        self.touch_conversation(conversation_id);

        // Finalizing → Completed
        self.send_event(ChatEvent::StreamComplete {
            message: assistant_message,
        });
        self.send_event(ChatEvent::AiThinking {
            conversation_id: conversation_id.clone(),
            thinking: false,
        });

        Ok(())
    }
}
