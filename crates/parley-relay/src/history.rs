use parley_core::events::ChatEvent;
use parley_core::ids::ConversationId;
use parley_store::messages::MessageRepo;
use parley_store::StoreError;

/// Build the `historyLoaded` event for a connection joining a conversation:
/// every message, ascending by timestamp. The caller delivers it to the
/// joining connection only; it is never broadcast to the session.
pub fn load_history(
    messages: &MessageRepo,
    conversation_id: &ConversationId,
) -> Result<ChatEvent, StoreError> {
    let messages = messages.list(conversation_id)?;
    Ok(ChatEvent::HistoryLoaded {
        conversation_id: conversation_id.clone(),
        messages,
    })
}
