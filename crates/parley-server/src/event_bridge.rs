use std::sync::Arc;

use tokio::sync::broadcast;

use parley_core::events::ChatEvent;

use crate::client::ConnectionRegistry;

/// Forwards relay events from the broadcast channel to every connection
/// subscribed to the event's conversation.
///
/// One producer side (the orchestrator's turns) and one bridge task mean
/// events of a single turn reach each subscriber in emission order.
pub struct EventBridge {
    registry: Arc<ConnectionRegistry>,
}

impl EventBridge {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Spawn the forwarding task.
    pub fn start(&self, mut rx: broadcast::Receiver<ChatEvent>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        // historyLoaded goes to the joining connection
                        // only; the join handler delivers it directly.
                        if matches!(event, ChatEvent::HistoryLoaded { .. }) {
                            continue;
                        }
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                registry.broadcast_to_conversation(event.conversation_id(), &json);
                            }
                            Err(e) => {
                                tracing::error!(error = %e, event_type = event.event_type(), "failed to serialize event");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event bridge lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}

/// Create an event bridge wired to a broadcast channel.
pub fn create_bridge(
    registry: Arc<ConnectionRegistry>,
    rx: broadcast::Receiver<ChatEvent>,
) -> tokio::task::JoinHandle<()> {
    EventBridge::new(registry).start(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ids::ConversationId;

    #[tokio::test]
    async fn forwards_to_conversation_members() {
        let registry = Arc::new(ConnectionRegistry::new(32));
        let (tx, rx) = broadcast::channel(64);

        let (connection_id, mut connection_rx) = registry.register();
        let conversation_id = ConversationId::new();
        registry.join(&connection_id, &conversation_id);

        let handle = create_bridge(Arc::clone(&registry), rx);

        tx.send(ChatEvent::AiThinking {
            conversation_id: conversation_id.clone(),
            thinking: true,
        })
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let msg = connection_rx.try_recv().unwrap();
        assert!(msg.contains("\"type\":\"aiThinking\""));
        assert!(msg.contains(conversation_id.as_str()));

        handle.abort();
    }

    #[tokio::test]
    async fn ignores_other_conversations() {
        let registry = Arc::new(ConnectionRegistry::new(32));
        let (tx, rx) = broadcast::channel(64);

        let (connection_id, mut connection_rx) = registry.register();
        registry.join(&connection_id, &ConversationId::new());

        let _handle = create_bridge(Arc::clone(&registry), rx);

        tx.send(ChatEvent::AiThinking {
            conversation_id: ConversationId::new(),
            thinking: true,
        })
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(connection_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn never_broadcasts_history() {
        let registry = Arc::new(ConnectionRegistry::new(32));
        let (tx, rx) = broadcast::channel(64);

        let (connection_id, mut connection_rx) = registry.register();
        let conversation_id = ConversationId::new();
        registry.join(&connection_id, &conversation_id);

        let _handle = create_bridge(Arc::clone(&registry), rx);

        tx.send(ChatEvent::HistoryLoaded {
            conversation_id,
            messages: vec![],
        })
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(connection_rx.try_recv().is_err());
    }
}
