//! Chat orchestrator — accepts inbound sends and drives relay turns.
//!
//! Each send spawns one background task running the relay state machine.
//! Failures are contained here: a failed turn produces exactly one
//! `error` broadcast plus an `aiThinking(false)` reset, and nothing
//! escapes to other conversations or the serving loop.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use parley_core::events::ChatEvent;
use parley_core::ids::{ConversationId, TurnId};
use parley_relay::error::USER_FACING_ERROR;
use parley_relay::{RelayError, TurnRunner};

use crate::client::ConnectionId;

/// Parameters for one inbound send.
#[derive(Clone, Debug)]
pub struct SendParams {
    pub conversation_id: ConversationId,
    pub content: String,
    pub connection_id: ConnectionId,
}

/// Acknowledgement returned before the turn runs.
#[derive(Clone, Debug)]
pub struct SendAck {
    pub turn_id: TurnId,
}

/// Trait for accepting sends and managing in-flight turns.
#[async_trait]
pub trait ChatOrchestrator: Send + Sync {
    /// Accept a send and start its turn. The turn itself runs in the
    /// background; outcome reaches subscribers as events.
    async fn send(&self, params: SendParams) -> SendAck;

    /// Cancel one in-flight turn. Returns whether it was active.
    fn cancel(&self, turn_id: &TurnId) -> bool;

    /// Cancel every turn a disconnected connection initiated. Returns
    /// how many were cancelled.
    fn cancel_for_connection(&self, connection_id: &ConnectionId) -> usize;

    /// In-flight turns for a conversation. Concurrent sends into one
    /// conversation are permitted, so this can exceed one.
    fn active_turns(&self, conversation_id: &ConversationId) -> usize;
}

struct ActiveTurn {
    cancel: CancellationToken,
    connection_id: ConnectionId,
    conversation_id: ConversationId,
}

/// Production orchestrator backed by the relay runner.
pub struct RelayOrchestrator {
    runner: Arc<TurnRunner>,
    event_tx: broadcast::Sender<ChatEvent>,
    active: Arc<DashMap<TurnId, ActiveTurn>>,
}

impl RelayOrchestrator {
    pub fn new(runner: TurnRunner, event_tx: broadcast::Sender<ChatEvent>) -> Self {
        Self {
            runner: Arc::new(runner),
            event_tx,
            active: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl ChatOrchestrator for RelayOrchestrator {
    async fn send(&self, params: SendParams) -> SendAck {
        let turn_id = TurnId::new();
        let cancel = CancellationToken::new();

        self.active.insert(
            turn_id.clone(),
            ActiveTurn {
                cancel: cancel.clone(),
                connection_id: params.connection_id,
                conversation_id: params.conversation_id.clone(),
            },
        );

        let runner = Arc::clone(&self.runner);
        let event_tx = self.event_tx.clone();
        let active = Arc::clone(&self.active);
        let spawned_turn_id = turn_id.clone();

        tokio::spawn(async move {
            let result = runner
                .run(
                    &params.conversation_id,
                    &params.content,
                    spawned_turn_id.clone(),
                    &cancel,
                )
                .await;

            match result {
                Ok(()) => {}
                Err(RelayError::Cancelled) => {
                    tracing::debug!(
                        conversation_id = %params.conversation_id,
                        turn_id = %spawned_turn_id,
                        "turn cancelled"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        conversation_id = %params.conversation_id,
                        turn_id = %spawned_turn_id,
                        kind = e.error_kind(),
                        error = %e,
                        "turn failed"
                    );
                    let _ = event_tx.send(ChatEvent::Error {
                        conversation_id: params.conversation_id.clone(),
                        message: USER_FACING_ERROR.into(),
                        details: e.to_string(),
                    });
                    let _ = event_tx.send(ChatEvent::AiThinking {
                        conversation_id: params.conversation_id.clone(),
                        thinking: false,
                    });
                }
            }

            active.remove(&spawned_turn_id);
        });

        SendAck { turn_id }
    }

    fn cancel(&self, turn_id: &TurnId) -> bool {
        if let Some((_, turn)) = self.active.remove(turn_id) {
            turn.cancel.cancel();
            true
        } else {
            false
        }
    }

    fn cancel_for_connection(&self, connection_id: &ConnectionId) -> usize {
        let owned: Vec<TurnId> = self
            .active
            .iter()
            .filter(|entry| &entry.value().connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        let cancelled = owned.len();
        for turn_id in owned {
            self.cancel(&turn_id);
        }
        cancelled
    }

    fn active_turns(&self, conversation_id: &ConversationId) -> usize {
        self.active
            .iter()
            .filter(|entry| &entry.value().conversation_id == conversation_id)
            .count()
    }
}
