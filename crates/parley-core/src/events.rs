use serde::{Deserialize, Serialize};

use crate::chat::{MessageRecord, Role};
use crate::ids::{ConversationId, TurnId};

/// Events pushed to live connections during a relay turn. Serialized
/// directly onto the wire; tag and field names match what the browser
/// client listens for.
///
/// Within one conversation, events emitted by a single relay invocation
/// reach each subscriber in emission order. `HistoryLoaded` is the one
/// variant that is never broadcast: it goes to the joining connection only.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatEvent {
    #[serde(rename = "historyLoaded", rename_all = "camelCase")]
    HistoryLoaded {
        conversation_id: ConversationId,
        messages: Vec<MessageRecord>,
    },

    #[serde(rename = "messageReceived")]
    MessageReceived { message: MessageRecord },

    #[serde(rename = "aiThinking", rename_all = "camelCase")]
    AiThinking {
        conversation_id: ConversationId,
        thinking: bool,
    },

    #[serde(rename = "streamStart", rename_all = "camelCase")]
    StreamStart {
        id: TurnId,
        conversation_id: ConversationId,
        role: Role,
    },

    #[serde(rename = "streamChunk", rename_all = "camelCase")]
    StreamChunk {
        id: TurnId,
        conversation_id: ConversationId,
        content: String,
    },

    #[serde(rename = "streamComplete")]
    StreamComplete { message: MessageRecord },

    /// Generic user-facing message plus diagnostic detail.
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        conversation_id: ConversationId,
        message: String,
        details: String,
    },
}

impl ChatEvent {
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::HistoryLoaded { conversation_id, .. }
            | Self::AiThinking { conversation_id, .. }
            | Self::StreamStart { conversation_id, .. }
            | Self::StreamChunk { conversation_id, .. }
            | Self::Error { conversation_id, .. } => conversation_id,
            Self::MessageReceived { message } | Self::StreamComplete { message } => {
                &message.conversation_id
            }
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::HistoryLoaded { .. } => "historyLoaded",
            Self::MessageReceived { .. } => "messageReceived",
            Self::AiThinking { .. } => "aiThinking",
            Self::StreamStart { .. } => "streamStart",
            Self::StreamChunk { .. } => "streamChunk",
            Self::StreamComplete { .. } => "streamComplete",
            Self::Error { .. } => "error",
        }
    }
}
