//! RPC method handlers organized by domain.

use std::sync::Arc;

use parley_core::ids::ConversationId;
use parley_relay::history;
use parley_store::conversations::ConversationRepo;
use parley_store::messages::MessageRepo;
use parley_store::{Database, StoreError};

use crate::client::{ConnectionId, ConnectionRegistry};
use crate::orchestrator::{ChatOrchestrator, SendParams};
use crate::rpc::{self, RpcResponse};

const DEFAULT_MESSAGE_LIMIT: usize = 50;

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub conversations: ConversationRepo,
    pub messages: MessageRepo,
    pub registry: Arc<ConnectionRegistry>,
    pub orchestrator: Arc<dyn ChatOrchestrator>,
}

impl HandlerState {
    pub fn new(
        db: Database,
        registry: Arc<ConnectionRegistry>,
        orchestrator: Arc<dyn ChatOrchestrator>,
    ) -> Self {
        Self {
            conversations: ConversationRepo::new(db.clone()),
            messages: MessageRepo::new(db),
            registry,
            orchestrator,
        }
    }
}

/// Dispatch an RPC method to the appropriate handler. `caller` is the
/// connection the request arrived on; join, leave, and send are
/// attributed to it.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    caller: &ConnectionId,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match method {
        // Chat
        "chat.send" => chat_send(state, caller, params, id).await,

        // Session membership
        "conversation.join" => conversation_join(state, caller, params, id),
        "conversation.leave" => conversation_leave(state, caller, params, id),

        // Conversation CRUD
        "conversation.create" => conversation_create(state, params, id),
        "conversation.list" => conversation_list(state, id),
        "conversation.get" => conversation_get(state, params, id),
        "conversation.rename" => conversation_rename(state, params, id),
        "conversation.delete" => conversation_delete(state, params, id),

        // Messages
        "messages.list" => messages_list(state, params, id),

        // System
        "system.ping" => system_ping(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

/// The browser client sends camelCase keys; accept snake_case too.
fn param_str<'a>(params: &'a serde_json::Value, camel: &str, snake: &str) -> Option<&'a str> {
    rpc::optional_str(params, camel).or_else(|| rpc::optional_str(params, snake))
}

fn require_conversation_id(params: &serde_json::Value) -> Result<ConversationId, String> {
    param_str(params, "conversationId", "conversation_id")
        .map(ConversationId::from_raw)
        .ok_or_else(|| "Missing required parameter: conversationId".into())
}

fn store_error_response(id: Option<serde_json::Value>, e: StoreError) -> RpcResponse {
    match e {
        StoreError::NotFound(what) => RpcResponse::not_found(id, what),
        other => RpcResponse::internal_error(id, other.to_string()),
    }
}

// ── Chat ──

async fn chat_send(
    state: &Arc<HandlerState>,
    caller: &ConnectionId,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let conversation_id = match require_conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let content = match rpc::require_str(params, "content") {
        Ok(c) => c.to_string(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    // The turn runs in the background; persistence or backend failures
    // reach subscribers as an `error` event, not as an RPC failure.
    let ack = state
        .orchestrator
        .send(SendParams {
            conversation_id,
            content,
            connection_id: caller.clone(),
        })
        .await;

    RpcResponse::success(
        id,
        serde_json::json!({
            "acknowledged": true,
            "turnId": ack.turn_id,
        }),
    )
}

// ── Session membership ──

fn conversation_join(
    state: &Arc<HandlerState>,
    caller: &ConnectionId,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let conversation_id = match require_conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    // Re-joining neither re-adds membership nor re-delivers history.
    let newly_joined = state.registry.join(caller, &conversation_id);
    if newly_joined {
        match history::load_history(&state.messages, &conversation_id) {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => {
                    state.registry.send_to(caller, json);
                }
                Err(e) => return RpcResponse::internal_error(id, e.to_string()),
            },
            Err(e) => return store_error_response(id, e),
        }
    }

    RpcResponse::success(id, serde_json::json!({"joined": true}))
}

fn conversation_leave(
    state: &Arc<HandlerState>,
    caller: &ConnectionId,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let conversation_id = match require_conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    state.registry.leave(caller, &conversation_id);
    RpcResponse::success(id, serde_json::json!({"left": true}))
}

// ── Conversation CRUD ──

fn conversation_create(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let title = rpc::optional_str(params, "title");
    let owner_id = param_str(params, "ownerId", "owner_id");

    match state.conversations.create(title, owner_id) {
        Ok(row) => RpcResponse::success(id, serde_json::json!({"conversation": row})),
        Err(e) => store_error_response(id, e),
    }
}

fn conversation_list(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    match state.conversations.list() {
        Ok(rows) => RpcResponse::success(id, serde_json::json!({"conversations": rows})),
        Err(e) => store_error_response(id, e),
    }
}

fn conversation_get(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let conversation_id = match require_conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match state.conversations.get(&conversation_id) {
        Ok(row) => RpcResponse::success(id, serde_json::json!({"conversation": row})),
        Err(e) => store_error_response(id, e),
    }
}

fn conversation_rename(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let conversation_id = match require_conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let title = match rpc::require_str(params, "title") {
        Ok(t) => t,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match state.conversations.rename(&conversation_id, title) {
        Ok(()) => RpcResponse::success(id, serde_json::json!({"renamed": true})),
        Err(e) => store_error_response(id, e),
    }
}

fn conversation_delete(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let conversation_id = match require_conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    match state.conversations.delete(&conversation_id) {
        Ok(()) => RpcResponse::success(id, serde_json::json!({"deleted": true})),
        Err(e) => store_error_response(id, e),
    }
}

// ── Messages ──

fn messages_list(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let conversation_id = match require_conversation_id(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let limit = rpc::optional_i64(params, "limit")
        .map(|l| l.max(0) as usize)
        .unwrap_or(DEFAULT_MESSAGE_LIMIT);

    // Most recent `limit` messages, oldest first.
    match state.messages.recent_window(&conversation_id, limit, None) {
        Ok(messages) => RpcResponse::success(id, serde_json::json!({"messages": messages})),
        Err(e) => store_error_response(id, e),
    }
}

// ── System ──

fn system_ping(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    RpcResponse::success(
        id,
        serde_json::json!({
            "status": "healthy",
            "connections": state.registry.count(),
        }),
    )
}
