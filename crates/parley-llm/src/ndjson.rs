use serde::Deserialize;

use parley_core::errors::BackendError;

/// One decoded line of the backend's newline-delimited JSON response:
/// an incremental content fragment, a completion flag, or both.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendChunk {
    pub content: Option<String>,
    pub done: bool,
}

/// Decode one stream line of shape `{"message":{"role","content"},"done":bool}`.
/// Empty content collapses to `None` so the consumer emits no fragment for it.
pub fn parse_line(line: &str) -> Result<BackendChunk, BackendError> {
    let parsed: ChatLine = serde_json::from_str(line).map_err(|e| {
        BackendError::Protocol(format!("invalid stream line: {e}"))
    })?;

    let content = parsed
        .message
        .and_then(|m| m.content)
        .filter(|c| !c.is_empty());

    Ok(BackendChunk {
        content,
        done: parsed.done.unwrap_or(false),
    })
}

#[derive(Deserialize)]
struct ChatLine {
    message: Option<LineMessage>,
    done: Option<bool>,
}

#[derive(Deserialize)]
struct LineMessage {
    content: Option<String>,
}
