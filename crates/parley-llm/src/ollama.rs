use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use serde::Serialize;
use tracing::instrument;

use parley_core::backend::ChatBackend;
use parley_core::chat::ChatTurn;
use parley_core::errors::BackendError;
use parley_core::stream::{ChunkEvent, ChunkStream};

use crate::ndjson;

const CHAT_PATH: &str = "/api/chat";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. You provide clear, \
accurate, and helpful responses. You can format your responses using markdown.";

/// Configuration for the Ollama chat backend.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub base_url: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    /// No data for this long mid-stream counts as a dead backend.
    pub idle_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            model: "llama3.2".into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            temperature: 0.7,
            top_p: 0.9,
            idle_timeout: IDLE_TIMEOUT,
        }
    }
}

/// Chat backend speaking Ollama's `/api/chat` NDJSON streaming protocol.
/// Never retries; failures surface as a terminal in-stream error chunk.
pub struct OllamaBackend {
    client: Client,
    config: BackendConfig,
}

impl OllamaBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            config,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), CHAT_PATH)
    }

    fn build_request_body(&self, history: &[ChatTurn], prompt: &str) -> ChatRequest {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(WireMessage {
            role: "system".into(),
            content: self.config.system_prompt.clone(),
        });
        for turn in history {
            messages.push(WireMessage {
                role: turn.role.to_string(),
                content: turn.content.clone(),
            });
        }
        messages.push(WireMessage {
            role: "user".into(),
            content: prompt.to_string(),
        });

        ChatRequest {
            model: self.config.model.clone(),
            messages,
            stream: true,
            options: RequestOptions {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
            },
        }
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, history, prompt), fields(model = %self.config.model, history_len = history.len()))]
    async fn stream(&self, history: &[ChatTurn], prompt: &str) -> ChunkStream {
        let url = self.chat_url();
        let body = self.build_request_body(history, prompt);

        let resp = match self.client.post(&url).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                return single_error(BackendError::Unreachable(format!(
                    "cannot connect to {url}: {e}"
                )));
            }
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return single_error(BackendError::Unreachable(format!(
                "backend returned status {status}: {body}"
            )));
        }

        Box::pin(NdjsonStream::new(resp.bytes_stream(), self.config.idle_timeout))
    }
}

/// A stream of exactly one terminal error chunk.
fn single_error(error: BackendError) -> ChunkStream {
    Box::pin(futures::stream::iter([ChunkEvent::Error { error }]))
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    options: RequestOptions,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct RequestOptions {
    temperature: f32,
    top_p: f32,
}

/// Wraps the response byte stream and yields ChunkEvents per NDJSON line.
/// Includes an idle timeout — if no data arrives within `idle_duration`,
/// a terminal error is injected.
struct NdjsonStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    pending: Vec<ChunkEvent>,
    finished: bool,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
}

impl NdjsonStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: String::new(),
            pending: Vec::new(),
            finished: false,
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
        }
    }

    fn terminal_queued(&self) -> bool {
        self.pending.iter().any(ChunkEvent::is_terminal)
    }

    /// Decode complete lines from the buffer into pending events. Stops at
    /// the first terminal event; anything after it is dropped unread.
    fn drain_lines(&mut self) {
        while !self.terminal_queued() {
            let Some(pos) = self.buffer.find('\n') else {
                break;
            };
            let line = self.buffer[..pos].trim().to_string();
            self.buffer.drain(..=pos);
            self.ingest_line(&line);
        }
    }

    fn ingest_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        match ndjson::parse_line(line) {
            Ok(chunk) => {
                if chunk.done {
                    self.pending.push(ChunkEvent::Done);
                } else if let Some(content) = chunk.content {
                    self.pending.push(ChunkEvent::Delta { delta: content });
                }
            }
            Err(error) => {
                self.pending.push(ChunkEvent::Error { error });
            }
        }
    }

    fn pop_pending(&mut self) -> Option<ChunkEvent> {
        if self.pending.is_empty() {
            return None;
        }
        let event = self.pending.remove(0);
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }
}

impl Stream for NdjsonStream {
    type Item = ChunkEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        if self.finished {
            return std::task::Poll::Ready(None);
        }

        if let Some(event) = self.pop_pending() {
            return std::task::Poll::Ready(Some(event));
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                std::task::Poll::Ready(Some(Ok(bytes))) => {
                    // Data received — reset idle timer
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    self.buffer.push_str(&text);
                    self.drain_lines();

                    if let Some(event) = self.pop_pending() {
                        return std::task::Poll::Ready(Some(event));
                    }
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return std::task::Poll::Ready(Some(ChunkEvent::Error {
                        error: BackendError::Unreachable(format!("stream interrupted: {e}")),
                    }));
                }
                std::task::Poll::Ready(None) => {
                    // Clean end of stream — flush a trailing unterminated line,
                    // then signal normal completion.
                    let remaining = std::mem::take(&mut self.buffer);
                    let remaining = remaining.trim().to_string();
                    if !self.terminal_queued() {
                        self.ingest_line(&remaining);
                    }
                    if !self.terminal_queued() {
                        self.pending.push(ChunkEvent::Done);
                    }
                    if let Some(event) = self.pop_pending() {
                        return std::task::Poll::Ready(Some(event));
                    }
                    self.finished = true;
                    return std::task::Poll::Ready(None);
                }
                std::task::Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return std::task::Poll::Ready(Some(ChunkEvent::Error {
                            error: BackendError::Unreachable(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return std::task::Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parley_core::chat::ChatTurn;

    async fn collect(stream: &mut ChunkStream) -> Vec<ChunkEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    fn channel_stream() -> (
        tokio::sync::mpsc::Sender<Result<bytes::Bytes, reqwest::Error>>,
        ChunkStream,
    ) {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, reqwest::Error>>(16);
        let stream = NdjsonStream::new(
            tokio_stream::wrappers::ReceiverStream::new(rx),
            Duration::from_secs(5),
        );
        (tx, Box::pin(stream))
    }

    #[test]
    fn request_body_shape() {
        let backend = OllamaBackend::new(BackendConfig::default());
        let history = vec![ChatTurn::user("earlier"), ChatTurn::assistant("reply")];
        let body = backend.build_request_body(&history, "new prompt");
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["model"], "llama3.2");
        assert_eq!(json["stream"], true);
        assert!((json["options"]["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
        assert!((json["options"]["top_p"].as_f64().unwrap() - 0.9).abs() < 1e-6);

        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "earlier");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["role"], "user");
        assert_eq!(messages[3]["content"], "new prompt");
    }

    #[test]
    fn chat_url_strips_trailing_slash() {
        let backend = OllamaBackend::new(BackendConfig {
            base_url: "http://localhost:11434/".into(),
            ..Default::default()
        });
        assert_eq!(backend.chat_url(), "http://localhost:11434/api/chat");
    }

    #[tokio::test]
    async fn streams_fragments_then_done() {
        let (tx, mut stream) = channel_stream();

        tx.send(Ok(bytes::Bytes::from(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"done\":false}\n",
        )))
        .await
        .unwrap();
        tx.send(Ok(bytes::Bytes::from(
            "{\"message\":{\"role\":\"assistant\",\"content\":\" there\"},\"done\":false}\n{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
        )))
        .await
        .unwrap();
        drop(tx);

        let events = collect(&mut stream).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ChunkEvent::Delta { delta } if delta == "Hi"));
        assert!(matches!(&events[1], ChunkEvent::Delta { delta } if delta == " there"));
        assert!(matches!(events[2], ChunkEvent::Done));
    }

    #[tokio::test]
    async fn fragment_split_across_byte_chunks() {
        let (tx, mut stream) = channel_stream();

        tx.send(Ok(bytes::Bytes::from(
            "{\"message\":{\"role\":\"assistant\",\"con",
        )))
        .await
        .unwrap();
        tx.send(Ok(bytes::Bytes::from("tent\":\"joined\"},\"done\":false}\n")))
            .await
            .unwrap();
        drop(tx);

        let events = collect(&mut stream).await;
        assert!(matches!(&events[0], ChunkEvent::Delta { delta } if delta == "joined"));
        assert!(matches!(events.last(), Some(ChunkEvent::Done)));
    }

    #[tokio::test]
    async fn done_flag_stops_consumption() {
        let (tx, mut stream) = channel_stream();

        tx.send(Ok(bytes::Bytes::from(
            "{\"done\":true}\n{\"message\":{\"role\":\"assistant\",\"content\":\"ignored\"},\"done\":false}\n",
        )))
        .await
        .unwrap();
        drop(tx);

        let events = collect(&mut stream).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChunkEvent::Done));
    }

    #[tokio::test]
    async fn invalid_line_is_terminal_protocol_error() {
        let (tx, mut stream) = channel_stream();

        tx.send(Ok(bytes::Bytes::from(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"ok\"},\"done\":false}\nthis is not json\n",
        )))
        .await
        .unwrap();
        drop(tx);

        let events = collect(&mut stream).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ChunkEvent::Delta { .. }));
        assert!(matches!(
            &events[1],
            ChunkEvent::Error {
                error: BackendError::Protocol(_)
            }
        ));
    }

    #[tokio::test]
    async fn eof_without_done_completes_normally() {
        let (tx, mut stream) = channel_stream();

        tx.send(Ok(bytes::Bytes::from(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"tail\"},\"done\":false}",
        )))
        .await
        .unwrap();
        drop(tx);

        let events = collect(&mut stream).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ChunkEvent::Delta { delta } if delta == "tail"));
        assert!(matches!(events[1], ChunkEvent::Done));
    }

    #[tokio::test]
    async fn empty_stream_yields_single_done() {
        let (tx, mut stream) = channel_stream();
        drop(tx);

        let events = collect(&mut stream).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChunkEvent::Done));
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_no_data() {
        tokio::time::pause();

        let byte_stream = futures::stream::pending::<Result<bytes::Bytes, reqwest::Error>>();
        let mut stream = Box::pin(NdjsonStream::new(byte_stream, Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;

        let event = stream.next().await;
        assert!(
            matches!(
                &event,
                Some(ChunkEvent::Error {
                    error: BackendError::Unreachable(msg)
                }) if msg.contains("idle timeout")
            ),
            "expected idle timeout error, got: {event:?}"
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_resets_on_data() {
        tokio::time::pause();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, reqwest::Error>>(16);
        let mut stream = Box::pin(NdjsonStream::new(
            tokio_stream::wrappers::ReceiverStream::new(rx),
            Duration::from_secs(5),
        ));

        tx.send(Ok(bytes::Bytes::from(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"a\"},\"done\":false}\n",
        )))
        .await
        .unwrap();
        let _ = stream.next().await;

        // 4s is inside the window measured from the reset point.
        tokio::time::advance(Duration::from_secs(4)).await;
        tx.send(Ok(bytes::Bytes::from(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"b\"},\"done\":false}\n",
        )))
        .await
        .unwrap();
        let _ = stream.next().await;

        drop(tx);
        let event = stream.next().await;
        assert!(matches!(event, Some(ChunkEvent::Done)), "got: {event:?}");
    }

    #[tokio::test]
    async fn connect_refused_yields_single_unreachable_error() {
        // Nothing listens on this port; the connection is refused locally.
        let backend = OllamaBackend::new(BackendConfig {
            base_url: "http://127.0.0.1:9".into(),
            ..Default::default()
        });
        let mut stream = backend.stream(&[], "hello").await;

        let event = stream.next().await;
        assert!(
            matches!(
                &event,
                Some(ChunkEvent::Error {
                    error: BackendError::Unreachable(_)
                })
            ),
            "got: {event:?}"
        );
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn defaults_match_backend_contract() {
        let config = BackendConfig::default();
        assert_eq!(config.base_url, "http://localhost:11434");
        assert_eq!(config.model, "llama3.2");
        assert!(config.system_prompt.contains("helpful AI assistant"));
        assert_eq!(CONNECT_TIMEOUT, Duration::from_secs(10));
        assert_eq!(IDLE_TIMEOUT, Duration::from_secs(90));
    }
}
