use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use memchr::memchr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ChatMessage, ChatRequest, ChatResponse};
use crate::core::model_config::ModelConfig;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Cumulative state of a streamed reply, handed to progress callbacks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamProgress {
    pub content: String,
    pub reasoning_content: String,
    pub is_thinking: bool,
}

/// Final text of a completed stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamOutcome {
    pub content: String,
    pub reasoning_content: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// Cancelled through `abort_current`.
    User,
    /// Cancelled because a newer request started on the same client.
    Superseded,
}

#[derive(Debug)]
pub enum StreamError {
    /// The endpoint answered with a non-success status.
    Http { status: u16, body: String },
    /// A `data:` payload could not be read as a completion chunk.
    Api(String),
    /// Connecting or reading the body failed.
    Transport(reqwest::Error),
    /// No chunk arrived within the idle limit.
    Timeout(Duration),
    Cancelled(CancelReason),
}

impl StreamError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, StreamError::Cancelled(_))
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Http { status, body } => {
                write!(f, "API request failed with status {status}: {body}")
            }
            StreamError::Api(message) => write!(f, "{message}"),
            StreamError::Transport(source) => write!(f, "request failed: {source}"),
            StreamError::Timeout(limit) => write!(
                f,
                "no response from the model within {} seconds",
                limit.as_secs()
            ),
            StreamError::Cancelled(CancelReason::User) => write!(f, "response cancelled"),
            StreamError::Cancelled(CancelReason::Superseded) => {
                write!(f, "response superseded by a newer request")
            }
        }
    }
}

impl StdError for StreamError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            StreamError::Transport(source) => Some(source),
            _ => None,
        }
    }
}

/// Optional request knobs shared by every call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub endpoint: String,
    pub api_key: String,
    pub body: ChatRequest,
}

impl StreamRequest {
    pub fn new(config: &ModelConfig, messages: Vec<ChatMessage>, options: &RequestOptions) -> Self {
        Self {
            endpoint: config.url.trim().to_string(),
            api_key: config.key.trim().to_string(),
            body: ChatRequest {
                model: config.model.trim().to_string(),
                messages,
                stream: true,
                temperature: options.temperature,
                max_tokens: options.max_tokens,
            },
        }
    }
}

/// Streaming chat-completion backend.
///
/// At most one request is in flight per client. Starting a request cancels
/// the previous one, which then resolves with
/// `StreamError::Cancelled(CancelReason::Superseded)`.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn stream_chat(
        &self,
        request: StreamRequest,
        on_progress: &mut (dyn for<'p> FnMut(&'p StreamProgress) + Send),
    ) -> Result<StreamOutcome, StreamError>;

    /// Cancel the in-flight request, if any. Progress already delivered is kept.
    fn abort_current(&self);
}

/// Accumulates streamed deltas into cumulative text.
#[derive(Default, Debug)]
pub struct StreamAccumulator {
    raw_content: String,
    reasoning: String,
}

impl StreamAccumulator {
    /// Append one delta. Returns whether anything changed.
    pub fn push(&mut self, content: Option<&str>, reasoning: Option<&str>) -> bool {
        let mut changed = false;
        if let Some(text) = reasoning.filter(|text| !text.is_empty()) {
            self.reasoning.push_str(text);
            changed = true;
        }
        if let Some(text) = content.filter(|text| !text.is_empty()) {
            self.raw_content.push_str(text);
            changed = true;
        }
        changed
    }

    pub fn progress(&self) -> StreamProgress {
        let (inline_reasoning, content, inline_open) = split_inline_reasoning(&self.raw_content);

        let mut reasoning_content = self.reasoning.clone();
        if !inline_reasoning.is_empty() {
            if !reasoning_content.is_empty() {
                reasoning_content.push('\n');
            }
            reasoning_content.push_str(inline_reasoning);
        }

        let is_thinking = inline_open || (content.is_empty() && !reasoning_content.is_empty());

        StreamProgress {
            content: content.to_string(),
            reasoning_content,
            is_thinking,
        }
    }

    pub fn finish(&self) -> StreamOutcome {
        let progress = self.progress();
        StreamOutcome {
            content: progress.content,
            reasoning_content: progress.reasoning_content,
        }
    }
}

/// Split a leading `<think>` block out of streamed content.
///
/// Returns `(reasoning, answer, block_still_open)`. Partial tags at the
/// stream edge are held back so neither channel ever shrinks.
fn split_inline_reasoning(raw: &str) -> (&str, &str, bool) {
    let trimmed = raw.trim_start();

    if trimmed.len() < THINK_OPEN.len() && THINK_OPEN.starts_with(trimmed) {
        return ("", "", false);
    }

    let Some(after_open) = trimmed.strip_prefix(THINK_OPEN) else {
        return ("", raw, false);
    };

    match after_open.find(THINK_CLOSE) {
        Some(end) => {
            let reasoning = after_open[..end].trim();
            let answer = after_open[end + THINK_CLOSE.len()..].trim_start();
            (reasoning, answer, false)
        }
        None => {
            // Trailing whitespace is held back until the block closes.
            let reasoning = trim_partial_suffix(after_open, THINK_CLOSE).trim();
            (reasoning, "", true)
        }
    }
}

fn trim_partial_suffix<'a>(text: &'a str, tag: &str) -> &'a str {
    for len in (1..tag.len()).rev() {
        if text.ends_with(&tag[..len]) {
            return &text[..text.len() - len];
        }
    }
    text
}

/// Splits a byte stream into trimmed lines.
#[derive(Default)]
pub(crate) struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub(crate) fn next_line(&mut self) -> Option<String> {
        loop {
            let newline_pos = memchr(b'\n', &self.buffer)?;
            let line = match std::str::from_utf8(&self.buffer[..newline_pos]) {
                Ok(s) => Some(s.trim().to_string()),
                Err(e) => {
                    warn!("Invalid UTF-8 in stream: {e}");
                    None
                }
            };
            self.buffer.drain(..=newline_pos);
            if let Some(line) = line {
                return Some(line);
            }
        }
    }

    /// Whatever is left once the body ends without a trailing newline.
    pub(crate) fn take_remainder(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Ignored,
    Delta,
    Done,
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn handle_data_payload(
    payload: &str,
    accumulator: &mut StreamAccumulator,
) -> Result<SseEvent, StreamError> {
    if payload == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    if payload.trim().is_empty() {
        return Ok(SseEvent::Ignored);
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => {
            let changed = response.choices.first().is_some_and(|choice| {
                accumulator.push(
                    choice.delta.content.as_deref(),
                    choice.delta.reasoning_content.as_deref(),
                )
            });
            Ok(if changed {
                SseEvent::Delta
            } else {
                SseEvent::Ignored
            })
        }
        Err(_) => Err(StreamError::Api(format_api_error(payload))),
    }
}

fn process_sse_line(
    line: &str,
    accumulator: &mut StreamAccumulator,
) -> Result<SseEvent, StreamError> {
    match extract_data_payload(line) {
        Some(payload) => handle_data_payload(payload, accumulator),
        None => Ok(SseEvent::Ignored),
    }
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.to_string()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
}

pub(crate) fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error: <empty>".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            return match extract_error_summary(&json_value) {
                Some(summary) if !summary.is_empty() => {
                    format!("API Error: {summary}\n```json\n{pretty_json}\n```")
                }
                _ => format!("API Error:\n```json\n{pretty_json}\n```"),
            };
        }
    }

    format!("API Error:\n```\n{trimmed}\n```")
}

#[derive(Clone)]
struct ActiveStream {
    id: u64,
    token: CancellationToken,
    superseded: Arc<AtomicBool>,
}

impl ActiveStream {
    fn cancel_reason(&self) -> CancelReason {
        if self.superseded.load(Ordering::SeqCst) {
            CancelReason::Superseded
        } else {
            CancelReason::User
        }
    }
}

/// `ChatClient` speaking the OpenAI-compatible streaming protocol over reqwest.
pub struct HttpChatClient {
    client: reqwest::Client,
    idle_timeout: Option<Duration>,
    active: Mutex<Option<ActiveStream>>,
    next_stream_id: AtomicU64,
}

impl HttpChatClient {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self::with_client(reqwest::Client::new(), idle_timeout)
    }

    pub fn with_client(client: reqwest::Client, idle_timeout: Option<Duration>) -> Self {
        Self {
            client,
            idle_timeout,
            active: Mutex::new(None),
            next_stream_id: AtomicU64::new(1),
        }
    }

    fn begin_stream(&self) -> ActiveStream {
        let stream = ActiveStream {
            id: self.next_stream_id.fetch_add(1, Ordering::SeqCst),
            token: CancellationToken::new(),
            superseded: Arc::new(AtomicBool::new(false)),
        };

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = active.replace(stream.clone()) {
            debug!(stream_id = previous.id, "superseding in-flight stream");
            previous.superseded.store(true, Ordering::SeqCst);
            previous.token.cancel();
        }
        stream
    }

    fn end_stream(&self, id: u64) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.as_ref().is_some_and(|stream| stream.id == id) {
            active.take();
        }
    }

    async fn within_idle_limit<F: std::future::Future>(&self, fut: F) -> Result<F::Output, StreamError> {
        match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| StreamError::Timeout(limit)),
            None => Ok(fut.await),
        }
    }

    async fn run_stream(
        &self,
        request: &StreamRequest,
        on_progress: &mut (dyn for<'p> FnMut(&'p StreamProgress) + Send),
    ) -> Result<StreamOutcome, StreamError> {
        let http_request = self
            .client
            .post(&request.endpoint)
            .header("Content-Type", "application/json")
            .bearer_auth(&request.api_key)
            .json(&request.body);

        let response = self
            .within_idle_limit(http_request.send())
            .await?
            .map_err(StreamError::Transport)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(StreamError::Http {
                status,
                body: format_api_error(&error_text),
            });
        }

        let mut stream = response.bytes_stream();
        let mut lines = SseLineBuffer::default();
        let mut accumulator = StreamAccumulator::default();

        while let Some(chunk) = self.within_idle_limit(stream.next()).await? {
            let chunk = chunk.map_err(StreamError::Transport)?;
            lines.push(&chunk);

            while let Some(line) = lines.next_line() {
                match process_sse_line(&line, &mut accumulator)? {
                    SseEvent::Delta => on_progress(&accumulator.progress()),
                    SseEvent::Done => return Ok(accumulator.finish()),
                    SseEvent::Ignored => {}
                }
            }
        }

        if let Some(line) = lines.take_remainder() {
            if process_sse_line(&line, &mut accumulator)? == SseEvent::Delta {
                on_progress(&accumulator.progress());
            }
        }

        Ok(accumulator.finish())
    }
}

impl Default for HttpChatClient {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn stream_chat(
        &self,
        request: StreamRequest,
        on_progress: &mut (dyn for<'p> FnMut(&'p StreamProgress) + Send),
    ) -> Result<StreamOutcome, StreamError> {
        let active = self.begin_stream();
        debug!(
            stream_id = active.id,
            model = %request.body.model,
            messages = request.body.messages.len(),
            "starting chat stream"
        );

        let result = tokio::select! {
            biased;
            _ = active.token.cancelled() => Err(StreamError::Cancelled(active.cancel_reason())),
            result = self.run_stream(&request, on_progress) => result,
        };

        self.end_stream(active.id);
        debug!(stream_id = active.id, ok = result.is_ok(), "chat stream finished");
        result
    }

    fn abort_current(&self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = active.take() {
            debug!(stream_id = stream.id, "aborting chat stream");
            stream.token.cancel();
        }
    }
}
