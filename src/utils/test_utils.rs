#[cfg(test)]
use crate::core::chat_stream::{
    CancelReason, ChatClient, StreamError, StreamOutcome, StreamProgress, StreamRequest,
};
#[cfg(test)]
use crate::core::conversation::ConversationController;
#[cfg(test)]
use crate::core::model_config::ModelConfig;
#[cfg(test)]
use crate::core::store::{MemoryStore, Persistence};
#[cfg(test)]
use async_trait::async_trait;
#[cfg(test)]
use std::collections::VecDeque;
#[cfg(test)]
use std::sync::{Arc, Mutex};
#[cfg(test)]
use tokio::sync::Notify;
#[cfg(test)]
use tokio_util::sync::CancellationToken;

/// How the scripted client answers one request.
#[cfg(test)]
pub enum ScriptedReply {
    /// Deliver each chunk as cumulative text, then finish with the last one.
    Chunks(Vec<&'static str>),
    /// Wait for the gate, then deliver `text` and finish.
    Gated { gate: Arc<Notify>, text: &'static str },
    /// Deliver `partial`, then wait until aborted.
    UntilAborted { partial: &'static str },
    /// Deliver `reasoning` as a thinking update, then finish with `content`.
    Reasoning {
        reasoning: &'static str,
        content: &'static str,
    },
    Fail(StreamError),
}

/// In-process `ChatClient` answering from a queue of scripted replies and
/// recording every request.
#[cfg(test)]
#[derive(Default)]
pub struct ScriptedClient {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<StreamRequest>>,
    current: Mutex<Option<CancellationToken>>,
}

#[cfg(test)]
impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request_messages(&self) -> Vec<(String, String)> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .map(|request| {
                request
                    .body
                    .messages
                    .iter()
                    .map(|m| (m.role.clone(), m.content.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
fn progress(content: &str, reasoning: &str, is_thinking: bool) -> StreamProgress {
    StreamProgress {
        content: content.to_string(),
        reasoning_content: reasoning.to_string(),
        is_thinking,
    }
}

#[cfg(test)]
fn outcome(content: &str, reasoning: &str) -> StreamOutcome {
    StreamOutcome {
        content: content.to_string(),
        reasoning_content: reasoning.to_string(),
    }
}

#[cfg(test)]
#[async_trait]
impl ChatClient for ScriptedClient {
    async fn stream_chat(
        &self,
        request: StreamRequest,
        on_progress: &mut (dyn for<'p> FnMut(&'p StreamProgress) + Send),
    ) -> Result<StreamOutcome, StreamError> {
        self.requests.lock().unwrap().push(request);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedReply::Chunks(Vec::new()));
        let token = CancellationToken::new();
        *self.current.lock().unwrap() = Some(token.clone());

        match reply {
            ScriptedReply::Chunks(chunks) => {
                let mut text = String::new();
                for chunk in chunks {
                    text.push_str(chunk);
                    on_progress(&progress(&text, "", false));
                }
                Ok(outcome(&text, ""))
            }
            ScriptedReply::Gated { gate, text } => {
                gate.notified().await;
                on_progress(&progress(text, "", false));
                Ok(outcome(text, ""))
            }
            ScriptedReply::UntilAborted { partial } => {
                on_progress(&progress(partial, "", false));
                token.cancelled().await;
                Err(StreamError::Cancelled(CancelReason::User))
            }
            ScriptedReply::Reasoning { reasoning, content } => {
                on_progress(&progress("", reasoning, true));
                on_progress(&progress(content, reasoning, false));
                Ok(outcome(content, reasoning))
            }
            ScriptedReply::Fail(err) => Err(err),
        }
    }

    fn abort_current(&self) {
        if let Some(token) = self.current.lock().unwrap().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
pub fn create_test_model() -> ModelConfig {
    ModelConfig::new("m", "gpt", "https://api.example.com/v1/chat", "sk-1")
}

/// A gateway over an in-memory store holding one valid model.
#[cfg(test)]
pub fn create_test_persistence() -> Persistence {
    let mut persistence = Persistence::new(MemoryStore::new());
    persistence
        .save_models(&[create_test_model()])
        .expect("save test model");
    persistence
}

#[cfg(test)]
pub fn create_test_controller(client: Arc<ScriptedClient>) -> ConversationController {
    ConversationController::new(create_test_persistence(), client, Default::default())
        .expect("create controller")
}
