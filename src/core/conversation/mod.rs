//! The session reducer.
//!
//! `ConversationController` owns the active transcript and decides what is
//! streamed and what is persisted. Views observe it through
//! [`SessionEvent`]s and call back into its operations; they never touch the
//! transcript directly.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::ChatMessage;
use crate::core::chat_stream::{
    CancelReason, ChatClient, RequestOptions, StreamError, StreamOutcome, StreamProgress,
    StreamRequest,
};
use crate::core::entry::{CommandRegistry, CustomCommand, EntryPoint};
use crate::core::error::ChatError;
use crate::core::events::{GenerationState, SessionEvent, EVENT_CAPACITY};
use crate::core::message::Message;
use crate::core::model_config::{ModelConfig, ModelRegistry};
use crate::core::session::{Session, SessionIdAllocator, SessionList, SessionSummary};
use crate::core::store::Persistence;
use crate::utils::time::now_millis;

/// Prefix of the assistant message that replaces a failed reply.
pub const ERROR_REPLY_PREFIX: &str = "An error occurred: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Completed { content: String },
    /// The reply was cancelled; whatever text had arrived is kept.
    Cancelled(CancelReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// The transcript is now empty; the caller may offer deleting the session.
    pub transcript_empty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditOutcome {
    /// Index of the assistant reply that answered the edited user message.
    pub retry_candidate: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSession {
    pub id: String,
    pub message_count: usize,
    /// The last reply never received any text before the previous run stopped.
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Sessions(Vec<SessionSummary>),
    Reply {
        session_id: String,
        outcome: SendOutcome,
    },
}

/// Cancels the in-flight reply from outside the controller, e.g. from a
/// signal handler while `send_message` is being awaited.
#[derive(Clone)]
pub struct AbortHandle {
    client: Arc<dyn ChatClient>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.client.abort_current();
    }
}

pub struct ConversationController {
    persistence: Persistence,
    client: Arc<dyn ChatClient>,
    options: RequestOptions,
    models: ModelRegistry,
    commands: CommandRegistry,
    session: Option<Session>,
    sessions: SessionList,
    ids: SessionIdAllocator,
    state: GenerationState,
    events: broadcast::Sender<SessionEvent>,
}

impl ConversationController {
    pub fn new(
        persistence: Persistence,
        client: Arc<dyn ChatClient>,
        options: RequestOptions,
    ) -> Result<Self, ChatError> {
        let models = ModelRegistry::new(persistence.load_models()?, persistence.load_model_index()?);
        let commands = CommandRegistry::new(persistence.load_commands()?);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut controller = Self {
            persistence,
            client,
            options,
            models,
            commands,
            session: None,
            sessions: SessionList::default(),
            ids: SessionIdAllocator::default(),
            state: GenerationState::Idle,
            events,
        };
        controller.load_chat_sessions()?;
        Ok(controller)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            client: Arc::clone(&self.client),
        }
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        self.session
            .as_ref()
            .map(|session| session.messages.as_slice())
            .unwrap_or_default()
    }

    pub fn sessions(&self) -> &SessionList {
        &self.sessions
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    // ----- sessions -------------------------------------------------------

    /// Rebuild the session list from storage. An open session that has not
    /// been stored yet stays listed.
    pub fn load_chat_sessions(&mut self) -> Result<&SessionList, ChatError> {
        let stored = self.persistence.list_sessions()?;
        for session in &stored {
            self.ids.observe(&session.id);
        }
        self.sessions = SessionList::from_sessions(&stored);

        if let Some(active) = &self.session {
            if !self.sessions.contains(&active.id) {
                self.sessions.touch(active.summary());
            }
        }

        debug!(count = self.sessions.len(), "loaded session list");
        self.emit(SessionEvent::SessionsChanged);
        Ok(&self.sessions)
    }

    /// Open a fresh session seeded with the current model's system prompt.
    pub fn create_new_chat(&mut self) -> String {
        self.start_session(None)
    }

    pub fn load_chat_session(&mut self, id: &str) -> Result<LoadedSession, ChatError> {
        let session = self
            .persistence
            .load_stored_session(id)?
            .ok_or_else(|| ChatError::UnknownSession(id.to_string()))?;
        self.discard_unsaved_active();

        let loaded = LoadedSession {
            id: session.id.clone(),
            message_count: session.messages.len(),
            interrupted: session.has_interrupted_reply(),
        };
        if loaded.interrupted {
            warn!(session_id = %loaded.id, "last reply was interrupted before any text arrived");
        }
        info!(session_id = %loaded.id, messages = loaded.message_count, "opened chat session");

        self.session = Some(session);
        self.emit(SessionEvent::ActiveSessionChanged(Some(loaded.id.clone())));
        self.transcript_changed();
        Ok(loaded)
    }

    pub fn delete_chat_session(&mut self, id: &str) -> Result<(), ChatError> {
        self.persistence.delete_session(id)?;
        self.sessions.remove(id);
        if self.session.as_ref().is_some_and(|session| session.id == id) {
            self.session = None;
            self.emit(SessionEvent::ActiveSessionChanged(None));
        }
        info!(session_id = id, "deleted chat session");
        self.emit(SessionEvent::SessionsChanged);
        Ok(())
    }

    /// Drop stored records without messages. Returns the removed ids.
    pub fn prune_empty_sessions(&mut self) -> Result<Vec<String>, ChatError> {
        let pruned = self.persistence.prune_empty_sessions()?;
        for id in &pruned {
            self.sessions.remove(id);
        }
        if !pruned.is_empty() {
            info!(count = pruned.len(), "pruned empty sessions");
            self.emit(SessionEvent::SessionsChanged);
        }
        Ok(pruned)
    }

    fn start_session(&mut self, system_prompt: Option<String>) -> String {
        self.discard_unsaved_active();

        let id = self.ids.next_id();
        let mut session = Session::new(id.clone());
        let prompt = system_prompt.or_else(|| {
            self.models
                .current()
                .and_then(ModelConfig::trimmed_system_prompt)
                .map(str::to_string)
        });
        if let Some(prompt) = prompt {
            session.messages.push(Message::system(prompt));
        }

        self.sessions.touch(session.summary());
        self.session = Some(session);
        info!(session_id = %id, "created chat session");

        self.emit(SessionEvent::ActiveSessionChanged(Some(id.clone())));
        self.emit(SessionEvent::SessionsChanged);
        self.transcript_changed();
        id
    }

    /// Close the active session, dropping it from the list if it was never
    /// stored.
    fn discard_unsaved_active(&mut self) {
        let Some(active) = self.session.take() else {
            return;
        };
        match self.persistence.has_session(&active.id) {
            Ok(true) => {}
            Ok(false) => {
                debug!(session_id = %active.id, "discarding unsaved session");
                self.sessions.remove(&active.id);
            }
            Err(err) => warn!(session_id = %active.id, "could not check stored session: {err}"),
        }
    }

    // ----- transcript -----------------------------------------------------

    /// Append `text` as a user message and stream the reply into a
    /// placeholder. Opens a new session when none is active.
    pub async fn send_message(&mut self, text: &str) -> Result<SendOutcome, ChatError> {
        let config = self.models.current().cloned().ok_or(ChatError::NoCurrentModel)?;
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if self.session.is_none() {
            self.start_session(None);
        }

        let session = self.active_session_mut()?;
        session.messages.push(Message::user(text));
        let history: Vec<ChatMessage> = session.messages.iter().map(Message::to_api).collect();
        session.messages.push(Message::placeholder());
        self.persist_active()?;

        self.stream_reply(&config, history).await
    }

    /// Regenerate the assistant reply at `index` from the nearest user
    /// message before it.
    pub async fn retry_message(&mut self, index: usize) -> Result<SendOutcome, ChatError> {
        let config = self.models.current().cloned().ok_or(ChatError::NoCurrentModel)?;
        let session = self.active_session_mut()?;

        let message = session
            .messages
            .get(index)
            .ok_or(ChatError::InvalidMessageIndex(index))?;
        if !message.is_assistant() {
            return Err(ChatError::NotAnAssistantMessage(index));
        }
        let user_index = session.messages[..index]
            .iter()
            .rposition(Message::is_user)
            .ok_or(ChatError::NoCorrespondingUserMessage(index))?;

        session.messages.remove(index);
        let history: Vec<ChatMessage> = session.messages[..=user_index]
            .iter()
            .map(Message::to_api)
            .collect();
        session.messages.push(Message::placeholder());
        debug!(index, user_index, "retrying reply");
        self.persist_active()?;

        self.stream_reply(&config, history).await
    }

    pub fn delete_message(&mut self, index: usize) -> Result<DeleteOutcome, ChatError> {
        let session = self.active_session_mut()?;
        if index >= session.messages.len() {
            return Err(ChatError::InvalidMessageIndex(index));
        }
        session.messages.remove(index);
        let transcript_empty = session.messages.is_empty();

        self.persist_if_started()?;
        Ok(DeleteOutcome { transcript_empty })
    }

    pub fn edit_message(
        &mut self,
        index: usize,
        content: impl Into<String>,
    ) -> Result<EditOutcome, ChatError> {
        let session = self.active_session_mut()?;
        let message = session
            .messages
            .get_mut(index)
            .ok_or(ChatError::InvalidMessageIndex(index))?;
        message.content = content.into();
        let edited_user = message.is_user();

        let next = index + 1;
        let retry_candidate = (edited_user
            && session.messages.get(next).is_some_and(Message::is_assistant))
        .then_some(next);

        self.persist_if_started()?;
        Ok(EditOutcome { retry_candidate })
    }

    /// Bring the transcript's system message in line with `prompt`: replace
    /// it, insert one at the top, or remove it when `prompt` is blank.
    pub fn update_system_prompt(&mut self, prompt: &str) -> Result<(), ChatError> {
        let prompt = prompt.trim();
        let session = self.active_session_mut()?;
        let existing = session.messages.iter().position(Message::is_system);

        match existing {
            Some(index) if prompt.is_empty() => {
                session.messages.remove(index);
            }
            Some(index) => {
                let message = &mut session.messages[index];
                if message.content != prompt {
                    message.content = prompt.to_string();
                    message.timestamp = now_millis();
                }
            }
            None if prompt.is_empty() => {}
            None => session.messages.insert(0, Message::system(prompt)),
        }

        self.persist_if_started()
    }

    pub fn abort_current_response(&self) {
        if self.state == GenerationState::Streaming {
            info!("aborting current response");
        }
        self.client.abort_current();
    }

    // ----- entry points ---------------------------------------------------

    /// Run a host entry point. Text entries open a single-shot session whose
    /// only user message is `payload`.
    pub async fn run_entry(
        &mut self,
        entry: &EntryPoint,
        payload: &str,
    ) -> Result<EntryOutcome, ChatError> {
        if *entry == EntryPoint::List {
            let sessions = self.load_chat_sessions()?;
            return Ok(EntryOutcome::Sessions(sessions.entries().to_vec()));
        }

        if payload.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if self.models.current().is_none() {
            return Err(ChatError::NoCurrentModel);
        }
        let system_prompt = self.commands.system_prompt_for(entry)?;

        info!(entry = entry.code(), "running entry point");
        let session_id = self.start_session(system_prompt);
        let outcome = self.send_message(payload).await?;
        Ok(EntryOutcome::Reply {
            session_id,
            outcome,
        })
    }

    pub fn add_command(&mut self, command: CustomCommand) -> Result<CustomCommand, ChatError> {
        let added = self.commands.add(command)?.clone();
        self.persistence.save_commands(self.commands.list())?;
        Ok(added)
    }

    pub fn remove_command(&mut self, code: &str) -> Result<CustomCommand, ChatError> {
        let removed = self.commands.remove(code)?;
        self.persistence.save_commands(self.commands.list())?;
        Ok(removed)
    }

    // ----- models ---------------------------------------------------------

    pub fn add_model(&mut self, config: ModelConfig) -> Result<usize, ChatError> {
        let index = self.models.add(config)?;
        self.save_models()?;
        Ok(index)
    }

    pub fn update_model(&mut self, index: usize, config: ModelConfig) -> Result<(), ChatError> {
        self.models.update(index, config)?;
        self.save_models()
    }

    pub fn remove_model(&mut self, index: usize) -> Result<ModelConfig, ChatError> {
        let removed = self.models.remove(index)?;
        self.save_models()?;
        Ok(removed)
    }

    pub fn set_current_model(&mut self, index: usize) -> Result<(), ChatError> {
        self.models.set_current(index)?;
        self.save_models()
    }

    pub fn switch_to_next_model(&mut self) -> Result<ModelConfig, ChatError> {
        let next = self.models.switch_to_next()?.clone();
        self.save_models()?;
        info!(model = %next.name, "switched model");
        Ok(next)
    }

    fn save_models(&mut self) -> Result<(), ChatError> {
        self.persistence.save_models(self.models.configs())?;
        self.persistence.save_model_index(self.models.current_index())?;
        Ok(())
    }

    // ----- streaming ------------------------------------------------------

    /// Stream into the trailing placeholder and settle the transcript.
    async fn stream_reply(
        &mut self,
        config: &ModelConfig,
        history: Vec<ChatMessage>,
    ) -> Result<SendOutcome, ChatError> {
        let request = StreamRequest::new(config, history, &self.options);
        let session = self.session.as_mut().ok_or(ChatError::NoActiveSession)?;
        let session_id = session.id.clone();
        let index = session.messages.len().saturating_sub(1);

        debug!(session_id = %session_id, model = %config.model, "requesting reply");
        self.state = GenerationState::Streaming;
        let _ = self
            .events
            .send(SessionEvent::GenerationChanged(GenerationState::Streaming));

        let events = &self.events;
        let messages = &mut session.messages;
        let mut on_progress = |progress: &StreamProgress| {
            if let Some(message) = messages.get_mut(index) {
                message.apply_progress(progress);
            }
            let _ = events.send(SessionEvent::Progress {
                session_id: session_id.clone(),
                index,
                progress: progress.clone(),
            });
        };
        let result = self.client.stream_chat(request, &mut on_progress).await;

        match result {
            Ok(outcome) => self.complete_reply(index, outcome),
            Err(StreamError::Cancelled(reason)) => self.keep_partial_reply(index, reason),
            Err(err) => self.replace_with_error(index, err),
        }
    }

    fn complete_reply(
        &mut self,
        index: usize,
        outcome: StreamOutcome,
    ) -> Result<SendOutcome, ChatError> {
        if let Some(message) = self.message_mut(index) {
            message.content.clone_from(&outcome.content);
            message.reasoning_content =
                (!outcome.reasoning_content.is_empty()).then(|| outcome.reasoning_content.clone());
            message.is_thinking = false;
        }
        debug!(chars = outcome.content.len(), "reply completed");

        let saved = self.persist_active();
        self.set_state(GenerationState::Idle);
        saved?;
        Ok(SendOutcome::Completed {
            content: outcome.content,
        })
    }

    fn keep_partial_reply(
        &mut self,
        index: usize,
        reason: CancelReason,
    ) -> Result<SendOutcome, ChatError> {
        if let Some(message) = self.message_mut(index) {
            message.is_thinking = false;
        }
        info!(?reason, "reply cancelled");

        let saved = self.persist_active();
        self.set_state(GenerationState::Idle);
        saved?;
        Ok(SendOutcome::Cancelled(reason))
    }

    fn replace_with_error(
        &mut self,
        index: usize,
        err: StreamError,
    ) -> Result<SendOutcome, ChatError> {
        warn!("chat request failed: {err}");
        if let Some(session) = self.session.as_mut() {
            if index < session.messages.len() {
                session.messages.remove(index);
            }
            session
                .messages
                .push(Message::assistant(format!("{ERROR_REPLY_PREFIX}{err}")));
        }

        if let Err(store_err) = self.persist_active() {
            warn!("could not save error reply: {store_err}");
        }
        self.set_state(GenerationState::Idle);
        Err(ChatError::Stream(err))
    }

    // ----- helpers --------------------------------------------------------

    fn active_session_mut(&mut self) -> Result<&mut Session, ChatError> {
        self.session.as_mut().ok_or(ChatError::NoActiveSession)
    }

    fn message_mut(&mut self, index: usize) -> Option<&mut Message> {
        self.session.as_mut()?.messages.get_mut(index)
    }

    /// Save the active transcript and move it to the front of the list.
    fn persist_active(&mut self) -> Result<(), ChatError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.last_saved = now_millis();
        self.persistence
            .save_session(&session.id, &session.messages, session.last_saved)?;

        if session.messages.is_empty() {
            self.sessions.remove(&session.id);
        } else {
            self.sessions.touch(session.summary());
        }
        debug!(session_id = %session.id, messages = session.messages.len(), "saved session");

        let event = SessionEvent::TranscriptChanged {
            session_id: session.id.clone(),
            messages: session.messages.clone(),
        };
        self.emit(event);
        self.emit(SessionEvent::SessionsChanged);
        Ok(())
    }

    /// Save the active session once it is stored or holds more than a system
    /// prompt. A fresh chat otherwise only notifies observers.
    fn persist_if_started(&mut self) -> Result<(), ChatError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        if session.has_conversation() || self.persistence.has_session(&session.id)? {
            self.persist_active()
        } else {
            self.transcript_changed();
            Ok(())
        }
    }

    fn transcript_changed(&self) {
        if let Some(session) = &self.session {
            self.emit(SessionEvent::TranscriptChanged {
                session_id: session.id.clone(),
                messages: session.messages.clone(),
            });
        }
    }

    fn set_state(&mut self, state: GenerationState) {
        if self.state != state {
            self.state = state;
            self.emit(SessionEvent::GenerationChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests;
