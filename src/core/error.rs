use std::error::Error as StdError;
use std::fmt;

use crate::core::chat_stream::StreamError;
use crate::core::model_config::RegistryError;
use crate::core::store::StoreError;

/// Failures surfaced by the conversation controller.
#[derive(Debug)]
pub enum ChatError {
    /// No model configuration is selected; nothing was sent.
    NoCurrentModel,

    /// A model configuration could not be added, edited or selected.
    Models(RegistryError),

    /// The operation needs an open session.
    NoActiveSession,

    /// The message text (or entry payload) is blank.
    EmptyMessage,

    InvalidMessageIndex(usize),

    /// Retry was asked for a message that is not an assistant reply.
    NotAnAssistantMessage(usize),

    /// No user message precedes the reply being retried.
    NoCorrespondingUserMessage(usize),

    UnknownSession(String),

    UnknownCommand(String),

    InvalidCommand(&'static str),

    /// The model request failed. The transcript already carries an error reply.
    Stream(StreamError),

    Store(StoreError),
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::NoCurrentModel => write!(f, "No model configured. Add a model first."),
            ChatError::Models(err) => write!(f, "{err}"),
            ChatError::NoActiveSession => write!(f, "No chat session is open."),
            ChatError::EmptyMessage => write!(f, "Message is empty."),
            ChatError::InvalidMessageIndex(index) => write!(f, "No message at index {index}."),
            ChatError::NotAnAssistantMessage(index) => {
                write!(f, "Message {index} is not an assistant reply.")
            }
            ChatError::NoCorrespondingUserMessage(index) => {
                write!(f, "No user message precedes message {index}.")
            }
            ChatError::UnknownSession(id) => write!(f, "Chat session '{id}' not found."),
            ChatError::UnknownCommand(code) => write!(f, "Command '{code}' not found."),
            ChatError::InvalidCommand(reason) => write!(f, "Invalid command: {reason}."),
            ChatError::Stream(err) => write!(f, "{err}"),
            ChatError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl StdError for ChatError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ChatError::Models(err) => Some(err),
            ChatError::Stream(err) => Some(err),
            ChatError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        ChatError::Store(err)
    }
}

impl From<RegistryError> for ChatError {
    fn from(err: RegistryError) -> Self {
        ChatError::Models(err)
    }
}
