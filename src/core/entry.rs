//! Host entry points and prompt commands.
//!
//! Besides the list view the host can route selected text into the plugin.
//! Each text entry is a command: a system prompt that frames the payload in
//! a fresh single-shot session.

use serde::{Deserialize, Serialize};

use crate::core::error::ChatError;
use crate::utils::time::now_millis;

pub const LIST_CODE: &str = "chat-list";
pub const TRANSLATE_CODE: &str = "ai-translate";
pub const EXPLAIN_CODE: &str = "ai-explain";
pub const ASK_CODE: &str = "ask-ai";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoint {
    List,
    Translate,
    Explain,
    Ask,
    Custom(String),
}

impl EntryPoint {
    pub fn from_code(code: &str) -> Self {
        match code {
            LIST_CODE => EntryPoint::List,
            TRANSLATE_CODE => EntryPoint::Translate,
            EXPLAIN_CODE => EntryPoint::Explain,
            ASK_CODE => EntryPoint::Ask,
            other => EntryPoint::Custom(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            EntryPoint::List => LIST_CODE,
            EntryPoint::Translate => TRANSLATE_CODE,
            EntryPoint::Explain => EXPLAIN_CODE,
            EntryPoint::Ask => ASK_CODE,
            EntryPoint::Custom(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinCommand {
    pub code: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// `None` keeps the current model's own system prompt.
    pub system_prompt: Option<&'static str>,
}

pub const BUILTIN_COMMANDS: &[BuiltinCommand] = &[
    BuiltinCommand {
        code: TRANSLATE_CODE,
        name: "AI Translate",
        description: "Translate the selected text",
        system_prompt: Some(
            "You are a translation assistant. Translate the user's text into English, \
or into Chinese when the text is already English. Reply with the translation only.",
        ),
    },
    BuiltinCommand {
        code: EXPLAIN_CODE,
        name: "AI Explain",
        description: "Explain the selected text",
        system_prompt: Some(
            "You are an explanation assistant. Explain the user's text in detail, \
covering the concepts involved, their background and related knowledge.",
        ),
    },
    BuiltinCommand {
        code: ASK_CODE,
        name: "Ask AI",
        description: "Ask a question about the selected text",
        system_prompt: None,
    },
];

pub fn find_builtin_command(code: &str) -> Option<&'static BuiltinCommand> {
    BUILTIN_COMMANDS.iter().find(|command| command.code == code)
}

/// A user-defined prompt command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomCommand {
    #[serde(default)]
    pub id: String,
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub system_prompt: String,
}

impl CustomCommand {
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            code: code.into(),
            name: name.into(),
            description: String::new(),
            system_prompt: system_prompt.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandRegistry {
    commands: Vec<CustomCommand>,
}

impl CommandRegistry {
    pub fn new(commands: Vec<CustomCommand>) -> Self {
        Self { commands }
    }

    pub fn list(&self) -> &[CustomCommand] {
        &self.commands
    }

    pub fn get(&self, code: &str) -> Option<&CustomCommand> {
        self.commands.iter().find(|command| command.code == code)
    }

    /// Add a command, replacing any existing command with the same code.
    pub fn add(&mut self, mut command: CustomCommand) -> Result<&CustomCommand, ChatError> {
        command.code = command.code.trim().to_string();
        command.name = command.name.trim().to_string();
        command.system_prompt = command.system_prompt.trim().to_string();

        if command.code.is_empty() {
            return Err(ChatError::InvalidCommand("code must not be empty"));
        }
        if command.name.is_empty() {
            return Err(ChatError::InvalidCommand("name must not be empty"));
        }
        if command.system_prompt.is_empty() {
            return Err(ChatError::InvalidCommand("system prompt must not be empty"));
        }
        if command.code == LIST_CODE || find_builtin_command(&command.code).is_some() {
            return Err(ChatError::InvalidCommand("code is reserved by a built-in entry"));
        }
        if command.id.is_empty() {
            command.id = format!("cmd_{}", now_millis());
        }
        if command.description.trim().is_empty() {
            command.description = command.name.clone();
        }

        let index = match self.commands.iter().position(|c| c.code == command.code) {
            Some(index) => {
                self.commands[index] = command;
                index
            }
            None => {
                self.commands.push(command);
                self.commands.len() - 1
            }
        };
        Ok(&self.commands[index])
    }

    pub fn remove(&mut self, code: &str) -> Result<CustomCommand, ChatError> {
        let index = self
            .commands
            .iter()
            .position(|command| command.code == code)
            .ok_or_else(|| ChatError::UnknownCommand(code.to_string()))?;
        Ok(self.commands.remove(index))
    }

    /// Resolve the system prompt a text entry runs with. `Ok(None)` means
    /// the session keeps the current model's prompt.
    pub fn system_prompt_for(&self, entry: &EntryPoint) -> Result<Option<String>, ChatError> {
        match entry {
            EntryPoint::List => Err(ChatError::InvalidCommand("the list entry takes no text")),
            EntryPoint::Custom(code) => self
                .get(code)
                .map(|command| Some(command.system_prompt.clone()))
                .ok_or_else(|| ChatError::UnknownCommand(code.clone())),
            builtin => Ok(find_builtin_command(builtin.code())
                .and_then(|command| command.system_prompt)
                .map(str::to_string)),
        }
    }
}
