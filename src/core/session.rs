use crate::core::message::{Message, Role};
use crate::utils::time::now_millis;

const TITLE_CHARS: usize = 35;
const PREVIEW_CHARS: usize = 30;
pub const UNTITLED_SESSION: &str = "New chat";

/// A conversation: an id and its ordered transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Time of the last save; only used while the transcript is empty.
    pub last_saved: i64,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            last_saved: now_millis(),
        }
    }

    pub fn restore(id: impl Into<String>, messages: Vec<Message>, last_saved: i64) -> Self {
        Self {
            id: id.into(),
            messages,
            last_saved,
        }
    }

    /// Timestamp of the most recent message, or the last save time when the
    /// transcript is empty.
    pub fn last_time(&self) -> i64 {
        self.messages
            .last()
            .map(|message| message.timestamp)
            .unwrap_or(self.last_saved)
    }

    /// True when the session holds anything besides a system prompt.
    pub fn has_conversation(&self) -> bool {
        self.messages.iter().any(|message| !message.is_system())
    }

    /// The trailing assistant reply never received any text, e.g. the
    /// process stopped while it was streaming.
    pub fn has_interrupted_reply(&self) -> bool {
        self.messages
            .last()
            .is_some_and(Message::is_pending_placeholder)
    }

    pub fn title(&self) -> String {
        self.messages
            .iter()
            .find(|message| !message.is_system())
            .map(|message| truncate_chars(message.content.trim(), TITLE_CHARS))
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| UNTITLED_SESSION.to_string())
    }

    pub fn summary(&self) -> SessionSummary {
        let preview = self
            .messages
            .last()
            .map(|message| {
                let prefix = match message.role {
                    Role::User => "You: ",
                    Role::Assistant => "AI: ",
                    Role::System => "",
                };
                format!("{prefix}{}", truncate_chars(&message.content, PREVIEW_CHARS))
            })
            .unwrap_or_default();

        SessionSummary {
            id: self.id.clone(),
            title: self.title(),
            preview,
            last_time: self.last_time(),
            message_count: self.messages.len(),
        }
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// List-view projection of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub preview: String,
    pub last_time: i64,
    pub message_count: usize,
}

/// Session summaries in recency order, most recent first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionList {
    entries: Vec<SessionSummary>,
}

impl SessionList {
    pub fn from_sessions<'a>(sessions: impl IntoIterator<Item = &'a Session>) -> Self {
        let mut list = Self {
            entries: sessions.into_iter().map(Session::summary).collect(),
        };
        list.sort_by_recency();
        list
    }

    pub fn entries(&self) -> &[SessionSummary] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    /// Replace or insert `summary` and move it to the front.
    pub fn touch(&mut self, summary: SessionSummary) {
        self.remove(&summary.id);
        self.entries.insert(0, summary);
    }

    pub fn remove(&mut self, id: &str) -> Option<SessionSummary> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(index))
    }

    pub fn sort_by_recency(&mut self) {
        self.entries.sort_by(|a, b| b.last_time.cmp(&a.last_time));
    }
}

/// Hands out session ids derived from the creation time in epoch millis,
/// never repeating an id within the process.
#[derive(Debug, Default)]
pub struct SessionIdAllocator {
    last: i64,
}

impl SessionIdAllocator {
    pub fn next_id(&mut self) -> String {
        self.next_id_at(now_millis())
    }

    /// Keep future ids above an id that already exists in storage.
    pub fn observe(&mut self, id: &str) {
        if let Ok(value) = id.parse::<i64>() {
            self.last = self.last.max(value);
        }
    }

    pub fn next_id_at(&mut self, millis: i64) -> String {
        let id = millis.max(self.last + 1);
        self.last = id;
        id.to_string()
    }
}
