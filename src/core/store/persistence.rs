use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{KeyValueStore, StoreError};
use crate::core::entry::CustomCommand;
use crate::core::message::Message;
use crate::core::model_config::ModelConfig;
use crate::core::session::Session;

const SESSION_PREFIX: &str = "chat_history_";
const MODELS_KEY: &str = "model_config";
const MODEL_INDEX_KEY: &str = "model_index";
const COMMANDS_KEY: &str = "custom_commands";

/// A session as read back from storage.
pub type StoredSession = Session;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionDocument {
    messages: Vec<Message>,
    #[serde(default)]
    last_time: i64,
}

/// Older records stored the bare message array.
#[derive(Deserialize)]
#[serde(untagged)]
enum SessionRecord {
    Document(SessionDocument),
    Bare(Vec<Message>),
}

impl SessionRecord {
    fn into_document(self) -> SessionDocument {
        match self {
            SessionRecord::Document(document) => document,
            SessionRecord::Bare(messages) => SessionDocument {
                messages,
                last_time: 0,
            },
        }
    }
}

fn session_key(id: &str) -> String {
    format!("{SESSION_PREFIX}{id}")
}

/// Typed gateway over the host store.
pub struct Persistence {
    store: Box<dyn KeyValueStore>,
}

impl Persistence {
    pub fn new(store: impl KeyValueStore + 'static) -> Self {
        Self {
            store: Box::new(store),
        }
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(key)? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(|source| StoreError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        self.store.set(key, value)
    }

    /// Store a transcript. An empty transcript removes the record, so a
    /// session without messages is never considered stored.
    pub fn save_session(
        &mut self,
        id: &str,
        messages: &[Message],
        last_time: i64,
    ) -> Result<(), StoreError> {
        let key = session_key(id);
        if messages.is_empty() {
            debug!(session_id = id, "dropping empty session record");
            return self.store.remove(&key);
        }

        let document = SessionDocument {
            messages: messages.to_vec(),
            last_time,
        };
        self.write(&key, &document)
    }

    pub fn load_session(&self, id: &str) -> Result<Option<Vec<Message>>, StoreError> {
        Ok(self.load_stored_session(id)?.map(|session| session.messages))
    }

    pub fn load_stored_session(&self, id: &str) -> Result<Option<StoredSession>, StoreError> {
        let record: Option<SessionRecord> = self.read(&session_key(id))?;
        Ok(record
            .map(SessionRecord::into_document)
            .filter(|document| !document.messages.is_empty())
            .map(|document| Session::restore(id, document.messages, document.last_time)))
    }

    /// Whether `id` has a stored transcript with at least one message.
    pub fn has_session(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.load_stored_session(id)?.is_some())
    }

    pub fn delete_session(&mut self, id: &str) -> Result<(), StoreError> {
        self.store.remove(&session_key(id))
    }

    fn session_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .keys()?
            .into_iter()
            .filter_map(|key| key.strip_prefix(SESSION_PREFIX).map(str::to_string))
            .collect())
    }

    /// Every stored session with at least one message, most recent first.
    /// Unreadable records are skipped with a warning.
    pub fn list_sessions(&self) -> Result<Vec<StoredSession>, StoreError> {
        let mut sessions = Vec::new();
        for id in self.session_ids()? {
            match self.load_stored_session(&id) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(err) => warn!(session_id = %id, "skipping unreadable session: {err}"),
            }
        }
        sessions.sort_by(|a, b| b.last_time().cmp(&a.last_time()));
        Ok(sessions)
    }

    /// Remove stored records whose transcript is empty. Returns their ids.
    pub fn prune_empty_sessions(&mut self) -> Result<Vec<String>, StoreError> {
        let mut pruned = Vec::new();
        for id in self.session_ids()? {
            let record: Option<SessionRecord> = match self.read(&session_key(&id)) {
                Ok(record) => record,
                Err(err) => {
                    warn!(session_id = %id, "leaving unreadable session in place: {err}");
                    continue;
                }
            };
            let empty = record
                .map(|record| record.into_document().messages.is_empty())
                .unwrap_or(false);
            if empty {
                self.delete_session(&id)?;
                pruned.push(id);
            }
        }
        Ok(pruned)
    }

    pub fn load_models(&self) -> Result<Vec<ModelConfig>, StoreError> {
        Ok(self.read(MODELS_KEY)?.unwrap_or_default())
    }

    pub fn save_models(&mut self, models: &[ModelConfig]) -> Result<(), StoreError> {
        self.write(MODELS_KEY, &models)
    }

    pub fn load_model_index(&self) -> Result<usize, StoreError> {
        Ok(self.read(MODEL_INDEX_KEY)?.unwrap_or(0))
    }

    pub fn save_model_index(&mut self, index: usize) -> Result<(), StoreError> {
        self.write(MODEL_INDEX_KEY, &index)
    }

    pub fn load_commands(&self) -> Result<Vec<CustomCommand>, StoreError> {
        Ok(self.read(COMMANDS_KEY)?.unwrap_or_default())
    }

    pub fn save_commands(&mut self, commands: &[CustomCommand]) -> Result<(), StoreError> {
        self.write(COMMANDS_KEY, &commands)
    }
}
