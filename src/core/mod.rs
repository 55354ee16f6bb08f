pub mod chat_stream;
pub mod config;
pub mod conversation;
pub mod entry;
pub mod error;
pub mod events;
pub mod message;
pub mod model_config;
pub mod session;
pub mod store;
