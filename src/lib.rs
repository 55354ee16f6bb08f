//! Chatlet is a small chat-assistant core: chat sessions kept in a key/value
//! store, with replies streamed from OpenAI-compatible endpoints.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the session reducer ([`core::conversation`]), the streaming
//!   client ([`core::chat_stream`]), model and command registries, the
//!   persistence gateway ([`core::store`]) and configuration.
//! - [`api`] defines the chat completion payloads sent to and read from
//!   providers.
//! - [`cli`] is the host shell: each subcommand stands in for an entry point
//!   or view action.
//! - [`utils`] holds logging setup and small helpers.
//!
//! The binary (`src/main.rs`) routes through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
