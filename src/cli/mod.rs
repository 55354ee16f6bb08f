//! Command-line interface parsing and handling
//!
//! Each subcommand stands in for one of the host's entry points or view
//! actions and drives a [`ConversationController`] backed by files in the
//! data directory.

pub mod settings;

use std::error::Error;
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::core::chat_stream::{CancelReason, ChatClient, HttpChatClient, StreamError};
use crate::core::config::{Config, ConfigOrchestrator};
use crate::core::conversation::{AbortHandle, ConversationController, EntryOutcome, SendOutcome};
use crate::core::entry::{CustomCommand, EntryPoint, BUILTIN_COMMANDS};
use crate::core::error::ChatError;
use crate::core::events::SessionEvent;
use crate::core::model_config::{ModelConfig, RegistryError};
use crate::core::store::{FileStore, Persistence};
use crate::utils::logging::init_tracing;

#[derive(Parser)]
#[command(name = "chatlet")]
#[command(version)]
#[command(about = "Streaming chat sessions with OpenAI-compatible models")]
#[command(
    long_about = "Chatlet keeps chat sessions on disk and streams replies from any \
OpenAI-compatible chat completion endpoint.\n\n\
Add a model first:\n\
  chatlet models add --name GPT --model gpt-4o-mini \\\n\
      --url https://api.openai.com/v1/chat/completions --key sk-...\n\n\
Press Ctrl+C while a reply streams to stop it; the partial reply is kept."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Read settings from this file instead of the platform config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Keep sessions, models and commands in this directory
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List chat sessions, most recent first
    Sessions,
    /// Print the transcript of a session
    Show { id: String },
    /// Send a message and stream the reply
    Chat {
        /// Continue this session instead of starting a new one
        #[arg(short, long)]
        session: Option<String>,
        #[arg(required = true, trailing_var_arg = true)]
        message: Vec<String>,
    },
    /// Regenerate the assistant reply at INDEX
    Retry { session: String, index: usize },
    /// Replace the content of the message at INDEX
    Edit {
        session: String,
        index: usize,
        #[arg(required = true, trailing_var_arg = true)]
        content: Vec<String>,
    },
    /// Remove the message at INDEX
    DeleteMessage { session: String, index: usize },
    /// Delete a session
    Delete { id: String },
    /// Remove stored sessions that have no messages
    Prune,
    /// Set the system prompt of a session; no prompt removes it
    SystemPrompt {
        session: String,
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// Manage model configurations
    Models {
        #[command(subcommand)]
        command: ModelCommands,
    },
    /// Translate text in a new session
    Translate {
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Explain text in a new session
    Explain {
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Ask a question in a new session
    Ask {
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Run a custom command on text in a new session
    Run {
        code: String,
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Manage custom prompt commands
    Commands {
        #[command(subcommand)]
        command: CommandCommands,
    },
    /// Set a configuration value, or show all values without a key
    Set {
        key: Option<String>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        value: Vec<String>,
    },
    /// Unset a configuration value
    Unset { key: String },
}

#[derive(Subcommand)]
pub enum ModelCommands {
    /// List model configurations; the current one is marked with *
    List,
    /// Add a model configuration
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        system_prompt: Option<String>,
    },
    /// Change fields of the model configuration at INDEX
    Update {
        index: usize,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        system_prompt: Option<String>,
    },
    /// Remove the model configuration at INDEX
    Remove { index: usize },
    /// Make the model configuration at INDEX current
    Use { index: usize },
    /// Switch to the next model configuration
    Next,
}

#[derive(Subcommand)]
pub enum CommandCommands {
    /// List built-in and custom commands
    List,
    /// Add or replace a custom command
    Add {
        code: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Remove a custom command
    Remove { code: String },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let orchestrator = match &args.config {
        Some(path) => ConfigOrchestrator::new(path.clone()),
        None => ConfigOrchestrator::for_default_path()?,
    };
    let config = orchestrator.load_with_cache()?;
    init_tracing(config.log_level(), config.log_file.as_deref())?;

    match args.command {
        Commands::Set { key, value } => Ok(settings::handle_set(&orchestrator, key, value)?),
        Commands::Unset { key } => Ok(settings::handle_unset(&orchestrator, &key)?),
        command => {
            let mut controller = open_controller(&config, args.data_dir)?;
            run_command(&mut controller, command).await
        }
    }
}

fn open_controller(
    config: &Config,
    data_dir: Option<PathBuf>,
) -> Result<ConversationController, Box<dyn Error>> {
    let data_dir = match data_dir {
        Some(dir) => dir,
        None => config.resolve_data_dir()?,
    };
    let client: Arc<dyn ChatClient> = Arc::new(HttpChatClient::new(config.stream_idle_timeout()));
    let persistence = Persistence::new(FileStore::new(data_dir));
    Ok(ConversationController::new(
        persistence,
        client,
        config.request_options(),
    )?)
}

async fn run_command(
    controller: &mut ConversationController,
    command: Commands,
) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Sessions => print_sessions(controller),
        Commands::Show { id } => {
            let loaded = controller.load_chat_session(&id)?;
            print_transcript(controller);
            if loaded.interrupted {
                eprintln!(
                    "⚠️  The last reply was interrupted. Run 'chatlet retry {id} {}' to regenerate it.",
                    loaded.message_count.saturating_sub(1)
                );
            }
        }
        Commands::Chat { session, message } => {
            if let Some(id) = session {
                controller.load_chat_session(&id)?;
            }
            let text = message.join(" ");
            let events = controller.subscribe();
            let abort = controller.abort_handle();
            let (result, printed) =
                stream_to_stdout(events, abort, controller.send_message(&text)).await;
            finish_reply(controller, result, printed)?;
        }
        Commands::Retry { session, index } => {
            controller.load_chat_session(&session)?;
            let events = controller.subscribe();
            let abort = controller.abort_handle();
            let (result, printed) =
                stream_to_stdout(events, abort, controller.retry_message(index)).await;
            finish_reply(controller, result, printed)?;
        }
        Commands::Edit {
            session,
            index,
            content,
        } => {
            controller.load_chat_session(&session)?;
            let outcome = controller.edit_message(index, content.join(" "))?;
            println!("✅ Message {index} updated");
            if let Some(reply) = outcome.retry_candidate {
                println!("Run 'chatlet retry {session} {reply}' to regenerate the reply.");
            }
        }
        Commands::DeleteMessage { session, index } => {
            controller.load_chat_session(&session)?;
            let outcome = controller.delete_message(index)?;
            println!("✅ Message {index} deleted");
            if outcome.transcript_empty {
                println!("The session is now empty. Run 'chatlet delete {session}' to remove it.");
            }
        }
        Commands::Delete { id } => {
            controller.delete_chat_session(&id)?;
            println!("✅ Deleted session {id}");
        }
        Commands::Prune => {
            let pruned = controller.prune_empty_sessions()?;
            println!("✅ Removed {} empty session(s)", pruned.len());
        }
        Commands::SystemPrompt { session, prompt } => {
            controller.load_chat_session(&session)?;
            let prompt = prompt.join(" ");
            controller.update_system_prompt(&prompt)?;
            if prompt.trim().is_empty() {
                println!("✅ System prompt removed");
            } else {
                println!("✅ System prompt updated");
            }
        }
        Commands::Models { command } => run_model_command(controller, command)?,
        Commands::Translate { text } => run_entry(controller, EntryPoint::Translate, text).await?,
        Commands::Explain { text } => run_entry(controller, EntryPoint::Explain, text).await?,
        Commands::Ask { text } => run_entry(controller, EntryPoint::Ask, text).await?,
        Commands::Run { code, text } => {
            run_entry(controller, EntryPoint::from_code(&code), text).await?
        }
        Commands::Commands { command } => run_command_command(controller, command)?,
        Commands::Set { .. } | Commands::Unset { .. } => {}
    }
    Ok(())
}

async fn run_entry(
    controller: &mut ConversationController,
    entry: EntryPoint,
    text: Vec<String>,
) -> Result<(), Box<dyn Error>> {
    let payload = text.join(" ");
    let events = controller.subscribe();
    let abort = controller.abort_handle();

    let (result, printed) =
        stream_to_stdout(events, abort, controller.run_entry(&entry, &payload)).await;
    let result = result.map(|outcome| match outcome {
        EntryOutcome::Reply {
            session_id,
            outcome,
        } => {
            eprintln!("(session {session_id})");
            outcome
        }
        EntryOutcome::Sessions(_) => SendOutcome::Completed {
            content: String::new(),
        },
    });
    finish_reply(controller, result, printed)?;
    Ok(())
}

/// Print streamed text while `reply` runs. Ctrl+C aborts the reply. Returns
/// the reply's result and how many bytes of it were printed.
async fn stream_to_stdout<T, F>(
    mut events: broadcast::Receiver<SessionEvent>,
    abort: AbortHandle,
    reply: F,
) -> (Result<T, ChatError>, usize)
where
    F: Future<Output = Result<T, ChatError>>,
{
    tokio::pin!(reply);
    let mut printed = 0;
    let mut events_open = true;
    let mut stdout = io::stdout();

    loop {
        tokio::select! {
            result = &mut reply => return (result, printed),
            event = events.recv(), if events_open => match event {
                Ok(SessionEvent::Progress { progress, .. }) => {
                    if let Some(delta) = progress.content.get(printed..) {
                        let _ = stdout.write_all(delta.as_bytes());
                        let _ = stdout.flush();
                        printed = progress.content.len();
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => events_open = false,
            },
            _ = tokio::signal::ctrl_c() => abort.abort(),
        }
    }
}

/// Print what the stream did not, then report the outcome.
fn finish_reply(
    controller: &ConversationController,
    result: Result<SendOutcome, ChatError>,
    printed: usize,
) -> Result<(), ChatError> {
    let reply = controller
        .messages()
        .last()
        .filter(|message| message.is_assistant());

    match &result {
        Ok(_) => {
            if let Some(rest) = reply.and_then(|message| message.content.get(printed..)) {
                print!("{rest}");
            }
            println!();
        }
        Err(ChatError::Stream(_)) => {
            if printed > 0 {
                println!();
            }
        }
        Err(_) => {}
    }

    if let Ok(SendOutcome::Cancelled(reason)) = &result {
        eprintln!("{}", cancelled_notice(*reason));
    }
    if let Some(session) = controller.session() {
        tracing::debug!(session_id = %session.id, "reply finished");
    }
    result.map(|_| ())
}

fn cancelled_notice(reason: CancelReason) -> String {
    format!(
        "⚠️  Reply stopped: {}. The partial text was kept.",
        StreamError::Cancelled(reason)
    )
}

fn print_sessions(controller: &ConversationController) {
    let sessions = controller.sessions();
    if sessions.is_empty() {
        println!("No chat sessions yet. Start one with 'chatlet chat <message>'.");
        return;
    }
    for entry in sessions.entries() {
        println!(
            "{}  {}  {}  ({} messages)",
            entry.id,
            format_time(entry.last_time),
            entry.title,
            entry.message_count
        );
        if !entry.preview.is_empty() {
            println!("    {}", entry.preview);
        }
    }
}

fn print_transcript(controller: &ConversationController) {
    for (index, message) in controller.messages().iter().enumerate() {
        println!("[{index}] {} ({})", message.role.as_str(), format_time(message.timestamp));
        if let Some(reasoning) = &message.reasoning_content {
            for line in reasoning.lines() {
                println!("  > {line}");
            }
        }
        if message.is_pending_placeholder() {
            println!("  (no reply)");
        }
        for line in message.content.lines() {
            println!("  {line}");
        }
    }
}

fn format_time(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|time| time.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn run_model_command(
    controller: &mut ConversationController,
    command: ModelCommands,
) -> Result<(), ChatError> {
    match command {
        ModelCommands::List => {
            let models = controller.models();
            if models.is_empty() {
                println!("No models configured. Add one with 'chatlet models add'.");
            }
            for (index, config) in models.configs().iter().enumerate() {
                let marker = if index == models.current_index() { "*" } else { " " };
                println!("{marker} [{index}] {} ({}) {}", config.name, config.model, config.url);
            }
        }
        ModelCommands::Add {
            name,
            model,
            url,
            key,
            system_prompt,
        } => {
            let config = ModelConfig::new(name, model, url, key)
                .with_system_prompt(system_prompt.unwrap_or_default());
            let index = controller.add_model(config)?;
            println!("✅ Added model [{index}]");
        }
        ModelCommands::Update {
            index,
            name,
            model,
            url,
            key,
            system_prompt,
        } => {
            let mut config = controller
                .models()
                .configs()
                .get(index)
                .cloned()
                .ok_or(ChatError::Models(RegistryError::InvalidIndex(index)))?;
            if let Some(name) = name {
                config.name = name;
            }
            if let Some(model) = model {
                config.model = model;
            }
            if let Some(url) = url {
                config.url = url;
            }
            if let Some(key) = key {
                config.key = key;
            }
            if let Some(prompt) = system_prompt {
                config.system_prompt = prompt;
            }
            controller.update_model(index, config)?;
            println!("✅ Updated model [{index}]");
        }
        ModelCommands::Remove { index } => {
            let removed = controller.remove_model(index)?;
            println!("✅ Removed model {}", removed.name);
        }
        ModelCommands::Use { index } => {
            controller.set_current_model(index)?;
            println!("✅ Using model [{index}]");
        }
        ModelCommands::Next => {
            let next = controller.switch_to_next_model()?;
            println!("✅ Using model {} ({})", next.name, next.model);
        }
    }
    Ok(())
}

fn run_command_command(
    controller: &mut ConversationController,
    command: CommandCommands,
) -> Result<(), ChatError> {
    match command {
        CommandCommands::List => {
            for builtin in BUILTIN_COMMANDS {
                println!("  {}  {} (built-in)", builtin.code, builtin.description);
            }
            for custom in controller.commands().list() {
                println!("  {}  {}", custom.code, custom.description);
            }
        }
        CommandCommands::Add {
            code,
            name,
            prompt,
            description,
        } => {
            let mut command = CustomCommand::new(code, name, prompt);
            command.description = description.unwrap_or_default();
            let added = controller.add_command(command)?;
            println!("✅ Saved command {}", added.code);
        }
        CommandCommands::Remove { code } => {
            let removed = controller.remove_command(&code)?;
            println!("✅ Removed command {}", removed.code);
        }
    }
    Ok(())
}
