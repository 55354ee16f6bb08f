use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::chat_stream::RequestOptions;

pub const DEFAULT_LOG_LEVEL: &str = "warn";
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Directory holding session, model and command records
    pub data_dir: Option<PathBuf>,
    /// Sampling temperature sent with every request
    pub temperature: Option<f32>,
    /// Output length limit, reasoning included
    pub max_tokens: Option<u32>,
    /// Seconds to wait for the next chunk of a reply; 0 waits forever
    pub stream_idle_timeout_secs: Option<u64>,
    /// Default tracing filter, e.g. "info" or "chatlet=debug"
    pub log_level: Option<String>,
    /// Append logs to this file instead of stderr
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        match self
            .stream_idle_timeout_secs
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn log_level(&self) -> &str {
        self.log_level
            .as_deref()
            .map(str::trim)
            .filter(|level| !level.is_empty())
            .unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
///
/// # Examples
/// - Unix: `/home/user/.config/chatlet/config.toml` → `~/.config/chatlet/config.toml`
/// - macOS: `/Users/user/Library/Application Support/...` → `~/Library/Application Support/...`
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
