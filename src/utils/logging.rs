use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::core::config::data::DEFAULT_LOG_LEVEL;

/// `RUST_LOG` wins over the configured level.
fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global tracing subscriber. Logs go to stderr, or are appended
/// to `log_file` without ANSI colors. A second call keeps the first subscriber.
pub fn init_tracing(level: &str, log_file: Option<&Path>) -> io::Result<()> {
    let filter_layer = filter_for(level);

    let result = match log_file {
        Some(path) => {
            let file = open_log_file(path)?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_target(true)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(file_layer)
                .try_init()
        }
        None => {
            let stderr_layer = tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false);
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(stderr_layer)
                .try_init()
        }
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}
