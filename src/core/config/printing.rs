use crate::core::config::data::{path_display, Config, DEFAULT_STREAM_IDLE_TIMEOUT_SECS};

impl Config {
    /// One `key: value` line per setting, unset values marked as such.
    pub fn display_lines(&self) -> Vec<String> {
        let unset = || "(unset)".to_string();
        let timeout = match self.stream_idle_timeout_secs {
            Some(0) => "off".to_string(),
            Some(secs) => format!("{secs}s"),
            None => format!("{DEFAULT_STREAM_IDLE_TIMEOUT_SECS}s (default)"),
        };

        vec![
            format!(
                "data-dir: {}",
                self.data_dir.as_ref().map(path_display).unwrap_or_else(unset)
            ),
            format!(
                "temperature: {}",
                self.temperature.map(|t| t.to_string()).unwrap_or_else(unset)
            ),
            format!(
                "max-tokens: {}",
                self.max_tokens.map(|t| t.to_string()).unwrap_or_else(unset)
            ),
            format!("stream-idle-timeout: {timeout}"),
            format!("log-level: {}", self.log_level()),
            format!(
                "log-file: {}",
                self.log_file.as_ref().map(path_display).unwrap_or_else(unset)
            ),
        ]
    }

    pub fn print_all(&self) {
        println!("Current configuration:");
        for line in self.display_lines() {
            println!("  {line}");
        }
    }
}
