//! Model configurations and the "current model" selection.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL_NAME: &str = "Unnamed model";
pub const DEFAULT_MODEL_ID: &str = "gpt-3.5-turbo";
pub const DEFAULT_MODEL_URL: &str = "https://api.openai.com/v1/chat/completions";

/// A named provider endpoint, credential and system prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub system_prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    EmptyName,
    EmptyModel,
    EmptyUrl,
    InvalidUrl,
    EmptyKey,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ValidationError::EmptyName => "model name must not be empty",
            ValidationError::EmptyModel => "model id must not be empty",
            ValidationError::EmptyUrl => "API URL must not be empty",
            ValidationError::InvalidUrl => "API URL is not a valid absolute URL",
            ValidationError::EmptyKey => "API key must not be empty",
        };
        f.write_str(text)
    }
}

/// Every problem found in a configuration, in field order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn contains(&self, error: ValidationError) -> bool {
        self.0.contains(&error)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&lines.join("\n"))
    }
}

impl std::error::Error for ValidationErrors {}

impl ModelConfig {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        url: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            url: url.into(),
            key: key.into(),
            system_prompt: String::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError::EmptyName);
        }
        if self.model.trim().is_empty() {
            errors.push(ValidationError::EmptyModel);
        }
        if self.url.trim().is_empty() {
            errors.push(ValidationError::EmptyUrl);
        } else if reqwest::Url::parse(self.url.trim()).is_err() {
            errors.push(ValidationError::InvalidUrl);
        }
        if self.key.trim().is_empty() {
            errors.push(ValidationError::EmptyKey);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }

    /// Fill the blanks of a stored record with defaults. The key is left
    /// empty so an incomplete record still fails validation on edit.
    pub fn normalized(mut self) -> Self {
        if self.name.trim().is_empty() {
            self.name = DEFAULT_MODEL_NAME.to_string();
        }
        if self.model.trim().is_empty() {
            self.model = DEFAULT_MODEL_ID.to_string();
        }
        if self.url.trim().is_empty() {
            self.url = DEFAULT_MODEL_URL.to_string();
        }
        self
    }

    /// The prompt to seed a new transcript with, if any.
    pub fn trimmed_system_prompt(&self) -> Option<&str> {
        let prompt = self.system_prompt.trim();
        (!prompt.is_empty()).then_some(prompt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    InvalidIndex(usize),
    Invalid(ValidationErrors),
    Empty,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::InvalidIndex(index) => write!(f, "no model configuration at index {index}"),
            RegistryError::Invalid(errors) => write!(f, "invalid model configuration:\n{errors}"),
            RegistryError::Empty => write!(f, "no model configurations; add one first"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Invalid(errors) => Some(errors),
            _ => None,
        }
    }
}

/// Ordered model configurations with exactly one current index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelRegistry {
    configs: Vec<ModelConfig>,
    current: usize,
}

impl ModelRegistry {
    pub fn new(configs: Vec<ModelConfig>, current: usize) -> Self {
        let configs: Vec<ModelConfig> = configs.into_iter().map(ModelConfig::normalized).collect();
        let current = clamp_index(current, configs.len());
        Self { configs, current }
    }

    pub fn configs(&self) -> &[ModelConfig] {
        &self.configs
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> Option<&ModelConfig> {
        self.configs.get(self.current)
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn add(&mut self, config: ModelConfig) -> Result<usize, RegistryError> {
        config.validate().map_err(RegistryError::Invalid)?;
        self.configs.push(config);
        Ok(self.configs.len() - 1)
    }

    pub fn update(&mut self, index: usize, config: ModelConfig) -> Result<(), RegistryError> {
        if index >= self.configs.len() {
            return Err(RegistryError::InvalidIndex(index));
        }
        config.validate().map_err(RegistryError::Invalid)?;
        self.configs[index] = config;
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<ModelConfig, RegistryError> {
        if index >= self.configs.len() {
            return Err(RegistryError::InvalidIndex(index));
        }
        let removed = self.configs.remove(index);
        self.current = clamp_index(self.current, self.configs.len());
        Ok(removed)
    }

    pub fn set_current(&mut self, index: usize) -> Result<(), RegistryError> {
        if index >= self.configs.len() {
            return Err(RegistryError::InvalidIndex(index));
        }
        self.current = index;
        Ok(())
    }

    /// Advance the current index, wrapping to the first configuration.
    pub fn switch_to_next(&mut self) -> Result<&ModelConfig, RegistryError> {
        if self.configs.is_empty() {
            return Err(RegistryError::Empty);
        }
        self.current = (self.current + 1) % self.configs.len();
        Ok(&self.configs[self.current])
    }
}

fn clamp_index(index: usize, len: usize) -> usize {
    index.min(len.saturating_sub(1))
}
