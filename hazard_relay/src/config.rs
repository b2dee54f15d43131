use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Failed to determine the current directory: {0}")]
    WorkingDirectory(std::io::Error),
    #[error("{0}")]
    InvalidEnvironment(String),
    #[error("Missing credential for the {backend} backend ({key})")]
    MissingCredential { backend: &'static str, key: &'static str },
    #[error("Failed to read {name} prompt from {path:?}: {source}")]
    UnreadablePrompt {
        name: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("The {name} prompt is empty")]
    EmptyPrompt { name: &'static str },
    #[error("Failed to build HTTP client for the {backend} backend: {source}")]
    HttpClient {
        backend: &'static str,
        source: reqwest::Error,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub prompts: PromptConfig,
    pub inference: InferenceConfig,
    #[serde(default)]
    pub claude: ClaudeConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn get_shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Locations of the two prompt templates. Relative paths resolve against the
/// working directory.
#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    pub describe_file: PathBuf,
    pub hazard_file: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Claude,
    Gemini,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    pub default_backend: BackendKind,
    #[serde(default)]
    pub describe_backend: Option<BackendKind>,
    #[serde(default)]
    pub hazard_backend: Option<BackendKind>,
}

impl InferenceConfig {
    pub fn get_describe_backend(&self) -> BackendKind {
        self.describe_backend.unwrap_or(self.default_backend)
    }

    pub fn get_hazard_backend(&self) -> BackendKind {
        self.hazard_backend.unwrap_or(self.default_backend)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClaudeConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_claude_model")]
    pub model: String,
    #[serde(default = "default_claude_base_url")]
    pub base_url: String,
    #[serde(default = "default_describe_max_tokens")]
    pub describe_max_tokens: u32,
    #[serde(default = "default_hazard_max_tokens")]
    pub hazard_max_tokens: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_claude_model(),
            base_url: default_claude_base_url(),
            describe_max_tokens: default_describe_max_tokens(),
            hazard_max_tokens: default_hazard_max_tokens(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default = "default_describe_max_tokens")]
    pub describe_max_tokens: u32,
    #[serde(default = "default_hazard_max_tokens")]
    pub hazard_max_tokens: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_gemini_model(),
            base_url: default_gemini_base_url(),
            describe_max_tokens: default_describe_max_tokens(),
            hazard_max_tokens: default_hazard_max_tokens(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_claude_model() -> String {
    "claude-3-haiku-20240307".into()
}

fn default_claude_base_url() -> String {
    "https://api.anthropic.com".into()
}

fn default_gemini_model() -> String {
    "gemini-1.5-flash".into()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}

fn default_describe_max_tokens() -> u32 {
    50
}

fn default_hazard_max_tokens() -> u32 {
    1
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Returns the trimmed credential, treating blank values as absent.
pub(crate) fn require_credential(
    api_key: Option<&str>,
    backend: &'static str,
    key: &'static str,
) -> Result<String, ConfigurationError> {
    match api_key.map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(ConfigurationError::MissingCredential { backend, key }),
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, ConfigurationError> {
    let base_path = std::env::current_dir().map_err(ConfigurationError::WorkingDirectory)?;

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(ConfigurationError::InvalidEnvironment)?;

    load_configuration(&base_path.join("configuration"), &environment)
}

pub fn load_configuration(
    configuration_directory: &Path,
    environment: &Environment,
) -> Result<Config, ConfigurationError> {
    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("HR")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    Ok(config)
}
