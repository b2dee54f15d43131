use crate::config::{ConfigurationError, PromptConfig};
use std::path::Path;

const DESCRIBE: &str = "describe";
const HAZARD: &str = "hazard";

/// The two prompt templates, loaded once before the server starts and never
/// mutated afterwards.
#[derive(Debug, Clone)]
pub struct PromptStore {
    describe_prompt: String,
    hazard_prompt: String,
}

impl PromptStore {
    pub fn new(
        describe_prompt: impl Into<String>,
        hazard_prompt: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            describe_prompt: non_empty(DESCRIBE, describe_prompt.into())?,
            hazard_prompt: non_empty(HAZARD, hazard_prompt.into())?,
        })
    }

    pub fn load(prompt_config: &PromptConfig) -> Result<Self, ConfigurationError> {
        let describe_prompt = read_prompt(DESCRIBE, &prompt_config.describe_file)?;
        let hazard_prompt = read_prompt(HAZARD, &prompt_config.hazard_file)?;
        tracing::debug!(
            describe_len = describe_prompt.len(),
            hazard_len = hazard_prompt.len(),
            "Loaded prompts"
        );
        Self::new(describe_prompt, hazard_prompt)
    }

    pub fn describe_prompt(&self) -> &str {
        &self.describe_prompt
    }

    pub fn hazard_prompt(&self) -> &str {
        &self.hazard_prompt
    }
}

fn read_prompt(name: &'static str, path: &Path) -> Result<String, ConfigurationError> {
    std::fs::read_to_string(path).map_err(|source| ConfigurationError::UnreadablePrompt {
        name,
        path: path.to_path_buf(),
        source,
    })
}

// The prompt is sent verbatim; only blank prompts are rejected.
fn non_empty(name: &'static str, prompt: String) -> Result<String, ConfigurationError> {
    if prompt.trim().is_empty() {
        return Err(ConfigurationError::EmptyPrompt { name });
    }
    Ok(prompt)
}
