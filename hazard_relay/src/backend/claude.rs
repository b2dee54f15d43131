use super::{http_client, parse_hazard_verdict, InferenceBackend, InferenceError, JPEG_MIME_TYPE};
use crate::config::{require_credential, ClaudeConfig, ConfigurationError};
use crate::frame::Frame;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::instrument;

const NAME: &str = "claude";
const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: [ContentBlock<'a>; 2],
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentBlock<'a> {
    Image { source: ImageSource },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'static str,
    data: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Deserialize)]
struct ResponseBlock {
    text: Option<String>,
}

/// Anthropic messages API. The frame travels inline as base64.
pub struct ClaudeBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
    describe_max_tokens: u32,
    hazard_max_tokens: u32,
}

impl ClaudeBackend {
    pub fn new(claude_config: &ClaudeConfig) -> Result<Self, ConfigurationError> {
        let api_key = require_credential(claude_config.api_key.as_deref(), NAME, "claude.api_key")?;

        Ok(Self {
            client: http_client(NAME, claude_config.timeout_ms)?,
            api_key,
            model: claude_config.model.clone(),
            endpoint: format!("{}/v1/messages", claude_config.base_url.trim_end_matches('/')),
            describe_max_tokens: claude_config.describe_max_tokens,
            hazard_max_tokens: claude_config.hazard_max_tokens,
        })
    }

    async fn complete(
        &self,
        frame: &Frame,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, InferenceError> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens,
            messages: [Message {
                role: "user",
                content: [
                    ContentBlock::Image {
                        source: ImageSource {
                            kind: "base64",
                            media_type: JPEG_MIME_TYPE,
                            data: STANDARD.encode(frame.as_bytes()),
                        },
                    },
                    ContentBlock::Text { text: prompt },
                ],
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| InferenceError::from_transport(NAME, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Provider(format!(
                "Request failed with status code {}",
                status.as_u16()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| InferenceError::from_transport(NAME, e))?;

        let parsed: MessagesResponse = serde_json::from_slice(&body)
            .map_err(|e| InferenceError::Protocol(format!("Malformed response body: {}", e)))?;

        parsed
            .content
            .into_iter()
            .next()
            .and_then(|block| block.text)
            .ok_or_else(|| InferenceError::Protocol("Response carries no text content".into()))
    }
}

#[async_trait]
impl InferenceBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    #[instrument(skip(self, frame, prompt), fields(frame_len = frame.byte_len()))]
    async fn describe(&self, frame: &Frame, prompt: &str) -> Result<String, InferenceError> {
        self.complete(frame, prompt, self.describe_max_tokens).await
    }

    #[instrument(skip(self, frame, prompt), fields(frame_len = frame.byte_len()))]
    async fn classify_hazard(&self, frame: &Frame, prompt: &str) -> Result<bool, InferenceError> {
        let answer = self.complete(frame, prompt, self.hazard_max_tokens).await?;
        parse_hazard_verdict(&answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_layout() {
        let request = MessagesRequest {
            model: "claude-3-haiku-20240307",
            max_tokens: 1,
            messages: [Message {
                role: "user",
                content: [
                    ContentBlock::Image {
                        source: ImageSource {
                            kind: "base64",
                            media_type: JPEG_MIME_TYPE,
                            data: STANDARD.encode([1u8, 2]),
                        },
                    },
                    ContentBlock::Text { text: "hazard?" },
                ],
            }],
        };

        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["max_tokens"], 1);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"][0]["type"], "image");
        assert_eq!(json["messages"][0]["content"][0]["source"]["type"], "base64");
        assert_eq!(
            json["messages"][0]["content"][0]["source"]["media_type"],
            "image/jpeg"
        );
        assert_eq!(json["messages"][0]["content"][0]["source"]["data"], "AQI=");
        assert_eq!(json["messages"][0]["content"][1]["type"], "text");
        assert_eq!(json["messages"][0]["content"][1]["text"], "hazard?");
    }

    #[test]
    fn test_missing_api_key_fails_construction() {
        let result = ClaudeBackend::new(&ClaudeConfig::default());

        assert!(matches!(
            result,
            Err(ConfigurationError::MissingCredential { backend: "claude", .. })
        ));
    }
}
