use super::{http_client, parse_hazard_verdict, InferenceBackend, InferenceError, JPEG_MIME_TYPE};
use crate::config::{require_credential, ConfigurationError, GeminiConfig};
use crate::frame::Frame;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

const NAME: &str = "gemini";
const UPLOAD_URL_HEADER: &str = "x-goog-upload-url";

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 2],
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Part<'a> {
    Text(&'a str),
    FileData { mime_type: &'static str, file_uri: &'a str },
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct UploadResponse {
    file: Option<UploadedFile>,
}

#[derive(Deserialize)]
struct UploadedFile {
    uri: Option<String>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

/// Google generative language API. Every frame is first pushed through the
/// resumable file upload, then referenced by URI in the generation call.
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    upload_endpoint: String,
    generate_endpoint: String,
    describe_max_tokens: u32,
    hazard_max_tokens: u32,
}

impl GeminiBackend {
    pub fn new(gemini_config: &GeminiConfig) -> Result<Self, ConfigurationError> {
        let api_key = require_credential(gemini_config.api_key.as_deref(), NAME, "gemini.api_key")?;
        let base_url = gemini_config.base_url.trim_end_matches('/');

        Ok(Self {
            client: http_client(NAME, gemini_config.timeout_ms)?,
            api_key,
            upload_endpoint: format!("{}/upload/v1beta/files", base_url),
            generate_endpoint: format!(
                "{}/v1beta/models/{}:generateContent",
                base_url, gemini_config.model
            ),
            describe_max_tokens: gemini_config.describe_max_tokens,
            hazard_max_tokens: gemini_config.hazard_max_tokens,
        })
    }

    async fn upload_frame(&self, frame: &Frame) -> Result<String, InferenceError> {
        let start_response = self
            .client
            .post(&self.upload_endpoint)
            .query(&[("key", &self.api_key)])
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", frame.byte_len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", JPEG_MIME_TYPE)
            .header(CONTENT_TYPE, "application/json")
            .body(json!({ "file": { "display_name": "Uploaded Image" } }).to_string())
            .send()
            .await
            .map_err(|e| InferenceError::from_transport(NAME, e))?;

        if !start_response.status().is_success() {
            return Err(InferenceError::Provider(format!(
                "Initial upload request failed with status code {}",
                start_response.status().as_u16()
            )));
        }

        let session_url = start_response
            .headers()
            .get(UPLOAD_URL_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| {
                InferenceError::Protocol("No upload URL received in response headers".into())
            })?;

        let upload_response = self
            .client
            .post(session_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(frame.to_bytes())
            .send()
            .await
            .map_err(|e| InferenceError::from_transport(NAME, e))?;

        if !upload_response.status().is_success() {
            return Err(InferenceError::Provider(format!(
                "Image upload failed with status code {}",
                upload_response.status().as_u16()
            )));
        }

        let body = upload_response
            .bytes()
            .await
            .map_err(|e| InferenceError::from_transport(NAME, e))?;

        serde_json::from_slice::<UploadResponse>(&body)
            .ok()
            .and_then(|upload| upload.file)
            .and_then(|file| file.uri)
            .ok_or_else(|| InferenceError::Protocol("No file URI returned in upload response".into()))
    }

    async fn generate(
        &self,
        frame: &Frame,
        prompt: &str,
        max_output_tokens: u32,
    ) -> Result<String, InferenceError> {
        let file_uri = self.upload_frame(frame).await?;
        tracing::debug!("Uploaded frame as {}", file_uri);

        let request = GenerateRequest {
            contents: [Content {
                parts: [
                    Part::Text(prompt),
                    Part::FileData {
                        mime_type: JPEG_MIME_TYPE,
                        file_uri: &file_uri,
                    },
                ],
            }],
            generation_config: GenerationConfig { max_output_tokens },
        };

        let response = self
            .client
            .post(&self.generate_endpoint)
            .query(&[("key", &self.api_key)])
            .json(&request)
            .send()
            .await
            .map_err(|e| InferenceError::from_transport(NAME, e))?;

        if !response.status().is_success() {
            return Err(InferenceError::Provider(format!(
                "Content generation failed with status code {}",
                response.status().as_u16()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| InferenceError::from_transport(NAME, e))?;

        let parsed: GenerateResponse = serde_json::from_slice(&body)
            .map_err(|e| InferenceError::Protocol(format!("Malformed response body: {}", e)))?;

        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts.into_iter().next())
            .and_then(|part| part.text)
            .ok_or_else(|| InferenceError::Protocol("Response carries no candidate text".into()))
    }
}

#[async_trait]
impl InferenceBackend for GeminiBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    #[instrument(skip(self, frame, prompt), fields(frame_len = frame.byte_len()))]
    async fn describe(&self, frame: &Frame, prompt: &str) -> Result<String, InferenceError> {
        self.generate(frame, prompt, self.describe_max_tokens).await
    }

    #[instrument(skip(self, frame, prompt), fields(frame_len = frame.byte_len()))]
    async fn classify_hazard(&self, frame: &Frame, prompt: &str) -> Result<bool, InferenceError> {
        let answer = self.generate(frame, prompt, self.hazard_max_tokens).await?;
        parse_hazard_verdict(&answer)
    }
}
