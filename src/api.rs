use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::ApiConfig;
use crate::conversation::WireMessage;
use crate::error::VoxError;

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: &'a [WireMessage],
}

#[derive(Deserialize)]
struct ChatResponse {
    content: String,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
}

/// Chat completion endpoint.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Sends the full history and returns the assistant reply.
    async fn complete(&self, messages: Vec<WireMessage>) -> Result<String, VoxError>;
}

/// Transcription and synthesis endpoint.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>) -> Result<String, VoxError>;
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, VoxError>;
}

pub struct HttpApi {
    client: reqwest::Client,
    chat_url: String,
    speech_url: String,
    upload_file_name: String,
    upload_mime: String,
}

impl HttpApi {
    pub fn new(config: &ApiConfig) -> Result<Self, VoxError> {
        let mut builder = reqwest::Client::builder();

        if let Some(timeout_ms) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }

        if !config.api_key.is_empty() {
            let mut headers = reqwest::header::HeaderMap::new();
            let value = format!("Bearer {}", config.api_key);
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&value)
                    .map_err(|e| VoxError::Config(format!("invalid API key: {}", e)))?,
            );
            builder = builder.default_headers(headers);
        }

        let client = builder
            .build()
            .map_err(|e| VoxError::Config(format!("failed to build HTTP client: {}", e)))?;

        let base = config.base_url.trim_end_matches('/');
        Ok(Self {
            client,
            chat_url: format!("{}{}", base, config.chat_path),
            speech_url: format!("{}{}", base, config.speech_path),
            upload_file_name: config.upload_file_name.clone(),
            upload_mime: config.upload_mime.clone(),
        })
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    pub fn speech_url(&self) -> &str {
        &self.speech_url
    }
}

#[async_trait]
impl ChatBackend for HttpApi {
    async fn complete(&self, messages: Vec<WireMessage>) -> Result<String, VoxError> {
        debug!("Sending {} messages to chat endpoint", messages.len());

        let response = self
            .client
            .post(&self.chat_url)
            .json(&ChatRequest {
                messages: &messages,
            })
            .send()
            .await
            .map_err(|e| VoxError::Chat(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(VoxError::Chat(format!(
                "API returned status {}",
                response.status()
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| VoxError::Chat(format!("failed to parse response: {}", e)))?;

        debug!("Chat reply: {} chars", body.content.len());
        Ok(body.content)
    }
}

#[async_trait]
impl SpeechBackend for HttpApi {
    async fn transcribe(&self, audio: Vec<u8>) -> Result<String, VoxError> {
        debug!(audio_bytes = audio.len(), "Uploading audio for transcription");

        let part = reqwest::multipart::Part::bytes(audio)
            .file_name(self.upload_file_name.clone())
            .mime_str(&self.upload_mime)
            .map_err(|e| VoxError::Transcription(format!("invalid upload type: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.speech_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoxError::Transcription(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(VoxError::Transcription(format!(
                "API returned status {}",
                response.status()
            )));
        }

        let body: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| VoxError::Transcription(format!("failed to parse response: {}", e)))?;

        Ok(body.text)
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, VoxError> {
        debug!("Requesting speech for {} chars", text.len());

        let response = self
            .client
            .post(&self.speech_url)
            .json(&SynthesisRequest { text })
            .send()
            .await
            .map_err(|e| VoxError::Synthesis(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(VoxError::Synthesis(format!(
                "API returned status {}",
                response.status()
            )));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| VoxError::Synthesis(format!("failed to read audio: {}", e)))?;

        if audio.is_empty() {
            return Err(VoxError::Synthesis("empty audio response".to_string()));
        }

        Ok(audio.to_vec())
    }
}
