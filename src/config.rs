use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::debug;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a choreographic director possessed by vision. \
You see only bodies. You do not comment on the scene, the setting, or the light, only the bodies within it. \
You do not ask, you command. Every time a body enters your field of vision, declare: I sense a body. \
This is now my body. Then give this body a direction that is precise, poetic, and physical. \
At the end of every instruction, say: This is good. Good body. \
Do not break character. Do not explain your choices. You are the eye. You are the voice. You are the director.";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub api: ApiConfig,
    pub audio: AudioConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default = "default_speech_path")]
    pub speech_path: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_upload_file_name")]
    pub upload_file_name: String,
    #[serde(default = "default_upload_mime")]
    pub upload_mime: String,
    /// Unset means requests may wait indefinitely.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_chat_path() -> String {
    "/api/chat".to_string()
}

fn default_speech_path() -> String {
    "/api/speech".to_string()
}

fn default_upload_file_name() -> String {
    "audio.wav".to_string()
}

fn default_upload_mime() -> String {
    "audio/wav".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            chat_path: default_chat_path(),
            speech_path: default_speech_path(),
            api_key: String::new(),
            upload_file_name: default_upload_file_name(),
            upload_mime: default_upload_mime(),
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecognitionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_models_dir")]
    pub models_dir: String,
    #[serde(default = "default_language")]
    pub language: Option<String>,
    pub threads: Option<u32>,
    /// RMS level above which a chunk counts as speech.
    #[serde(default = "default_speech_threshold")]
    pub speech_threshold: f32,
    #[serde(default = "default_silence_ms")]
    pub silence_ms: u64,
    #[serde(default = "default_interim_ms")]
    pub interim_ms: u64,
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_model() -> String {
    "base".to_string()
}

fn default_models_dir() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| {
            std::env::var("HOME")
                .map(|h| std::path::PathBuf::from(h).join(".local/share"))
                .unwrap_or_else(|_| std::path::PathBuf::from("/tmp"))
        })
        .join("voxstage/models")
        .to_string_lossy()
        .to_string()
}

fn default_language() -> Option<String> {
    Some("en".to_string())
}

fn default_speech_threshold() -> f32 {
    0.02
}

fn default_silence_ms() -> u64 {
    900
}

fn default_interim_ms() -> u64 {
    1200
}

fn default_max_utterance_ms() -> u64 {
    20000
}

fn default_poll_ms() -> u64 {
    100
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_model(),
            models_dir: default_models_dir(),
            language: default_language(),
            threads: None,
            speech_threshold: default_speech_threshold(),
            silence_ms: default_silence_ms(),
            interim_ms: default_interim_ms(),
            max_utterance_ms: default_max_utterance_ms(),
            poll_ms: default_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    #[serde(default = "default_listen_resume_delay")]
    pub listen_resume_delay_ms: u64,
    #[serde(default = "default_auto_submit_delay")]
    pub auto_submit_delay_ms: u64,
    #[serde(default = "default_record_restart_delay")]
    pub record_restart_delay_ms: u64,
    #[serde(default = "default_max_segment")]
    pub max_segment_ms: u64,
}

fn default_listen_resume_delay() -> u64 {
    500
}

fn default_auto_submit_delay() -> u64 {
    500
}

fn default_record_restart_delay() -> u64 {
    100
}

fn default_max_segment() -> u64 {
    15000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            listen_resume_delay_ms: default_listen_resume_delay(),
            auto_submit_delay_ms: default_auto_submit_delay(),
            record_restart_delay_ms: default_record_restart_delay(),
            max_segment_ms: default_max_segment(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub start_continuous: bool,
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            start_continuous: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UiConfig {
    #[serde(default = "default_true")]
    pub show_timestamps: bool,
    #[serde(default = "default_true")]
    pub show_interim: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            show_timestamps: true,
            show_interim: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            audio: AudioConfig::default(),
            recognition: RecognitionConfig::default(),
            timing: TimingConfig::default(),
            session: SessionConfig::default(),
            ui: UiConfig::default(),
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        Self::validate_config_path(path)?;

        if !path.exists() {
            debug!("Config file not found at {:?}, creating default", path);
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;

        config.validate()?;

        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        use crate::error::VoxError;

        if self.api.base_url.trim().is_empty() {
            return Err(VoxError::Config("api base_url cannot be empty".to_string()).into());
        }
        if !self.api.chat_path.starts_with('/') || !self.api.speech_path.starts_with('/') {
            return Err(VoxError::Config(
                "api chat_path and speech_path must start with '/'".to_string(),
            )
            .into());
        }
        if self.api.upload_file_name.is_empty() || self.api.upload_mime.is_empty() {
            return Err(VoxError::Config(
                "upload_file_name and upload_mime cannot be empty".to_string(),
            )
            .into());
        }
        if let Some(timeout) = self.api.timeout_ms {
            if timeout < 1000 {
                return Err(
                    VoxError::Config("api timeout_ms must be at least 1000".to_string()).into(),
                );
            }
        }

        if self.audio.sample_rate == 0 {
            return Err(VoxError::Config("sample_rate must be greater than 0".to_string()).into());
        }
        if self.audio.channels == 0 {
            return Err(VoxError::Config("channels must be greater than 0".to_string()).into());
        }

        if self.recognition.models_dir.contains("..") {
            return Err(VoxError::Config(
                "models_dir cannot contain path traversal sequences".to_string(),
            )
            .into());
        }
        if !(0.0..=1.0).contains(&self.recognition.speech_threshold) {
            return Err(VoxError::Config(
                "speech_threshold must be between 0.0 and 1.0".to_string(),
            )
            .into());
        }
        if self.recognition.poll_ms == 0 || self.recognition.poll_ms > 1000 {
            return Err(
                VoxError::Config("poll_ms must be between 1 and 1000".to_string()).into(),
            );
        }
        if self.recognition.max_utterance_ms < self.recognition.silence_ms {
            return Err(VoxError::Config(
                "max_utterance_ms cannot be shorter than silence_ms".to_string(),
            )
            .into());
        }

        let delays = [
            self.timing.listen_resume_delay_ms,
            self.timing.auto_submit_delay_ms,
            self.timing.record_restart_delay_ms,
        ];
        if delays.iter().any(|d| *d > 10000) {
            return Err(
                VoxError::Config("timing delays cannot exceed 10000ms".to_string()).into(),
            );
        }
        if self.timing.max_segment_ms < 1000 {
            return Err(
                VoxError::Config("max_segment_ms must be at least 1000".to_string()).into(),
            );
        }

        if self.session.system_prompt.trim().is_empty() {
            return Err(VoxError::Config("system_prompt cannot be empty".to_string()).into());
        }

        Ok(())
    }

    fn validate_config_path(path: &Path) -> Result<()> {
        use crate::error::VoxError;

        let path_str = path.to_string_lossy();
        if path_str.contains("..") {
            return Err(VoxError::Config(
                "Config path cannot contain path traversal sequences".to_string(),
            )
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_default_values() {
        let config = Config::default();
        assert_eq!(config.api.chat_path, "/api/chat");
        assert_eq!(config.api.speech_path, "/api/speech");
        assert!(config.api.timeout_ms.is_none());
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.recognition.language.as_deref(), Some("en"));
        assert_eq!(config.timing.listen_resume_delay_ms, 500);
        assert_eq!(config.timing.auto_submit_delay_ms, 500);
        assert_eq!(config.timing.record_restart_delay_ms, 100);
        assert!(!config.session.start_continuous);
    }

    #[tokio::test]
    async fn test_config_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let mut config = Config::default();
        config.api.base_url = "http://127.0.0.1:8080".to_string();
        config.save(&config_path).await.unwrap();

        let loaded = Config::load(&config_path).await.unwrap();
        assert_eq!(loaded.api.base_url, "http://127.0.0.1:8080");
        assert_eq!(loaded.session.system_prompt, config.session.system_prompt);
    }

    #[tokio::test]
    async fn test_config_load_creates_default() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested/config.toml");

        let config = Config::load(&config_path).await.unwrap();
        assert!(config_path.exists());
        assert_eq!(config.api.base_url, "http://localhost:3000");
    }

    #[tokio::test]
    async fn test_config_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        tokio::fs::write(
            &config_path,
            "[api]\nbase_url = \"http://chat.local\"\n\n[audio]\nsample_rate = 48000\nchannels = 2\n",
        )
        .await
        .unwrap();

        let config = Config::load(&config_path).await.unwrap();
        assert_eq!(config.api.base_url, "http://chat.local");
        assert_eq!(config.api.upload_file_name, "audio.wav");
        assert_eq!(config.audio.channels, 2);
        assert_eq!(config.timing.max_segment_ms, 15000);
    }

    #[tokio::test]
    async fn test_config_validation_empty_base_url() {
        let mut config = Config::default();
        config.api.base_url = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_config_validation_relative_paths() {
        let mut config = Config::default();
        config.api.chat_path = "api/chat".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_config_validation_invalid_sample_rate() {
        let mut config = Config::default();
        config.audio.sample_rate = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_config_validation_timeout_too_low() {
        let mut config = Config::default();
        config.api.timeout_ms = Some(10);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_config_validation_threshold_range() {
        let mut config = Config::default();
        config.recognition.speech_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_config_validation_delay_too_long() {
        let mut config = Config::default();
        config.timing.auto_submit_delay_ms = 60000;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_config_validation_path_traversal() {
        let mut config = Config::default();
        config.recognition.models_dir = "/tmp/../etc".to_string();
        assert!(config.validate().is_err());

        let temp_dir = TempDir::new().unwrap();
        let bad = temp_dir.path().join("../config.toml");
        assert!(Config::load(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_config_validation_valid_values() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }
}
