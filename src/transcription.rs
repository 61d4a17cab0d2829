use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::audio::{resample, to_mono};
use crate::config::RecognitionConfig;
use crate::error::VoxError;

const HF_BASE_URL: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

/// Valid Whisper model names that can be downloaded
const VALID_MODELS: &[&str] = &["tiny", "base", "small", "medium", "large-v3-turbo"];

const WHISPER_SAMPLE_RATE: u32 = 16000;

/// Local whisper.cpp engine backing the speech recognizer.
pub struct WhisperEngine {
    config: RecognitionConfig,
    context: Option<WhisperContext>,
    model_path: PathBuf,
}

fn validate_model_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VoxError::Config("Model name cannot be empty".to_string()).into());
    }

    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(VoxError::Config(format!(
            "Invalid model name '{}': contains path separators",
            name
        ))
        .into());
    }

    if name.contains('\0') {
        return Err(
            VoxError::Config("Invalid model name: contains null bytes".to_string()).into(),
        );
    }

    // Custom models are allowed, just flagged
    if !VALID_MODELS.contains(&name) {
        warn!("Model '{}' is not in the known model list: {:?}", name, VALID_MODELS);
    }

    Ok(())
}

/// Streams the model to a `.part` file and renames it once complete, so an
/// interrupted download never leaves a truncated model behind.
fn download_model(url: &str, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| VoxError::ModelDownload(format!("{}: {}", parent.display(), e)))?;
    }

    let mut response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(|e| VoxError::ModelDownload(e.to_string()))?;

    let partial = dest.with_extension("bin.part");
    let mut file = std::fs::File::create(&partial)?;
    let size = std::io::copy(&mut response, &mut file).map_err(|e| {
        let _ = std::fs::remove_file(&partial);
        VoxError::ModelDownload(e.to_string())
    })?;
    std::fs::rename(&partial, dest)?;

    debug!("Wrote {} bytes to {}", size, dest.display());
    Ok(size)
}

impl WhisperEngine {
    pub fn new(config: &RecognitionConfig) -> Result<Self> {
        validate_model_name(&config.model)?;

        if config.models_dir.contains("..") {
            return Err(VoxError::Config(
                "models_dir cannot contain path traversal sequences".to_string(),
            )
            .into());
        }

        let model_path =
            PathBuf::from(&config.models_dir).join(format!("ggml-{}.bin", config.model));

        Ok(Self {
            config: config.clone(),
            context: None,
            model_path,
        })
    }

    /// Fetches the model into `models_dir` unless it is already there.
    pub async fn ensure_model(&self) -> Result<()> {
        if self.model_path.exists() {
            return Ok(());
        }

        let url = format!("{}/ggml-{}.bin", HF_BASE_URL, self.config.model);
        info!("Fetching whisper model '{}'", self.config.model);

        let dest = self.model_path.clone();
        let size = tokio::task::spawn_blocking(move || download_model(&url, &dest))
            .await
            .map_err(|e| VoxError::ModelDownload(format!("Download task failed: {}", e)))??;

        info!("Model '{}' ready ({} bytes)", self.config.model, size);
        Ok(())
    }

    pub async fn load_model(&mut self) -> Result<()> {
        if self.context.is_some() {
            return Ok(());
        }
        self.ensure_model().await?;

        let path = self
            .model_path
            .to_str()
            .ok_or_else(|| VoxError::ModelLoad("Invalid model path encoding".to_string()))?
            .to_string();

        let ctx = tokio::task::spawn_blocking(move || {
            WhisperContext::new_with_params(&path, WhisperContextParameters::default())
        })
        .await
        .map_err(|e| VoxError::ModelLoad(format!("Model load task failed: {}", e)))?
        .map_err(|e| VoxError::ModelLoad(e.to_string()))?;

        self.context = Some(ctx);
        info!("Whisper model loaded from {}", self.model_path.display());
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.context.is_some()
    }

    /// Transcribes interleaved samples captured at `sample_rate`.
    pub async fn transcribe(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        channels: u16,
    ) -> Result<String> {
        if self.context.is_none() {
            self.load_model().await?;
        }

        let mono = to_mono(samples, channels);
        let input = resample(&mono, sample_rate, WHISPER_SAMPLE_RATE);

        let ctx = self
            .context
            .as_ref()
            .ok_or_else(|| VoxError::Recognition("Model not loaded".to_string()))?;

        let mut state = ctx.create_state().map_err(|e| {
            VoxError::Recognition(format!("Failed to create whisper state: {}", e))
        })?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

        if let Some(ref lang) = self.config.language {
            params.set_language(Some(lang));
        }

        let threads = self.config.threads.unwrap_or_else(|| {
            let cpus = num_cpus::get() as u32;
            std::cmp::max(1, std::cmp::min(8, cpus.saturating_sub(2)))
        });
        params.set_n_threads(threads as i32);
        params.set_temperature(0.2);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        state
            .full(params, &input)
            .map_err(|e| VoxError::Recognition(format!("Whisper failed: {}", e)))?;

        let mut text = String::new();
        for i in 0..state.full_n_segments() {
            if let Some(segment) = state.get_segment(i) {
                if let Ok(segment_text) = segment.to_str() {
                    text.push_str(segment_text);
                }
            }
        }

        let result = text.trim().to_string();
        debug!("Recognized {} chars from {} samples", result.len(), input.len());
        Ok(result)
    }
}
