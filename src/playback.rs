//! Audio playback to speakers

use async_trait::async_trait;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use tracing::{debug, error};

use crate::error::VoxError;

/// Output device for synthesized speech.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Plays an encoded audio object and returns when playback has finished.
    async fn play(&self, audio: Vec<u8>) -> Result<(), VoxError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
}

/// Mono samples ready for output.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.samples.len() as u64 * 1000 / self.sample_rate as u64)
    }
}

pub fn sniff_format(audio: &[u8]) -> AudioFormat {
    if audio.len() >= 12 && &audio[..4] == b"RIFF" && &audio[8..12] == b"WAVE" {
        AudioFormat::Wav
    } else {
        AudioFormat::Mp3
    }
}

pub fn decode(audio: &[u8]) -> Result<DecodedAudio, VoxError> {
    match sniff_format(audio) {
        AudioFormat::Wav => decode_wav(audio),
        AudioFormat::Mp3 => decode_mp3(audio),
    }
}

fn decode_wav(audio: &[u8]) -> Result<DecodedAudio, VoxError> {
    let reader = hound::WavReader::new(Cursor::new(audio))
        .map_err(|e| VoxError::Playback(format!("WAV decode error: {}", e)))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .filter_map(|s| s.ok())
            .collect(),
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .filter_map(|s| s.ok())
                .map(|s| s as f32 / max_val)
                .collect()
        }
    };

    Ok(DecodedAudio {
        samples: crate::audio::to_mono(&samples, spec.channels),
        sample_rate: spec.sample_rate,
    })
}

fn decode_mp3(audio: &[u8]) -> Result<DecodedAudio, VoxError> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(audio));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = frame.sample_rate as u32;
                let pcm: Vec<f32> = frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(crate::audio::to_mono(&pcm, frame.channels as u16));
            }
            Err(minimp3::Error::SkippedData) => continue,
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(VoxError::Playback(format!("MP3 decode error: {}", e))),
        }
    }

    if samples.is_empty() {
        return Err(VoxError::Playback("no audio frames in response".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Plays audio on the default output device.
#[derive(Default)]
pub struct CpalPlayer;

impl CpalPlayer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioSink for CpalPlayer {
    async fn play(&self, audio: Vec<u8>) -> Result<(), VoxError> {
        let decoded = decode(&audio)?;
        tokio::task::spawn_blocking(move || play_blocking(decoded))
            .await
            .map_err(|e| VoxError::Playback(format!("playback task failed: {}", e)))?
    }
}

fn play_blocking(audio: DecodedAudio) -> Result<(), VoxError> {
    if audio.samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| VoxError::Playback("no output device available".to_string()))?;

    let rate = SampleRate(audio.sample_rate);
    let supported = device
        .supported_output_configs()
        .map_err(|e| VoxError::Playback(e.to_string()))?
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| c.channels())
        .ok_or_else(|| {
            VoxError::Playback(format!(
                "no output config supports {} Hz",
                audio.sample_rate
            ))
        })?;

    let config = supported.with_sample_rate(rate).config();
    let channels = config.channels as usize;
    let duration = audio.duration();

    let samples = Arc::new(audio.samples);
    let position = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let cb_samples = samples.clone();
    let cb_position = position.clone();
    let cb_finished = finished.clone();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let pos = cb_position.fetch_add(1, Ordering::Relaxed);
                    let sample = match cb_samples.get(pos) {
                        Some(s) => *s,
                        None => {
                            cb_finished.store(true, Ordering::Relaxed);
                            0.0
                        }
                    };
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            |err| {
                error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| VoxError::Playback(e.to_string()))?;

    stream.play().map_err(|e| VoxError::Playback(e.to_string()))?;

    let start = Instant::now();
    let timeout = duration + Duration::from_millis(500);
    while !finished.load(Ordering::Relaxed) {
        if start.elapsed() > timeout {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    // Let the device drain its last buffer
    std::thread::sleep(Duration::from_millis(100));
    drop(stream);

    debug!(samples = samples.len(), "playback complete");
    Ok(())
}
