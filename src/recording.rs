use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::audio::{encode_wav, CaptureStream};
use crate::config::AudioConfig;
use crate::error::VoxError;
use crate::microphone::{MicLease, MicUser, Microphone};

/// Segment recorder whose stream may outlive a single segment.
#[async_trait]
pub trait Recorder: Send {
    /// Begins a new segment, acquiring the microphone stream if it is not held yet.
    async fn start(&mut self) -> Result<()>;

    /// Ends the current segment and returns it as one encoded audio object.
    async fn stop(&mut self) -> Result<Vec<u8>>;

    /// Drops any open segment and releases the microphone stream.
    async fn release(&mut self);

    fn holds_stream(&self) -> bool;
}

struct HeldStream {
    // Dropped after the stream is closed.
    _lease: MicLease,
    stream: CaptureStream,
}

pub struct MicRecorder {
    config: AudioConfig,
    mic: Microphone,
    held: Option<HeldStream>,
    segment_open: bool,
}

impl MicRecorder {
    pub fn new(config: &AudioConfig, mic: Microphone) -> Self {
        Self {
            config: config.clone(),
            mic,
            held: None,
            segment_open: false,
        }
    }
}

#[async_trait]
impl Recorder for MicRecorder {
    async fn start(&mut self) -> Result<()> {
        match self.held {
            Some(ref held) => {
                // Reusing the stream: discard anything left from before the pause.
                let stale = held.stream.drain();
                held.stream.set_capturing(true);
                debug!("Reusing microphone stream, discarded {} samples", stale.len());
            }
            None => {
                let lease = self.mic.acquire(MicUser::Recorder)?;
                let stream = CaptureStream::open(&self.config, "voxstage-recorder").await?;
                self.held = Some(HeldStream {
                    _lease: lease,
                    stream,
                });
            }
        }

        self.segment_open = true;
        info!("Recording segment started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<Vec<u8>> {
        let held = match self.held {
            Some(ref held) if self.segment_open => held,
            _ => return Err(VoxError::Audio("No active recording segment".to_string()).into()),
        };
        self.segment_open = false;

        // Nothing buffers between segments while the stream stays held.
        held.stream.set_capturing(false);
        let samples = held.stream.drain();
        if samples.is_empty() {
            return Err(VoxError::Audio("Recording segment is empty".to_string()).into());
        }

        let audio = encode_wav(&samples, held.stream.sample_rate(), held.stream.channels())?;
        info!("Recording segment finished ({} bytes)", audio.len());
        Ok(audio)
    }

    async fn release(&mut self) {
        self.segment_open = false;
        if let Some(held) = self.held.take() {
            let HeldStream {
                _lease: lease,
                stream,
            } = held;
            if let Err(e) = stream.close().await {
                warn!("Failed to close recorder stream: {}", e);
            }
            drop(lease);
            info!("Recorder released microphone");
        }
    }

    fn holds_stream(&self) -> bool {
        self.held.is_some()
    }
}
