//! Continuous speech recognition.
//!
//! A recognizer listens on the microphone and emits interim and final
//! transcripts. Every event carries the run id passed to `start`, so events
//! from a run that has since been stopped can be told apart.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::rms;
use crate::config::RecognitionConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    Started,
    Transcript { text: String, is_final: bool },
    Error(String),
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionUpdate {
    pub run: u64,
    pub event: RecognitionEvent,
}

/// Sending half handed to a recognizer run.
#[derive(Clone)]
pub struct RecognitionSink {
    run: u64,
    tx: mpsc::UnboundedSender<RecognitionUpdate>,
}

impl RecognitionSink {
    pub fn new(run: u64, tx: mpsc::UnboundedSender<RecognitionUpdate>) -> Self {
        Self { run, tx }
    }

    pub fn run(&self) -> u64 {
        self.run
    }

    pub fn emit(&self, event: RecognitionEvent) {
        let _ = self.tx.send(RecognitionUpdate {
            run: self.run,
            event,
        });
    }
}

/// Platform speech recognition capability.
#[async_trait]
pub trait SpeechRecognizer: Send {
    /// Starts a listening run. Calling it while active is a no-op.
    async fn start(&mut self, sink: RecognitionSink) -> Result<()>;

    /// Stops the current run and returns once the microphone is released.
    /// Calling it while inactive is a no-op.
    async fn stop(&mut self) -> Result<()>;

    fn is_active(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentAction {
    Wait,
    Interim(Vec<f32>),
    Final(Vec<f32>),
}

/// Energy-based utterance segmentation over interleaved capture chunks.
pub struct Segmenter {
    threshold: f32,
    channels: usize,
    silence_samples: usize,
    interim_samples: usize,
    max_samples: usize,
    preroll_samples: usize,
    buffer: Vec<f32>,
    heard_speech: bool,
    trailing_silence: usize,
    since_interim: usize,
}

const PREROLL_MS: u64 = 300;

fn samples_for(ms: u64, sample_rate: u32, channels: u16) -> usize {
    (sample_rate as u64 * channels as u64 * ms / 1000) as usize
}

impl Segmenter {
    pub fn new(config: &RecognitionConfig, sample_rate: u32, channels: u16) -> Self {
        Self {
            threshold: config.speech_threshold,
            channels: channels.max(1) as usize,
            silence_samples: samples_for(config.silence_ms, sample_rate, channels),
            interim_samples: samples_for(config.interim_ms, sample_rate, channels),
            max_samples: samples_for(config.max_utterance_ms, sample_rate, channels),
            preroll_samples: samples_for(PREROLL_MS, sample_rate, channels),
            buffer: Vec::new(),
            heard_speech: false,
            trailing_silence: 0,
            since_interim: 0,
        }
    }

    pub fn push(&mut self, chunk: &[f32]) -> SegmentAction {
        if chunk.is_empty() {
            return SegmentAction::Wait;
        }

        self.buffer.extend_from_slice(chunk);
        let loud = rms(chunk) >= self.threshold;

        if !self.heard_speech {
            if !loud {
                if self.buffer.len() > self.preroll_samples {
                    let excess = self.buffer.len() - self.preroll_samples;
                    let excess = excess - excess % self.channels;
                    self.buffer.drain(..excess);
                }
                return SegmentAction::Wait;
            }
            self.heard_speech = true;
            self.trailing_silence = 0;
            self.since_interim = 0;
        }

        if loud {
            self.trailing_silence = 0;
        } else {
            self.trailing_silence += chunk.len();
        }
        self.since_interim += chunk.len();

        if self.trailing_silence >= self.silence_samples || self.buffer.len() >= self.max_samples
        {
            return SegmentAction::Final(self.take());
        }

        if self.since_interim >= self.interim_samples {
            self.since_interim = 0;
            return SegmentAction::Interim(self.buffer.clone());
        }

        SegmentAction::Wait
    }

    fn take(&mut self) -> Vec<f32> {
        self.heard_speech = false;
        self.trailing_silence = 0;
        self.since_interim = 0;
        std::mem::take(&mut self.buffer)
    }
}

#[cfg(feature = "local-recognition")]
pub use whisper::WhisperRecognizer;

#[cfg(feature = "local-recognition")]
mod whisper {
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{oneshot, Mutex};
    use tokio::task::JoinHandle;
    use tracing::{debug, info, warn};

    use super::{RecognitionEvent, RecognitionSink, SegmentAction, Segmenter, SpeechRecognizer};
    use crate::audio::CaptureStream;
    use crate::config::{AudioConfig, RecognitionConfig};
    use crate::microphone::{MicUser, Microphone};
    use crate::transcription::WhisperEngine;

    struct ActiveRun {
        stop_tx: oneshot::Sender<()>,
        handle: JoinHandle<()>,
    }

    pub struct WhisperRecognizer {
        config: RecognitionConfig,
        audio: AudioConfig,
        mic: Microphone,
        engine: Arc<Mutex<WhisperEngine>>,
        active: Option<ActiveRun>,
    }

    impl WhisperRecognizer {
        pub fn new(
            config: &RecognitionConfig,
            audio: &AudioConfig,
            mic: Microphone,
        ) -> Result<Self> {
            let engine = WhisperEngine::new(config)?;
            Ok(Self {
                config: config.clone(),
                audio: audio.clone(),
                mic,
                engine: Arc::new(Mutex::new(engine)),
                active: None,
            })
        }

        /// Loads the model ahead of the first listening run.
        pub async fn prepare(&self) -> Result<()> {
            self.engine.lock().await.load_model().await
        }
    }

    #[async_trait]
    impl SpeechRecognizer for WhisperRecognizer {
        async fn start(&mut self, sink: RecognitionSink) -> Result<()> {
            if self.is_active() {
                debug!("Recognizer already listening");
                return Ok(());
            }
            self.active = None;

            let lease = self.mic.acquire(MicUser::Recognizer)?;
            let (stop_tx, stop_rx) = oneshot::channel();

            let config = self.config.clone();
            let audio = self.audio.clone();
            let engine = self.engine.clone();

            let handle = tokio::spawn(async move {
                let stream = match CaptureStream::open(&audio, "voxstage-recognizer").await {
                    Ok(stream) => stream,
                    Err(e) => {
                        drop(lease);
                        sink.emit(RecognitionEvent::Error(e.to_string()));
                        sink.emit(RecognitionEvent::Ended);
                        return;
                    }
                };

                if let Err(e) = engine.lock().await.load_model().await {
                    let _ = stream.close().await;
                    drop(lease);
                    sink.emit(RecognitionEvent::Error(e.to_string()));
                    sink.emit(RecognitionEvent::Ended);
                    return;
                }

                sink.emit(RecognitionEvent::Started);
                info!("Speech recognition run {} started", sink.run());

                listen(&config, &stream, &engine, &sink, stop_rx).await;

                if let Err(e) = stream.close().await {
                    warn!("Failed to close recognizer stream: {}", e);
                }
                drop(lease);
                sink.emit(RecognitionEvent::Ended);
                info!("Speech recognition run {} ended", sink.run());
            });

            self.active = Some(ActiveRun { stop_tx, handle });
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            if let Some(run) = self.active.take() {
                let _ = run.stop_tx.send(());
                run.handle.await?;
            }
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.active
                .as_ref()
                .map(|run| !run.handle.is_finished())
                .unwrap_or(false)
        }
    }

    async fn listen(
        config: &RecognitionConfig,
        stream: &CaptureStream,
        engine: &Mutex<WhisperEngine>,
        sink: &RecognitionSink,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let mut segmenter = Segmenter::new(config, stream.sample_rate(), stream.channels());
        let mut interval = tokio::time::interval(Duration::from_millis(config.poll_ms));

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = interval.tick() => {}
            }

            let (samples, is_final) = match segmenter.push(&stream.drain()) {
                SegmentAction::Wait => continue,
                SegmentAction::Interim(samples) => (samples, false),
                SegmentAction::Final(samples) => (samples, true),
            };

            let result = engine
                .lock()
                .await
                .transcribe(&samples, stream.sample_rate(), stream.channels())
                .await;

            match result {
                Ok(text) if text.is_empty() => {}
                Ok(text) => sink.emit(RecognitionEvent::Transcript { text, is_final }),
                Err(e) => {
                    sink.emit(RecognitionEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    }
}
