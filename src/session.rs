//! The conversation session and its control loop.
//!
//! All mutable state lives in [`Session`] and is only touched from
//! [`Session::handle`]. Network calls, playback and timers run in spawned
//! tasks that report back through the event channel, so every completion is
//! applied against the current state rather than a captured copy.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{ChatBackend, SpeechBackend};
use crate::command::Command;
use crate::config::{Config, TimingConfig};
use crate::conversation::{Conversation, Message};
use crate::error::VoxError;
use crate::machine::{transition, State, Trigger};
use crate::playback::AudioSink;
use crate::recognition::{RecognitionEvent, RecognitionSink, RecognitionUpdate, SpeechRecognizer};
use crate::recording::Recorder;
use crate::socket::{read_command, SocketServer};

const TYPED_ERROR: &str = "Sorry, I encountered an error.";
const VOICE_ERROR: &str = "Sorry, I encountered an error. Please try again.";

/// Where a submission came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Typed,
    Voice,
}

impl Origin {
    pub fn error_message(self) -> &'static str {
        match self {
            Origin::Typed => TYPED_ERROR,
            Origin::Voice => VOICE_ERROR,
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    Command(Command),
    /// A command from the control socket, answered with the resulting state.
    Remote {
        cmd: Command,
        reply: oneshot::Sender<String>,
    },
    Recognition(RecognitionUpdate),
    ChatFinished {
        origin: Origin,
        result: Result<String, VoxError>,
    },
    TranscriptionFinished(Result<String, VoxError>),
    PlaybackFinished {
        run: u64,
        result: Result<(), VoxError>,
    },
    Timer {
        generation: u64,
    },
}

/// Observable changes, for whatever renders the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    State(State),
    Continuous(bool),
    Draft(String),
    Message(Message),
    Notice(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Followup {
    ResumeListening,
    RestartRecording,
    AutoSubmit(String),
    EndSegment,
}

/// Capabilities the session drives.
pub struct SessionParts {
    pub chat: Arc<dyn ChatBackend>,
    pub speech: Arc<dyn SpeechBackend>,
    pub sink: Arc<dyn AudioSink>,
    pub recognizer: Option<Box<dyn SpeechRecognizer>>,
    pub recorder: Box<dyn Recorder>,
}

pub struct Session {
    timing: TimingConfig,
    start_continuous: bool,
    conversation: Conversation,
    state: State,
    continuous: bool,
    draft: String,
    chat: Arc<dyn ChatBackend>,
    speech: Arc<dyn SpeechBackend>,
    sink: Arc<dyn AudioSink>,
    recognizer: Option<Box<dyn SpeechRecognizer>>,
    recorder: Box<dyn Recorder>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    recognition_tx: mpsc::UnboundedSender<RecognitionUpdate>,
    recognition_rx: mpsc::UnboundedReceiver<RecognitionUpdate>,
    updates: broadcast::Sender<SessionUpdate>,
    scheduled: Option<(u64, Followup)>,
    generation: u64,
    listen_run: u64,
    playback_run: u64,
}

impl Session {
    pub fn new(config: &Config, parts: SessionParts) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (recognition_tx, recognition_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(256);

        if parts.recognizer.is_none() {
            info!("Speech recognition unavailable, continuous mode will use recording");
        }

        Self {
            timing: config.timing.clone(),
            start_continuous: config.session.start_continuous,
            conversation: Conversation::new(&config.session.system_prompt),
            state: State::Idle,
            continuous: false,
            draft: String::new(),
            chat: parts.chat,
            speech: parts.speech,
            sink: parts.sink,
            recognizer: parts.recognizer,
            recorder: parts.recorder,
            events_tx,
            events_rx,
            recognition_tx,
            recognition_rx,
            updates,
            scheduled: None,
            generation: 0,
            listen_run: 0,
            playback_run: 0,
        }
    }

    /// Sender for commands from the terminal or other front ends.
    pub fn events(&self) -> mpsc::UnboundedSender<SessionEvent> {
        self.events_tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn status_line(&self) -> String {
        format!(
            "{} (continuous: {}, messages: {})",
            self.state,
            if self.continuous { "on" } else { "off" },
            self.conversation.visible().len()
        )
    }

    /// Applies startup configuration that needs a running event loop.
    pub async fn begin(&mut self) {
        if self.start_continuous {
            self.set_continuous(true).await;
        }
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        tokio::select! {
            Some(event) = self.events_rx.recv() => Some(event),
            Some(update) = self.recognition_rx.recv() => Some(SessionEvent::Recognition(update)),
            else => None,
        }
    }

    /// Waits for and handles one event. Returns false once the session should end.
    pub async fn step(&mut self) -> bool {
        match self.next_event().await {
            Some(event) => self.handle(event).await,
            None => false,
        }
    }

    pub async fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Command(cmd) => return self.handle_command(cmd).await,
            SessionEvent::Remote { cmd, reply } => {
                let keep_running = self.handle_command(cmd).await;
                let response = if keep_running {
                    format!("ok: {}", self.state)
                } else {
                    info!("Quit requested via socket");
                    "ok: quitting".to_string()
                };
                let _ = reply.send(response);
                return keep_running;
            }
            SessionEvent::Recognition(update) => self.on_recognition(update).await,
            SessionEvent::ChatFinished { origin, result } => {
                self.on_chat_finished(origin, result).await
            }
            SessionEvent::TranscriptionFinished(result) => {
                self.on_transcription_finished(result).await
            }
            SessionEvent::PlaybackFinished { run, result } => {
                self.on_playback_finished(run, result)
            }
            SessionEvent::Timer { generation } => self.on_timer(generation).await,
        }
        true
    }

    pub async fn run(mut self, socket: Option<SocketServer>) -> Result<()> {
        info!("Session running (PID {})", std::process::id());
        self.begin().await;

        let listener = socket.map(|server| spawn_socket_listener(server, self.events()));

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down...");
                    break;
                }
                event = self.next_event() => {
                    match event {
                        Some(event) => {
                            if !self.handle(event).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        if let Some(listener) = listener {
            listener.abort();
        }
        self.shutdown().await;
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Submit(text) => self.submit(&text, Origin::Typed).await,
            Command::SubmitDraft => {
                let text = self.draft.clone();
                self.submit(&text, Origin::Typed).await
            }
            Command::ToggleContinuous => self.set_continuous(!self.continuous).await,
            Command::StartRecording => self.start_recording().await,
            Command::StopRecording => self.stop_recording().await,
            Command::Replay(n) => self.replay(n).await,
            Command::Status => self.notice(self.status_line()),
            Command::Quit => return false,
        }
        true
    }

    pub async fn shutdown(&mut self) {
        self.scheduled = None;
        if let Some(recognizer) = self.recognizer.as_mut() {
            if let Err(e) = recognizer.stop().await {
                warn!("Failed to stop speech recognition: {}", e);
            }
        }
        self.recorder.release().await;
        info!("Session shut down cleanly");
    }

    fn publish(&self, update: SessionUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    fn notice(&self, text: String) {
        info!("{}", text);
        self.publish(SessionUpdate::Notice(text));
    }

    fn set_draft(&mut self, text: String) {
        if self.draft != text {
            self.draft = text;
            self.publish(SessionUpdate::Draft(self.draft.clone()));
        }
    }

    fn apply(&mut self, trigger: Trigger) -> bool {
        match transition(self.state, trigger) {
            Ok(next) => {
                if next != self.state {
                    debug!("State {} -> {} ({})", self.state, next, trigger);
                    self.state = next;
                    self.publish(SessionUpdate::State(next));
                }
                true
            }
            Err(e) => {
                debug!("{}", e);
                false
            }
        }
    }

    fn schedule(&mut self, followup: Followup, delay_ms: u64) {
        self.generation += 1;
        let generation = self.generation;
        debug!("Scheduling {:?} in {}ms", followup, delay_ms);
        self.scheduled = Some((generation, followup));

        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = tx.send(SessionEvent::Timer { generation });
        });
    }

    fn schedule_resume_listening(&mut self) {
        if self.continuous && self.recognizer.is_some() {
            self.schedule(Followup::ResumeListening, self.timing.listen_resume_delay_ms);
        }
    }

    async fn on_timer(&mut self, generation: u64) {
        let followup = match self.scheduled.take() {
            Some((scheduled, followup)) if scheduled == generation => followup,
            other => {
                debug!("Ignoring stale timer {}", generation);
                self.scheduled = other;
                return;
            }
        };

        match followup {
            Followup::ResumeListening => {
                if self.continuous {
                    self.start_listening().await;
                }
            }
            Followup::RestartRecording => {
                if self.continuous && self.state == State::Idle {
                    self.start_recording().await;
                }
            }
            Followup::AutoSubmit(text) => self.submit(&text, Origin::Voice).await,
            Followup::EndSegment => {
                if self.state.is_recording() {
                    debug!("Recording segment reached its maximum length");
                    self.stop_recording().await;
                }
            }
        }
    }

    /// Stops listening or recording. Recording audio is discarded.
    async fn halt_input(&mut self) {
        match self.state {
            State::Listening => self.stop_listening(Trigger::StopListening).await,
            State::Recording => {
                self.recorder.release().await;
                self.apply(Trigger::Halt);
            }
            _ => {}
        }
        if self.recorder.holds_stream() {
            self.recorder.release().await;
        }
    }

    async fn set_continuous(&mut self, on: bool) {
        if self.continuous == on {
            return;
        }
        self.continuous = on;
        info!("Continuous mode {}", if on { "on" } else { "off" });
        self.publish(SessionUpdate::Continuous(on));

        if on {
            // A pending auto-submit leads to playback, which resumes listening.
            let submitting = matches!(self.scheduled, Some((_, Followup::AutoSubmit(_))));
            if self.state == State::Idle && !submitting {
                self.schedule_resume_listening();
            }
            return;
        }

        // A pending auto-submit still goes through.
        if !matches!(self.scheduled, Some((_, Followup::AutoSubmit(_)))) {
            self.scheduled = None;
        }
        if self.state.is_listening() {
            self.stop_listening(Trigger::StopListening).await;
        }
        if !self.state.is_recording() && self.recorder.holds_stream() {
            self.recorder.release().await;
        }
    }

    async fn start_listening(&mut self) {
        if self.state != State::Idle {
            debug!("Not starting recognition while {}", self.state);
            return;
        }
        if self.recognizer.is_none() {
            debug!("Speech recognition unavailable");
            return;
        }
        if self.recorder.holds_stream() {
            self.recorder.release().await;
        }

        self.listen_run += 1;
        let sink = RecognitionSink::new(self.listen_run, self.recognition_tx.clone());
        let result = match self.recognizer.as_mut() {
            Some(recognizer) => recognizer.start(sink).await,
            None => return,
        };

        match result {
            Ok(()) => {
                self.apply(Trigger::StartListening);
            }
            Err(e) => warn!("Failed to start speech recognition: {}", e),
        }
    }

    async fn stop_listening(&mut self, trigger: Trigger) {
        // Events still queued from this run are stale from here on.
        self.listen_run += 1;
        if let Some(recognizer) = self.recognizer.as_mut() {
            if let Err(e) = recognizer.stop().await {
                warn!("Failed to stop speech recognition: {}", e);
            }
        }
        if self.state.is_listening() {
            self.apply(trigger);
        }
    }

    async fn on_recognition(&mut self, update: RecognitionUpdate) {
        if update.run != self.listen_run {
            debug!("Ignoring event from recognition run {}", update.run);
            return;
        }

        match update.event {
            RecognitionEvent::Started => debug!("Recognition run {} started", update.run),
            RecognitionEvent::Transcript {
                text,
                is_final: false,
            } => {
                if self.state.is_listening() {
                    self.set_draft(text);
                }
            }
            RecognitionEvent::Transcript {
                text,
                is_final: true,
            } => {
                if !self.continuous {
                    debug!("Final transcript outside continuous mode ignored");
                    return;
                }
                let text = text.trim().to_string();
                if text.is_empty() {
                    return;
                }
                info!("Heard: {}", text);
                self.set_draft(text.clone());
                self.stop_listening(Trigger::FinalTranscript).await;
                self.schedule(
                    Followup::AutoSubmit(text),
                    self.timing.auto_submit_delay_ms,
                );
            }
            RecognitionEvent::Error(msg) => {
                warn!("Speech recognition error: {}", msg);
                self.end_listening().await;
            }
            RecognitionEvent::Ended => self.end_listening().await,
        }
    }

    async fn end_listening(&mut self) {
        if !self.state.is_listening() {
            return;
        }
        self.stop_listening(Trigger::RecognitionEnded).await;
        self.schedule_resume_listening();
    }

    async fn start_recording(&mut self) {
        match self.state {
            State::Recording => {
                debug!("Already recording");
                return;
            }
            State::Idle | State::Listening => {}
            other => {
                debug!("Cannot record while {}", other);
                return;
            }
        }

        self.scheduled = None;
        if self.state.is_listening() {
            self.stop_listening(Trigger::StopListening).await;
        }

        match self.recorder.start().await {
            Ok(()) => {
                self.apply(Trigger::StartRecording);
                if self.continuous {
                    self.schedule(Followup::EndSegment, self.timing.max_segment_ms);
                }
            }
            Err(e) => {
                warn!("Failed to start recording: {}", e);
                self.schedule_resume_listening();
            }
        }
    }

    async fn stop_recording(&mut self) {
        if !self.state.is_recording() {
            debug!("Not recording");
            return;
        }
        self.scheduled = None;

        match self.recorder.stop().await {
            Ok(audio) => {
                self.apply(Trigger::StopRecording);
                let speech = self.speech.clone();
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = speech.transcribe(audio).await;
                    let _ = tx.send(SessionEvent::TranscriptionFinished(result));
                });
            }
            Err(e) => {
                warn!("Recording produced no audio: {}", e);
                self.apply(Trigger::Halt);
                self.after_recording().await;
            }
        }
    }

    async fn on_transcription_finished(&mut self, result: Result<String, VoxError>) {
        if self.state != State::Transcribing {
            debug!("Ignoring transcription result while {}", self.state);
            return;
        }

        match result {
            Ok(text) => self.set_draft(text),
            Err(e) => warn!("Transcription failed: {}", e),
        }
        self.apply(Trigger::TranscriptionDone);
        self.after_recording().await;
    }

    async fn after_recording(&mut self) {
        if self.continuous {
            self.schedule(Followup::RestartRecording, self.timing.record_restart_delay_ms);
        } else {
            self.recorder.release().await;
        }
    }

    async fn submit(&mut self, text: &str, origin: Origin) {
        let text = text.trim();
        if text.is_empty() {
            debug!("Ignoring empty submission");
            return;
        }
        if self.state.is_loading() || self.state.is_speaking() {
            debug!("Submission ignored while {}", self.state);
            if origin == Origin::Typed {
                self.set_draft(text.to_string());
                self.notice(format!("Busy ({}), message kept in draft", self.state));
            }
            return;
        }
        let text = text.to_string();

        self.scheduled = None;
        self.halt_input().await;
        if !self.apply(Trigger::Submit) {
            return;
        }

        let message = self.conversation.push_user(&text);
        self.publish(SessionUpdate::Message(message));
        self.set_draft(String::new());

        let history = self.conversation.wire_messages();
        let chat = self.chat.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = chat.complete(history).await;
            let _ = tx.send(SessionEvent::ChatFinished { origin, result });
        });
    }

    async fn on_chat_finished(&mut self, origin: Origin, result: Result<String, VoxError>) {
        if self.state != State::Submitting {
            debug!("Ignoring chat result while {}", self.state);
            return;
        }

        let reply = match result {
            Ok(content) => {
                let message = self.conversation.push_assistant(&content);
                self.publish(SessionUpdate::Message(message));
                content
            }
            Err(e) => {
                warn!("Chat request failed: {}", e);
                let text = origin.error_message();
                let message = self.conversation.push_error(text);
                self.publish(SessionUpdate::Message(message));
                text.to_string()
            }
        };

        if self.continuous {
            self.speak(reply).await;
        } else {
            self.apply(Trigger::ChatDone);
        }
    }

    async fn replay(&mut self, n: usize) {
        let content = match self.conversation.assistant_reply(n) {
            Some(message) => message.content.clone(),
            None => {
                self.notice(format!("No assistant reply #{}", n));
                return;
            }
        };
        if self.state.is_loading() || self.state.is_speaking() {
            self.notice(format!("Replay ignored while {}", self.state));
            return;
        }
        self.speak(content).await;
    }

    async fn speak(&mut self, text: String) {
        self.scheduled = None;
        self.halt_input().await;
        if !self.apply(Trigger::Speak) {
            return;
        }

        self.playback_run += 1;
        let run = self.playback_run;
        let speech = self.speech.clone();
        let sink = self.sink.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = match speech.synthesize(&text).await {
                Ok(audio) => sink.play(audio).await,
                Err(e) => Err(e),
            };
            let _ = tx.send(SessionEvent::PlaybackFinished { run, result });
        });
    }

    fn on_playback_finished(&mut self, run: u64, result: Result<(), VoxError>) {
        if run != self.playback_run || self.state != State::Speaking {
            debug!("Ignoring stale playback completion {}", run);
            return;
        }
        if let Err(e) = result {
            warn!("Playback failed: {}", e);
        }
        self.apply(Trigger::PlaybackDone);
        self.schedule_resume_listening();
    }
}

/// Accepts control connections off the event loop and forwards their commands.
pub fn spawn_socket_listener(
    server: SocketServer,
    tx: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut stream = match server.accept().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Socket accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let tx = tx.clone();
            tokio::spawn(async move {
                let cmd = match read_command(&mut stream).await {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        debug!("Rejected socket connection: {}", e);
                        return;
                    }
                };
                let (reply_tx, reply_rx) = oneshot::channel();
                if tx.send(SessionEvent::Remote { cmd, reply: reply_tx }).is_err() {
                    return;
                }
                let response = reply_rx
                    .await
                    .unwrap_or_else(|_| "error: session ended".to_string());
                let _ = stream.write_all(format!("{}\n", response).as_bytes()).await;
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Role, WireMessage};
    use async_trait::async_trait;
    use crate::socket::send_command_to;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct FakeChat {
        calls: Mutex<Vec<Vec<WireMessage>>>,
        fail: bool,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl ChatBackend for FakeChat {
        async fn complete(&self, messages: Vec<WireMessage>) -> Result<String, VoxError> {
            self.calls.lock().unwrap().push(messages);
            if let Some(ref gate) = self.gate {
                let _permit = gate.acquire().await.unwrap();
            }
            if self.fail {
                Err(VoxError::Chat("HTTP 500".to_string()))
            } else {
                Ok("Turn left.".to_string())
            }
        }
    }

    #[derive(Default)]
    struct FakeSpeech {
        transcribed: AtomicUsize,
        synthesized: Mutex<Vec<String>>,
        fail_transcription: bool,
        fail_synthesis: bool,
    }

    #[async_trait]
    impl SpeechBackend for FakeSpeech {
        async fn transcribe(&self, _audio: Vec<u8>) -> Result<String, VoxError> {
            self.transcribed.fetch_add(1, Ordering::SeqCst);
            if self.fail_transcription {
                Err(VoxError::Transcription("HTTP 502".to_string()))
            } else {
                Ok("arms up".to_string())
            }
        }

        async fn synthesize(&self, text: &str) -> Result<Vec<u8>, VoxError> {
            self.synthesized.lock().unwrap().push(text.to_string());
            if self.fail_synthesis {
                Err(VoxError::Synthesis("HTTP 503".to_string()))
            } else {
                Ok(vec![1, 2, 3])
            }
        }
    }

    #[derive(Default)]
    struct FakeSink {
        played: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl AudioSink for FakeSink {
        async fn play(&self, _audio: Vec<u8>) -> Result<(), VoxError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(VoxError::Playback("device lost".to_string()));
            }
            self.played.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecognizerLog {
        starts: AtomicUsize,
        stops: AtomicUsize,
        sink: Mutex<Option<RecognitionSink>>,
    }

    impl RecognizerLog {
        fn emit(&self, event: RecognitionEvent) {
            self.sink.lock().unwrap().as_ref().unwrap().emit(event);
        }
    }

    struct FakeRecognizer {
        log: Arc<RecognizerLog>,
        active: bool,
    }

    #[async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        async fn start(&mut self, sink: RecognitionSink) -> Result<()> {
            self.log.starts.fetch_add(1, Ordering::SeqCst);
            *self.log.sink.lock().unwrap() = Some(sink);
            self.active = true;
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            if self.active {
                self.log.stops.fetch_add(1, Ordering::SeqCst);
                self.active = false;
            }
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    #[derive(Default)]
    struct RecorderLog {
        starts: AtomicUsize,
        releases: AtomicUsize,
        fail_start: AtomicBool,
    }

    struct FakeRecorder {
        log: Arc<RecorderLog>,
        held: bool,
        segment: bool,
    }

    #[async_trait]
    impl Recorder for FakeRecorder {
        async fn start(&mut self) -> Result<()> {
            self.log.starts.fetch_add(1, Ordering::SeqCst);
            if self.log.fail_start.load(Ordering::SeqCst) {
                anyhow::bail!("microphone busy");
            }
            self.held = true;
            self.segment = true;
            Ok(())
        }

        async fn stop(&mut self) -> Result<Vec<u8>> {
            if !self.segment {
                anyhow::bail!("no segment");
            }
            self.segment = false;
            Ok(vec![0; 64])
        }

        async fn release(&mut self) {
            if self.held {
                self.log.releases.fetch_add(1, Ordering::SeqCst);
            }
            self.held = false;
            self.segment = false;
        }

        fn holds_stream(&self) -> bool {
            self.held
        }
    }

    struct Harness {
        session: Session,
        chat: Arc<FakeChat>,
        speech: Arc<FakeSpeech>,
        sink: Arc<FakeSink>,
        recognizer: Arc<RecognizerLog>,
        recorder: Arc<RecorderLog>,
    }

    fn harness_with(chat: FakeChat, speech: FakeSpeech, with_recognizer: bool) -> Harness {
        let chat = Arc::new(chat);
        let speech = Arc::new(speech);
        let sink = Arc::new(FakeSink::default());
        let recognizer = Arc::new(RecognizerLog::default());
        let recorder = Arc::new(RecorderLog::default());

        let parts = SessionParts {
            chat: chat.clone(),
            speech: speech.clone(),
            sink: sink.clone(),
            recognizer: if with_recognizer {
                Some(Box::new(FakeRecognizer {
                    log: recognizer.clone(),
                    active: false,
                }))
            } else {
                None
            },
            recorder: Box::new(FakeRecorder {
                log: recorder.clone(),
                held: false,
                segment: false,
            }),
        };

        Harness {
            session: Session::new(&Config::default(), parts),
            chat,
            speech,
            sink,
            recognizer,
            recorder,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeChat::default(), FakeSpeech::default(), true)
    }

    impl Harness {
        async fn send(&mut self, cmd: Command) {
            self.session.handle(SessionEvent::Command(cmd)).await;
        }

        /// Steps the session until `done` holds.
        async fn pump_until(&mut self, done: impl Fn(&Harness) -> bool) {
            for _ in 0..100 {
                if done(self) {
                    return;
                }
                tokio::time::timeout(Duration::from_secs(60), self.session.step())
                    .await
                    .expect("session stalled");
            }
            panic!("condition not reached");
        }

        /// True when no further event arrives within a minute.
        async fn is_quiet(&mut self) -> bool {
            tokio::time::timeout(Duration::from_secs(60), self.session.next_event())
                .await
                .is_err()
        }

        fn chat_calls(&self) -> usize {
            self.chat.calls.lock().unwrap().len()
        }

        fn recognizer_starts(&self) -> usize {
            self.recognizer.starts.load(Ordering::SeqCst)
        }
    }

    fn roles(session: &Session) -> Vec<Role> {
        session
            .conversation()
            .messages()
            .iter()
            .map(|m| m.role)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_round_trip() {
        let mut h = harness();
        h.session.draft = "hello".to_string();

        h.send(Command::Submit("hello".to_string())).await;
        assert_eq!(h.session.state(), State::Submitting);
        assert_eq!(h.session.draft(), "");
        assert_eq!(h.session.conversation().len(), 2);

        h.pump_until(|h| h.session.state() == State::Idle).await;

        assert_eq!(roles(&h.session), vec![Role::System, Role::User, Role::Assistant]);
        let visible = h.session.conversation().visible();
        assert_eq!(visible[0].content, "hello");
        assert_eq!(visible[1].content, "Turn left.");

        let calls = h.chat.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 2);
        assert_eq!(calls[0][0].role, Role::System);
        assert_eq!(calls[0][1].content, "hello");
        drop(calls);

        // Not continuous: nothing spoken, nothing resumed
        assert!(h.is_quiet().await);
        assert!(h.speech.synthesized.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_includes_prior_turns() {
        let mut h = harness();
        h.send(Command::Submit("first".to_string())).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;
        h.send(Command::Submit("second".to_string())).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;

        let calls = h.chat.calls.lock().unwrap();
        let contents: Vec<&str> = calls[1].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents.len(), 4);
        assert_eq!(&contents[1..], &["first", "Turn left.", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_submission_is_noop() {
        let mut h = harness();
        h.send(Command::Submit("   \t".to_string())).await;
        h.send(Command::SubmitDraft).await;

        assert_eq!(h.session.state(), State::Idle);
        assert_eq!(h.session.conversation().len(), 1);
        assert!(h.is_quiet().await);
        assert_eq!(h.chat_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_in_flight_rejects_another() {
        let gate = Arc::new(Semaphore::new(0));
        let chat = FakeChat {
            gate: Some(gate.clone()),
            ..FakeChat::default()
        };
        let mut h = harness_with(chat, FakeSpeech::default(), true);

        h.send(Command::Submit("one".to_string())).await;
        h.send(Command::Submit("two".to_string())).await;
        assert_eq!(h.session.conversation().len(), 2);

        gate.add_permits(1);
        h.pump_until(|h| h.session.state() == State::Idle).await;

        assert_eq!(h.chat_calls(), 1);
        assert_eq!(roles(&h.session), vec![Role::System, Role::User, Role::Assistant]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typed_failure_appends_one_error() {
        let chat = FakeChat {
            fail: true,
            ..FakeChat::default()
        };
        let mut h = harness_with(chat, FakeSpeech::default(), true);

        h.send(Command::Submit("hello".to_string())).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;

        let visible = h.session.conversation().visible();
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[1].role, Role::Assistant);
        assert_eq!(visible[1].content, "Sorry, I encountered an error.");
        assert!(visible[1].id.starts_with("error-"));
        assert!(h.speech.synthesized.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_voice_round_trip() {
        let mut h = harness();

        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Listening).await;
        assert_eq!(h.recognizer_starts(), 1);

        h.recognizer.emit(RecognitionEvent::Transcript {
            text: "move".to_string(),
            is_final: false,
        });
        h.pump_until(|h| h.session.draft() == "move").await;
        assert_eq!(h.chat_calls(), 0);

        h.recognizer.emit(RecognitionEvent::Transcript {
            text: "  move slowly ".to_string(),
            is_final: true,
        });
        h.pump_until(|h| h.session.draft() == "move slowly").await;
        assert_eq!(h.session.state(), State::Idle);
        assert_eq!(h.recognizer.stops.load(Ordering::SeqCst), 1);
        assert_eq!(h.chat_calls(), 0);

        h.pump_until(|h| h.session.state() == State::Speaking).await;
        {
            let calls = h.chat.calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].last().unwrap().content, "move slowly");
        }
        assert_eq!(h.session.draft(), "");

        h.pump_until(|h| h.recognizer_starts() == 2).await;
        assert_eq!(
            h.speech.synthesized.lock().unwrap().as_slice(),
            &["Turn left.".to_string()]
        );
        assert_eq!(h.sink.played.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.state(), State::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_voice_failure_is_spoken() {
        let chat = FakeChat {
            fail: true,
            ..FakeChat::default()
        };
        let mut h = harness_with(chat, FakeSpeech::default(), true);

        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Listening).await;
        h.recognizer.emit(RecognitionEvent::Transcript {
            text: "jump".to_string(),
            is_final: true,
        });
        h.pump_until(|h| h.session.state() == State::Speaking).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;

        let visible = h.session.conversation().visible();
        assert_eq!(visible.len(), 2);
        assert_eq!(
            visible[1].content,
            "Sorry, I encountered an error. Please try again."
        );
        assert_eq!(
            h.speech.synthesized.lock().unwrap().as_slice(),
            &["Sorry, I encountered an error. Please try again.".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_halts_listening_first() {
        let mut h = harness();
        h.send(Command::Submit("hello".to_string())).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;

        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Listening).await;

        let mut updates = h.session.subscribe();
        h.send(Command::Replay(1)).await;
        assert_eq!(h.session.state(), State::Speaking);
        assert_eq!(h.recognizer.stops.load(Ordering::SeqCst), 1);

        let mut states = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if let SessionUpdate::State(state) = update {
                states.push(state);
            }
        }
        assert_eq!(states, vec![State::Idle, State::Speaking]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_halts_recording_first() {
        let mut h = harness_with(FakeChat::default(), FakeSpeech::default(), false);
        h.send(Command::Submit("hello".to_string())).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;

        h.send(Command::StartRecording).await;
        assert_eq!(h.session.state(), State::Recording);

        let mut updates = h.session.subscribe();
        h.send(Command::Replay(1)).await;
        assert_eq!(h.recorder.releases.load(Ordering::SeqCst), 1);

        let mut states = Vec::new();
        while let Ok(update) = updates.try_recv() {
            if let SessionUpdate::State(state) = update {
                states.push(state);
            }
        }
        assert_eq!(states, vec![State::Idle, State::Speaking]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_playback_resumes_listening_once() {
        let mut h = harness();
        h.send(Command::Submit("hello".to_string())).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;

        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Listening).await;
        h.send(Command::Replay(1)).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;

        assert!(matches!(
            h.session.scheduled,
            Some((_, Followup::ResumeListening))
        ));
        h.pump_until(|h| h.session.state() == State::Listening).await;
        assert_eq!(h.recognizer_starts(), 2);
        assert!(h.is_quiet().await);
        assert_eq!(h.recognizer_starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_continuous_playback_resumes_nothing() {
        let mut h = harness();
        h.send(Command::Submit("hello".to_string())).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;

        h.send(Command::Replay(1)).await;
        assert_eq!(h.session.state(), State::Speaking);
        h.pump_until(|h| h.session.state() == State::Idle).await;

        assert!(h.session.scheduled.is_none());
        assert!(h.is_quiet().await);
        assert_eq!(h.recognizer_starts(), 0);
        assert_eq!(h.sink.played.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_rejected_while_busy_or_missing() {
        let gate = Arc::new(Semaphore::new(0));
        let chat = FakeChat {
            gate: Some(gate.clone()),
            ..FakeChat::default()
        };
        let mut h = harness_with(chat, FakeSpeech::default(), true);

        h.send(Command::Replay(1)).await;
        assert_eq!(h.session.state(), State::Idle);

        gate.add_permits(1);
        h.send(Command::Submit("hello".to_string())).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;

        h.send(Command::Submit("again".to_string())).await;
        h.send(Command::Replay(1)).await;
        assert_eq!(h.session.state(), State::Submitting);
        assert!(h.speech.synthesized.lock().unwrap().is_empty());
        gate.add_permits(1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognition_error_returns_to_idle_and_retries() {
        let mut h = harness();
        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Listening).await;

        h.recognizer
            .emit(RecognitionEvent::Error("no-speech".to_string()));
        h.recognizer.emit(RecognitionEvent::Ended);
        h.session.step().await;
        assert_eq!(h.session.state(), State::Idle);

        // The trailing Ended belongs to the stopped run and changes nothing.
        h.session.step().await;
        assert_eq!(h.session.state(), State::Idle);

        h.pump_until(|h| h.session.state() == State::Listening).await;
        assert_eq!(h.recognizer_starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_recognition_events_are_ignored() {
        let mut h = harness();
        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Listening).await;

        let stale = h.recognizer.sink.lock().unwrap().clone().unwrap();
        h.send(Command::ToggleContinuous).await;
        assert_eq!(h.session.state(), State::Idle);

        stale.emit(RecognitionEvent::Transcript {
            text: "late words".to_string(),
            is_final: true,
        });
        h.session.step().await;
        assert_eq!(h.session.draft(), "");
        assert!(h.is_quiet().await);
        assert_eq!(h.chat_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_fills_draft() {
        let mut h = harness();
        h.send(Command::StartRecording).await;
        assert_eq!(h.session.state(), State::Recording);

        h.send(Command::StopRecording).await;
        assert_eq!(h.session.state(), State::Transcribing);
        h.pump_until(|h| h.session.state() == State::Idle).await;

        assert_eq!(h.session.draft(), "arms up");
        assert_eq!(h.recorder.releases.load(Ordering::SeqCst), 1);
        assert_eq!(h.chat_calls(), 0);

        h.send(Command::SubmitDraft).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;
        assert_eq!(h.session.conversation().visible()[0].content, "arms up");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcription_failure_is_swallowed() {
        let speech = FakeSpeech {
            fail_transcription: true,
            ..FakeSpeech::default()
        };
        let mut h = harness_with(FakeChat::default(), speech, true);
        h.session.draft = "typed".to_string();

        h.send(Command::StartRecording).await;
        h.send(Command::StopRecording).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;

        assert_eq!(h.session.draft(), "typed");
        assert_eq!(h.session.conversation().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_while_listening_stops_recognition() {
        let mut h = harness();
        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Listening).await;

        h.send(Command::StartRecording).await;
        assert_eq!(h.session.state(), State::Recording);
        assert_eq!(h.recognizer.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_recording_restarts_segments() {
        let mut h = harness_with(FakeChat::default(), FakeSpeech::default(), false);
        h.send(Command::ToggleContinuous).await;
        assert!(h.is_quiet().await);
        assert_eq!(h.session.state(), State::Idle);

        h.send(Command::StartRecording).await;
        // The segment ends itself after the maximum length.
        h.pump_until(|h| h.session.state() == State::Transcribing).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;
        assert_eq!(h.session.draft(), "arms up");
        assert_eq!(h.recorder.releases.load(Ordering::SeqCst), 0);

        h.pump_until(|h| h.session.state() == State::Recording).await;
        assert_eq!(h.recorder.starts.load(Ordering::SeqCst), 2);

        h.send(Command::ToggleContinuous).await;
        assert_eq!(h.session.state(), State::Recording);
        h.send(Command::StopRecording).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;
        assert_eq!(h.recorder.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_typed_submission_stays_in_draft() {
        let mut h = harness();
        h.send(Command::Submit("hello".to_string())).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;

        h.send(Command::Replay(1)).await;
        assert_eq!(h.session.state(), State::Speaking);
        h.send(Command::Submit("turn around".to_string())).await;
        assert_eq!(h.session.draft(), "turn around");
        assert_eq!(h.session.conversation().len(), 3);

        h.pump_until(|h| h.session.state() == State::Idle).await;
        h.send(Command::SubmitDraft).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;
        assert_eq!(h.chat_calls(), 2);
        assert_eq!(h.session.conversation().visible()[2].content, "turn around");
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_toggle_keeps_auto_submit() {
        let mut h = harness();
        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Listening).await;
        h.recognizer.emit(RecognitionEvent::Transcript {
            text: "move slowly".to_string(),
            is_final: true,
        });
        h.pump_until(|h| h.session.draft() == "move slowly").await;

        h.send(Command::ToggleContinuous).await;
        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Speaking).await;
        {
            let calls = h.chat.calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].last().unwrap().content, "move slowly");
        }

        h.pump_until(|h| h.session.state() == State::Listening).await;
        assert_eq!(h.recognizer_starts(), 2);
        assert!(h.is_quiet().await);
        assert_eq!(h.recognizer_starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_continuous_still_sends_auto_submit() {
        let mut h = harness();
        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Listening).await;
        h.recognizer.emit(RecognitionEvent::Transcript {
            text: "move slowly".to_string(),
            is_final: true,
        });
        h.pump_until(|h| h.session.draft() == "move slowly").await;

        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Submitting).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;

        {
            let calls = h.chat.calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].last().unwrap().content, "move slowly");
        }
        assert!(h.is_quiet().await);
        assert!(h.speech.synthesized.lock().unwrap().is_empty());
        assert_eq!(h.recognizer_starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_transcript_outside_continuous_is_ignored() {
        let mut h = harness();
        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Listening).await;

        // Recognition left running after the mode flag dropped.
        h.session.continuous = false;
        h.recognizer.emit(RecognitionEvent::Transcript {
            text: "move slowly".to_string(),
            is_final: true,
        });
        h.session.step().await;

        assert_eq!(h.session.draft(), "");
        assert_eq!(h.session.state(), State::Listening);
        assert!(h.session.scheduled.is_none());
        assert!(h.is_quiet().await);
        assert_eq!(h.chat_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_failure_resumes_listening_once() {
        let speech = FakeSpeech {
            fail_synthesis: true,
            ..FakeSpeech::default()
        };
        let mut h = harness_with(FakeChat::default(), speech, true);
        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Listening).await;

        h.send(Command::Submit("hello".to_string())).await;
        h.pump_until(|h| h.session.state() == State::Speaking).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;
        assert_eq!(h.sink.played.load(Ordering::SeqCst), 0);
        assert_eq!(h.session.conversation().len(), 3);

        h.pump_until(|h| h.session.state() == State::Listening).await;
        assert!(h.is_quiet().await);
        assert_eq!(h.recognizer_starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_failure_resumes_listening_once() {
        let mut h = harness();
        h.sink.fail.store(true, Ordering::SeqCst);
        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Listening).await;

        h.send(Command::Submit("hello".to_string())).await;
        h.pump_until(|h| h.session.state() == State::Speaking).await;
        h.pump_until(|h| h.session.state() == State::Idle).await;
        assert_eq!(h.speech.synthesized.lock().unwrap().len(), 1);
        assert_eq!(h.sink.played.load(Ordering::SeqCst), 0);

        h.pump_until(|h| h.session.state() == State::Listening).await;
        assert!(h.is_quiet().await);
        assert_eq!(h.recognizer_starts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recorder_start_failure_is_swallowed() {
        let mut h = harness();
        h.recorder.fail_start.store(true, Ordering::SeqCst);

        h.send(Command::StartRecording).await;
        assert_eq!(h.session.state(), State::Idle);
        assert!(h.is_quiet().await);
        assert_eq!(h.recorder.starts.load(Ordering::SeqCst), 1);

        // In continuous mode the failed attempt falls back to listening.
        h.send(Command::ToggleContinuous).await;
        h.pump_until(|h| h.session.state() == State::Listening).await;
        h.send(Command::StartRecording).await;
        assert_eq!(h.session.state(), State::Idle);
        h.pump_until(|h| h.session.state() == State::Listening).await;
        assert_eq!(h.recognizer_starts(), 2);
    }

    #[tokio::test]
    async fn test_socket_commands_reach_the_session() {
        let mut h = harness();
        let temp_dir = tempfile::TempDir::new().unwrap();
        let sock_path = temp_dir.path().join("session.sock");
        let server = SocketServer::bind_at(sock_path.clone()).unwrap();
        let listener = spawn_socket_listener(server, h.session.events());

        let client = tokio::spawn(async move { send_command_to(&sock_path, "record").await });
        h.pump_until(|h| h.session.state() == State::Recording).await;
        assert_eq!(client.await.unwrap().unwrap(), "ok: recording");

        listener.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_quit_ends_session() {
        let mut h = harness();
        assert!(!h.session.handle(SessionEvent::Command(Command::Quit)).await);
    }

    #[test]
    fn test_error_messages_by_origin() {
        assert_eq!(Origin::Typed.error_message(), "Sorry, I encountered an error.");
        assert_eq!(
            Origin::Voice.error_message(),
            "Sorry, I encountered an error. Please try again."
        );
    }
}
