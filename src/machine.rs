use crate::error::VoxError;

/// Mutually exclusive interaction modes of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Idle,
    Listening,
    Recording,
    Transcribing,
    Submitting,
    Speaking,
}

impl State {
    pub fn is_listening(self) -> bool {
        self == State::Listening
    }

    pub fn is_recording(self) -> bool {
        self == State::Recording
    }

    /// True while a network request is outstanding on behalf of the user.
    pub fn is_loading(self) -> bool {
        matches!(self, State::Transcribing | State::Submitting)
    }

    pub fn is_speaking(self) -> bool {
        self == State::Speaking
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Idle => write!(f, "idle"),
            State::Listening => write!(f, "listening"),
            State::Recording => write!(f, "recording"),
            State::Transcribing => write!(f, "transcribing"),
            State::Submitting => write!(f, "submitting"),
            State::Speaking => write!(f, "speaking"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    StartListening,
    FinalTranscript,
    RecognitionEnded,
    StopListening,
    StartRecording,
    StopRecording,
    Halt,
    TranscriptionDone,
    Submit,
    ChatDone,
    Speak,
    PlaybackDone,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Trigger::StartListening => "start listening",
            Trigger::FinalTranscript => "final transcript",
            Trigger::RecognitionEnded => "recognition ended",
            Trigger::StopListening => "stop listening",
            Trigger::StartRecording => "start recording",
            Trigger::StopRecording => "stop recording",
            Trigger::Halt => "halt",
            Trigger::TranscriptionDone => "transcription done",
            Trigger::Submit => "submit",
            Trigger::ChatDone => "chat done",
            Trigger::Speak => "speak",
            Trigger::PlaybackDone => "playback done",
        };
        f.write_str(name)
    }
}

/// The single transition function of the interaction loop.
pub fn transition(from: State, trigger: Trigger) -> Result<State, VoxError> {
    use State::*;
    use Trigger::*;

    let to = match (from, trigger) {
        (Idle, StartListening) => Listening,
        (Listening, FinalTranscript | RecognitionEnded | StopListening) => Idle,
        (Idle | Listening | Recording, StartRecording) => Recording,
        (Recording, StopRecording) => Transcribing,
        (Recording, Halt) => Idle,
        (Transcribing, TranscriptionDone) => Idle,
        (Idle | Listening | Recording, Submit) => Submitting,
        (Submitting, ChatDone) => Idle,
        (Idle | Listening | Recording | Submitting, Speak) => Speaking,
        (Speaking, PlaybackDone) => Idle,
        _ => return Err(VoxError::InvalidTransition { from, trigger }),
    };

    Ok(to)
}
