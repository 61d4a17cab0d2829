use thiserror::Error;

use crate::machine::{State, Trigger};
use crate::microphone::MicUser;

#[derive(Error, Debug)]
pub enum VoxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chat error: {0}")]
    Chat(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Speech synthesis error: {0}")]
    Synthesis(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Speech recognition error: {0}")]
    Recognition(String),

    #[error("Model download error: {0}")]
    ModelDownload(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Microphone is held by the {holder}")]
    MicrophoneBusy { holder: MicUser },

    #[error("Invalid transition: {trigger} while {from}")]
    InvalidTransition { from: State, trigger: Trigger },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
