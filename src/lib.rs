pub mod api;
pub mod audio;
pub mod command;
pub mod config;
pub mod conversation;
pub mod error;
pub mod machine;
pub mod microphone;
pub mod playback;
pub mod recognition;
pub mod recording;
pub mod session;
pub mod socket;
pub mod ui;

#[cfg(feature = "local-recognition")]
pub mod transcription;

pub use config::Config;
pub use error::VoxError;
pub use session::{Session, SessionParts};
