use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::VoxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicUser {
    Recognizer,
    Recorder,
}

impl std::fmt::Display for MicUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MicUser::Recognizer => write!(f, "recognizer"),
            MicUser::Recorder => write!(f, "recorder"),
        }
    }
}

/// Arbiter for the single microphone. Recognition and recording never hold it at once.
#[derive(Clone, Default)]
pub struct Microphone {
    holder: Arc<Mutex<Option<MicUser>>>,
}

impl Microphone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, user: MicUser) -> Result<MicLease, VoxError> {
        let mut holder = self
            .holder
            .lock()
            .map_err(|_| VoxError::Audio("Microphone mutex poisoned".to_string()))?;

        if let Some(current) = *holder {
            return Err(VoxError::MicrophoneBusy { holder: current });
        }

        *holder = Some(user);
        debug!("Microphone acquired by {}", user);
        Ok(MicLease {
            mic: self.clone(),
            user,
        })
    }

    pub fn holder(&self) -> Option<MicUser> {
        self.holder.lock().ok().and_then(|h| *h)
    }
}

/// Exclusive hold on the microphone, released on drop.
pub struct MicLease {
    mic: Microphone,
    user: MicUser,
}

impl Drop for MicLease {
    fn drop(&mut self) {
        if let Ok(mut holder) = self.mic.holder.lock() {
            if *holder == Some(self.user) {
                *holder = None;
                debug!("Microphone released by {}", self.user);
            }
        }
    }
}
