use chrono::Local;
use std::io::Write;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::UiConfig;
use crate::conversation::{Message, Role};
use crate::session::SessionUpdate;

/// Turns session updates into terminal lines.
#[derive(Clone)]
pub struct Renderer {
    config: UiConfig,
}

impl Renderer {
    pub fn new(config: &UiConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Returns the line to print for an update, if any.
    pub fn render(&self, update: &SessionUpdate) -> Option<String> {
        match update {
            SessionUpdate::Message(msg) => self.format_message(msg),
            SessionUpdate::Draft(text) => {
                if !self.config.show_interim || text.is_empty() {
                    return None;
                }
                Some(format!("  ... {}", text))
            }
            SessionUpdate::State(state) => Some(format!("[{}]", state)),
            SessionUpdate::Continuous(on) => Some(format!(
                "[continuous mode {}]",
                if *on { "on" } else { "off" }
            )),
            SessionUpdate::Notice(text) => Some(format!("* {}", text)),
        }
    }

    pub fn format_message(&self, msg: &Message) -> Option<String> {
        let label = match msg.role {
            // The directive is never shown.
            Role::System => return None,
            Role::User => "you",
            Role::Assistant => "director",
        };

        let mut line = String::new();
        if self.config.show_timestamps {
            if let Some(ts) = msg.timestamp {
                line.push_str(&ts.with_timezone(&Local).format("%H:%M:%S ").to_string());
            }
        }
        if msg.is_floating {
            line.push_str("  ");
        }
        line.push_str(label);
        line.push_str("> ");
        line.push_str(&msg.content);
        Some(line)
    }
}

/// Prints updates until the session goes away.
pub async fn render_updates(renderer: Renderer, mut updates: broadcast::Receiver<SessionUpdate>) {
    loop {
        match updates.recv().await {
            Ok(update) => {
                if let Some(line) = renderer.render(&update) {
                    let mut out = std::io::stdout().lock();
                    let _ = writeln!(out, "{}", line);
                    let _ = out.flush();
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Renderer fell behind, skipped {} updates", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Renderer stopped");
}
