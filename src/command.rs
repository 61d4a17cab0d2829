use anyhow::Result;

/// User intent, from the terminal or the control socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Submit(String),
    /// Submit whatever transcription left in the draft.
    SubmitDraft,
    ToggleContinuous,
    StartRecording,
    StopRecording,
    /// Speak the n-th (1-based) assistant reply again.
    Replay(usize),
    Status,
    Quit,
}

/// Parses one line of terminal input. Slash-prefixed lines are commands.
pub fn parse_input(line: &str) -> Result<Command> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::SubmitDraft);
    }
    match line.strip_prefix('/') {
        Some(word) => parse_word(word),
        None => Ok(Command::Submit(line.to_string())),
    }
}

/// Parses a bare command word such as `listen` or `replay 2`.
pub fn parse_word(input: &str) -> Result<Command> {
    let mut parts = input.split_whitespace();
    let word = parts.next().unwrap_or_default();

    let cmd = match word {
        "listen" | "toggle" => Command::ToggleContinuous,
        "record" => Command::StartRecording,
        "stop" => Command::StopRecording,
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        "replay" => {
            let n = parts
                .next()
                .ok_or_else(|| anyhow::anyhow!("replay needs a reply number"))?
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("invalid reply number: {}", e))?;
            Command::Replay(n)
        }
        other => return Err(anyhow::anyhow!("Unknown command: {}", other)),
    };

    if let Some(extra) = parts.next() {
        return Err(anyhow::anyhow!("Unexpected argument: {}", extra));
    }

    Ok(cmd)
}
