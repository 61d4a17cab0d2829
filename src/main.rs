use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use voxstage::api::HttpApi;
use voxstage::command::{parse_input, Command};
use voxstage::config::Config;
use voxstage::microphone::Microphone;
use voxstage::playback::CpalPlayer;
use voxstage::recognition::SpeechRecognizer;
use voxstage::recording::MicRecorder;
use voxstage::session::{Session, SessionEvent, SessionParts};
use voxstage::socket::{self, SocketServer};
use voxstage::ui::{render_updates, Renderer};

#[derive(Parser)]
#[command(name = "voxstage")]
#[command(about = "Spoken conversation with a chat completion endpoint")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an interactive session (default)
    Run {
        /// Start with continuous voice mode on
        #[arg(long)]
        continuous: bool,
    },
    /// Toggle continuous mode of the running session
    Toggle,
    /// Show the running session's state
    Status,
    /// Stop the running session
    Stop,
}

fn main() -> Result<()> {
    // Logs go to stderr so they stay out of the conversation on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(|| dirs::config_dir().map(|d| d.join("voxstage/config.toml")))
        .ok_or_else(|| anyhow::anyhow!("Could not determine config path"))?;

    let command = cli.command.unwrap_or(Commands::Run { continuous: false });
    let rt = tokio::runtime::Runtime::new()?;

    match command {
        Commands::Run { continuous } => {
            rt.block_on(async {
                let mut config = Config::load(&config_path).await?;
                if continuous {
                    config.session.start_continuous = true;
                }
                run_session(config).await
            })?;
            // The stdin reader may still be parked in a blocking read.
            rt.shutdown_timeout(Duration::from_millis(200));
        }
        Commands::Toggle => rt.block_on(forward("toggle"))?,
        Commands::Status => rt.block_on(forward("status"))?,
        Commands::Stop => rt.block_on(forward("quit"))?,
    }

    Ok(())
}

async fn forward(word: &str) -> Result<()> {
    match socket::send_command(word).await {
        Ok(response) => {
            println!("{}", response);
            Ok(())
        }
        Err(e) => {
            println!("Session is not running");
            Err(e)
        }
    }
}

async fn run_session(config: Config) -> Result<()> {
    let api = Arc::new(HttpApi::new(&config.api)?);
    info!("Chat endpoint: {}", api.chat_url());
    info!("Speech endpoint: {}", api.speech_url());

    let mic = Microphone::new();
    let recognizer = build_recognizer(&config, mic.clone()).await;

    let parts = SessionParts {
        chat: api.clone(),
        speech: api,
        sink: Arc::new(CpalPlayer::new()),
        recognizer,
        recorder: Box::new(MicRecorder::new(&config.audio, mic)),
    };
    let session = Session::new(&config, parts);

    tokio::spawn(render_updates(
        Renderer::new(&config.ui),
        session.subscribe(),
    ));
    tokio::spawn(read_terminal(session.events()));

    let socket_server = match SocketServer::bind().await {
        Ok(server) => Some(server),
        Err(e) => {
            warn!("Failed to start socket server: {}", e);
            None
        }
    };

    println!("Type a message and press Enter. Commands: /listen /record /stop /replay N /status /quit");
    session.run(socket_server).await
}

#[cfg(feature = "local-recognition")]
async fn build_recognizer(config: &Config, mic: Microphone) -> Option<Box<dyn SpeechRecognizer>> {
    use voxstage::recognition::WhisperRecognizer;

    if !config.recognition.enabled {
        info!("Speech recognition disabled in config");
        return None;
    }

    let recognizer = match WhisperRecognizer::new(&config.recognition, &config.audio, mic) {
        Ok(recognizer) => recognizer,
        Err(e) => {
            warn!("Speech recognition unavailable: {}", e);
            return None;
        }
    };

    if let Err(e) = recognizer.prepare().await {
        warn!("Speech recognition unavailable: {}", e);
        return None;
    }

    Some(Box::new(recognizer))
}

#[cfg(not(feature = "local-recognition"))]
async fn build_recognizer(_config: &Config, _mic: Microphone) -> Option<Box<dyn SpeechRecognizer>> {
    info!("Built without local speech recognition");
    None
}

async fn read_terminal(tx: UnboundedSender<SessionEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let cmd = match lines.next_line().await {
            Ok(Some(line)) => match parse_input(&line) {
                Ok(cmd) => cmd,
                Err(e) => {
                    println!("* {}", e);
                    continue;
                }
            },
            // EOF ends the session like /quit
            Ok(None) => Command::Quit,
            Err(e) => {
                warn!("Failed to read terminal input: {}", e);
                Command::Quit
            }
        };

        let quit = cmd == Command::Quit;
        if tx.send(SessionEvent::Command(cmd)).is_err() || quit {
            break;
        }
    }
}
