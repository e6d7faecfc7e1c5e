//! Daemon module - main event loop orchestration
//!
//! Builds the voice session from the desktop pieces and drives it from
//! Unix signals and stdin. Commands the session recognizes are printed to
//! stdout, one per line, for whatever is consuming them.

use crate::audio::CpalEngineFactory;
use crate::command::Command;
use crate::config::Config;
use crate::error::{Result, SessionError, VoxnavError};
use crate::recognize;
use crate::route::{CpalRouteProbe, DesktopAudioSession, RouteProbe};
use crate::session::{SessionHandlers, SessionParts, VoiceSession};
use crate::speech;
use crate::state::{SessionSnapshot, StatusReport};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Write state to file for external integrations (e.g., Waybar)
fn write_state_file(path: &PathBuf, snapshot: &SessionSnapshot) {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Failed to create state file directory: {}", e);
            return;
        }
    }

    let contents = match serde_json::to_string(&StatusReport::from(snapshot)) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("Failed to serialize state: {}", e);
            return;
        }
    };

    if let Err(e) = std::fs::write(path, contents) {
        tracing::warn!("Failed to write state file: {}", e);
    } else {
        tracing::trace!("State file updated: {}", snapshot.state.as_str());
    }
}

/// Remove a runtime file on shutdown
fn cleanup_file(path: &PathBuf) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

/// Write PID file for external control via signals
fn write_pid_file() -> Option<PathBuf> {
    let pid_path = Config::pid_file();

    if let Some(parent) = pid_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Failed to create PID file directory: {}", e);
            return None;
        }
    }

    let pid = std::process::id();
    if let Err(e) = std::fs::write(&pid_path, pid.to_string()) {
        tracing::warn!("Failed to write PID file: {}", e);
        return None;
    }

    tracing::debug!("PID file written: {:?} (pid={})", pid_path, pid);
    Some(pid_path)
}

/// A line typed on stdin
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    Say(String),
    Listen,
    Stop,
    Hush,
    Status,
    Quit,
}

/// Parse one stdin control line. Unknown input yields None.
pub fn parse_control_line(line: &str) -> Option<ControlLine> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    match word.to_lowercase().as_str() {
        "say" | "speak" if !rest.is_empty() => Some(ControlLine::Say(rest.to_string())),
        "listen" => Some(ControlLine::Listen),
        "stop" => Some(ControlLine::Stop),
        "hush" => Some(ControlLine::Hush),
        "status" => Some(ControlLine::Status),
        "quit" | "exit" => Some(ControlLine::Quit),
        _ => None,
    }
}

/// What the session reports back to the daemon loop
enum UiEvent {
    Command(Command),
    ForcedOff,
    Error(SessionError),
}

fn send_command(
    tx: &mpsc::UnboundedSender<UiEvent>,
    command: Command,
) -> impl FnMut() + Send + 'static {
    let tx = tx.clone();
    move || {
        let _ = tx.send(UiEvent::Command(command));
    }
}

/// Handlers that forward everything to the daemon loop
fn forwarding_handlers(tx: mpsc::UnboundedSender<UiEvent>) -> SessionHandlers {
    let forced = tx.clone();
    let errors = tx.clone();
    SessionHandlers::new()
        .on_next(send_command(&tx, Command::Next))
        .on_back(send_command(&tx, Command::Back))
        .on_repeat(send_command(&tx, Command::Repeat))
        .on_toggle(send_command(&tx, Command::Toggle))
        .on_forced_off(move || {
            let _ = forced.send(UiEvent::ForcedOff);
        })
        .on_error(move |e| {
            let _ = errors.send(UiEvent::Error(e.clone()));
        })
}

/// Main daemon that owns the voice session
pub struct Daemon {
    config: Config,
    state_file_path: Option<PathBuf>,
    pid_file_path: Option<PathBuf>,
    /// Last text spoken, replayed on "repeat"
    last_spoken: Option<String>,
}

impl Daemon {
    /// Create a new daemon with the given configuration
    pub fn new(config: Config) -> Self {
        let state_file_path = config.resolve_state_file();
        Self {
            config,
            state_file_path,
            pid_file_path: None,
            last_spoken: None,
        }
    }

    /// Build the desktop implementations of the session's platform pieces
    async fn build_parts(&self) -> Result<SessionParts> {
        let synthesizer = speech::create_synthesizer(&self.config.speech).await?;
        let recognizer =
            recognize::create_recognizer(&self.config.recognizer, self.config.audio.sample_rate);
        tracing::info!("Recognizer: {}", recognizer.name());

        let route_probe: Arc<dyn RouteProbe> = Arc::new(CpalRouteProbe::new());

        Ok(SessionParts {
            audio_session: Box::new(DesktopAudioSession::new()),
            engines: Box::new(CpalEngineFactory::new(&self.config.audio)),
            recognizer,
            synthesizer,
            route_probe: Some(route_probe),
        })
    }

    fn speak(&mut self, session: &VoiceSession, text: String) -> Result<()> {
        session.speak(text.clone())?;
        self.last_spoken = Some(text);
        Ok(())
    }

    fn on_ui_event(&mut self, session: &VoiceSession, event: UiEvent) -> Result<()> {
        match event {
            UiEvent::Command(command) => {
                println!("{}", command);
                if command == Command::Repeat {
                    if let Some(text) = self.last_spoken.clone() {
                        self.speak(session, text)?;
                    }
                }
            }
            UiEvent::ForcedOff => {
                tracing::info!("Audio device changed, say 'listen' to resume");
            }
            UiEvent::Error(e) => {
                tracing::error!("{}", e);
            }
        }
        Ok(())
    }

    /// Apply a stdin control line. Returns false when the daemon should exit.
    async fn on_control_line(&mut self, session: &VoiceSession, line: &str) -> Result<bool> {
        let Some(control) = parse_control_line(line) else {
            if !line.trim().is_empty() {
                tracing::warn!(
                    "Unknown input {:?} (try: say <text>, listen, stop, hush, status, quit)",
                    line.trim()
                );
            }
            return Ok(true);
        };

        match control {
            ControlLine::Say(text) => self.speak(session, text)?,
            ControlLine::Listen => session.start_listening()?,
            ControlLine::Stop => session.stop_listening()?,
            ControlLine::Hush => session.stop_speaking()?,
            ControlLine::Status => {
                let snapshot = session.snapshot().await?;
                println!(
                    "{} (authorization: {:?}, speaking: {})",
                    snapshot.state, snapshot.authorization, snapshot.speaking
                );
                if let Some(phrase) = snapshot.last_phrase {
                    println!("  last heard: {:?}", phrase);
                }
            }
            ControlLine::Quit => return Ok(false),
        }
        Ok(true)
    }

    /// Run the daemon main loop
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("Starting voxnav daemon");

        // Write PID file for external control via signals
        self.pid_file_path = write_pid_file();

        let mut sigusr1 = signal(SignalKind::user_defined1()).map_err(|e| {
            VoxnavError::Config(format!("Failed to set up SIGUSR1 handler: {}", e))
        })?;
        let mut sigusr2 = signal(SignalKind::user_defined2()).map_err(|e| {
            VoxnavError::Config(format!("Failed to set up SIGUSR2 handler: {}", e))
        })?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            VoxnavError::Config(format!("Failed to set up SIGTERM handler: {}", e))
        })?;

        if let Some(ref path) = self.state_file_path {
            tracing::info!("State file: {:?}", path);
        }
        if !self.config.recognizer.is_configured() {
            tracing::warn!("No recognizer configured; listening will be refused until [recognizer] command is set");
        }

        let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
        let parts = self.build_parts().await?;
        let session = VoiceSession::spawn(
            parts,
            &self.config.session,
            &self.config.speech,
            forwarding_handlers(ui_tx),
        );

        let mut snapshots = session.subscribe();
        if let Some(ref path) = self.state_file_path {
            write_state_file(path, &snapshots.borrow_and_update());
        }

        let mut stdin = Some(BufReader::new(tokio::io::stdin()).lines());

        tracing::info!("Ready (type 'listen' or run 'voxnav toggle')");

        loop {
            tokio::select! {
                Some(event) = ui_rx.recv() => {
                    self.on_ui_event(&session, event)?;
                }

                // Stdin is optional: under a service manager it is closed immediately
                line = async {
                    match &mut stdin {
                        Some(lines) => lines.next_line().await,
                        None => std::future::pending().await,
                    }
                } => match line {
                    Ok(Some(line)) => {
                        if !self.on_control_line(&session, &line).await? {
                            tracing::info!("Quit requested, shutting down...");
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("stdin closed, signals only");
                        stdin = None;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to read stdin: {}", e);
                        stdin = None;
                    }
                },

                changed = snapshots.changed() => {
                    if changed.is_err() {
                        tracing::warn!("Voice session ended unexpectedly");
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    if let Some(ref path) = self.state_file_path {
                        write_state_file(path, &snapshot);
                    }
                }

                // Handle SIGUSR1 - toggle listening (for compositor keybindings)
                _ = sigusr1.recv() => {
                    tracing::debug!("Received SIGUSR1 (toggle listening)");
                    session.start_listening()?;
                }

                // Handle SIGUSR2 - stop speaking
                _ = sigusr2.recv() => {
                    tracing::debug!("Received SIGUSR2 (stop speaking)");
                    session.stop_speaking()?;
                }

                // Handle graceful shutdown (SIGINT from Ctrl+C)
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received SIGINT, shutting down...");
                    break;
                }

                // Handle graceful shutdown (SIGTERM from systemctl stop)
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down...");
                    break;
                }
            }
        }

        if let Err(e) = session.shutdown().await {
            tracing::debug!("Session already stopped: {}", e);
        }

        if let Some(ref path) = self.state_file_path {
            cleanup_file(path);
        }
        if let Some(ref path) = self.pid_file_path {
            cleanup_file(path);
        }

        tracing::info!("Daemon stopped");

        Ok(())
    }
}
