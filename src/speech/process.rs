//! Child-process synthesizer (espeak-ng compatible)
//!
//! Each utterance runs in its own process with the text fed on stdin.
//! Cancelling kills the process, so an interrupted utterance never plays
//! to completion and is reported as cancelled rather than finished.
//!
//! Requires:
//! - espeak-ng (or a tool accepting the same -s/-p/-a/-v/--stdin flags)

use super::{SpeechSynthesizer, SynthesisEvent, Utterance, UtteranceId};
use crate::error::PlaybackError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// How long a voice list is trusted before it is read again
const VOICE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// The utterance currently owned by the synthesizer
struct ActiveUtterance {
    id: UtteranceId,
    cancel_tx: oneshot::Sender<()>,
}

/// Installed voices as last reported by the program
struct VoiceList {
    /// Lowercase voice names, languages and voice files
    names: RwLock<Vec<String>>,
    checked_at: Mutex<Instant>,
    refreshing: AtomicBool,
}

impl VoiceList {
    fn new(names: Vec<String>) -> Self {
        Self {
            names: RwLock::new(names),
            checked_at: Mutex::new(Instant::now()),
            refreshing: AtomicBool::new(false),
        }
    }

    fn contains(&self, voice: &str) -> bool {
        self.names
            .read()
            .map(|names| names.iter().any(|name| name == voice))
            .unwrap_or(false)
    }

    fn is_stale(&self, max_age: Duration) -> bool {
        self.checked_at
            .lock()
            .map(|checked_at| checked_at.elapsed() >= max_age)
            .unwrap_or(true)
    }

    fn replace(&self, names: Vec<String>) {
        if let Ok(mut current) = self.names.write() {
            *current = names;
        }
        if let Ok(mut checked_at) = self.checked_at.lock() {
            *checked_at = Instant::now();
        }
    }
}

/// Synthesizer that spawns one process per utterance
pub struct ProcessSynthesizer {
    program: PathBuf,
    voices: Arc<VoiceList>,
    refresh_interval: Duration,
    current: Option<ActiveUtterance>,
    events_tx: mpsc::UnboundedSender<SynthesisEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SynthesisEvent>>,
}

impl ProcessSynthesizer {
    /// Resolve the synthesizer program and read its voice list
    pub async fn new(program: &str) -> Result<Self, PlaybackError> {
        let program = which::which(program)
            .map_err(|_| PlaybackError::SynthesizerNotFound(program.to_string()))?;

        let voices = list_voices(&program).await.unwrap_or_default();
        tracing::debug!("Synthesizer {:?} reports {} voices", program, voices.len());

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            program,
            voices: Arc::new(VoiceList::new(voices)),
            refresh_interval: VOICE_REFRESH_INTERVAL,
            current: None,
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    /// How long a voice list is trusted before it is read again
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Re-read the voice list in the background. At most one refresh runs
    /// at a time; a failed listing keeps the previous list.
    fn spawn_refresh(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.voices.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }

        let program = self.program.clone();
        let voices = self.voices.clone();
        runtime.spawn(async move {
            if let Some(names) = list_voices(&program).await {
                tracing::trace!("Voice list refreshed ({} entries)", names.len());
                voices.replace(names);
            }
            voices.refreshing.store(false, Ordering::SeqCst);
        });
    }
}

impl SpeechSynthesizer for ProcessSynthesizer {
    fn speak(&mut self, utterance: Utterance) -> Result<(), PlaybackError> {
        self.stop();

        let mut child = Command::new(&self.program)
            .args(synthesizer_args(&utterance))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PlaybackError::SynthesisFailed(format!("failed to start {:?}: {}", self.program, e))
            })?;

        let stdin = child.stdin.take();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let events = self.events_tx.clone();
        let id = utterance.id;
        let text = utterance.text;

        tokio::spawn(async move {
            let event = run_utterance(child, stdin, text, id, cancel_rx).await;
            let _ = events.send(event);
        });

        tracing::debug!("Speaking utterance {}", id);
        self.current = Some(ActiveUtterance { id, cancel_tx });
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(active) = self.current.take() {
            // Fails only if the utterance already finished on its own
            if active.cancel_tx.send(()).is_ok() {
                tracing::debug!("Cancelling utterance {}", active.id);
            }
        }
    }

    /// Answers from the cached list. A miss or a stale list schedules a
    /// refresh, so installed and removed voices are noticed on later checks.
    fn has_voice(&self, voice: &str) -> bool {
        let found = self.voices.contains(&voice.to_lowercase());
        if !found || self.voices.is_stale(self.refresh_interval) {
            self.spawn_refresh();
        }
        found
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SynthesisEvent>> {
        self.events_rx.take()
    }
}

/// Feed the text, then wait for the process to exit or for a cancel request
async fn run_utterance(
    mut child: Child,
    stdin: Option<ChildStdin>,
    text: String,
    id: UtteranceId,
    cancel_rx: oneshot::Receiver<()>,
) -> SynthesisEvent {
    let mut stdin = stdin;

    let cancelled = {
        let playback = async {
            if let Some(mut pipe) = stdin.take() {
                if let Err(e) = pipe.write_all(text.as_bytes()).await {
                    tracing::warn!("Failed to write utterance text: {}", e);
                }
                // Closing stdin marks the end of the text
                drop(pipe);
            }
            child.wait().await
        };

        tokio::select! {
            status = playback => {
                match status {
                    Ok(status) if !status.success() => {
                        tracing::warn!("Synthesizer exited with {}", status);
                    }
                    Err(e) => tracing::warn!("Failed to wait for synthesizer: {}", e),
                    Ok(_) => {}
                }
                false
            }
            // A dropped sender cancels too
            _ = cancel_rx => true,
        }
    };

    if cancelled {
        if let Err(e) = child.kill().await {
            tracing::warn!("Failed to kill synthesizer process: {}", e);
        }
        SynthesisEvent::Cancelled(id)
    } else {
        SynthesisEvent::Finished(id)
    }
}

/// Translate utterance parameters to espeak-ng flags
fn synthesizer_args(utterance: &Utterance) -> Vec<String> {
    // 0.5 maps to espeak's default of 175 words per minute
    let words_per_minute = (80.0 + utterance.rate * 190.0).round().clamp(80.0, 450.0) as u32;
    let pitch = (utterance.pitch * 50.0).round().clamp(0.0, 99.0) as u32;
    let amplitude = (utterance.volume * 100.0).round().clamp(0.0, 200.0) as u32;

    let mut args = vec![
        "-s".to_string(),
        words_per_minute.to_string(),
        "-p".to_string(),
        pitch.to_string(),
        "-a".to_string(),
        amplitude.to_string(),
    ];
    if let Some(ref voice) = utterance.voice {
        args.push("-v".to_string());
        args.push(voice.clone());
    }
    args.push("--stdin".to_string());
    args
}

async fn list_voices(program: &Path) -> Option<Vec<String>> {
    let output = Command::new(program)
        .arg("--voices")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            Some(parse_voice_list(&String::from_utf8_lossy(&output.stdout)))
        }
        Ok(output) => {
            tracing::warn!("{:?} --voices exited with {}", program, output.status);
            None
        }
        Err(e) => {
            tracing::warn!("Failed to list voices from {:?}: {}", program, e);
            None
        }
    }
}

/// Parse `espeak-ng --voices` output.
///
/// Columns: Pty Language Age/Gender VoiceName File Other-Languages.
/// Language, voice name and file are all accepted as voice identifiers.
fn parse_voice_list(output: &str) -> Vec<String> {
    let mut voices = Vec::new();
    for line in output.lines().skip(1) {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 5 {
            continue;
        }
        for name in [columns[1], columns[3], columns[4]] {
            let name = name.to_lowercase();
            if !voices.contains(&name) {
                voices.push(name);
            }
        }
    }
    voices
}
