//! Streaming recognizer driven as a child process
//!
//! The configured command runs under `sh -c`. It receives raw f32
//! little-endian mono PCM on stdin and prints one hypothesis per line:
//!
//! ```text
//! partial: go to the
//! partial: go to the next
//! final: go to the next
//! ```
//!
//! Bare lines count as partial results. JSON lines of the form
//! `{"text": "...", "segment": "...", "final": true}` are also accepted.
//! The locale, sample rate and partial-result preference are passed as
//! `VOXNAV_LOCALE`, `VOXNAV_SAMPLE_RATE` and `VOXNAV_PARTIAL_RESULTS`.

use super::{RecognitionEvent, RecognitionResult, SpeechRecognizer};
use crate::config::RecognizerConfig;
use crate::error::CaptureError;
use crate::state::AuthorizationStatus;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

/// JSON hypothesis line
#[derive(Debug, serde::Deserialize)]
struct Hypothesis {
    text: String,
    #[serde(default)]
    segment: Option<String>,
    #[serde(default, rename = "final")]
    is_final: bool,
}

/// Recognizer backed by an external streaming process
pub struct ProcessRecognizer {
    command: String,
    locale: String,
    partial_results: bool,
    sample_rate: u32,
}

impl ProcessRecognizer {
    pub fn new(config: &RecognizerConfig, sample_rate: u32) -> Self {
        Self {
            command: config.command.trim().to_string(),
            locale: config.locale.clone(),
            partial_results: config.partial_results,
            sample_rate,
        }
    }

    /// First word of the command line
    fn program(&self) -> Option<&str> {
        self.command.split_whitespace().next()
    }
}

#[async_trait::async_trait]
impl SpeechRecognizer for ProcessRecognizer {
    async fn request_authorization(&self) -> AuthorizationStatus {
        let Some(program) = self.program().map(str::to_string) else {
            tracing::warn!("No recognizer configured. Set [recognizer] command in the config file.");
            return AuthorizationStatus::Denied;
        };

        let lookup = program.clone();
        let found = tokio::task::spawn_blocking(move || which::which(&lookup).is_ok())
            .await
            .unwrap_or(false);

        if found {
            tracing::debug!("Recognizer '{}' available", program);
            AuthorizationStatus::Granted
        } else {
            tracing::warn!("Recognizer '{}' not found in PATH", program);
            AuthorizationStatus::Denied
        }
    }

    async fn recognize(
        &self,
        audio: mpsc::Receiver<Vec<f32>>,
    ) -> Result<mpsc::Receiver<RecognitionEvent>, CaptureError> {
        if self.command.is_empty() {
            return Err(CaptureError::RecognizerUnavailable(
                "no recognizer command configured".to_string(),
            ));
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("VOXNAV_LOCALE", &self.locale)
            .env("VOXNAV_SAMPLE_RATE", self.sample_rate.to_string())
            .env(
                "VOXNAV_PARTIAL_RESULTS",
                if self.partial_results { "1" } else { "0" },
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CaptureError::RecognizerUnavailable(format!("failed to spawn recognizer: {}", e))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            CaptureError::RecognizerUnavailable("recognizer stdin not available".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            CaptureError::RecognizerUnavailable("recognizer stdout not available".to_string())
        })?;

        tracing::debug!("Recognition stream started ({})", self.locale);

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(feed_audio(audio, stdin));
        tokio::spawn(read_hypotheses(child, stdout, tx, self.partial_results));

        Ok(rx)
    }

    fn name(&self) -> &str {
        self.program().unwrap_or("none")
    }
}

/// Forward microphone chunks to the recognizer until the tap closes
async fn feed_audio(mut audio: mpsc::Receiver<Vec<f32>>, mut stdin: ChildStdin) {
    while let Some(chunk) = audio.recv().await {
        tracing::trace!("Feeding {} samples to recognizer", chunk.len());
        let bytes: Vec<u8> = chunk.iter().flat_map(|s| s.to_le_bytes()).collect();
        if let Err(e) = stdin.write_all(&bytes).await {
            tracing::debug!("Recognizer stopped reading audio: {}", e);
            return;
        }
    }
    // Dropping stdin tells the recognizer the audio has ended
}

/// Turn recognizer output into events until a final result, EOF or error
async fn read_hypotheses(
    mut child: Child,
    stdout: ChildStdout,
    tx: mpsc::Sender<RecognitionEvent>,
    partial_results: bool,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("Recognition stream abandoned");
                let _ = child.kill().await;
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(result) = parse_line(&line) else {
                        continue;
                    };
                    if !partial_results && !result.is_final {
                        continue;
                    }
                    let is_final = result.is_final;
                    if tx.send(RecognitionEvent::Result(result)).await.is_err() || is_final {
                        let _ = child.kill().await;
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(RecognitionEvent::Failed(e.to_string())).await;
                    let _ = child.kill().await;
                    return;
                }
            }
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => {
            tracing::debug!("Recognizer exited");
        }
        Ok(status) => {
            let _ = tx
                .send(RecognitionEvent::Failed(format!("recognizer exited with {}", status)))
                .await;
        }
        Err(e) => {
            let _ = tx.send(RecognitionEvent::Failed(e.to_string())).await;
        }
    }
}

/// Parse one line of recognizer output
fn parse_line(line: &str) -> Option<RecognitionResult> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if line.starts_with('{') {
        return match serde_json::from_str::<Hypothesis>(line) {
            Ok(hypothesis) => Some(RecognitionResult {
                transcript: hypothesis.text,
                last_segment: hypothesis.segment,
                is_final: hypothesis.is_final,
            }),
            Err(e) => {
                tracing::debug!("Ignoring malformed recognizer line: {}", e);
                None
            }
        };
    }

    if let Some(text) = line.strip_prefix("final:") {
        Some(RecognitionResult::final_result(text.trim()))
    } else if let Some(text) = line.strip_prefix("partial:") {
        Some(RecognitionResult::partial(text.trim()))
    } else {
        Some(RecognitionResult::partial(line))
    }
}
