//! Streaming speech recognition
//!
//! A recognizer consumes the microphone stream and emits hypotheses as
//! they firm up. Partial results revise earlier ones; a final result or
//! an error ends the stream.

pub mod process;

use crate::config::RecognizerConfig;
use crate::error::CaptureError;
use crate::state::AuthorizationStatus;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use process::ProcessRecognizer;

/// One recognizer hypothesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    /// Best transcription so far
    pub transcript: String,
    /// Most recent segment, when the recognizer reports segments
    pub last_segment: Option<String>,
    /// No further results follow this one
    pub is_final: bool,
}

impl RecognitionResult {
    pub fn partial(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            last_segment: None,
            is_final: false,
        }
    }

    pub fn final_result(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            last_segment: None,
            is_final: true,
        }
    }
}

/// Event on a recognition stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Result(RecognitionResult),
    /// The stream failed; nothing follows
    Failed(String),
}

/// Trait for streaming recognizer implementations
#[async_trait::async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Ask for permission to recognize speech. May prompt; call off the
    /// controller task.
    async fn request_authorization(&self) -> AuthorizationStatus;

    /// Start a recognition stream fed by `audio`. The returned channel
    /// closes when the stream ends.
    async fn recognize(
        &self,
        audio: mpsc::Receiver<Vec<f32>>,
    ) -> Result<mpsc::Receiver<RecognitionEvent>, CaptureError>;

    /// Name for logs
    fn name(&self) -> &str;
}

/// Factory function to create the configured recognizer
pub fn create_recognizer(
    config: &RecognizerConfig,
    sample_rate: u32,
) -> Arc<dyn SpeechRecognizer> {
    Arc::new(ProcessRecognizer::new(config, sample_rate))
}
