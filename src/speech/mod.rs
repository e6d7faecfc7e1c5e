//! Speech synthesis backends
//!
//! A synthesizer speaks one utterance at a time and reports, on an event
//! channel, when each utterance finishes or is cancelled. Policy (never
//! queueing, voice fallback, turn-taking) lives in the playback pipeline.

pub mod process;

use crate::config::SpeechConfig;
use crate::error::PlaybackError;
use tokio::sync::mpsc;

pub use process::ProcessSynthesizer;

/// Identifies one utterance for completion reporting
pub type UtteranceId = u64;

/// One request to speak a piece of text
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: UtteranceId,
    pub text: String,
    /// 0.0 ..= 1.0, 0.5 is normal speed
    pub rate: f32,
    /// Pitch multiplier, 1.0 is normal
    pub pitch: f32,
    /// 0.0 ..= 1.0
    pub volume: f32,
    /// None leaves the synthesizer's own voice in place
    pub voice: Option<String>,
}

/// Completion notifications from a synthesizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisEvent {
    /// The utterance played to the end
    Finished(UtteranceId),
    /// The utterance was interrupted before the end
    Cancelled(UtteranceId),
}

impl SynthesisEvent {
    pub fn utterance(&self) -> UtteranceId {
        match self {
            SynthesisEvent::Finished(id) | SynthesisEvent::Cancelled(id) => *id,
        }
    }
}

/// Trait for text-to-speech implementations
pub trait SpeechSynthesizer: Send {
    /// Begin speaking. Returns once playback has started; completion
    /// arrives later on the event channel.
    fn speak(&mut self, utterance: Utterance) -> Result<(), PlaybackError>;

    /// Interrupt the current utterance immediately
    fn stop(&mut self);

    /// Whether a named voice is installed
    fn has_voice(&self, voice: &str) -> bool;

    /// Take the completion event channel. Returns None after the first call.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SynthesisEvent>>;
}

/// Factory function to create the configured synthesizer
pub async fn create_synthesizer(
    config: &SpeechConfig,
) -> Result<Box<dyn SpeechSynthesizer>, PlaybackError> {
    Ok(Box::new(ProcessSynthesizer::new(&config.synthesizer).await?))
}
