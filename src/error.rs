//! Error types for voxnav
//!
//! Uses thiserror for ergonomic error definitions with clear messages
//! that guide users toward fixing common issues.

use thiserror::Error;

/// Top-level error type for the voxnav application
#[derive(Error, Debug)]
pub enum VoxnavError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Voice session error: {0}")]
    Session(#[from] SessionError),

    #[error("Audio capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Conditions the voice session reports to the UI layer
///
/// None of these are fatal to the session itself: every failure path
/// converges back to idle with the capture graph closed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Speech recognition is not authorized. Grant microphone access or configure a recognizer, then try again.")]
    AuthorizationDenied,

    #[error("Could not start listening: {0}")]
    CaptureConfigurationFailed(CaptureError),

    #[error("Speech recognition stopped: {0}")]
    RecognitionStreamFailed(String),

    #[error("Voice '{requested}' is not available, falling back to '{fallback}'")]
    VoiceUnavailable { requested: String, fallback: String },

    #[error("Speech playback failed: {0}")]
    PlaybackFailed(PlaybackError),

    #[error("Voice session is no longer running")]
    Closed,
}

/// Errors related to the microphone, audio session and recognition stream
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Audio connection failed: {0}")]
    Connection(String),

    #[error("Audio device not found: '{0}'. List devices with: voxnav routes")]
    DeviceNotFound(String),

    #[error("Audio device '{requested}' not found.\n{available}")]
    DeviceNotFoundWithList { requested: String, available: String },

    #[error("Audio stream error: {0}")]
    StreamError(String),

    #[error("Timed out after {0} seconds waiting for the audio engine")]
    Timeout(u32),

    #[error("Recognizer could not be started: {0}")]
    RecognizerUnavailable(String),

    #[error("Recognition failed: {0}")]
    RecognitionFailed(String),
}

/// Errors related to speech synthesis
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("Synthesizer '{0}' not found in PATH. Install espeak-ng or set [speech] synthesizer.")]
    SynthesizerNotFound(String),

    #[error("Synthesis failed: {0}")]
    SynthesisFailed(String),
}

/// Result type alias using VoxnavError
pub type Result<T> = std::result::Result<T, VoxnavError>;
