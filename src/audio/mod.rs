//! Microphone capture
//!
//! An engine delivers mono f32 chunks at the configured sample rate. The
//! capture pipeline builds a fresh engine through an [`EngineFactory`]
//! every time listening starts, so no engine outlives one session.

pub mod cpal_capture;

use crate::config::AudioConfig;
use crate::error::CaptureError;
use tokio::sync::mpsc;

pub use cpal_capture::CpalCapture;

/// Trait for microphone engine implementations
#[async_trait::async_trait]
pub trait AudioEngine: Send + Sync {
    /// Install the tap and start the engine.
    /// Returns a channel receiver for audio chunks (f32 samples, mono)
    async fn start(&mut self) -> Result<mpsc::Receiver<Vec<f32>>, CaptureError>;

    /// Remove the tap and release the device. Safe to call more than once.
    async fn stop(&mut self) -> Result<(), CaptureError>;
}

/// Builds engines on demand
pub trait EngineFactory: Send + Sync {
    /// Create an engine, recording from `preferred_input` when given
    fn create_engine(
        &self,
        preferred_input: Option<&str>,
    ) -> Result<Box<dyn AudioEngine>, CaptureError>;
}

/// Factory for cpal engines
#[derive(Debug, Clone)]
pub struct CpalEngineFactory {
    config: AudioConfig,
}

impl CpalEngineFactory {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl EngineFactory for CpalEngineFactory {
    fn create_engine(
        &self,
        preferred_input: Option<&str>,
    ) -> Result<Box<dyn AudioEngine>, CaptureError> {
        let mut engine = CpalCapture::new(&self.config);
        if let Some(input) = preferred_input {
            engine = engine.with_preferred_input(input);
        }
        Ok(Box::new(engine))
    }
}
