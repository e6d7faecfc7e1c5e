//! Capture pipeline
//!
//! Owns one capture graph at a time: a microphone engine with its tap and
//! the recognition stream it feeds. Every open builds a fresh engine, and
//! the graph tears itself down when the recognizer delivers a final result
//! or fails, before the terminal event is sent.

use crate::audio::{AudioEngine, EngineFactory};
use crate::command::RecognizedPhrase;
use crate::error::CaptureError;
use crate::recognize::{RecognitionEvent, SpeechRecognizer};
use crate::route::RouteDecision;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Output of an open capture graph
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Latest hypothesis, partial or final
    Phrase(RecognizedPhrase),
    /// The recognizer finished; the graph has closed itself
    Ended,
    /// The recognizer failed; the graph has closed itself
    Failed(CaptureError),
}

impl CaptureEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CaptureEvent::Phrase(_))
    }
}

/// A running engine + recognition stream
struct CaptureGraph {
    generation: u64,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

pub struct CapturePipeline {
    engines: Box<dyn EngineFactory>,
    recognizer: Arc<dyn SpeechRecognizer>,
    graph: Option<CaptureGraph>,
    generation: u64,
}

impl CapturePipeline {
    pub fn new(engines: Box<dyn EngineFactory>, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        Self {
            engines,
            recognizer,
            graph: None,
            generation: 0,
        }
    }

    /// Whether a capture graph exists (it may have closed itself and be
    /// waiting for [`close`](Self::close) to collect it)
    pub fn is_open(&self) -> bool {
        self.graph.is_some()
    }

    /// Generation of the current graph, or of the last one opened
    pub fn generation(&self) -> u64 {
        self.graph
            .as_ref()
            .map(|graph| graph.generation)
            .unwrap_or(self.generation)
    }

    /// Open a new capture graph, closing any existing one first.
    ///
    /// Returns the generation of the new graph and its event stream.
    pub async fn open(
        &mut self,
        decision: &RouteDecision,
    ) -> Result<(u64, mpsc::UnboundedReceiver<CaptureEvent>), CaptureError> {
        self.close().await;

        let preferred_input = decision.preferred_input().map(|port| port.name.as_str());
        let mut engine = self.engines.create_engine(preferred_input)?;
        let audio = engine.start().await?;

        let results = match self.recognizer.recognize(audio).await {
            Ok(results) => results,
            Err(e) => {
                if let Err(stop_err) = engine.stop().await {
                    tracing::warn!("Failed to release microphone: {}", stop_err);
                }
                return Err(e);
            }
        };

        self.generation += 1;
        let generation = self.generation;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_graph(engine, results, events_tx, stop_rx));

        self.graph = Some(CaptureGraph {
            generation,
            stop_tx: Some(stop_tx),
            task,
        });

        tracing::info!(
            "Capture graph {} open (recognizer: {})",
            generation,
            self.recognizer.name()
        );
        Ok((generation, events_rx))
    }

    /// Tear down the current graph and wait until the microphone is released.
    /// Returns false if nothing was open.
    pub async fn close(&mut self) -> bool {
        let Some(mut graph) = self.graph.take() else {
            return false;
        };

        if let Some(stop_tx) = graph.stop_tx.take() {
            // Fails if the graph already closed itself
            let _ = stop_tx.send(());
        }
        if let Err(e) = graph.task.await {
            tracing::warn!("Capture task failed: {}", e);
        }

        tracing::info!("Capture graph {} closed", graph.generation);
        true
    }
}

/// Forward recognizer output until stopped, a final result, or an error
async fn run_graph(
    mut engine: Box<dyn AudioEngine>,
    mut results: mpsc::Receiver<RecognitionEvent>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let terminal = loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => break None,

            event = results.recv() => match event {
                Some(RecognitionEvent::Result(result)) => {
                    let phrase = RecognizedPhrase::from_result(&result);
                    tracing::debug!("Heard: {:?}", phrase.transcript);
                    let _ = events.send(CaptureEvent::Phrase(phrase));
                    if result.is_final {
                        break Some(CaptureEvent::Ended);
                    }
                }
                Some(RecognitionEvent::Failed(message)) => {
                    tracing::warn!("Recognition failed: {}", message);
                    break Some(CaptureEvent::Failed(CaptureError::RecognitionFailed(message)));
                }
                None => break Some(CaptureEvent::Ended),
            }
        }
    };

    // End the recognition stream, then remove the tap and release the engine
    drop(results);
    if let Err(e) = engine.stop().await {
        tracing::warn!("Failed to release microphone: {}", e);
    }

    if let Some(event) = terminal {
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognize::RecognitionResult;
    use crate::route::{AudioPort, PortKind};
    use crate::state::AuthorizationStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        stopped: AtomicUsize,
        preferred: Mutex<Vec<Option<String>>>,
    }

    struct FakeEngine {
        counters: Arc<Counters>,
        audio_tx: Option<mpsc::Sender<Vec<f32>>>,
        fail_start: bool,
    }

    #[async_trait::async_trait]
    impl AudioEngine for FakeEngine {
        async fn start(&mut self) -> Result<mpsc::Receiver<Vec<f32>>, CaptureError> {
            if self.fail_start {
                return Err(CaptureError::DeviceNotFound("fake".to_string()));
            }
            let (tx, rx) = mpsc::channel(4);
            self.audio_tx = Some(tx);
            Ok(rx)
        }

        async fn stop(&mut self) -> Result<(), CaptureError> {
            if self.audio_tx.take().is_some() {
                self.counters.stopped.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct FakeFactory {
        counters: Arc<Counters>,
        fail_start: bool,
    }

    impl EngineFactory for FakeFactory {
        fn create_engine(
            &self,
            preferred_input: Option<&str>,
        ) -> Result<Box<dyn AudioEngine>, CaptureError> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            self.counters
                .preferred
                .lock()
                .unwrap()
                .push(preferred_input.map(str::to_string));
            Ok(Box::new(FakeEngine {
                counters: self.counters.clone(),
                audio_tx: None,
                fail_start: self.fail_start,
            }))
        }
    }

    /// Hands each stream's sender to the test
    #[derive(Default)]
    struct FakeRecognizer {
        streams: Mutex<Vec<mpsc::Sender<RecognitionEvent>>>,
        refuse: bool,
    }

    impl FakeRecognizer {
        fn latest(&self) -> mpsc::Sender<RecognitionEvent> {
            self.streams.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        async fn request_authorization(&self) -> AuthorizationStatus {
            AuthorizationStatus::Granted
        }

        async fn recognize(
            &self,
            _audio: mpsc::Receiver<Vec<f32>>,
        ) -> Result<mpsc::Receiver<RecognitionEvent>, CaptureError> {
            if self.refuse {
                return Err(CaptureError::RecognizerUnavailable("fake".to_string()));
            }
            let (tx, rx) = mpsc::channel(8);
            self.streams.lock().unwrap().push(tx);
            Ok(rx)
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    fn pipeline(
        fail_start: bool,
        refuse: bool,
    ) -> (CapturePipeline, Arc<Counters>, Arc<FakeRecognizer>) {
        let counters = Arc::new(Counters::default());
        let recognizer = Arc::new(FakeRecognizer {
            refuse,
            ..FakeRecognizer::default()
        });
        let factory = FakeFactory {
            counters: counters.clone(),
            fail_start,
        };
        let pipeline = CapturePipeline::new(Box::new(factory), recognizer.clone());
        (pipeline, counters, recognizer)
    }

    #[tokio::test]
    async fn test_final_result_self_closes() {
        let (mut capture, counters, recognizer) = pipeline(false, false);
        let (generation, mut events) = capture.open(&RouteDecision::UseLoudspeaker).await.unwrap();
        assert_eq!(generation, 1);
        assert!(capture.is_open());

        let stream = recognizer.latest();
        stream
            .send(RecognitionEvent::Result(RecognitionResult::partial("go")))
            .await
            .unwrap();
        stream
            .send(RecognitionEvent::Result(RecognitionResult::final_result("go next")))
            .await
            .unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first, CaptureEvent::Phrase(RecognizedPhrase::new("go")));
        let second = events.recv().await.unwrap();
        assert_eq!(second, CaptureEvent::Phrase(RecognizedPhrase::new("go next")));
        assert_eq!(events.recv().await, Some(CaptureEvent::Ended));

        // Engine released before the terminal event
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
        assert!(events.recv().await.is_none());

        // Collecting the self-closed graph does not stop the engine again
        assert!(capture.close().await);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recognizer_failure_is_terminal() {
        let (mut capture, counters, recognizer) = pipeline(false, false);
        let (_, mut events) = capture.open(&RouteDecision::UseLoudspeaker).await.unwrap();

        recognizer
            .latest()
            .send(RecognitionEvent::Failed("lost audio".to_string()))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert!(event.is_terminal());
        assert_eq!(
            event,
            CaptureEvent::Failed(CaptureError::RecognitionFailed("lost audio".to_string()))
        );
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut capture, counters, _) = pipeline(false, false);
        let (_, mut events) = capture.open(&RouteDecision::UseLoudspeaker).await.unwrap();

        assert!(capture.close().await);
        assert!(!capture.close().await);
        assert!(!capture.is_open());
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);

        // A requested close sends no terminal event
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_open_rebuilds_engine() {
        let (mut capture, counters, _) = pipeline(false, false);
        capture.open(&RouteDecision::UseLoudspeaker).await.unwrap();
        let (generation, _events) = capture.open(&RouteDecision::UseLoudspeaker).await.unwrap();

        assert_eq!(generation, 2);
        assert_eq!(capture.generation(), 2);
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
        capture.close().await;
    }

    #[tokio::test]
    async fn test_preferred_input_reaches_engine() {
        let (mut capture, counters, _) = pipeline(false, false);
        let decision = RouteDecision::UseExternal {
            preferred_input: Some(AudioPort::new(PortKind::BluetoothHfp, "bluez_input.0")),
        };
        capture.open(&decision).await.unwrap();
        capture.close().await;
        capture.open(&RouteDecision::UseLoudspeaker).await.unwrap();
        capture.close().await;

        assert_eq!(
            *counters.preferred.lock().unwrap(),
            vec![Some("bluez_input.0".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_engine_failure_leaves_nothing_open() {
        let (mut capture, _, _) = pipeline(true, false);
        let result = capture.open(&RouteDecision::UseLoudspeaker).await;
        assert!(matches!(result, Err(CaptureError::DeviceNotFound(_))));
        assert!(!capture.is_open());
        assert_eq!(capture.generation(), 0);
    }

    #[tokio::test]
    async fn test_recognizer_refusal_releases_engine() {
        let (mut capture, counters, _) = pipeline(false, true);
        let result = capture.open(&RouteDecision::UseLoudspeaker).await;
        assert!(matches!(result, Err(CaptureError::RecognizerUnavailable(_))));
        assert!(!capture.is_open());
        assert_eq!(counters.stopped.load(Ordering::SeqCst), 1);
    }
}
