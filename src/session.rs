//! Voice session controller
//!
//! A single task owns every piece of session state: the listening state
//! machine, authorization, both pipelines and the audio session. The UI
//! talks to it through a cloneable [`VoiceSession`] handle; recognizer
//! output, synthesizer completions, authorization results and route
//! changes arrive as messages on an internal queue. Nothing is mutated
//! from anywhere else.
//!
//! ```text
//!  UI ──requests──▶ ┌────────────────┐ ──▶ handlers (next/back/…)
//!                   │  SessionActor  │
//!  platform ─msgs─▶ └────────────────┘ ──▶ watch<SessionSnapshot>
//! ```

use crate::audio::EngineFactory;
use crate::capture::{CaptureEvent, CapturePipeline};
use crate::command::{Command, RecognizedPhrase};
use crate::config::{SessionConfig, SpeechConfig};
use crate::error::SessionError;
use crate::gate::TurnGate;
use crate::playback::{PlaybackPipeline, VoiceChoice};
use crate::recognize::SpeechRecognizer;
use crate::route::{self, AudioSession, RouteChange, RouteMonitor, RouteProbe, RouteSnapshot};
use crate::speech::{SpeechSynthesizer, SynthesisEvent};
use crate::state::{AuthorizationStatus, SessionSnapshot, SessionState};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

type Handler = Box<dyn FnMut() + Send>;
type ErrorHandler = Box<dyn FnMut(&SessionError) + Send>;

/// Callbacks invoked on the session task.
///
/// Handlers must not block. They may call back into a [`VoiceSession`]
/// handle; requests are queued and handled after the handler returns.
#[derive(Default)]
pub struct SessionHandlers {
    on_next: Option<Handler>,
    on_back: Option<Handler>,
    on_repeat: Option<Handler>,
    on_toggle: Option<Handler>,
    on_forced_off: Option<Handler>,
    on_error: Option<ErrorHandler>,
}

impl SessionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_next(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_next = Some(Box::new(f));
        self
    }

    pub fn on_back(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_back = Some(Box::new(f));
        self
    }

    pub fn on_repeat(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_repeat = Some(Box::new(f));
        self
    }

    pub fn on_toggle(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_toggle = Some(Box::new(f));
        self
    }

    /// Called when a device change stops listening
    pub fn on_forced_off(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_forced_off = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&SessionError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn dispatch(&mut self, command: Command) {
        let handler = match command {
            Command::Next => &mut self.on_next,
            Command::Back => &mut self.on_back,
            Command::Repeat => &mut self.on_repeat,
            Command::Toggle => &mut self.on_toggle,
            // Handled by the controller itself
            Command::Stop => return,
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    fn forced_off(&mut self) {
        if let Some(ref mut handler) = self.on_forced_off {
            handler();
        }
    }

    fn error(&mut self, error: &SessionError) {
        if let Some(ref mut handler) = self.on_error {
            handler(error);
        }
    }
}

/// Platform pieces the session is built from
pub struct SessionParts {
    pub audio_session: Box<dyn AudioSession>,
    pub engines: Box<dyn EngineFactory>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Box<dyn SpeechSynthesizer>,
    /// Polled for route changes when present
    pub route_probe: Option<Arc<dyn RouteProbe>>,
}

/// UI requests
enum Request {
    StartListening,
    StopListening,
    Speak(String),
    StopSpeaking,
    RouteChanged(RouteChange),
    RequestAuthorization(oneshot::Sender<AuthorizationStatus>),
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Platform notifications
enum Internal {
    Authorization(AuthorizationStatus),
    Capture { generation: u64, event: CaptureEvent },
    Playback(SynthesisEvent),
    Route(RouteChange),
}

/// Handle to a running voice session
#[derive(Clone)]
pub struct VoiceSession {
    requests: mpsc::UnboundedSender<Request>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl VoiceSession {
    /// Start the session task. Must be called inside a tokio runtime.
    pub fn spawn(
        parts: SessionParts,
        session: &SessionConfig,
        speech: &SpeechConfig,
        handlers: SessionHandlers,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let mut playback = PlaybackPipeline::new(parts.synthesizer, speech.clone());
        if let Some(mut events) = playback.take_events() {
            let tx = internal_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if tx.send(Internal::Playback(event)).is_err() {
                        break;
                    }
                }
            });
        }

        let monitor = parts.route_probe.clone().map(|probe| {
            let tx = internal_tx.clone();
            RouteMonitor::spawn(probe, session.route_poll_interval(), move |change| {
                let _ = tx.send(Internal::Route(change));
            })
        });

        let actor = SessionActor {
            state: SessionState::Idle,
            authorization: AuthorizationStatus::Unknown,
            authorization_pending: false,
            authorization_waiters: Vec::new(),
            start_after_authorization: false,
            audio_session: parts.audio_session,
            capture: CapturePipeline::new(parts.engines, parts.recognizer.clone()),
            playback,
            recognizer: parts.recognizer,
            gate: TurnGate::new(session.cool_down()),
            handlers,
            last_phrase: None,
            voice_fallback_reported: false,
            route_probe: parts.route_probe,
            route_monitor: monitor,
            internal_tx,
            snapshots: snapshot_tx,
        };

        tokio::spawn(actor.run(requests_rx, internal_rx));

        Self {
            requests: requests_tx,
            snapshots: snapshot_rx,
        }
    }

    fn send(&self, request: Request) -> Result<(), SessionError> {
        self.requests.send(request).map_err(|_| SessionError::Closed)
    }

    /// Start listening, or stop if already listening
    pub fn start_listening(&self) -> Result<(), SessionError> {
        self.send(Request::StartListening)
    }

    pub fn stop_listening(&self) -> Result<(), SessionError> {
        self.send(Request::StopListening)
    }

    /// Speak `text`, cancelling anything already playing
    pub fn speak(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(Request::Speak(text.into()))
    }

    pub fn stop_speaking(&self) -> Result<(), SessionError> {
        self.send(Request::StopSpeaking)
    }

    /// Deliver a route-change notification from the platform
    pub fn route_changed(&self, change: RouteChange) -> Result<(), SessionError> {
        self.send(Request::RouteChanged(change))
    }

    /// Resolve recognizer authorization. Prompts at most once.
    pub async fn request_authorization(&self) -> Result<AuthorizationStatus, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::RequestAuthorization(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Snapshot taken after every earlier request has been handled
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Snapshot(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Latest published snapshot, without waiting
    pub fn current(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn is_listening(&self) -> bool {
        self.snapshots.borrow().is_listening()
    }

    pub fn is_speaking(&self) -> bool {
        self.snapshots.borrow().speaking
    }

    /// Receive every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Stop listening and speaking, release the audio session, and end the task
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Shutdown(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

struct SessionActor {
    state: SessionState,
    authorization: AuthorizationStatus,
    authorization_pending: bool,
    authorization_waiters: Vec<oneshot::Sender<AuthorizationStatus>>,
    /// A start request is waiting on the authorization prompt
    start_after_authorization: bool,
    audio_session: Box<dyn AudioSession>,
    capture: CapturePipeline,
    playback: PlaybackPipeline,
    recognizer: Arc<dyn SpeechRecognizer>,
    gate: TurnGate,
    handlers: SessionHandlers,
    last_phrase: Option<String>,
    voice_fallback_reported: bool,
    route_probe: Option<Arc<dyn RouteProbe>>,
    route_monitor: Option<RouteMonitor>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        tracing::debug!("Voice session started");
        self.refresh_route().await;

        loop {
            tokio::select! {
                biased;

                Some(event) = internal.recv() => self.handle_internal(event).await,

                request = requests.recv() => match request {
                    Some(Request::Shutdown(done)) => {
                        self.teardown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
            }
        }

        tracing::debug!("Voice session ended");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::StartListening => self.start_listening().await,
            Request::StopListening => self.stop_listening().await,
            Request::Speak(text) => self.speak(&text),
            Request::StopSpeaking => self.stop_speaking(),
            Request::RouteChanged(change) => self.on_route_changed(change).await,
            Request::RequestAuthorization(reply) => {
                if self.authorization.is_resolved() {
                    let _ = reply.send(self.authorization);
                } else {
                    self.authorization_waiters.push(reply);
                    self.begin_authorization();
                }
            }
            Request::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Handled by the run loop
            Request::Shutdown(_) => {}
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Authorization(status) => self.on_authorization(status).await,
            Internal::Capture { generation, event } => self.on_capture(generation, event).await,
            Internal::Playback(event) => {
                if self.playback.on_event(event, Instant::now()) {
                    self.publish();
                }
            }
            Internal::Route(change) => self.on_route_changed(change).await,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            authorization: self.authorization,
            speaking: self.playback.state().is_speaking(),
            last_phrase: self.last_phrase.clone(),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn set_state(&mut self, state: SessionState) {
        tracing::debug!("Session state: {} -> {}", self.state.as_str(), state.as_str());
        self.state = state;
        self.publish();
    }

    fn report(&mut self, error: SessionError) {
        tracing::warn!("{}", error);
        self.handlers.error(&error);
    }

    /// Ask the recognizer for permission on a separate task
    fn begin_authorization(&mut self) {
        if self.authorization_pending {
            return;
        }
        self.authorization_pending = true;
        tracing::debug!("Requesting recognizer authorization");

        let recognizer = self.recognizer.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let status = recognizer.request_authorization().await;
            let _ = tx.send(Internal::Authorization(status));
        });
    }

    async fn on_authorization(&mut self, status: AuthorizationStatus) {
        // An undecided answer counts as a refusal; the decision is final
        let status = if status.is_resolved() {
            status
        } else {
            AuthorizationStatus::Denied
        };
        tracing::info!("Recognizer authorization: {:?}", status);

        self.authorization = status;
        self.authorization_pending = false;
        for waiter in self.authorization_waiters.drain(..) {
            let _ = waiter.send(status);
        }
        self.publish();

        if std::mem::take(&mut self.start_after_authorization)
            && self.state == SessionState::AwaitingAuthorization
        {
            if status == AuthorizationStatus::Granted {
                self.open_capture().await;
            } else {
                self.set_state(SessionState::Idle);
                self.report(SessionError::AuthorizationDenied);
            }
        }
    }

    async fn start_listening(&mut self) {
        match self.state {
            SessionState::Listening { .. } => {
                self.stop_listening().await;
                return;
            }
            SessionState::AwaitingAuthorization | SessionState::Stopping => {
                tracing::debug!("Start ignored while {}", self.state.as_str());
                return;
            }
            SessionState::Idle => {}
        }

        match self.authorization {
            AuthorizationStatus::Denied => {
                self.report(SessionError::AuthorizationDenied);
            }
            AuthorizationStatus::Unknown => {
                self.start_after_authorization = true;
                self.set_state(SessionState::AwaitingAuthorization);
                self.begin_authorization();
            }
            AuthorizationStatus::Granted => {
                self.set_state(SessionState::AwaitingAuthorization);
                self.open_capture().await;
            }
        }
    }

    /// Configure the audio session, apply the route and open the capture graph
    async fn open_capture(&mut self) {
        let snapshot = current_route(self.route_probe.clone()).await;
        let decision = route::choose(&snapshot);

        let opened = match self.audio_session.activate_play_and_record() {
            Ok(()) => match self.audio_session.apply_route(&decision) {
                Ok(()) => self.capture.open(&decision).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match opened {
            Ok((generation, mut events)) => {
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if tx.send(Internal::Capture { generation, event }).is_err() {
                            break;
                        }
                    }
                });
                self.set_state(SessionState::Listening {
                    started_at: Instant::now(),
                });
                tracing::info!("Listening ({})", decision);
            }
            Err(e) => {
                self.set_state(SessionState::Idle);
                self.report(SessionError::CaptureConfigurationFailed(e));
            }
        }
    }

    async fn stop_listening(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Stopping => {
                tracing::debug!("Stop ignored while {}", self.state.as_str());
            }
            SessionState::AwaitingAuthorization => {
                self.start_after_authorization = false;
                self.set_state(SessionState::Idle);
            }
            SessionState::Listening { .. } => {
                self.set_state(SessionState::Stopping);
                self.capture.close().await;
                self.set_state(SessionState::Idle);
                tracing::info!("Stopped listening");
            }
        }
    }

    async fn on_capture(&mut self, generation: u64, event: CaptureEvent) {
        if !self.state.owns_capture()
            || !self.capture.is_open()
            || generation != self.capture.generation()
        {
            tracing::trace!("Dropping event from capture graph {}", generation);
            return;
        }

        match event {
            CaptureEvent::Phrase(phrase) => self.on_recognized(phrase),
            CaptureEvent::Ended => {
                self.capture.close().await;
                self.set_state(SessionState::Idle);
                tracing::info!("Recognition ended");
            }
            CaptureEvent::Failed(e) => {
                self.capture.close().await;
                self.set_state(SessionState::Idle);
                self.report(SessionError::RecognitionStreamFailed(e.to_string()));
            }
        }
    }

    fn on_recognized(&mut self, phrase: RecognizedPhrase) {
        self.last_phrase = Some(phrase.transcript.clone());
        let command = phrase.command();

        if command == Some(Command::Stop) {
            tracing::debug!("Heard stop");
            self.stop_speaking();
            return;
        }

        let playback = self.playback.state();
        if !self.gate.accepts(&phrase, &playback, Instant::now()) {
            tracing::debug!("Ignoring {:?} (turn-taking)", phrase.last_token);
            self.publish();
            return;
        }

        if let Some(command) = command {
            tracing::info!("Command: {}", command);
            self.handlers.dispatch(command);
        }
        self.publish();
    }

    fn speak(&mut self, text: &str) {
        match self.playback.speak(text, Instant::now()) {
            Ok(VoiceChoice::Fallback {
                requested,
                language,
            }) => {
                if !self.voice_fallback_reported {
                    self.voice_fallback_reported = true;
                    self.report(SessionError::VoiceUnavailable {
                        requested,
                        fallback: language,
                    });
                }
            }
            Ok(_) => {}
            Err(e) => self.report(SessionError::PlaybackFailed(e)),
        }
        self.publish();
    }

    fn stop_speaking(&mut self) {
        self.playback.stop(Instant::now());
        self.publish();
    }

    async fn on_route_changed(&mut self, change: RouteChange) {
        let decision = route::choose(&change.snapshot);
        tracing::debug!("Route change ({:?}): {}", change.reason, decision);
        if let Err(e) = self.audio_session.apply_route(&decision) {
            tracing::warn!("Failed to apply route: {}", e);
        }

        // Reconfigurations we cause ourselves do not carry a device reason
        if self.state.is_listening() && change.reason.is_device_transition() {
            tracing::info!("Audio device changed ({:?}), listening turned off", change.reason);
            self.stop_listening().await;
            self.handlers.forced_off();
        }
    }

    /// Apply the route policy to the current route
    async fn refresh_route(&mut self) {
        if self.route_probe.is_none() {
            return;
        }
        let decision = route::choose(&current_route(self.route_probe.clone()).await);
        if let Err(e) = self.audio_session.apply_route(&decision) {
            tracing::warn!("Failed to apply route: {}", e);
        }
    }

    async fn teardown(&mut self) {
        self.stop_listening().await;
        self.playback.stop(Instant::now());
        self.audio_session.deactivate();
        if let Some(monitor) = self.route_monitor.take() {
            monitor.stop();
        }
        self.authorization_waiters.clear();
        self.publish();
    }
}

/// Fresh route snapshot, or an empty one without a probe
async fn current_route(probe: Option<Arc<dyn RouteProbe>>) -> RouteSnapshot {
    let Some(probe) = probe else {
        return RouteSnapshot::default();
    };
    match tokio::task::spawn_blocking(move || probe.snapshot()).await {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => {
            tracing::warn!("Route probe failed: {}", e);
            RouteSnapshot::default()
        }
        Err(e) => {
            tracing::warn!("Route probe task failed: {}", e);
            RouteSnapshot::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dispatch_reaches_matching_handler() {
        let next = Arc::new(AtomicUsize::new(0));
        let back = Arc::new(AtomicUsize::new(0));
        let (n, b) = (next.clone(), back.clone());

        let mut handlers = SessionHandlers::new()
            .on_next(move || {
                n.fetch_add(1, Ordering::SeqCst);
            })
            .on_back(move || {
                b.fetch_add(1, Ordering::SeqCst);
            });

        handlers.dispatch(Command::Next);
        handlers.dispatch(Command::Next);
        handlers.dispatch(Command::Back);
        // No handler registered
        handlers.dispatch(Command::Repeat);
        handlers.dispatch(Command::Stop);

        assert_eq!(next.load(Ordering::SeqCst), 2);
        assert_eq!(back.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_handler_receives_error() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut handlers =
            SessionHandlers::new().on_error(move |e| sink.lock().unwrap().push(e.clone()));

        handlers.error(&SessionError::AuthorizationDenied);
        handlers.forced_off();

        assert_eq!(*seen.lock().unwrap(), vec![SessionError::AuthorizationDenied]);
    }
}
