//! Playback pipeline
//!
//! Owns the synthesizer and the playback half of turn-taking: whether an
//! utterance is in flight and when the last one ended. A new utterance
//! always cancels the previous one; nothing is ever queued.

use crate::config::SpeechConfig;
use crate::error::PlaybackError;
use crate::speech::{SpeechSynthesizer, SynthesisEvent, Utterance, UtteranceId};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Whether speech is playing, and when it last stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackState {
    speaking: Option<UtteranceId>,
    last_finished_at: Option<Instant>,
}

impl PlaybackState {
    pub fn is_speaking(&self) -> bool {
        self.speaking.is_some()
    }

    /// Utterance currently in flight
    pub fn current(&self) -> Option<UtteranceId> {
        self.speaking
    }

    /// When the most recent utterance finished or was cancelled
    pub fn last_finished_at(&self) -> Option<Instant> {
        self.last_finished_at
    }

    pub(crate) fn begin(&mut self, id: UtteranceId) {
        self.speaking = Some(id);
    }

    /// Record the end of `id`. Only the utterance in flight can end, so each
    /// utterance settles at most once and `last_finished_at` never moves back.
    pub(crate) fn settle(&mut self, id: UtteranceId, now: Instant) -> bool {
        if self.speaking != Some(id) {
            return false;
        }
        self.speaking = None;
        self.last_finished_at = Some(match self.last_finished_at {
            Some(previous) if previous > now => previous,
            _ => now,
        });
        true
    }
}

/// How the configured voice was resolved for an utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceChoice {
    /// No override; the synthesizer picks
    SystemDefault,
    /// The configured voice is installed
    Named(String),
    /// The configured voice is missing; the fallback language voice is used
    Fallback { requested: String, language: String },
}

impl VoiceChoice {
    /// Voice identifier handed to the synthesizer
    pub fn voice_id(&self) -> Option<&str> {
        match self {
            VoiceChoice::SystemDefault => None,
            VoiceChoice::Named(voice) => Some(voice),
            VoiceChoice::Fallback { language, .. } => Some(language),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, VoiceChoice::Fallback { .. })
    }
}

/// Owns the synthesizer and its playback state
pub struct PlaybackPipeline {
    synth: Box<dyn SpeechSynthesizer>,
    settings: SpeechConfig,
    state: PlaybackState,
    next_id: UtteranceId,
}

impl PlaybackPipeline {
    pub fn new(synth: Box<dyn SpeechSynthesizer>, settings: SpeechConfig) -> Self {
        Self {
            synth,
            settings,
            state: PlaybackState::default(),
            next_id: 1,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Take the synthesizer's completion channel (once)
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SynthesisEvent>> {
        self.synth.take_events()
    }

    /// Resolve the configured voice against what the synthesizer has installed
    pub fn resolve_voice(&self) -> VoiceChoice {
        if self.settings.uses_system_voice() {
            return VoiceChoice::SystemDefault;
        }
        let requested = self.settings.voice.trim();
        if self.synth.has_voice(requested) {
            VoiceChoice::Named(requested.to_string())
        } else {
            VoiceChoice::Fallback {
                requested: requested.to_string(),
                language: self.settings.fallback_language.clone(),
            }
        }
    }

    /// Cancel anything in flight and start speaking `text`.
    ///
    /// Returns the voice that was used so the caller can report a fallback.
    pub fn speak(&mut self, text: &str, now: Instant) -> Result<VoiceChoice, PlaybackError> {
        self.stop(now);

        let voice = self.resolve_voice();
        let id = self.next_id;
        self.next_id += 1;

        let utterance = Utterance {
            id,
            text: text.to_string(),
            rate: self.settings.effective_rate(),
            pitch: self.settings.effective_pitch(),
            volume: self.settings.effective_volume(),
            voice: voice.voice_id().map(str::to_string),
        };

        self.synth.speak(utterance)?;
        self.state.begin(id);
        tracing::debug!("Utterance {} started ({} chars)", id, text.len());
        Ok(voice)
    }

    /// Cancel the utterance in flight. Returns true if one was playing.
    pub fn stop(&mut self, now: Instant) -> bool {
        self.synth.stop();
        match self.state.current() {
            Some(id) => {
                tracing::debug!("Utterance {} cancelled", id);
                self.state.settle(id, now)
            }
            None => false,
        }
    }

    /// Apply a synthesizer event. Returns true if it ended the utterance in
    /// flight; events for utterances already settled are ignored.
    pub fn on_event(&mut self, event: SynthesisEvent, now: Instant) -> bool {
        let settled = self.state.settle(event.utterance(), now);
        if settled {
            tracing::debug!("Utterance {} ended: {:?}", event.utterance(), event);
        }
        settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Records calls and emits events the way a real synthesizer would
    struct FakeSynth {
        spoken: Arc<Mutex<Vec<Utterance>>>,
        current: Option<UtteranceId>,
        voices: Vec<&'static str>,
        events_tx: mpsc::UnboundedSender<SynthesisEvent>,
        events_rx: Option<mpsc::UnboundedReceiver<SynthesisEvent>>,
    }

    impl FakeSynth {
        fn new(voices: Vec<&'static str>) -> (Self, Arc<Mutex<Vec<Utterance>>>) {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let spoken = Arc::new(Mutex::new(Vec::new()));
            let synth = Self {
                spoken: spoken.clone(),
                current: None,
                voices,
                events_tx,
                events_rx: Some(events_rx),
            };
            (synth, spoken)
        }
    }

    impl SpeechSynthesizer for FakeSynth {
        fn speak(&mut self, utterance: Utterance) -> Result<(), PlaybackError> {
            self.stop();
            self.current = Some(utterance.id);
            self.spoken.lock().unwrap().push(utterance);
            Ok(())
        }

        fn stop(&mut self) {
            if let Some(id) = self.current.take() {
                let _ = self.events_tx.send(SynthesisEvent::Cancelled(id));
            }
        }

        fn has_voice(&self, voice: &str) -> bool {
            self.voices.contains(&voice)
        }

        fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SynthesisEvent>> {
            self.events_rx.take()
        }
    }

    fn pipeline(
        voice: &str,
        voices: Vec<&'static str>,
    ) -> (PlaybackPipeline, Arc<Mutex<Vec<Utterance>>>) {
        let (synth, spoken) = FakeSynth::new(voices);
        let settings = SpeechConfig {
            voice: voice.to_string(),
            ..SpeechConfig::default()
        };
        (PlaybackPipeline::new(Box::new(synth), settings), spoken)
    }

    #[test]
    fn test_settle_is_once_per_utterance() {
        let now = Instant::now();
        let mut state = PlaybackState::default();
        state.begin(1);
        assert!(state.is_speaking());
        assert!(state.settle(1, now));
        assert!(!state.settle(1, now + Duration::from_secs(1)));
        assert_eq!(state.last_finished_at(), Some(now));
    }

    #[test]
    fn test_settle_ignores_other_utterances() {
        let now = Instant::now();
        let mut state = PlaybackState::default();
        state.begin(2);
        assert!(!state.settle(1, now));
        assert!(state.is_speaking());
        assert_eq!(state.last_finished_at(), None);
    }

    #[test]
    fn test_last_finished_never_moves_back() {
        let now = Instant::now();
        let mut state = PlaybackState::default();
        state.begin(1);
        state.settle(1, now + Duration::from_secs(5));
        state.begin(2);
        state.settle(2, now);
        assert_eq!(state.last_finished_at(), Some(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_speak_a_then_b_completes_only_b() {
        let (mut playback, spoken) = pipeline("system", vec![]);
        let mut events = playback.take_events().unwrap();
        let now = Instant::now();

        playback.speak("A", now).unwrap();
        playback.speak("B", now).unwrap();

        let a = spoken.lock().unwrap()[0].id;
        let b = spoken.lock().unwrap()[1].id;
        assert_eq!(playback.state().current(), Some(b));

        // The synthesizer reports A as cancelled; that must not end B
        let event = events.try_recv().unwrap();
        assert_eq!(event, SynthesisEvent::Cancelled(a));
        assert!(!playback.on_event(event, now));
        assert!(playback.state().is_speaking());

        // B plays to the end
        assert!(playback.on_event(SynthesisEvent::Finished(b), now));
        assert!(!playback.state().is_speaking());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_stop_settles_immediately() {
        let (mut playback, _) = pipeline("system", vec![]);
        let now = Instant::now();
        playback.speak("hello", now).unwrap();
        assert!(playback.stop(now));
        assert!(!playback.state().is_speaking());
        assert_eq!(playback.state().last_finished_at(), Some(now));
        // Nothing in flight
        assert!(!playback.stop(now));
    }

    #[test]
    fn test_settings_passed_through() {
        let (synth, spoken) = FakeSynth::new(vec![]);
        let settings = SpeechConfig {
            rate: 0.0,
            pitch: 1.2,
            volume: 0.0,
            ..SpeechConfig::default()
        };
        let mut playback = PlaybackPipeline::new(Box::new(synth), settings);
        playback.speak("hello", Instant::now()).unwrap();

        let utterance = spoken.lock().unwrap()[0].clone();
        assert_eq!(utterance.rate, 0.5);
        assert_eq!(utterance.pitch, 1.2);
        assert_eq!(utterance.volume, 1.0);
        assert_eq!(utterance.voice, None);
    }

    #[test]
    fn test_voice_resolution() {
        let (playback, _) = pipeline("system", vec!["en-gb"]);
        assert_eq!(playback.resolve_voice(), VoiceChoice::SystemDefault);

        let (playback, _) = pipeline("en-gb", vec!["en-gb"]);
        assert_eq!(playback.resolve_voice(), VoiceChoice::Named("en-gb".to_string()));

        let (playback, _) = pipeline("klingon", vec!["en-gb"]);
        let choice = playback.resolve_voice();
        assert!(choice.is_fallback());
        assert_eq!(choice.voice_id(), Some("en-us"));
    }

    #[test]
    fn test_fallback_voice_used_for_utterance() {
        let (mut playback, spoken) = pipeline("missing-voice", vec![]);
        let choice = playback.speak("hi", Instant::now()).unwrap();
        assert_eq!(
            choice,
            VoiceChoice::Fallback {
                requested: "missing-voice".to_string(),
                language: "en-us".to_string(),
            }
        );
        assert_eq!(spoken.lock().unwrap()[0].voice.as_deref(), Some("en-us"));
    }
}
