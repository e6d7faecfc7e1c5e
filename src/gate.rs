//! Turn-taking gate
//!
//! The microphone stays open while we speak, so the recognizer hears our
//! own voice. Phrases are dropped while an utterance is playing and for a
//! short window after it ends. `stop` always passes so the user can
//! interrupt speech.

use crate::command::{Command, RecognizedPhrase};
use crate::playback::PlaybackState;
use std::time::Duration;
use tokio::time::Instant;

/// Window after playback ends during which phrases are ignored
pub const COOL_DOWN_WINDOW: Duration = Duration::from_millis(750);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnGate {
    cool_down: Duration,
}

impl TurnGate {
    pub fn new(cool_down: Duration) -> Self {
        Self { cool_down }
    }

    pub fn cool_down(&self) -> Duration {
        self.cool_down
    }

    /// Whether a phrase heard at `now` may be acted on
    pub fn accepts(
        &self,
        phrase: &RecognizedPhrase,
        playback: &PlaybackState,
        now: Instant,
    ) -> bool {
        if phrase.command() == Some(Command::Stop) {
            return true;
        }
        if playback.is_speaking() {
            return false;
        }
        match playback.last_finished_at() {
            Some(finished) => now.saturating_duration_since(finished) >= self.cool_down,
            None => true,
        }
    }
}

impl Default for TurnGate {
    fn default() -> Self {
        Self::new(COOL_DOWN_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHRASES: &[&str] = &[
        "next",
        "go back",
        "say it again",
        "toggle",
        "play",
        "hello world",
        "",
        "please stop",
        "stop",
    ];

    fn speaking() -> PlaybackState {
        let mut state = PlaybackState::default();
        state.begin(1);
        state
    }

    fn finished_at(at: Instant) -> PlaybackState {
        let mut state = speaking();
        state.settle(1, at);
        state
    }

    #[test]
    fn test_speaking_blocks_everything_but_stop() {
        let gate = TurnGate::default();
        let playback = speaking();
        let now = Instant::now();
        for text in PHRASES {
            let phrase = RecognizedPhrase::new(text);
            let is_stop = phrase.command() == Some(Command::Stop);
            assert_eq!(gate.accepts(&phrase, &playback, now), is_stop, "{:?}", text);
        }
    }

    #[test]
    fn test_cool_down_blocks_everything_but_stop() {
        let gate = TurnGate::default();
        let finished = Instant::now();
        let playback = finished_at(finished);
        for ms in [0, 1, 100, 500, 749] {
            let now = finished + Duration::from_millis(ms);
            for text in PHRASES {
                let phrase = RecognizedPhrase::new(text);
                let is_stop = phrase.command() == Some(Command::Stop);
                assert_eq!(
                    gate.accepts(&phrase, &playback, now),
                    is_stop,
                    "{:?} at {}ms",
                    text,
                    ms
                );
            }
        }
    }

    #[test]
    fn test_after_cool_down_everything_passes() {
        let gate = TurnGate::default();
        let finished = Instant::now();
        let playback = finished_at(finished);
        for ms in [750, 800, 5000] {
            let now = finished + Duration::from_millis(ms);
            for text in PHRASES {
                assert!(gate.accepts(&RecognizedPhrase::new(text), &playback, now));
            }
        }
    }

    #[test]
    fn test_never_spoken_passes() {
        let gate = TurnGate::default();
        let phrase = RecognizedPhrase::new("next");
        assert!(gate.accepts(&phrase, &PlaybackState::default(), Instant::now()));
    }

    #[test]
    fn test_custom_window() {
        let gate = TurnGate::new(Duration::from_millis(200));
        let finished = Instant::now();
        let playback = finished_at(finished);
        let phrase = RecognizedPhrase::new("next");
        assert!(!gate.accepts(&phrase, &playback, finished + Duration::from_millis(150)));
        assert!(gate.accepts(&phrase, &playback, finished + Duration::from_millis(200)));
    }

    #[test]
    fn test_clock_before_finish_is_inside_window() {
        let gate = TurnGate::default();
        let now = Instant::now();
        let playback = finished_at(now + Duration::from_secs(1));
        assert!(!gate.accepts(&RecognizedPhrase::new("next"), &playback, now));
    }
}
