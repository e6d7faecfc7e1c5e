//! Navigation commands and the phrase parser
//!
//! Recognizer output is noisy and short, so commands are matched by
//! substring containment on the last spoken word rather than by equality.

use crate::recognize::RecognitionResult;
use std::fmt;

/// A navigation command decoded from speech
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Next,
    Back,
    Repeat,
    Toggle,
    /// Interrupt speech. Never gated.
    Stop,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Next => "next",
            Command::Back => "back",
            Command::Repeat => "repeat",
            Command::Toggle => "toggle",
            Command::Stop => "stop",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vocabulary in priority order. The first entry contained in the input wins.
const VOCABULARY: &[(&str, Command)] = &[
    ("stop", Command::Stop),
    ("next", Command::Next),
    ("back", Command::Back),
    ("previous", Command::Back),
    ("repeat", Command::Repeat),
    ("again", Command::Repeat),
    ("toggle", Command::Toggle),
    // "start"/"play" replay the current item once speech has finished
    ("start", Command::Repeat),
    ("play", Command::Repeat),
];

/// Map recognized text to a command. Unmatched text is not an error.
pub fn parse(text: &str) -> Option<Command> {
    let text = text.to_lowercase();
    VOCABULARY
        .iter()
        .find(|(word, _)| text.contains(word))
        .map(|&(_, command)| command)
}

/// One recognizer hypothesis, reduced to what command decisions need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizedPhrase {
    /// Full lowercase transcript, kept for display
    pub transcript: String,
    /// Last spoken word; the only part used to decide a command
    pub last_token: String,
}

impl RecognizedPhrase {
    /// Build a phrase from a transcript, taking its last whitespace-delimited token
    pub fn new(transcript: &str) -> Self {
        let transcript = transcript.trim().to_lowercase();
        let last_token = transcript
            .split_whitespace()
            .last()
            .unwrap_or_default()
            .to_string();
        Self {
            transcript,
            last_token,
        }
    }

    /// Build a phrase from a recognizer result, preferring its own last segment
    pub fn from_result(result: &RecognitionResult) -> Self {
        let mut phrase = Self::new(&result.transcript);
        if let Some(segment) = result.last_segment.as_deref() {
            let segment = segment.trim();
            if !segment.is_empty() {
                phrase.last_token = segment.to_lowercase();
            }
        }
        phrase
    }

    /// Command carried by the last token, if any
    pub fn command(&self) -> Option<Command> {
        parse(&self.last_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_examples() {
        assert_eq!(parse("please stop now"), Some(Command::Stop));
        assert_eq!(parse("go back please"), Some(Command::Back));
        assert_eq!(parse("say that again"), Some(Command::Repeat));
        assert_eq!(parse("toggle the view"), Some(Command::Toggle));
        assert_eq!(parse("play"), Some(Command::Repeat));
        assert_eq!(parse("hello world"), None);
    }

    #[test]
    fn test_parse_priority() {
        // stop beats everything else in the same fragment
        assert_eq!(parse("next stop"), Some(Command::Stop));
        assert_eq!(parse("back to next"), Some(Command::Next));
        assert_eq!(parse("previous again"), Some(Command::Back));
        assert_eq!(parse("repeat toggle"), Some(Command::Repeat));
        assert_eq!(parse("toggle start"), Some(Command::Toggle));
    }

    #[test]
    fn test_parse_substring_and_case() {
        assert_eq!(parse("Next."), Some(Command::Next));
        assert_eq!(parse("backwards"), Some(Command::Back));
        assert_eq!(parse("restart"), Some(Command::Repeat));
        assert_eq!(parse("PREVIOUS"), Some(Command::Back));
        assert_eq!(parse(""), None);
    }

    #[test]
    fn test_parse_is_deterministic() {
        for (word, command) in VOCABULARY {
            assert_eq!(parse(word), Some(*command));
            assert_eq!(parse(word), parse(word));
        }
    }

    #[test]
    fn test_phrase_uses_last_token() {
        let phrase = RecognizedPhrase::new("  Move BACK stance then Next ");
        assert_eq!(phrase.transcript, "move back stance then next");
        assert_eq!(phrase.last_token, "next");
        assert_eq!(phrase.command(), Some(Command::Next));

        // "back" earlier in the phrase does not count
        let phrase = RecognizedPhrase::new("step back and block");
        assert_eq!(phrase.command(), None);
    }

    #[test]
    fn test_empty_phrase() {
        let phrase = RecognizedPhrase::new("   ");
        assert_eq!(phrase.transcript, "");
        assert_eq!(phrase.last_token, "");
        assert_eq!(phrase.command(), None);
    }

    #[test]
    fn test_phrase_from_result_prefers_segment() {
        let result = RecognitionResult {
            transcript: "Go to the next one".to_string(),
            last_segment: Some("Again".to_string()),
            is_final: false,
        };
        let phrase = RecognizedPhrase::from_result(&result);
        assert_eq!(phrase.transcript, "go to the next one");
        assert_eq!(phrase.last_token, "again");
        assert_eq!(phrase.command(), Some(Command::Repeat));

        let result = RecognitionResult {
            transcript: "go next".to_string(),
            last_segment: None,
            is_final: true,
        };
        assert_eq!(
            RecognizedPhrase::from_result(&result).command(),
            Some(Command::Next)
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Command::Toggle.to_string(), "toggle");
        assert_eq!(format!("{}", Command::Stop), "stop");
    }
}
