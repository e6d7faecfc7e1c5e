//! State machine for the voice session
//!
//! Idle → AwaitingAuthorization → Listening → Stopping → Idle

use serde::Serialize;
use tokio::time::Instant;

/// Listening state, owned by the session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Microphone closed
    Idle,

    /// Waiting for the recognizer permission decision before opening the microphone
    AwaitingAuthorization,

    /// Capture graph open, phrases flowing
    Listening {
        /// When the capture graph was opened
        started_at: Instant,
    },

    /// Capture graph being torn down
    Stopping,
}

impl SessionState {
    /// Create a new idle state
    pub fn new() -> Self {
        SessionState::Idle
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    pub fn is_listening(&self) -> bool {
        matches!(self, SessionState::Listening { .. })
    }

    /// Whether the capture graph is allowed to exist in this state
    pub fn owns_capture(&self) -> bool {
        matches!(self, SessionState::Listening { .. } | SessionState::Stopping)
    }

    /// How long the microphone has been open, if listening
    pub fn listening_duration(&self) -> Option<std::time::Duration> {
        match self {
            SessionState::Listening { started_at } => Some(started_at.elapsed()),
            _ => None,
        }
    }

    /// Short name written to the state file
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingAuthorization => "authorizing",
            SessionState::Listening { .. } => "listening",
            SessionState::Stopping => "stopping",
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Listening { started_at } => {
                write!(f, "Listening ({:.1}s)", started_at.elapsed().as_secs_f32())
            }
            SessionState::AwaitingAuthorization => write!(f, "Awaiting authorization"),
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Recognizer permission, resolved once and then cached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    #[default]
    Unknown,
    Granted,
    Denied,
}

impl AuthorizationStatus {
    /// Whether a decision has been made
    pub fn is_resolved(self) -> bool {
        !matches!(self, AuthorizationStatus::Unknown)
    }
}

/// Observable view of the session, published on every change
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub authorization: AuthorizationStatus,
    pub speaking: bool,
    /// Most recent transcript, kept for display
    pub last_phrase: Option<String>,
}

impl SessionSnapshot {
    pub fn is_listening(&self) -> bool {
        self.state.is_listening()
    }
}

/// Serializable form of the snapshot for `voxnav status --format json`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport<'a> {
    pub state: &'a str,
    pub authorization: AuthorizationStatus,
    pub speaking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_phrase: Option<&'a str>,
}

impl<'a> From<&'a SessionSnapshot> for StatusReport<'a> {
    fn from(snapshot: &'a SessionSnapshot) -> Self {
        Self {
            state: snapshot.state.as_str(),
            authorization: snapshot.authorization,
            speaking: snapshot.speaking,
            last_phrase: snapshot.last_phrase.as_deref(),
        }
    }
}
