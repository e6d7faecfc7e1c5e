//! Voxnav: hands-free voice navigation for Linux
//!
//! This library provides the core functionality for:
//! - Listening for short spoken commands through a streaming recognizer
//! - Capturing audio via cpal (supports PipeWire, PulseAudio, ALSA)
//! - Reading text aloud through an espeak-ng compatible synthesizer
//! - Keeping the two apart: commands heard while speaking, or just after,
//!   are ignored so the app never answers its own voice
//! - Following headset and Bluetooth connects and disconnects
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────────────────────────────────┐
//!            │           Daemon (signals, stdin, state)         │
//!            └──────────────────────────────────────────────────┘
//!                                   │ VoiceSession handle
//!                                   ▼
//!            ┌──────────────────────────────────────────────────┐
//!            │       SessionActor (one task owns all state)     │
//!            │  Idle ─▶ AwaitingAuthorization ─▶ Listening ─┐   │
//!            │   ▲                                Stopping ◀┘   │
//!            │   └──────────────────────────────────┘           │
//!            └──────────────────────────────────────────────────┘
//!               │               │                │          │
//!               ▼               ▼                ▼          ▼
//!      ┌──────────────┐ ┌──────────────┐ ┌────────────┐ ┌──────────┐
//!      │   Capture    │ │   Playback   │ │  TurnGate  │ │  Route   │
//!      │ cpal engine  │ │  espeak-ng   │ │ (cool-down)│ │ monitor  │
//!      │ + recognizer │ │              │ │            │ │ + policy │
//!      └──────────────┘ └──────────────┘ └────────────┘ └──────────┘
//!               │
//!               ▼ partial / final hypotheses
//!      ┌──────────────┐
//!      │   Command    │ next / back / repeat / toggle / stop
//!      │   parser     │
//!      └──────────────┘
//! ```

pub mod audio;
pub mod capture;
pub mod cli;
pub mod command;
pub mod config;
pub mod daemon;
pub mod error;
pub mod gate;
pub mod playback;
pub mod recognize;
pub mod route;
pub mod session;
pub mod speech;
pub mod state;

pub use cli::{Cli, Commands};
pub use command::Command;
pub use config::Config;
pub use daemon::Daemon;
pub use error::{Result, VoxnavError};
pub use session::{SessionHandlers, SessionParts, VoiceSession};
