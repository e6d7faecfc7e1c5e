//! Configuration loading and types for voxnav
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/voxnav/config.toml)
//! 3. Environment variables (VOXNAV_*)
//! 4. CLI arguments (highest priority)

use crate::error::VoxnavError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# Voxnav Configuration
#
# Location: ~/.config/voxnav/config.toml
# All settings can be overridden via CLI flags

# State file for external integrations (Waybar, polybar, etc.)
# Use "auto" for default location ($XDG_RUNTIME_DIR/voxnav/state),
# a custom path, or "disabled" to turn off. The daemon writes its state
# ("idle", "authorizing", "listening", "stopping") here whenever it changes.
state_file = "auto"

[speech]
# Speaking rate (0.3 slow .. 0.7 fast). 0 uses the default of 0.5
rate = 0.5

# Pitch multiplier (0.8 .. 1.2). 0 uses the default of 1.0
pitch = 1.0

# Volume (0.0 .. 1.0). 0 uses the default of 1.0
volume = 1.0

# Voice: "system" keeps the synthesizer's own choice, or name a voice
# installed for the synthesizer (list with: espeak-ng --voices)
voice = "system"

# Voice used when the configured voice is no longer installed
fallback_language = "en-us"

# Synthesizer executable (espeak-ng compatible flags)
synthesizer = "espeak-ng"

[session]
# Commands heard within this window after speech ends are ignored,
# so the tail of our own voice is not taken as a command
cool_down_ms = 750

# How often to check for headset / Bluetooth connect and disconnect
route_poll_ms = 1000

[audio]
# Audio input device ("default" uses system default)
device = "default"

# Sample rate in Hz delivered to the recognizer
sample_rate = 16000

# Frames per microphone buffer
buffer_frames = 1024

[recognizer]
# Streaming recognizer command. Receives raw f32 little-endian mono PCM on
# stdin and prints one hypothesis per line on stdout ("partial: ..." or
# "final: ..."; bare lines count as partial results).
# command = "whisper-stream --stdin --lines"

# Recognition locale passed to the recognizer as VOXNAV_LOCALE
locale = "en-US"

# Ask the recognizer for partial results
partial_results = true
"#;

/// Default speaking rate when unset or zero
pub const DEFAULT_RATE: f32 = 0.5;
/// Default pitch multiplier when unset or zero
pub const DEFAULT_PITCH: f32 = 1.0;
/// Default volume when unset or zero
pub const DEFAULT_VOLUME: f32 = 1.0;
/// Voice selection that leaves the synthesizer's own voice in place
pub const SYSTEM_VOICE: &str = "system";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub speech: SpeechConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub recognizer: RecognizerConfig,

    /// Optional path to state file for external integrations (e.g., Waybar)
    /// Use "auto" for the default runtime location, or "disabled"
    #[serde(default)]
    pub state_file: Option<String>,
}

/// Utterance parameters, passed to the synthesizer unchanged
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpeechConfig {
    #[serde(default = "default_rate")]
    pub rate: f32,

    #[serde(default = "default_pitch")]
    pub pitch: f32,

    #[serde(default = "default_volume")]
    pub volume: f32,

    /// "system" or a synthesizer voice identifier
    #[serde(default = "default_voice")]
    pub voice: String,

    #[serde(default = "default_fallback_language")]
    pub fallback_language: String,

    #[serde(default = "default_synthesizer")]
    pub synthesizer: String,
}

/// Turn-taking and route monitoring settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_cool_down_ms")]
    pub cool_down_ms: u64,

    #[serde(default = "default_route_poll_ms")]
    pub route_poll_ms: u64,
}

/// Audio capture configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    /// cpal input device name, or "default"
    #[serde(default = "default_device")]
    pub device: String,

    /// Sample rate in Hz delivered to the recognizer
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Frames per microphone buffer
    #[serde(default = "default_buffer_frames")]
    pub buffer_frames: u32,
}

/// Streaming recognizer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecognizerConfig {
    /// Shell command line; empty means no recognizer is configured
    #[serde(default)]
    pub command: String,

    #[serde(default = "default_locale")]
    pub locale: String,

    #[serde(default = "default_true")]
    pub partial_results: bool,
}

fn default_rate() -> f32 {
    DEFAULT_RATE
}

fn default_pitch() -> f32 {
    DEFAULT_PITCH
}

fn default_volume() -> f32 {
    DEFAULT_VOLUME
}

fn default_voice() -> String {
    SYSTEM_VOICE.to_string()
}

fn default_fallback_language() -> String {
    "en-us".to_string()
}

fn default_synthesizer() -> String {
    "espeak-ng".to_string()
}

fn default_cool_down_ms() -> u64 {
    750
}

fn default_route_poll_ms() -> u64 {
    1000
}

fn default_device() -> String {
    "default".to_string()
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_buffer_frames() -> u32 {
    1024
}

fn default_locale() -> String {
    "en-US".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            pitch: default_pitch(),
            volume: default_volume(),
            voice: default_voice(),
            fallback_language: default_fallback_language(),
            synthesizer: default_synthesizer(),
        }
    }
}

impl SpeechConfig {
    /// Speaking rate, with zero meaning "use the default"
    pub fn effective_rate(&self) -> f32 {
        if self.rate == 0.0 {
            DEFAULT_RATE
        } else {
            self.rate
        }
    }

    /// Pitch multiplier, with zero meaning "use the default"
    pub fn effective_pitch(&self) -> f32 {
        if self.pitch == 0.0 {
            DEFAULT_PITCH
        } else {
            self.pitch
        }
    }

    /// Volume, with zero meaning "use the default"
    pub fn effective_volume(&self) -> f32 {
        if self.volume == 0.0 {
            DEFAULT_VOLUME
        } else {
            self.volume
        }
    }

    /// Whether the synthesizer's own voice choice should be left alone
    pub fn uses_system_voice(&self) -> bool {
        let voice = self.voice.trim();
        voice.is_empty() || voice.eq_ignore_ascii_case(SYSTEM_VOICE)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cool_down_ms: default_cool_down_ms(),
            route_poll_ms: default_route_poll_ms(),
        }
    }
}

impl SessionConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    pub fn route_poll_interval(&self) -> Duration {
        Duration::from_millis(self.route_poll_ms.max(100))
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            sample_rate: default_sample_rate(),
            buffer_frames: default_buffer_frames(),
        }
    }
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            locale: default_locale(),
            partial_results: true,
        }
    }
}

impl RecognizerConfig {
    pub fn is_configured(&self) -> bool {
        !self.command.trim().is_empty()
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "voxnav")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the config directory path
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "voxnav")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the runtime directory for ephemeral files (state, pid)
    pub fn runtime_dir() -> PathBuf {
        // Use XDG_RUNTIME_DIR if available, otherwise fall back to /tmp
        std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join("voxnav")
    }

    /// Path of the PID file written by the daemon
    pub fn pid_file() -> PathBuf {
        Self::runtime_dir().join("pid")
    }

    /// Resolve the state file path from config
    /// Returns None if state_file is not configured or explicitly disabled
    pub fn resolve_state_file(&self) -> Option<PathBuf> {
        self.state_file
            .as_ref()
            .and_then(|path| match path.to_lowercase().as_str() {
                "disabled" | "none" | "off" | "false" => None,
                "auto" => Some(Self::runtime_dir().join("state")),
                _ => Some(PathBuf::from(path)),
            })
    }

    /// Log settings that fall outside the ranges the settings UI offers.
    /// Values are still passed through as configured.
    pub fn warn_out_of_range(&self) {
        let speech = &self.speech;
        if speech.rate != 0.0 && !(0.3..=0.7).contains(&speech.rate) {
            tracing::warn!("speech.rate {} is outside 0.3..0.7", speech.rate);
        }
        if speech.pitch != 0.0 && !(0.8..=1.2).contains(&speech.pitch) {
            tracing::warn!("speech.pitch {} is outside 0.8..1.2", speech.pitch);
        }
        if !(0.0..=1.0).contains(&speech.volume) {
            tracing::warn!("speech.volume {} is outside 0.0..1.0", speech.volume);
        }
    }
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(path: Option<&Path>) -> Result<Config, VoxnavError> {
    // Start with defaults
    let mut config = Config {
        state_file: Some("auto".to_string()),
        ..Config::default()
    };

    let config_path = path.map(PathBuf::from).or_else(Config::default_path);

    if let Some(ref path) = config_path {
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)
                .map_err(|e| VoxnavError::Config(format!("Failed to read config: {}", e)))?;

            config = toml::from_str(&contents)
                .map_err(|e| VoxnavError::Config(format!("Invalid config: {}", e)))?;
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
        }
    }

    apply_env_overrides(&mut config);
    config.warn_out_of_range();

    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(voice) = std::env::var("VOXNAV_VOICE") {
        config.speech.voice = voice;
    }
    if let Ok(command) = std::env::var("VOXNAV_RECOGNIZER") {
        config.recognizer.command = command;
    }
    if let Ok(device) = std::env::var("VOXNAV_DEVICE") {
        config.audio.device = device;
    }
}

/// Save configuration to file
pub fn save_config(config: &Config, path: &Path) -> Result<(), VoxnavError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| VoxnavError::Config(format!("Failed to create config dir: {}", e)))?;
    }

    let contents = toml::to_string_pretty(config)
        .map_err(|e| VoxnavError::Config(format!("Failed to serialize config: {}", e)))?;

    std::fs::write(path, contents)
        .map_err(|e| VoxnavError::Config(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.speech.rate, 0.5);
        assert_eq!(config.speech.voice, "system");
        assert_eq!(config.session.cool_down(), Duration::from_millis(750));
        assert_eq!(config.audio.buffer_frames, 1024);
        assert_eq!(config.recognizer.locale, "en-US");
        assert!(config.recognizer.partial_results);
        assert!(!config.recognizer.is_configured());
    }

    #[test]
    fn test_default_config_template_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.state_file.as_deref(), Some("auto"));
        assert_eq!(config.speech.synthesizer, "espeak-ng");
        assert_eq!(config.session.route_poll_ms, 1000);
        assert_eq!(config.audio.sample_rate, 16000);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
            [speech]
            rate = 0.65
            voice = "en-gb"

            [session]
            cool_down_ms = 1200
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.speech.rate, 0.65);
        assert_eq!(config.speech.pitch, 1.0); // default
        assert_eq!(config.speech.voice, "en-gb");
        assert!(!config.speech.uses_system_voice());
        assert_eq!(config.session.cool_down(), Duration::from_millis(1200));
        assert_eq!(config.audio.device, "default");
    }

    #[test]
    fn test_zero_speech_values_fall_back_to_defaults() {
        let speech = SpeechConfig {
            rate: 0.0,
            pitch: 0.0,
            volume: 0.0,
            ..SpeechConfig::default()
        };
        assert_eq!(speech.effective_rate(), DEFAULT_RATE);
        assert_eq!(speech.effective_pitch(), DEFAULT_PITCH);
        assert_eq!(speech.effective_volume(), DEFAULT_VOLUME);

        let speech = SpeechConfig {
            rate: 0.35,
            pitch: 0.9,
            volume: 0.4,
            ..SpeechConfig::default()
        };
        assert_eq!(speech.effective_rate(), 0.35);
        assert_eq!(speech.effective_pitch(), 0.9);
        assert_eq!(speech.effective_volume(), 0.4);
    }

    #[test]
    fn test_system_voice_spellings() {
        let mut speech = SpeechConfig::default();
        assert!(speech.uses_system_voice());
        speech.voice = "System".to_string();
        assert!(speech.uses_system_voice());
        speech.voice = String::new();
        assert!(speech.uses_system_voice());
    }

    #[test]
    fn test_resolve_state_file() {
        let mut config = Config::default();
        assert!(config.resolve_state_file().is_none());

        config.state_file = Some("disabled".to_string());
        assert!(config.resolve_state_file().is_none());

        config.state_file = Some("auto".to_string());
        assert!(config.resolve_state_file().unwrap().ends_with("voxnav/state"));

        config.state_file = Some("/tmp/custom-state".to_string());
        assert_eq!(
            config.resolve_state_file(),
            Some(PathBuf::from("/tmp/custom-state"))
        );
    }

    #[test]
    fn test_save_and_load_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.speech.voice = "en-gb".to_string();
        config.session.cool_down_ms = 900;
        save_config(&config, &path).unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.speech.voice, "en-gb");
        assert_eq!(loaded.session.cool_down_ms, 900);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[speech]\nrate = \"fast\"\n").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(err, VoxnavError::Config(_)));
    }
}
