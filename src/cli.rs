// Command-line interface definitions for voxnav
//
// This module is separate so it can be used by both the binary (main.rs)
// and build.rs for generating man pages.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "voxnav")]
#[command(author, version, about = "Hands-free voice navigation for Linux")]
#[command(long_about = "
Voxnav listens for short spoken commands (next, back, repeat, toggle, stop)
while it reads text aloud, without mistaking its own voice for a command.

SETUP:
  1. Install espeak-ng (or another synthesizer with espeak-ng flags)
  2. Configure a streaming recognizer: [recognizer] command in config.toml
  3. Run: voxnav setup (to check dependencies and write a default config)
  4. Run: voxnav (to start the daemon)

USAGE:
  Type 'listen' or run 'voxnav toggle' to start listening.
  Type 'say <text>' to have text read aloud; say 'stop' to interrupt it.
  Plugging in or removing a headset turns listening off.
")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Override the synthesizer voice ("system" or a voice id)
    #[arg(long, value_name = "VOICE")]
    pub voice: Option<String>,

    /// Override the audio input device
    #[arg(long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Override the recognizer command line
    #[arg(long, value_name = "COMMAND")]
    pub recognizer: Option<String>,

    /// Override the cool-down after speech, in milliseconds
    #[arg(long, value_name = "MS")]
    pub cool_down_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as daemon (default if no command specified)
    Daemon,

    /// Show which command a phrase would trigger
    Parse {
        /// Recognized text, as the recognizer would report it
        #[arg(required = true, num_args = 1..)]
        phrase: Vec<String>,
    },

    /// Speak text with the configured voice and exit
    Say {
        /// Text to speak
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Show audio devices and the route that would be chosen
    Routes {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check dependencies and write a default config file
    Setup,

    /// Show current configuration
    Config,

    /// Show daemon status (for Waybar/polybar integration)
    Status {
        /// Continuously output status changes
        #[arg(long)]
        follow: bool,

        /// Output format: "text" (default) or "json" (for Waybar)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Toggle listening in the running daemon (sends SIGUSR1)
    Toggle,

    /// Stop speech in the running daemon (sends SIGUSR2)
    Hush,
}
