//! Voxnav - Hands-free voice navigation for Linux
//!
//! Run with `voxnav` or `voxnav daemon` to start the daemon.
//! Use `voxnav setup` to check dependencies and write a default config.
//! Use `voxnav toggle` / `voxnav hush` to control a running daemon.

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use voxnav::command::RecognizedPhrase;
use voxnav::config::{self, Config};
use voxnav::playback::{PlaybackPipeline, VoiceChoice};
use voxnav::route::{self, CpalRouteProbe, RouteProbe};
use voxnav::speech::{self, SynthesisEvent};
use voxnav::{Cli, Commands, Daemon};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("voxnav={},warn", log_level))),
        )
        .with_target(false)
        .init();

    // Load configuration
    let mut config = config::load_config(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(voice) = cli.voice {
        config.speech.voice = voice;
    }
    if let Some(device) = cli.device {
        config.audio.device = device;
    }
    if let Some(recognizer) = cli.recognizer {
        config.recognizer.command = recognizer;
    }
    if let Some(ms) = cli.cool_down_ms {
        config.session.cool_down_ms = ms;
    }

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => {
            let mut daemon = Daemon::new(config);
            daemon.run().await?;
        }

        Commands::Parse { phrase } => {
            parse_phrase(&phrase.join(" "));
        }

        Commands::Say { text } => {
            say(&config, &text.join(" ")).await?;
        }

        Commands::Routes { json } => {
            show_routes(json).await?;
        }

        Commands::Setup => {
            run_setup(&config, cli.config.as_deref()).await?;
        }

        Commands::Config => {
            show_config(&config)?;
        }

        Commands::Status { follow, format } => {
            run_status(&config, follow, &format)?;
        }

        Commands::Toggle => {
            signal_daemon(Signal::Toggle)?;
        }

        Commands::Hush => {
            signal_daemon(Signal::Hush)?;
        }
    }

    Ok(())
}

/// Show how a phrase would be decoded
fn parse_phrase(text: &str) {
    let phrase = RecognizedPhrase::new(text);
    println!("Transcript: {:?}", phrase.transcript);
    println!("Last word:  {:?}", phrase.last_token);
    match phrase.command() {
        Some(command) => println!("Command:    {}", command),
        None => println!("Command:    (none)"),
    }
}

/// Speak text once and wait for it to finish
async fn say(config: &Config, text: &str) -> anyhow::Result<()> {
    let synth = speech::create_synthesizer(&config.speech).await?;
    let mut playback = PlaybackPipeline::new(synth, config.speech.clone());
    let Some(mut events) = playback.take_events() else {
        anyhow::bail!("synthesizer event channel unavailable");
    };

    let voice = playback.speak(text, tokio::time::Instant::now())?;
    match voice {
        VoiceChoice::Fallback { requested, language } => {
            tracing::warn!("Voice {:?} not installed, using {:?}", requested, language);
        }
        VoiceChoice::Named(name) => tracing::debug!("Voice: {}", name),
        VoiceChoice::SystemDefault => tracing::debug!("Voice: synthesizer default"),
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if playback.on_event(event, tokio::time::Instant::now()) {
                    if let SynthesisEvent::Cancelled(_) = event {
                        tracing::warn!("Speech was interrupted");
                    }
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                playback.stop(tokio::time::Instant::now());
                break;
            }
        }
    }

    Ok(())
}

/// List audio devices and the route policy's decision
async fn show_routes(json: bool) -> anyhow::Result<()> {
    let snapshot = tokio::task::spawn_blocking(|| CpalRouteProbe::new().snapshot()).await??;
    let decision = route::choose(&snapshot);

    if json {
        let value = serde_json::json!({
            "outputs": snapshot.outputs,
            "available_inputs": snapshot.available_inputs,
            "decision": decision.to_string(),
            "preferred_input": decision.preferred_input().map(|port| &port.name),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Outputs:");
    if snapshot.outputs.is_empty() {
        println!("  (none)");
    }
    for port in &snapshot.outputs {
        println!("  {:<16} {}", port.kind.as_str(), port.name);
    }

    println!("\nInputs:");
    if snapshot.available_inputs.is_empty() {
        println!("  (none)");
    }
    for port in &snapshot.available_inputs {
        println!("  {:<16} {}", port.kind.as_str(), port.name);
    }

    println!("\nRoute: {}", decision);
    Ok(())
}

/// Run the setup command
async fn run_setup(config: &Config, config_path: Option<&Path>) -> anyhow::Result<()> {
    println!("Voxnav Setup\n");
    println!("============\n");

    // Create default config file if it doesn't exist
    let config_path = config_path.map(PathBuf::from).or_else(Config::default_path);
    if let Some(ref config_path) = config_path {
        if !config_path.exists() {
            println!("Creating default config file...");
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(config_path, config::DEFAULT_CONFIG)?;
            println!("  ✓ Created: {:?}", config_path);
        } else {
            println!("  Config file exists: {:?}", config_path);
        }
    }

    let mut all_ok = true;

    // Check synthesizer
    println!("\nChecking synthesizer...");
    match speech::ProcessSynthesizer::new(&config.speech.synthesizer).await {
        Ok(synth) => {
            println!("  ✓ {} found", config.speech.synthesizer);
            if !config.speech.uses_system_voice() {
                use voxnav::speech::SpeechSynthesizer;
                if synth.has_voice(config.speech.voice.trim()) {
                    println!("  ✓ Voice {:?} installed", config.speech.voice);
                } else {
                    println!(
                        "  ✗ Voice {:?} not installed, {:?} will be used",
                        config.speech.voice, config.speech.fallback_language
                    );
                }
            }
        }
        Err(e) => {
            println!("  ✗ {}", e);
            all_ok = false;
        }
    }

    // Check recognizer
    println!("\nChecking recognizer...");
    if config.recognizer.is_configured() {
        let recognizer =
            voxnav::recognize::create_recognizer(&config.recognizer, config.audio.sample_rate);
        match recognizer.request_authorization().await {
            voxnav::state::AuthorizationStatus::Granted => {
                println!("  ✓ {} found", recognizer.name());
            }
            _ => {
                println!("  ✗ {} not found in PATH", recognizer.name());
                all_ok = false;
            }
        }
    } else {
        println!("  ✗ No recognizer configured");
        println!("    Set [recognizer] command in {:?}", config_path.unwrap_or_default());
        all_ok = false;
    }

    // Check microphone
    println!("\nChecking audio devices...");
    match tokio::task::spawn_blocking(|| CpalRouteProbe::new().snapshot()).await? {
        Ok(snapshot) if !snapshot.available_inputs.is_empty() => {
            println!("  ✓ {} input(s) found", snapshot.available_inputs.len());
            println!("  Route: {}", route::choose(&snapshot));
        }
        Ok(_) => {
            println!("  ✗ No input devices found");
            all_ok = false;
        }
        Err(e) => {
            println!("  ✗ {}", e);
            all_ok = false;
        }
    }

    // Summary
    println!("\n---");
    if all_ok {
        println!("✓ All checks passed! Run 'voxnav' to start.");
    } else {
        println!("✗ Some checks failed. Please fix the issues above.");
    }

    Ok(())
}

/// Text line for one state file reading
fn format_state_text(report: &serde_json::Value) -> String {
    let state = report["state"].as_str().unwrap_or("unknown");
    if report["speaking"].as_bool().unwrap_or(false) {
        format!("{} (speaking)", state)
    } else {
        state.to_string()
    }
}

/// Format state as JSON for Waybar consumption
fn format_state_json(report: &serde_json::Value) -> String {
    let state = report["state"].as_str().unwrap_or("unknown");
    let speaking = report["speaking"].as_bool().unwrap_or(false);

    let (text, class, tooltip) = match state {
        "listening" => ("🎤", "listening", "Listening for commands"),
        "authorizing" => ("⏳", "authorizing", "Waiting for recognizer permission"),
        "stopping" => ("⏳", "stopping", "Stopping..."),
        "idle" => ("🎙️", "idle", "Voxnav ready - run 'voxnav toggle' to listen"),
        "stopped" => ("", "stopped", "Voxnav not running"),
        _ => ("?", "unknown", "Unknown state"),
    };

    let mut tooltip = tooltip.to_string();
    if speaking {
        tooltip.push_str(" (speaking)");
    }
    if let Some(phrase) = report["last_phrase"].as_str() {
        tooltip.push_str(&format!("\nLast heard: {}", phrase));
    }

    serde_json::json!({
        "text": text,
        "class": class,
        "tooltip": tooltip,
    })
    .to_string()
}

/// Read the state file; a missing file means the daemon is not running
fn read_state(path: &Path) -> serde_json::Value {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|contents| serde_json::from_str(&contents).ok())
        .unwrap_or_else(|| serde_json::json!({ "state": "stopped" }))
}

fn print_state(report: &serde_json::Value, format: &str) {
    if format == "json" {
        println!("{}", format_state_json(report));
    } else {
        println!("{}", format_state_text(report));
    }
}

/// Run the status command - show current daemon state
fn run_status(config: &Config, follow: bool, format: &str) -> anyhow::Result<()> {
    let Some(state_path) = config.resolve_state_file() else {
        eprintln!("Error: state_file is disabled.");
        eprintln!();
        eprintln!("To enable status monitoring, add to your config.toml:");
        eprintln!();
        eprintln!("  state_file = \"auto\"");
        std::process::exit(1);
    };

    let mut last = read_state(&state_path);
    print_state(&last, format);

    if !follow {
        return Ok(());
    }

    // Follow mode: watch for changes
    use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    let (tx, rx) = channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        NotifyConfig::default().with_poll_interval(Duration::from_millis(100)),
    )?;

    // Watch the state file's parent directory (file may not exist yet)
    if let Some(parent) = state_path.parent() {
        std::fs::create_dir_all(parent)?;
        watcher.watch(parent, RecursiveMode::NonRecursive)?;
    }

    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(_event)) => {
                let current = read_state(&state_path);
                if current != last {
                    print_state(&current, format);
                    last = current;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Watch error: {:?}", e);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                // Daemon stopped without an event reaching us
                if !state_path.exists() && last["state"] != "stopped" {
                    last = serde_json::json!({ "state": "stopped" });
                    print_state(&last, format);
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                break;
            }
        }
    }

    Ok(())
}

/// Requests sent to the daemon over Unix signals
#[derive(Debug, Clone, Copy)]
enum Signal {
    Toggle,
    Hush,
}

/// Signal the running daemon using its PID file
fn signal_daemon(request: Signal) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal as UnixSignal};
    use nix::unistd::Pid;

    let pid_path = Config::pid_file();
    let contents = std::fs::read_to_string(&pid_path).map_err(|e| {
        anyhow::anyhow!(
            "Voxnav daemon is not running (cannot read {:?}: {})",
            pid_path,
            e
        )
    })?;
    let pid: i32 = contents
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid PID file {:?}: {}", pid_path, e))?;

    let signal = match request {
        Signal::Toggle => UnixSignal::SIGUSR1,
        Signal::Hush => UnixSignal::SIGUSR2,
    };

    kill(Pid::from_raw(pid), signal)
        .map_err(|e| anyhow::anyhow!("Failed to signal voxnav daemon (pid {}): {}", pid, e))?;
    tracing::debug!("Sent {:?} to pid {}", signal, pid);
    Ok(())
}

/// Show current configuration
fn show_config(config: &Config) -> anyhow::Result<()> {
    println!("Current Configuration\n");
    println!("=====================\n");

    println!("[speech]");
    println!("  rate = {} (effective {})", config.speech.rate, config.speech.effective_rate());
    println!("  pitch = {} (effective {})", config.speech.pitch, config.speech.effective_pitch());
    println!(
        "  volume = {} (effective {})",
        config.speech.volume,
        config.speech.effective_volume()
    );
    println!("  voice = {:?}", config.speech.voice);
    println!("  fallback_language = {:?}", config.speech.fallback_language);
    println!("  synthesizer = {:?}", config.speech.synthesizer);

    println!("\n[session]");
    println!("  cool_down_ms = {}", config.session.cool_down_ms);
    println!("  route_poll_ms = {}", config.session.route_poll_ms);

    println!("\n[audio]");
    println!("  device = {:?}", config.audio.device);
    println!("  sample_rate = {}", config.audio.sample_rate);
    println!("  buffer_frames = {}", config.audio.buffer_frames);

    println!("\n[recognizer]");
    if config.recognizer.is_configured() {
        println!("  command = {:?}", config.recognizer.command);
    } else {
        println!("  command = (not configured)");
    }
    println!("  locale = {:?}", config.recognizer.locale);
    println!("  partial_results = {}", config.recognizer.partial_results);

    if let Some(ref state_file) = config.state_file {
        println!("\n[integration]");
        println!("  state_file = {:?}", state_file);
        if let Some(resolved) = config.resolve_state_file() {
            println!("  (resolves to: {:?})", resolved);
        }
    }

    println!("\n---");
    println!(
        "Config file: {:?}",
        Config::default_path().unwrap_or_else(|| PathBuf::from("(not found)"))
    );
    println!("PID file: {:?}", Config::pid_file());

    Ok(())
}
