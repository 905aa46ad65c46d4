pub mod audio;
pub mod connector;
pub mod metrics;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use connector::LiveConnector;
use session::{spawn_session, SessionHandle, SessionPhase, SessionStatus};
use settings::VoiceSettings;
use streaming::StreamingError;

const DEFAULT_LOG_FILTER: &str = "duplex_voice=info,warn";

/// Console commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Toggle,
    Start,
    Stop,
    Status,
    Metrics,
    Save,
    Help,
    Quit,
}

fn parse_command(input: &str) -> Option<Command> {
    match input.trim().to_ascii_lowercase().as_str() {
        "" | "t" | "toggle" => Some(Command::Toggle),
        "start" => Some(Command::Start),
        "stop" => Some(Command::Stop),
        "s" | "status" => Some(Command::Status),
        "m" | "metrics" => Some(Command::Metrics),
        "save" => Some(Command::Save),
        "h" | "help" | "?" => Some(Command::Help),
        "q" | "quit" | "exit" => Some(Command::Quit),
        _ => None,
    }
}

fn print_help() {
    println!(
        "Commands: <enter>/toggle, start, stop, status, metrics, save, help, quit (Ctrl+C also quits)"
    );
}

fn phase_label(phase: SessionPhase) -> &'static str {
    match phase {
        SessionPhase::Idle => "idle",
        SessionPhase::Connecting => "connecting",
        SessionPhase::Connected => "listening",
        SessionPhase::Error => "error",
    }
}

/// Text to print when the newest transcript snapshot changes from `old` to `new`.
/// A continuation of the same turn prints only the new suffix.
fn transcript_update<'a>(old: Option<&str>, new: &'a str) -> (bool, &'a str) {
    match old {
        Some(old) if !old.is_empty() && new.starts_with(old) => (false, &new[old.len()..]),
        _ => (true, new),
    }
}

/// Write the active settings so they can be edited between runs
fn save_current_settings(path: Option<&Path>, settings: &VoiceSettings) -> Result<PathBuf, String> {
    let path = path.ok_or("No config directory available")?;
    settings::save_settings(path, settings)?;
    Ok(path.to_path_buf())
}

/// Returns false when the console should exit
async fn handle_command(
    handle: &SessionHandle,
    command: Command,
    settings: &VoiceSettings,
    settings_path: Option<&Path>,
) -> bool {
    let result = match command {
        Command::Toggle => handle.toggle().await,
        Command::Start => handle.start().await,
        Command::Stop => handle.stop().await,
        Command::Status => {
            match serde_json::to_string_pretty(&handle.status()) {
                Ok(json) => println!("{}", json),
                Err(e) => log::warn!("Failed to render status: {}", e),
            }
            Ok(())
        }
        Command::Metrics => match handle.metrics().await {
            Ok(summary) => {
                match serde_json::to_string_pretty(&summary) {
                    Ok(json) => println!("{}", json),
                    Err(e) => log::warn!("Failed to render metrics: {}", e),
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::Save => {
            match save_current_settings(settings_path, settings) {
                Ok(path) => println!("Settings saved to {:?}", path),
                Err(e) => println!("! {}", e),
            }
            Ok(())
        }
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Quit => return false,
    };

    if let Err(e) = result {
        println!("! {}", e);
    }
    true
}

async fn print_status(mut rx: watch::Receiver<SessionStatus>) {
    let mut last = rx.borrow_and_update().clone();

    while rx.changed().await.is_ok() {
        let status = rx.borrow_and_update().clone();

        if status.phase != last.phase {
            match &status.error {
                Some(error) => println!("\n[{}] {}", phase_label(status.phase), error),
                None => println!("\n[{}]", phase_label(status.phase)),
            }
        }

        let old_line = last.last_transcript_lines.last().map(String::as_str);
        if let Some(line) = status.last_transcript_lines.last() {
            if old_line != Some(line.as_str()) {
                let (new_turn, text) = transcript_update(old_line, line);
                if new_turn {
                    print!("\n> {}", text);
                } else {
                    print!("{}", text);
                }
                let _ = std::io::stdout().flush();
            }
        }

        last = status;
    }
}

async fn run_console(
    settings: VoiceSettings,
    settings_path: Option<PathBuf>,
    api_key: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let (handle, loop_task) = spawn_session(
        settings.clone(),
        LiveConnector::new(settings.clone(), api_key),
    );
    let printer = tokio::spawn(print_status(handle.subscribe()));

    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_command(&line) {
                    Some(command) => {
                        let keep_going = handle_command(
                            &handle,
                            command,
                            &settings,
                            settings_path.as_deref(),
                        )
                        .await;
                        if !keep_going {
                            break;
                        }
                    }
                    None => println!("Unknown command: {:?}", line.trim()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl+C received");
                break;
            }
        }
    }

    handle.shutdown();
    if let Err(e) = loop_task.await {
        log::error!("Session loop panicked: {}", e);
    }
    printer.abort();
    println!();
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    // rustls needs an explicit provider when more than one could be linked
    let _ = rustls::crypto::ring::default_provider().install_default();

    let (settings, settings_path) = match settings::default_settings_path() {
        Ok(path) => {
            log::info!("Settings: {:?}", path);
            (settings::load_settings(&path), Some(path))
        }
        Err(e) => {
            log::warn!("Settings: {}", e);
            (VoiceSettings::default(), None)
        }
    };

    let api_key = streaming::get_api_key().ok_or(StreamingError::MissingApiKey)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    log::info!("Duplex voice console started ({})", settings.model);
    runtime.block_on(run_console(settings, settings_path, api_key))
}
