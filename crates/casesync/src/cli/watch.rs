//! `watch` command: an interactive case view on the terminal.
//!
//! Reads one command per line from stdin while the session polls in the
//! background. Ctrl+C or `quit` unmounts the session.

use std::sync::Arc;
use std::time::Duration;

use casesync_core::{
    CacheStore, CaseSession, FormSnapshot, SessionError, SessionEvent, SessionObserver,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{http_api, open_cache, runtime};
use crate::config::Config;
use crate::http_api::HttpSessionApi;

/// `leave` is sent from a detached task; give it a moment before the runtime shuts down.
const LEAVE_GRACE: Duration = Duration::from_millis(500);

/// Handle `watch <case_id>`.
pub fn handle_watch(config: &Config, case_id: &str, offline: bool) -> Result<(), String> {
    let cache = open_cache(config)?;
    let api = http_api(config)?;

    println!("Opening case {}", case_id);
    println!("  Server: {}", config.server_url.as_deref().unwrap_or_default());
    println!("  Cache:  {}", config.cache_dir().display());
    if offline {
        println!("  Starting offline");
    }
    println!();

    runtime()?.block_on(run_watch(config, case_id, offline, api, cache))
}

async fn run_watch(
    config: &Config,
    case_id: &str,
    offline: bool,
    api: Arc<HttpSessionApi>,
    cache: Arc<CacheStore>,
) -> Result<(), String> {
    let mut builder = CaseSession::builder(case_id, api, cache)
        .config(config.sync.clone())
        .observer(Arc::new(TerminalObserver))
        .online(!offline);
    if let Some(user) = &config.user_id {
        builder = builder.author(user.clone());
    }
    let session = builder.build();

    match session.mount().await {
        Ok(()) => {}
        Err(SessionError::Unavailable(id)) => {
            return Err(format!(
                "Case {} is unavailable: no connection and no offline data",
                id
            ));
        }
        Err(e) => eprintln!("Warning: {} (type `retry` to join again)", e),
    }
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(command) = parse_command(&line) else {
                        continue;
                    };
                    if !run_command(&session, command).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    eprintln!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    println!("Leaving case {}...", case_id);
    session.flush_writes().await;
    session.unmount();
    tokio::time::sleep(LEAVE_GRACE).await;
    Ok(())
}

/// A line typed by the user.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Set(String, Value),
    Show,
    Who,
    Pending,
    Hide,
    Visible,
    Offline,
    Online,
    Retry,
    Help,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();

    Some(match word {
        "set" => match rest.split_once(char::is_whitespace) {
            Some((field, raw)) => Command::Set(field.to_string(), parse_value(raw.trim())),
            None if !rest.is_empty() => Command::Set(rest.to_string(), Value::Null),
            None => Command::Unknown(line.to_string()),
        },
        "show" | "status" => Command::Show,
        "who" => Command::Who,
        "pending" => Command::Pending,
        "hide" => Command::Hide,
        "visible" | "show-view" => Command::Visible,
        "offline" => Command::Offline,
        "online" => Command::Online,
        "retry" => Command::Retry,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    })
}

/// JSON if it parses, otherwise the raw text.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Run one command. Returns `false` to stop.
async fn run_command(session: &CaseSession, command: Command) -> bool {
    match command {
        Command::Set(field, value) => match session.write(field.as_str(), value) {
            Ok(update) => println!("  {} = {}", update.key, update.value),
            Err(e) => eprintln!("  {}", e),
        },
        Command::Show => print_form(session),
        Command::Who => {
            let participants = session.participants();
            if participants.is_empty() {
                println!("  (nobody else here)");
            }
            for p in participants {
                println!(
                    "  {} ({:?}) last seen {}",
                    p.display_name,
                    p.role,
                    p.last_activity.format("%H:%M:%S")
                );
            }
        }
        Command::Pending => {
            let pending = session.pending_writes();
            if pending.is_empty() {
                println!("  (no queued edits)");
            }
            for write in pending {
                println!(
                    "  {} = {} (edited {}, {} failed replays)",
                    write.key,
                    write.value,
                    write.timestamp.format("%H:%M:%S"),
                    write.retry_count
                );
            }
        }
        Command::Hide => report(session.set_visible(false).await),
        Command::Visible => report(session.set_visible(true).await),
        Command::Offline => report(session.set_online(false).await),
        Command::Online => report(session.set_online(true).await),
        Command::Retry => report(session.retry_join().await),
        Command::Help => print_help(),
        Command::Quit => return false,
        Command::Unknown(line) => eprintln!("  Unknown command: {} (try `help`)", line),
    }
    true
}

fn report(result: Result<(), SessionError>) {
    if let Err(e) = result {
        eprintln!("  {}", e);
    }
}

fn print_form(session: &CaseSession) {
    let form: FormSnapshot = session.form();
    let timers = session.timer_status();
    println!("  Case {}: {:?}", session.id(), form.status);
    println!(
        "  Presence: {:?}  Data: {}  Polling: {}  Heartbeat: {}",
        session.presence(),
        if session.is_degraded() { "cached" } else { "live" },
        if timers.form_polling { "on" } else { "off" },
        if timers.heartbeat { "on" } else { "off" },
    );
    for (key, entry) in form.fields.iter() {
        let by = entry.updated_by.as_deref().unwrap_or("?");
        println!("    {:<24} {} ({})", key.as_str(), entry.value, by);
    }
}

fn print_help() {
    println!("Commands:");
    println!("  set <field> <value>   edit a field (value is JSON or plain text)");
    println!("  show                  print the form");
    println!("  who                   list participants");
    println!("  pending               list edits waiting for the server");
    println!("  hide | visible        simulate the view losing or regaining focus");
    println!("  offline | online      simulate connectivity changes");
    println!("  retry                 join again after a failed join");
    println!("  quit                  leave the case");
}

/// Prints session events as they happen.
struct TerminalObserver;

impl SessionObserver for TerminalObserver {
    fn on_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { .. } | SessionEvent::PresenceChanged(_) => {}
            SessionEvent::ParticipantsChanged(participants) => {
                tracing::debug!("{} participant(s)", participants.len());
            }
            SessionEvent::DegradedModeChanged(true) => {
                println!("! Connection problem: showing cached data")
            }
            SessionEvent::DegradedModeChanged(false) => println!("! Back on live data"),
            SessionEvent::StatusChanged(status) => println!("! Case status is now {:?}", status),
            SessionEvent::FieldChangedElsewhere {
                key,
                server_value,
                updated_by,
            } => println!(
                "! {} was updated elsewhere{}; your offline edit was dropped (now {})",
                key,
                updated_by.map(|u| format!(" by {}", u)).unwrap_or_default(),
                server_value.unwrap_or(Value::Null)
            ),
            SessionEvent::WriteAbandoned {
                key,
                value,
                attempts,
            } => println!(
                "! Gave up saving {} = {} after {} attempts",
                key, value, attempts
            ),
            SessionEvent::JoinFailed(e) => println!("! {}", e),
            SessionEvent::NoOfflineData(id) => println!("! No offline data available for case {}", id),
            SessionEvent::Unavailable(id) => println!("! Case {} is unavailable", id),
        }
    }
}
