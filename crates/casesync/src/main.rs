//! `casesync`: terminal client for collaborative case sessions.

/// CLI module - argument parsing and command handlers
mod cli;

/// Config file handling
mod config;

/// HTTP implementation of the session API
mod http_api;

fn main() -> std::process::ExitCode {
    cli::run_cli()
}
