//! Command dispatch.

mod args;
mod cache;
mod watch;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::http_api::HttpSessionApi;
use args::{Cli, Commands};
use casesync_core::{CacheStore, FileCacheBackend};

/// Parse arguments and run the selected command.
pub fn run_cli() -> ExitCode {
    // `init` also routes the core library's `log` records into tracing.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "casesync=info,casesync_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Commands::Config {
        set_server,
        set_token,
        set_user,
    } = cli.command
    {
        return handle_config(config, cli.config.as_deref(), set_server, set_token, set_user);
    }

    if cli.server.is_some() {
        config.server_url = cli.server;
    }
    if cli.token.is_some() {
        config.auth_token = cli.token;
    }
    if cli.cache_dir.is_some() {
        config.cache_dir = cli.cache_dir;
    }

    let result = match cli.command {
        Commands::Watch { case_id, offline } => watch::handle_watch(&config, &case_id, offline),
        Commands::Reference { category, offline } => {
            cache::handle_reference(&config, &category, offline)
        }
        Commands::Cache { command } => cache::handle_cache(&config, command),
        Commands::Config { .. } => Ok(()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            tracing::error!("{}", message);
            eprintln!("Error: {}", message);
            ExitCode::FAILURE
        }
    }
}

fn handle_config(
    mut config: Config,
    path: Option<&std::path::Path>,
    server: Option<String>,
    token: Option<String>,
    user: Option<String>,
) -> ExitCode {
    let changed = server.is_some() || token.is_some() || user.is_some();
    if let Some(server) = server {
        config.server_url = Some(server);
    }
    if let Some(token) = token {
        config.auth_token = Some(token);
    }
    if let Some(user) = user {
        config.user_id = Some(user);
    }

    if changed {
        match config.save(path) {
            Ok(saved) => println!("Saved {}", saved.display()),
            Err(e) => {
                eprintln!("Error saving config: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    println!("Server:    {}", config.server_url.as_deref().unwrap_or("(not configured)"));
    println!(
        "Token:     {}",
        if config.auth_token.is_some() { "(set)" } else { "(not set)" }
    );
    println!("User:      {}", config.user_id.as_deref().unwrap_or("(not set)"));
    println!("Cache dir: {}", config.cache_dir().display());
    println!(
        "Polling:   every {}s, heartbeat every {}s",
        config.sync.poll_interval_secs, config.sync.heartbeat_interval_secs
    );
    ExitCode::SUCCESS
}

/// Open the on-disk snapshot cache.
fn open_cache(config: &Config) -> Result<Arc<CacheStore>, String> {
    let dir = config.cache_dir();
    let backend = FileCacheBackend::open(&dir)
        .map_err(|e| format!("Failed to open cache at {}: {}", dir.display(), e))?;
    Ok(Arc::new(CacheStore::new(backend)))
}

/// Build the HTTP API client from config.
fn http_api(config: &Config) -> Result<Arc<HttpSessionApi>, String> {
    let Some(server) = config.server_url.as_deref() else {
        return Err("No server configured. Pass --server, set CASESYNC_SERVER, or run `casesync config --set-server <url>`".to_string());
    };
    Ok(Arc::new(HttpSessionApi::new(server, config.auth_token.clone())?))
}

/// Runtime for one command.
fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to create Tokio runtime: {}", e))
}
