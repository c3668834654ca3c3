//! `cache` and `reference` command handlers.

use casesync_core::{CacheError, ReferenceCategory, ReferenceData};

use super::args::CacheCommands;
use super::{http_api, open_cache, runtime};
use crate::config::Config;

/// Handle `cache <stats|clear|preload>`.
pub fn handle_cache(config: &Config, command: CacheCommands) -> Result<(), String> {
    let cache = open_cache(config)?;
    match command {
        CacheCommands::Stats => {
            let stats = cache.stats().map_err(|e| e.to_string())?;
            println!("Cache: {}", config.cache_dir().display());
            if stats.is_empty() {
                println!("  (empty)");
            }
            for entry in stats {
                println!(
                    "  {:<32} {:>8} bytes  cached {}",
                    entry.key.to_string(),
                    entry.payload_bytes,
                    entry.cached_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            Ok(())
        }
        CacheCommands::Clear => {
            cache.clear().map_err(|e| e.to_string())?;
            println!("Cache cleared.");
            Ok(())
        }
        CacheCommands::Preload { force } => {
            let api = http_api(config)?;
            let data = ReferenceData::new(api, cache);
            let results = runtime()?.block_on(data.preload(true, force));
            let mut failed = 0;
            for (category, result) in results {
                match result {
                    Ok(list) if list.from_cache && list.is_current() => {
                        println!("  {:<12} {} items (up to date)", category, list.items.len())
                    }
                    Ok(list) if list.from_cache => {
                        println!("  {:<12} {} items (server unreachable, kept cached copy)", category, list.items.len())
                    }
                    Ok(list) => println!("  {:<12} {} items", category, list.items.len()),
                    Err(e) => {
                        failed += 1;
                        println!("  {:<12} failed: {}", category, e);
                    }
                }
            }
            if failed > 0 {
                Err(format!("{} reference list(s) unavailable", failed))
            } else {
                Ok(())
            }
        }
    }
}

/// Handle `reference <category>`.
pub fn handle_reference(config: &Config, category: &str, offline: bool) -> Result<(), String> {
    let category = ReferenceCategory::parse(category).ok_or_else(|| {
        let known: Vec<&str> = ReferenceCategory::ALL.iter().map(|c| c.as_str()).collect();
        format!("Unknown category '{}'. Expected one of: {}", category, known.join(", "))
    })?;

    let cache = open_cache(config)?;
    let loaded = if offline {
        ReferenceData::cached(&cache, category)
    } else {
        let data = ReferenceData::new(http_api(config)?, cache);
        runtime()?.block_on(data.load(category, true))
    };

    let list = match loaded {
        Ok(list) => list,
        Err(CacheError::Miss(key)) => return Err(format!("No offline data available for {}", key)),
        Err(e) => return Err(e.to_string()),
    };

    if list.from_cache {
        eprintln!("(showing cached {} list)", category);
    }
    let rendered = serde_json::to_string_pretty(&list.items).map_err(|e| e.to_string())?;
    println!("{}", rendered);
    Ok(())
}
