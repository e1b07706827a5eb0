//! rivercache - live gauge readings and river timelines from the command line.
//!
//! Every command goes through the same cache, so repeated invocations within
//! a namespace's TTL are answered from the on-disk snapshot without touching
//! the network.

mod app;
mod decoders;

use std::io;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rivercache_core::config::namespaces;
use rivercache_core::utils::{format_age, format_flow, format_level, truncate_string};
use rivercache_core::{Config, MutationEvent, Origin, Payload};

use app::App;

// ============================================================================
// Constants
// ============================================================================

/// Directory for a rotating log file, in addition to stderr.
const LOG_DIR_ENV: &str = "RIVERCACHE_LOG_DIR";

/// Number of timeline rows printed by default.
const DEFAULT_TIMELINE_DAYS: usize = 14;

/// Width of the source column in listings.
const SOURCE_COLUMN_WIDTH: usize = 16;

const USAGE: &str = "\
Usage: rivercache <command> [args]

Commands:
  live <station:province>...     Latest reading per station
  timeline <station:province> [days]
                                 Historical and real-time daily series with the gap between them
  refresh <namespace> <key>      Fetch now, ignoring the cached entry's age
  favorite <station:province>    Toggle a favourite
  favorites                      List favourites
  cache                          Show cached entries
  clear [namespace]              Drop cached entries

Keys look like 08NA011:BC (station number, province code).";

/// Initialize the tracing subscriber for logging.
///
/// Returns the file writer guard, which must stay alive until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "rivercache.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };
    if command == "--help" || command == "-h" {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    let app = App::new(config).await?;
    if let Err(e) = app.load_from_cache().await {
        // A broken snapshot only costs a cold start.
        tracing::warn!(error = %e, "Could not restore local state");
    }
    info!(command = %command, "rivercache starting");

    let result = run(&app, command, &args[1..]).await;
    app.shutdown().await;
    result
}

async fn run(app: &App, command: &str, args: &[String]) -> Result<()> {
    match command {
        "live" => {
            if args.is_empty() {
                bail!("live needs at least one station key");
            }
            print_live(app, args).await;
        }
        "timeline" => {
            let Some(key) = args.first() else {
                bail!("timeline needs a station key");
            };
            let days = match args.get(1) {
                Some(n) => n.parse()?,
                None => DEFAULT_TIMELINE_DAYS,
            };
            print_timeline(app, key, days).await?;
        }
        "refresh" => {
            let [namespace, key] = args else {
                bail!("refresh needs a namespace and a key");
            };
            let resolved = app.refresh(namespace, key).await?;
            println!("{} {}: {}", namespace, key, describe(&resolved.value));
            println!("  source {} ({})", resolved.source, origin_label(resolved.origin));
        }
        "favorite" => {
            let Some(key) = args.first() else {
                bail!("favorite needs a station key");
            };
            toggle_favorite(app, key).await?;
        }
        "favorites" => {
            let members = app.favorites().members();
            if members.is_empty() {
                println!("No favourites yet.");
            }
            for key in members {
                println!("{}", key);
            }
        }
        "cache" => print_cache(app),
        "clear" => {
            let targets: Vec<String> = match args.first() {
                Some(ns) => vec![ns.clone()],
                None => app.config().namespaces.keys().cloned().collect(),
            };
            for namespace in &targets {
                app.invalidate(namespace, None).await;
            }
            println!("Cleared {}", targets.join(", "));
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
    Ok(())
}

fn origin_label(origin: Origin) -> &'static str {
    match origin {
        Origin::Fresh => "cached",
        Origin::Stale => "cached, refreshing",
        Origin::Fetched => "fetched",
        Origin::Deferred => "cached, rate limited",
        Origin::LastKnownGood => "last known good, upstream failing",
    }
}

fn describe(payload: &Payload) -> String {
    match payload {
        Payload::Reading(r) => format!(
            "{} / {} at {}",
            format_flow(r.discharge),
            format_level(r.level),
            r.observed_at.format("%Y-%m-%d %H:%M UTC")
        ),
        Payload::Readings(r) => format!("{} readings", r.len()),
        Payload::Series(s) => match (s.first(), s.last()) {
            (Some(first), Some(last)) => format!("{} days, {} to {}", s.len(), first.date, last.date),
            _ => "empty series".to_string(),
        },
        Payload::Document { .. } => "document".to_string(),
    }
}

async fn print_live(app: &App, keys: &[String]) {
    for (key, result) in app.live(keys).await {
        match result {
            Ok(resolved) => println!(
                "{:<14} {}  [{}, {} {}]",
                key,
                describe(&resolved.value),
                truncate_string(&resolved.source, SOURCE_COLUMN_WIDTH),
                origin_label(resolved.origin),
                format_age(resolved.age)
            ),
            Err(e) if e.all_stale() => println!("{:<14} no recent data (every source is stale)", key),
            Err(e) => println!("{:<14} unavailable: {}", key, e),
        }
    }
}

async fn print_timeline(app: &App, key: &str, days: usize) -> Result<()> {
    let timeline = app.timeline(key).await?;

    if let Some(range) = timeline.historical_range {
        println!("Historical: {} to {}", range.first, range.last);
    }
    if let Some(range) = timeline.realtime_range {
        println!("Real-time:  {} to {}", range.first, range.last);
    }
    match timeline.gap {
        Some(gap) => println!("Gap:        {}", gap),
        None => println!("Gap:        none"),
    }
    println!();

    let skip = timeline.records.len().saturating_sub(days);
    for record in &timeline.records[skip..] {
        println!(
            "{}  {:>14}  {:>10}  {}",
            record.date,
            format_flow(record.discharge),
            format_level(record.level),
            record.source
        );
    }
    Ok(())
}

async fn toggle_favorite(app: &App, key: &str) -> Result<()> {
    let mut events = app.favorites().subscribe();
    let value = app.toggle_favorite(key);
    println!("{} {}", key, if value { "added to favourites" } else { "removed from favourites" });

    // Stay alive until the debounced write lands.
    let wait = app.config().debounce() + Duration::from_secs(10);
    let outcome = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(MutationEvent::Committed { key: k, .. }) if k == key => return Ok(()),
                Ok(MutationEvent::RolledBack { key: k, error, .. }) if k == key => {
                    bail!("Could not save favourite: {}", error)
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => bail!("Favourite events closed"),
            }
        }
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(_) => bail!("Timed out saving favourite"),
    }
}

fn print_cache(app: &App) {
    let cache = app.cache();
    let mut namespaces_seen: Vec<String> = cache.namespaces();
    namespaces_seen.sort();
    for namespace in namespaces_seen {
        let mut entries = cache.entries(&namespace);
        if entries.is_empty() {
            continue;
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        println!("{} ({} entries)", namespace, entries.len());
        for (key, _) in entries {
            if let Some(cached) = cache.get(&namespace, &key) {
                println!(
                    "  {:<14} {:<10} {:<width$} {}",
                    key,
                    format!("{:?}", cached.freshness).to_lowercase(),
                    truncate_string(&cached.source, SOURCE_COLUMN_WIDTH),
                    format_age(cached.age),
                    width = SOURCE_COLUMN_WIDTH
                );
            }
        }
    }
    if cache.is_empty(namespaces::LIVE_READING) {
        println!("No live readings cached.");
    }
}
