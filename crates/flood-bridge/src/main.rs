// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flood sensor bridge CLI
//!
//! # Usage
//!
//! ```bash
//! # Poll forever using a config file
//! flood-bridge --config bridge.yaml
//!
//! # Also subscribe to live events
//! flood-bridge --config bridge.yaml --live
//!
//! # Show saved cursors
//! flood-bridge --state-file bridge_state.json cursors
//!
//! # Check connectivity to the source and InfluxDB
//! flood-bridge --config bridge.yaml check
//!
//! # Per-stream record counts and last keys in InfluxDB
//! flood-bridge --config bridge.yaml verify
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flood_bridge::influx::FIELD_SOURCE_KEY;
use flood_bridge::live::{run_listener, run_writer, LiveStats};
use flood_bridge::{
    BridgeConfig, CursorStore, EngineOptions, FirebaseSource, InfluxSink, JsonFileCursorStore,
    MeasurementSink, SourceStore, SyncEngine, TagFilter,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

/// Flood sensor bridge
#[derive(Parser, Debug)]
#[command(name = "flood-bridge")]
#[command(about = "Relay flood sensor readings from a realtime database into InfluxDB")]
#[command(version)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cursor snapshot file (overrides sync.state_file)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Enable the live event listener
    #[arg(long)]
    live: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the saved cursor snapshot
    Cursors,

    /// Check connectivity to the source and InfluxDB
    Check,

    /// Show stored record counts and last keys per stream
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = build_config(&args)?;

    match args.command {
        Some(Commands::Cursors) => cmd_cursors(&config),
        Some(Commands::Check) => {
            config.validate()?;
            cmd_check(&config).await
        }
        Some(Commands::Verify) => {
            config.validate()?;
            cmd_verify(&config).await
        }
        None => {
            config.validate()?;
            run(config).await
        }
    }
}

fn build_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::defaults(),
    };
    config.apply_env();

    if let Some(state_file) = &args.state_file {
        config.sync.state_file = state_file.clone();
    }
    if args.live {
        config.live.enabled = true;
    }
    Ok(config)
}

async fn run(config: BridgeConfig) -> Result<()> {
    let timeout = config.sync.request_timeout();
    let source = Arc::new(FirebaseSource::new(&config.source, timeout)?);
    let sink = Arc::new(InfluxSink::new(&config.influxdb, timeout)?);
    let store = JsonFileCursorStore::new(&config.sync.state_file);

    println!("Flood Bridge v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!("Source:   {}", config.source.url);
    println!("InfluxDB: {} (bucket {})", config.influxdb.url, config.influxdb.bucket);
    println!("Streams:  {}", config.streams.join(", "));
    println!("State:    {}", config.sync.state_file.display());
    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(tokio::signal::ctrl_c(), shutdown_tx));

    let mut live_tasks = Vec::new();
    let live_stats = Arc::new(LiveStats::default());
    if config.live.enabled {
        let capacity = config.live.channel_capacity;
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (batch_tx, batch_rx) = mpsc::channel(capacity);

        let subscriber = source.clone();
        let delay = config.live.reconnect_delay();
        let rx = shutdown_rx.clone();
        live_tasks.push(tokio::spawn(async move {
            subscriber.subscribe(event_tx, delay, rx).await;
        }));
        live_tasks.push(tokio::spawn(run_listener(
            event_rx,
            batch_tx,
            live_stats.clone(),
            shutdown_rx.clone(),
        )));
        live_tasks.push(tokio::spawn(run_writer(
            sink.clone(),
            batch_rx,
            live_stats.clone(),
        )));
        tracing::info!("Live event listener enabled");
    }

    let mut engine = SyncEngine::new(source, sink, store, EngineOptions::from_config(&config));
    engine.recover().await;
    engine.run(shutdown_rx).await;

    for task in live_tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "live task ended abnormally");
        }
    }

    let stats = engine.stats();
    println!();
    println!("Cycles:          {}", stats.cycles);
    println!("Records written: {}", stats.records_written);
    println!("Records dropped: {}", stats.records_dropped);
    println!("Write failures:  {}", stats.write_failures);
    println!("Fetch failures:  {}", stats.fetch_failures);
    if config.live.enabled {
        let (events, _, written, failures) = live_stats.snapshot();
        println!("Live events:     {} ({} written, {} failed writes)", events, written, failures);
    }
    Ok(())
}

/// Flip `shutdown` once `signal` fires. If the signal cannot be installed,
/// keep the sender alive so the bridge keeps running.
async fn forward_shutdown<F>(signal: F, shutdown: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            tracing::info!("Shutdown requested");
            let _ = shutdown.send(true);
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
            drop(shutdown);
        }
    }
}

fn cmd_cursors(config: &BridgeConfig) -> Result<()> {
    let store = JsonFileCursorStore::new(&config.sync.state_file);
    let cursors = store
        .load()
        .with_context(|| format!("reading {}", store.path().display()))?;

    println!("Cursor snapshot: {}", store.path().display());
    for stream in &config.streams {
        match cursors.get(stream) {
            Some(cursor) => println!("  {:<16} {}", stream, cursor),
            None => println!("  {:<16} (unset)", stream),
        }
    }
    for (stream, cursor) in cursors.iter().filter(|(s, _)| !config.streams.contains(*s)) {
        println!("  {:<16} {} (not configured)", stream, cursor);
    }
    Ok(())
}

async fn cmd_check(config: &BridgeConfig) -> Result<()> {
    let timeout = config.sync.request_timeout();
    let source = FirebaseSource::new(&config.source, timeout)?;
    let sink = InfluxSink::new(&config.influxdb, timeout)?;

    let source_ok = report("Source", &config.source.url, source.health_check().await);
    let sink_ok = report("InfluxDB", &config.influxdb.url, sink.health_check().await);

    if !(source_ok && sink_ok) {
        bail!("connectivity check failed");
    }
    Ok(())
}

fn report(name: &str, url: &str, result: flood_bridge::Result<bool>) -> bool {
    match result {
        Ok(true) => {
            println!("[ok]   {} {}", name, url);
            true
        }
        Ok(false) => {
            println!("[fail] {} {} (unhealthy response)", name, url);
            false
        }
        Err(e) => {
            println!("[fail] {} {} ({})", name, url, e);
            false
        }
    }
}

async fn cmd_verify(config: &BridgeConfig) -> Result<()> {
    let sink = InfluxSink::new(&config.influxdb, config.sync.request_timeout())?;
    let window = config.sync.recovery_lookback();

    println!(
        "Measurement '{}' in bucket '{}', last {} days:",
        sink.measurement(),
        config.influxdb.bucket,
        config.sync.recovery_lookback_days
    );
    for stream in &config.streams {
        let filter = TagFilter::sensor(stream.as_str());
        let count = sink.count_since(&filter, window).await?;
        let last = sink.query_last(&filter, FIELD_SOURCE_KEY, window).await?;
        println!(
            "  {:<16} {:>8} records  last key {}",
            stream,
            count,
            last.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_sets_shutdown() {
        let (tx, rx) = watch::channel(false);
        forward_shutdown(async { Ok::<(), std::io::Error>(()) }, tx).await;
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_signal_error_keeps_running() {
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(forward_shutdown(
            async { Err::<(), _>(std::io::Error::other("no signal handler")) },
            tx,
        ));

        let changed = tokio::time::timeout(Duration::from_millis(50), rx.changed()).await;
        assert!(changed.is_err(), "sender must neither fire nor drop");
        assert!(!*rx.borrow());
        task.abort();
    }
}
