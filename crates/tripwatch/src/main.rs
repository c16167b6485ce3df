//! `tripwatch` - CLI for the tripwatch pipeline
//!
//! Runs the sampling, buffering, upload and check-in pipeline, and inspects
//! or flushes the local buffer.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use tripwatch::adapters::{
    FixedBattery, InMemoryTrips, LogNotifier, ReplaySource, SwitchableConnectivity, SysfsBattery,
};
use tripwatch::checkin::TripCollaborator;
use tripwatch::cli::{ClearCommand, Cli, Command, ConfigCommand, RunCommand};
use tripwatch::device::BatteryMonitor;
use tripwatch::pipeline::sink_from_config;
use tripwatch::{init_logging, Config, CryptoCodec, EncryptedBuffer, Pipeline, PipelineDeps};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    // `config validate` reports problems instead of failing on them.
    if let Command::Config(ConfigCommand::Validate { file }) = &cli.command {
        let path = file
            .clone()
            .or_else(|| cli.config.clone())
            .unwrap_or_else(Config::default_config_path);
        println!("Validating configuration: {}", path.display());
        match Config::load_from(Some(path)) {
            Ok(_) => println!("Configuration is valid."),
            Err(e) => println!("Configuration error: {e}"),
        }
        return Ok(());
    }

    let config = Config::load_from(cli.config.clone()).context("loading configuration")?;

    match cli.command {
        Command::Run(run) => handle_run(config, run).await,
        Command::Status(status) => handle_status(&config, status.json).await,
        Command::Flush => handle_flush(&config).await,
        Command::Clear(clear) => handle_clear(&config, &clear).await,
        Command::Config(config_cmd) => handle_config(&config, &config_cmd),
    }
}

async fn open_buffer(config: &Config) -> anyhow::Result<EncryptedBuffer> {
    let codec = CryptoCodec::new(config.crypto.kdf_iterations);
    EncryptedBuffer::initialize(config, codec)
        .await
        .context("opening the position buffer")
}

async fn handle_run(config: Config, cmd: RunCommand) -> anyhow::Result<()> {
    let source = ReplaySource::from_path(cmd.source.into(), &cmd.track)
        .with_context(|| format!("reading track {}", cmd.track.display()))?;

    let trips: Option<Arc<dyn TripCollaborator>> = match &cmd.destinations {
        Some(path) => Some(
            InMemoryTrips::load(path)
                .with_context(|| format!("reading destinations {}", path.display()))?,
        ),
        None => None,
    };

    let battery: Arc<dyn BatteryMonitor> = match SysfsBattery::discover() {
        Some(battery) => Arc::new(battery),
        None => Arc::new(FixedBattery(None)),
    };

    let deps = PipelineDeps {
        source: Arc::new(source),
        connectivity: Arc::new(SwitchableConnectivity::new(!cmd.offline)),
        battery,
        sink: sink_from_config(&config.upload)?,
        trips,
        notifier: Arc::new(LogNotifier),
        geocoder: None,
    };

    let pipeline = Pipeline::build(config, deps).await?;
    println!("tripwatch running, press Ctrl-C to stop");
    pipeline
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let buffer = open_buffer(config).await?;
    let stats = buffer.stats()?;
    let retry_batches = buffer.retry_batches()?;
    let retry_records: usize = retry_batches.iter().map(|b| b.records.len()).sum();

    if json {
        let status = serde_json::json!({
            "backend": buffer.backend(),
            "database_path": config.database_path(),
            "fallback_path": config.fallback_path(),
            "buffered": stats,
            "retry_batches": retry_batches.len(),
            "retry_records": retry_records,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("tripwatch status");
        println!("----------------");
        println!("Backend:        {}", buffer.backend());
        println!("Database:       {}", config.database_path().display());
        println!("Online tier:    {}", stats.online);
        println!("Offline tier:   {}", stats.offline);
        println!(
            "Retry queue:    {} batches, {} records",
            retry_batches.len(),
            retry_records
        );
    }
    Ok(())
}

async fn handle_flush(config: &Config) -> anyhow::Result<()> {
    let traveler_id = config.traveler_id()?.to_string();
    let codec = CryptoCodec::new(config.crypto.kdf_iterations);
    let buffer = Arc::new(tokio::sync::Mutex::new(open_buffer(config).await?));

    let coordinator = tripwatch::UploadCoordinator::new(
        buffer,
        codec,
        traveler_id,
        sink_from_config(&config.upload)?,
        Arc::new(SwitchableConnectivity::new(true)),
        &config.upload,
    );
    coordinator.restore_retry_queue().await?;

    let result = coordinator.emergency_flush().await;
    println!(
        "Uploaded {}, failed {}, dropped {}",
        result.uploaded_count, result.failed_count, result.dropped_count
    );
    if let Some(e) = result.error {
        anyhow::bail!("flush incomplete: {e}");
    }
    Ok(())
}

async fn handle_clear(config: &Config, cmd: &ClearCommand) -> anyhow::Result<()> {
    let mut buffer = open_buffer(config).await?;
    for &tier in cmd.tier.tiers() {
        let removed = buffer.clear(tier)?;
        println!("Cleared {removed} {tier} records");
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: &ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if *json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Traveler]");
                println!(
                    "  Id:                 {}",
                    config.traveler.id.as_deref().unwrap_or("(unset)")
                );
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!("  Fallback path:      {}", config.fallback_path().display());
                println!(
                    "  Capacity:           {} online / {} offline",
                    config.storage.online_capacity, config.storage.offline_capacity
                );
                println!();
                println!("[Sampling]");
                println!("  Mode:               {:?}", config.sampling.mode);
                println!(
                    "  Interval:           {} s ({} s on low battery)",
                    config.sampling.interval_secs, config.sampling.low_battery_interval_secs
                );
                println!();
                println!("[Upload]");
                println!(
                    "  Endpoint:           {}",
                    config.upload.endpoint.as_deref().unwrap_or("(log only)")
                );
                println!("  Chunk size:         {}", config.upload.chunk_size);
                println!("  Max retries:        {}", config.upload.max_retries);
                println!();
                println!("[Check-in]");
                println!(
                    "  Grace period:       {} min",
                    config.check_in.grace_period_minutes
                );
                println!("  Radius:             {} m", config.check_in.radius_m);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { .. } => {}
    }
    Ok(())
}
