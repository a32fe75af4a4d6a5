//! NOAA weather daemon.
//!
//! Long-lived local service that keeps fresh GFS, WAFS and METAR data
//! cached on disk and answers UDP weather queries from the simulator
//! plugin:
//! - cycle-dated grib downloads with index-driven partial transfers
//! - METAR ingestion into SQLite with a spatial nearest-station query
//! - a single-dispatch UDP server re-parsing the cached gribs per request

mod config;
mod download;
mod server;
mod sources;
mod store;
mod wgrib2;
mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{user_agent, DaemonPaths, ServerState, Settings};
use server::ServerContext;
use sources::gfs::GfsKind;
use sources::grib::{GribSlot, GribSnapshot, GribSource};
use sources::metar::MetarSource;
use sources::wafs::WafsKind;
use sources::WeatherSource;
use store::MetarStore;
use worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "weather-daemon")]
#[command(about = "NOAA weather daemon with a UDP query server")]
struct Args {
    /// Resource directory for settings, levels config and the cache
    #[arg(long, env = "WX_RES_PATH", default_value = ".")]
    res_path: PathBuf,

    /// Simulator system directory receiving METAR.rwx
    #[arg(long, env = "WX_SIM_PATH", default_value = ".")]
    sim_path: PathBuf,

    /// Path to the wgrib2 binary
    #[arg(long, env = "WGRIB2_BIN", default_value = "wgrib2")]
    wgrib2_bin: PathBuf,

    /// UDP listen address
    #[arg(long, env = "WX_LISTEN", default_value = "127.0.0.1:8950")]
    listen: String,

    /// Worker tick rate in seconds
    #[arg(long, default_value = "1")]
    tick_rate: u64,

    /// Log filter (tracing env-filter syntax)
    #[arg(long, env = "WX_LOG", default_value = "info")]
    log: String,
}

/// Keep a stored grib reference only while the file is still on disk.
fn validate_snapshot(paths: &DaemonPaths, stored: Option<String>) -> Option<GribSnapshot> {
    let filename = stored?;
    let on_disk = paths.cache_path().join(&filename);
    if !on_disk.exists() {
        warn!(grib = %filename, "Stored grib is gone, ignoring");
        return None;
    }
    let datecycle = PathBuf::from(&filename)
        .file_name()?
        .to_str()?
        .split('_')
        .next()?
        .to_string();
    Some(GribSnapshot { filename, datecycle })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    info!(version = config::VERSION, "Starting weather daemon");

    let paths = DaemonPaths {
        res_path: args.res_path.clone(),
        sim_path: args.sim_path.clone(),
        wgrib2_bin: args.wgrib2_bin.clone(),
    };
    paths.ensure_cache_dirs().context("Could not create cache directories")?;

    let settings = Settings::load(&paths.settings_file());
    let mut state = ServerState::load(&paths.server_state_file());

    // Bind first; a stale daemon holding the port gets one SIGTERM chance
    let socket = server::bind_with_takeover(&args.listen, state.weather_server_pid)
        .await
        .with_context(|| format!("Could not bind {}", args.listen))?;

    // Reload after a takeover so we see the old server's final state
    state = ServerState::load(&paths.server_state_file());
    state.weather_server_pid = Some(std::process::id());
    state.save(&paths.server_state_file()).context("Could not save server state")?;

    let gfs_groups = config::load_gfs_groups(&paths.gfs_levels_file());
    let store = MetarStore::open(&paths.metar_db()).await?;

    let gfs_slot: GribSlot = Arc::new(RwLock::new(validate_snapshot(&paths, state.lastgrib.clone())));
    let wafs_slot: GribSlot =
        Arc::new(RwLock::new(validate_snapshot(&paths, state.lastwafsgrib.clone())));

    let ms_update = Arc::new(AtomicI64::new(state.ms_update));
    let reset_metar = Arc::new(AtomicBool::new(false));
    let client = download::build_client()?;
    let agent = user_agent();

    let gfs_source = GribSource::new(
        GfsKind::new(gfs_groups),
        paths.clone(),
        client.clone(),
        agent.clone(),
        settings.download,
        settings.keep_old_files,
        gfs_slot.clone(),
    );
    let wafs_source = GribSource::new(
        WafsKind,
        paths.clone(),
        client.clone(),
        agent.clone(),
        settings.download,
        settings.keep_old_files,
        wafs_slot.clone(),
    );
    let metar_source = MetarSource::new(
        settings.metar_source,
        paths.clone(),
        client.clone(),
        agent.clone(),
        settings.keep_old_files,
        settings.update_metar_rwx,
        store.clone(),
        ms_update.clone(),
        reset_metar.clone(),
    );

    // Worker order: GFS, METAR, WAFS
    let sources: Vec<Box<dyn WeatherSource>> =
        vec![Box::new(gfs_source), Box::new(metar_source), Box::new(wafs_source)];

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let worker = Worker::new(sources, Duration::from_secs(args.tick_rate.max(1)));
    let worker_handle = tokio::spawn(worker.run(shutdown_tx.subscribe()));

    let settings = Arc::new(RwLock::new(settings));
    let ctx = ServerContext {
        paths: paths.clone(),
        settings: settings.clone(),
        gfs_slot: gfs_slot.clone(),
        wafs_slot: wafs_slot.clone(),
        store,
        reset_metar,
        shutdown_tx: shutdown_tx.clone(),
    };

    tokio::select! {
        result = server::run_server(socket, ctx) => {
            result.context("Query server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt");
            shutdown_tx.send(()).ok();
        }
    }

    // State is persisted only after the worker has fully stopped
    worker_handle.await.ok();

    let final_state = ServerState {
        version: config::VERSION.to_string(),
        lastgrib: gfs_slot.read().await.as_ref().map(|s| s.filename.clone()),
        lastwafsgrib: wafs_slot.read().await.as_ref().map(|s| s.filename.clone()),
        ms_update: ms_update.load(Ordering::Relaxed),
        weather_server_pid: None,
    };
    final_state.save(&paths.server_state_file()).context("Could not save server state")?;
    settings.read().await.save(&paths.settings_file()).context("Could not save settings")?;

    info!("Weather daemon stopped");
    Ok(())
}
