//! UDP query server.
//!
//! One datagram in, at most one datagram out. Every weather query
//! re-parses the current gribs at the requested coordinate; missing
//! sections degrade to empty instead of failing the reply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use metar_parse::{parse_report, ParsedMetar};
use wx_common::geo::great_circle_distance;
use wx_common::{WxError, WxResult};
use wx_protocol::{
    encode_reply_bounded, GfsReport, MetarSection, Reply, ReplyInfo, Request, TurbulenceLayer,
    WeatherReport, MAX_REPLY_BYTES,
};

use crate::config::{DaemonPaths, Settings};
use crate::sources::grib::GribSlot;
use crate::sources::{gfs, wafs};
use crate::store::MetarStore;

/// Cycle string sent when a source has no grib yet.
const CYCLE_NA: &str = "na";

/// Shared state the dispatcher needs to answer queries.
pub struct ServerContext {
    pub paths: DaemonPaths,
    pub settings: Arc<RwLock<Settings>>,
    pub gfs_slot: GribSlot,
    pub wafs_slot: GribSlot,
    pub store: MetarStore,
    /// Handed to the METAR source, set on `!resetMetar`.
    pub reset_metar: Arc<AtomicBool>,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Bind the query socket, taking the port over from a stale daemon once.
///
/// On `AddrInUse` with a recorded pid: SIGTERM it, wait two seconds and
/// retry a single time.
pub async fn bind_with_takeover(addr: &str, previous_pid: Option<u32>) -> WxResult<UdpSocket> {
    match UdpSocket::bind(addr).await {
        Ok(socket) => Ok(socket),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            let Some(pid) = previous_pid else {
                return Err(WxError::PortInUse(addr.to_string()));
            };
            warn!(addr = addr, pid = pid, "Port in use, signalling previous server");
            terminate_pid(pid);
            tokio::time::sleep(Duration::from_secs(2)).await;

            UdpSocket::bind(addr).await.map_err(|_| WxError::PortInUse(addr.to_string()))
        }
        Err(e) => Err(WxError::Storage(e.to_string())),
    }
}

#[cfg(unix)]
fn terminate_pid(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_pid(_pid: u32) {}

/// Serve requests until `!shutdown` arrives.
pub async fn run_server(socket: UdpSocket, ctx: ServerContext) -> WxResult<()> {
    let mut buf = [0u8; 1024];

    info!(addr = %socket.local_addr().map(|a| a.to_string()).unwrap_or_default(), "Query server listening");

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "Socket receive failed");
                continue;
            }
        };

        let data = String::from_utf8_lossy(&buf[..len]);
        let Some(request) = Request::parse(&data) else {
            debug!(peer = %peer, data = %data, "Dropped unparseable request");
            continue;
        };
        debug!(peer = %peer, request = ?request, "Request");

        let (reply, stop) = dispatch(&ctx, request).await;

        if let Some(reply) = reply {
            match encode_reply_bounded(&reply, MAX_REPLY_BYTES) {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, peer).await {
                        warn!(peer = %peer, error = %e, "Reply send failed");
                    }
                }
                Err(e) => warn!(error = %e, "Reply encoding failed"),
            }
        }

        if stop {
            info!("Shutdown requested by client");
            ctx.shutdown_tx.send(()).ok();
            return Ok(());
        }
    }
}

/// Handle one request; returns the optional reply and whether to stop.
pub async fn dispatch(ctx: &ServerContext, request: Request) -> (Option<Reply>, bool) {
    match request {
        Request::Weather { lat, lon } => {
            if lat > 98.0 && lon > 98.0 {
                return (Some(Reply::False), false);
            }
            (Some(Reply::Weather(Box::new(weather_at(ctx, lat, lon).await))), false)
        }
        Request::MetarIcao(icao) => (Some(Reply::Metar(Box::new(metar_lookup(ctx, &icao).await))), false),
        Request::Shutdown => (Some(Reply::Text("!bye".into())), true),
        Request::Reload => {
            let reloaded = Settings::load(&ctx.paths.settings_file());
            *ctx.settings.write().await = reloaded;
            info!("Settings reloaded");
            (None, false)
        }
        Request::ResetMetar => {
            ctx.reset_metar.store(true, Ordering::Relaxed);
            (None, false)
        }
        Request::Ping => (Some(Reply::Text("!pong".into())), false),
    }
}

/// Assemble the full weather record for a coordinate.
async fn weather_at(ctx: &ServerContext, lat: f64, lon: f64) -> WeatherReport {
    let gfs_snapshot = ctx.gfs_slot.read().await.clone();
    let wafs_snapshot = ctx.wafs_slot.read().await.clone();

    let gfs = match &gfs_snapshot {
        Some(snap) => parse_gfs(ctx, &snap.filename, lat, lon).await,
        None => None,
    };
    let wafs = match &wafs_snapshot {
        Some(snap) => parse_wafs(ctx, &snap.filename, lat, lon).await,
        None => None,
    };

    let ignore = ctx.settings.read().await.ignore_metar_stations.clone();
    let metar = nearest_metar(ctx, lat, lon, &ignore).await;

    WeatherReport {
        gfs,
        wafs,
        metar,
        info: ReplyInfo {
            lat,
            lon,
            gfs_cycle: gfs_snapshot.map(|s| s.datecycle).unwrap_or_else(|| CYCLE_NA.into()),
            wafs_cycle: wafs_snapshot.map(|s| s.datecycle).unwrap_or_else(|| CYCLE_NA.into()),
        },
    }
}

async fn parse_gfs(ctx: &ServerContext, filename: &str, lat: f64, lon: f64) -> Option<GfsReport> {
    let path = ctx.paths.cache_path().join(filename);
    if !path.exists() {
        return None;
    }
    match gfs::parse_at(&ctx.paths.wgrib2_bin, &path, lat, lon).await {
        Ok(report) => Some(report),
        Err(e) => {
            warn!(grib = filename, error = %e, "GFS parse failed");
            None
        }
    }
}

async fn parse_wafs(
    ctx: &ServerContext,
    filename: &str,
    lat: f64,
    lon: f64,
) -> Option<Vec<TurbulenceLayer>> {
    let path = ctx.paths.cache_path().join(filename);
    if !path.exists() {
        return None;
    }
    match wafs::parse_at(&ctx.paths.wgrib2_bin, &path, lat, lon).await {
        Ok(layers) => Some(layers),
        Err(e) => {
            warn!(grib = filename, error = %e, "WAFS parse failed");
            None
        }
    }
}

async fn nearest_metar(
    ctx: &ServerContext,
    lat: f64,
    lon: f64,
    ignore: &[String],
) -> Option<MetarSection> {
    let row = match ctx.store.nearest_station(lat, lon, ignore).await {
        Ok(row) => row?,
        Err(e) => {
            warn!(error = %e, "Nearest-station query failed");
            return None;
        }
    };

    let metar = row.metar.as_deref()?;
    Some(MetarSection {
        report: parse_report(&row.icao, metar, row.elevation_m),
        latlon: (row.lat, row.lon),
        distance_m: great_circle_distance(lat, lon, row.lat, row.lon),
    })
}

/// `?ICAO` lookup: the parsed report, or the placeholder record.
async fn metar_lookup(ctx: &ServerContext, icao: &str) -> ParsedMetar {
    match ctx.store.by_icao(icao).await {
        Ok(Some(row)) => {
            if let Some(metar) = row.metar.as_deref() {
                return parse_report(&row.icao, metar, row.elevation_m);
            }
        }
        Ok(None) => {}
        Err(e) => warn!(icao = icao, error = %e, "METAR lookup failed"),
    }
    parse_report("METAR STATION", "NOT AVAILABLE", 0.0)
}
