//! Cycle-dated grib acquisition shared by the GFS and WAFS sources.
//!
//! Each source keeps at most one "current" grib on disk. A tick computes
//! the active cycle, checks whether the matching file is already cached,
//! and otherwise starts (or finishes) a background download. Transient
//! failures arm a fixed cooldown instead of propagating.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use grib_index::VarGroup;
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::DaemonPaths;
use crate::download::{DownloadJob, DownloadOptions};
use crate::sources::{WeatherSource, SHUTDOWN_DEADLINE};

/// Seconds to wait after a failed download before retrying. Re-armed, not
/// compounded, on consecutive failures.
const RETRY_COOLDOWN_SECS: f64 = 60.0;

/// Identity of one published forecast run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleDate {
    /// `YYYYMMDDHH`.
    pub datecycle: String,
    pub cycle: u32,
    /// Forecast hop in hours past the cycle.
    pub forecast: u32,
}

/// The cache-relative grib currently answering queries for a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GribSnapshot {
    pub filename: String,
    pub datecycle: String,
}

/// Shared handle to a source's current grib; the UDP server reads it.
pub type GribSlot = Arc<RwLock<Option<GribSnapshot>>>;

/// Source-specific naming and scheduling, plugged into [`GribSource`].
pub trait GribKind: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cache subdirectory under `cache/`.
    fn cache_dir(&self) -> &'static str;

    /// Delay between a cycle's nominal hour and its publication.
    fn publish_delay(&self) -> chrono::Duration;

    fn cycle_hours(&self) -> &'static [u32] {
        &[0, 6, 12, 18]
    }

    /// Quantize elapsed hours since the cycle into the published step set.
    fn step_forecast(&self, elapsed_hours: u32) -> u32;

    /// Remote file name for a cycle.
    fn remote_file(&self, cycle: &CycleDate) -> String;

    fn url(&self, cycle: &CycleDate) -> String;

    /// Download filter; empty means a full-file transfer.
    fn variable_list(&self) -> Vec<VarGroup>;
}

/// Latest cycle whose publication time has passed, with the forecast hop
/// carried over day boundaries.
pub fn cycle_date<K: GribKind + ?Sized>(kind: &K, now: DateTime<Utc>) -> CycleDate {
    let cnow = now - kind.publish_delay();

    let mut cycle = 0;
    for &c in kind.cycle_hours() {
        if cnow.hour() >= c {
            cycle = c;
        }
    }

    let day_carry = if cnow.day() != now.day() { 24 } else { 0 };
    let elapsed = (day_carry + now.hour()).saturating_sub(cycle);
    let forecast = kind.step_forecast(elapsed);

    CycleDate {
        datecycle: format!("{}{:02}", cnow.format("%Y%m%d"), cycle),
        cycle,
        forecast,
    }
}

/// Driver implementing the download state machine over a [`GribKind`].
pub struct GribSource<K: GribKind> {
    kind: K,
    paths: DaemonPaths,
    client: Client,
    user_agent: String,
    download_enabled: bool,
    keep_old_files: bool,
    slot: GribSlot,
    download_wait: f64,
    job: Option<PendingDownload>,
}

struct PendingDownload {
    job: DownloadJob,
    snapshot: GribSnapshot,
}

impl<K: GribKind> GribSource<K> {
    pub fn new(
        kind: K,
        paths: DaemonPaths,
        client: Client,
        user_agent: String,
        download_enabled: bool,
        keep_old_files: bool,
        slot: GribSlot,
    ) -> Self {
        Self {
            kind,
            paths,
            client,
            user_agent,
            download_enabled,
            keep_old_files,
            slot,
            download_wait: 0.0,
            job: None,
        }
    }

    /// Cache-relative filename for a cycle.
    fn cache_file(&self, cycle: &CycleDate) -> String {
        let remote = self.kind.remote_file(cycle);
        let remote = remote.strip_suffix(".grib2").unwrap_or(&remote);
        format!("{}/{}_{}.grib2", self.kind.cache_dir(), cycle.datecycle, remote)
    }

    async fn finish_job(&mut self, pending: PendingDownload) {
        let result = pending.job.handle.await;

        match result {
            Ok(Ok(())) => {
                let previous = self.slot.read().await.clone();
                if !self.keep_old_files {
                    if let Some(old) = previous {
                        if old.filename != pending.snapshot.filename {
                            let path = self.paths.cache_path().join(&old.filename);
                            tokio::fs::remove_file(&path).await.ok();
                        }
                    }
                }
                info!(
                    source = self.kind.name(),
                    grib = %pending.snapshot.filename,
                    "New grib available"
                );
                *self.slot.write().await = Some(pending.snapshot);
            }
            Ok(Err(e)) => {
                if let wx_common::WxError::Storage(_) = e {
                    // Cache writes are failing; retrying cannot help
                    warn!(source = self.kind.name(), error = %e, "Source disabled until restart");
                    self.download_enabled = false;
                } else {
                    warn!(source = self.kind.name(), error = %e, "Download failed");
                    self.download_wait = RETRY_COOLDOWN_SECS;
                }
            }
            Err(e) => {
                warn!(source = self.kind.name(), error = %e, "Download task died");
                self.download_wait = RETRY_COOLDOWN_SECS;
            }
        }
    }

    fn start_job(&mut self, cycle: &CycleDate, filename: String) {
        let url = self.kind.url(cycle);
        let out_path = self.paths.cache_path().join(&filename);

        let mut opts = DownloadOptions::new(self.user_agent.clone());
        opts.variable_list = self.kind.variable_list();
        opts.repack_with = Some(self.paths.wgrib2_bin.clone());

        info!(source = self.kind.name(), url = %url, "Starting grib download");

        self.job = Some(PendingDownload {
            job: DownloadJob::spawn(self.client.clone(), url, out_path, opts),
            snapshot: GribSnapshot { filename, datecycle: cycle.datecycle.clone() },
        });
    }
}

#[async_trait]
impl<K: GribKind> WeatherSource for GribSource<K> {
    async fn run(&mut self, elapsed: Duration) {
        if !self.download_enabled {
            return;
        }

        if let Some(pending) = self.job.take() {
            if pending.job.is_finished() {
                self.finish_job(pending).await;
            } else {
                self.job = Some(pending);
                return;
            }
        }

        if self.download_wait > 0.0 {
            self.download_wait -= elapsed.as_secs_f64();
            return;
        }

        let cycle = cycle_date(&self.kind, Utc::now());
        let filename = self.cache_file(&cycle);

        let current = self.slot.read().await.clone();
        if current.as_ref().map(|s| s.filename.as_str()) == Some(filename.as_str()) {
            let on_disk = self.paths.cache_path().join(&filename);
            if on_disk.exists() {
                return;
            }
        }

        self.start_job(&cycle, filename);
    }

    async fn shutdown(&mut self) {
        if let Some(pending) = self.job.take() {
            pending.job.abort(SHUTDOWN_DEADLINE).await;
        }
    }
}
