//! METAR acquisition: station catalogue refresh, cyclic report downloads
//! and the `METAR.rwx` dump consumed by the simulator.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Timelike, Utc};
use reqwest::Client;
use tokio::fs;
use tracing::{info, warn};

use metar_parse::{observation_timestamp, parse_station_line, scan_report_line};
use wx_common::WxResult;

use crate::config::{DaemonPaths, MetarSourceKind};
use crate::download::{DownloadJob, DownloadOptions};
use crate::sources::{WeatherSource, SHUTDOWN_DEADLINE};
use crate::store::MetarStore;

const STATIONS_URL: &str = "https://www.aviationweather.gov/docs/metar/stations.txt";

/// Station table refresh period.
const STATION_UPDATE_RATE: i64 = 30 * 86_400;

/// `METAR.rwx` regeneration period in seconds.
const RWX_PERIOD_SECS: f64 = 300.0;

struct PendingFetch {
    job: DownloadJob,
    path: PathBuf,
}

pub struct MetarSource {
    kind: MetarSourceKind,
    paths: DaemonPaths,
    client: Client,
    user_agent: String,
    keep_old_files: bool,
    update_rwx: bool,
    store: MetarStore,
    /// Epoch seconds of the last station refresh, persisted by the owner.
    ms_update: Arc<AtomicI64>,
    /// Set by the UDP server on `!resetMetar`.
    reset_requested: Arc<AtomicBool>,
    station_job: Option<PendingFetch>,
    report_job: Option<PendingFetch>,
    last_report_slot: i64,
    rwx_elapsed: f64,
    disabled: bool,
}

impl MetarSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: MetarSourceKind,
        paths: DaemonPaths,
        client: Client,
        user_agent: String,
        keep_old_files: bool,
        update_rwx: bool,
        store: MetarStore,
        ms_update: Arc<AtomicI64>,
        reset_requested: Arc<AtomicBool>,
    ) -> Self {
        Self {
            kind,
            paths,
            client,
            user_agent,
            keep_old_files,
            update_rwx,
            store,
            ms_update,
            reset_requested,
            station_job: None,
            report_job: None,
            last_report_slot: -1,
            rwx_elapsed: 0.0,
            disabled: false,
        }
    }

    fn note_fetch_error(&mut self, what: &str, e: &wx_common::WxError) {
        if let wx_common::WxError::Storage(_) = e {
            // Cache writes are failing; retrying cannot help
            warn!(what = what, error = %e, "METAR source disabled until restart");
            self.disabled = true;
        } else {
            warn!(what = what, error = %e, "METAR fetch failed");
        }
    }

    fn fetch(&self, url: &str, path: PathBuf) -> PendingFetch {
        let opts = DownloadOptions::new(self.user_agent.clone());
        PendingFetch {
            job: DownloadJob::spawn(self.client.clone(), url.to_string(), path.clone(), opts),
            path,
        }
    }

    async fn poll_station_job(&mut self) {
        let Some(pending) = self.station_job.take() else {
            return;
        };
        if !pending.job.is_finished() {
            self.station_job = Some(pending);
            return;
        }

        match pending.job.handle.await {
            Ok(Ok(())) => match ingest_stations_file(&self.store, &pending.path).await {
                Ok(count) => {
                    self.ms_update.store(Utc::now().timestamp(), Ordering::Relaxed);
                    info!(stations = count, "Station table refreshed");
                }
                Err(e) => warn!(error = %e, "Station table ingest failed"),
            },
            Ok(Err(e)) => self.note_fetch_error("stations", &e),
            Err(e) => warn!(error = %e, "Station table task died"),
        }
    }

    async fn poll_report_job(&mut self) {
        let Some(pending) = self.report_job.take() else {
            return;
        };
        if !pending.job.is_finished() {
            self.report_job = Some(pending);
            return;
        }

        match pending.job.handle.await {
            Ok(Ok(())) => {
                match ingest_report_file(&self.store, &pending.path, Utc::now()).await {
                    Ok((seen, updated)) => {
                        info!(seen = seen, updated = updated, "Report batch applied")
                    }
                    Err(e) => warn!(error = %e, "Report batch ingest failed"),
                }
                if !self.keep_old_files {
                    fs::remove_file(&pending.path).await.ok();
                }
            }
            Ok(Err(e)) => self.note_fetch_error("reports", &e),
            Err(e) => warn!(error = %e, "Report task died"),
        }
    }

    fn start_station_fetch(&mut self) {
        let path = self.paths.cache_path().join("metar").join("stations.txt");
        info!(url = STATIONS_URL, "Refreshing station table");
        self.station_job = Some(self.fetch(STATIONS_URL, path));
    }

    fn start_report_fetch(&mut self) {
        let now = Utc::now();
        // Reports belong to the cycle hour that is still being filled
        let cycle_hour = (now - chrono::Duration::minutes(15)).hour();
        let filename =
            format!("{}_{}_{:02}Z.txt", self.kind.label(), now.timestamp(), cycle_hour);
        let path = self.paths.cache_path().join("metar").join(filename);

        info!(source = self.kind.label(), "Downloading METAR reports");
        self.report_job = Some(self.fetch(self.kind.report_url(), path));
    }
}

#[async_trait]
impl WeatherSource for MetarSource {
    async fn run(&mut self, elapsed: Duration) {
        if self.disabled {
            return;
        }
        self.poll_station_job().await;
        self.poll_report_job().await;

        if self.reset_requested.swap(false, Ordering::Relaxed) {
            match self.store.reset_reports().await {
                Ok(rows) => {
                    info!(rows = rows, "Cleared stored reports");
                    self.last_report_slot = -1;
                }
                Err(e) => warn!(error = %e, "Report reset failed"),
            }
        }

        let now = Utc::now();

        if self.station_job.is_none()
            && now.timestamp() - self.ms_update.load(Ordering::Relaxed) > STATION_UPDATE_RATE
        {
            self.start_station_fetch();
        }

        if self.report_job.is_none() {
            let slot = now.timestamp() / 60 / self.kind.update_rate_min();
            if slot != self.last_report_slot {
                self.last_report_slot = slot;
                self.start_report_fetch();
            }
        }

        self.rwx_elapsed += elapsed.as_secs_f64();
        if self.update_rwx && self.rwx_elapsed >= RWX_PERIOD_SECS {
            self.rwx_elapsed = 0.0;
            match write_rwx(&self.store, &self.paths.metar_rwx()).await {
                Ok(count) => info!(stations = count, "METAR.rwx updated"),
                Err(e) => warn!(error = %e, "METAR.rwx update failed"),
            }
        }
    }

    async fn shutdown(&mut self) {
        if let Some(pending) = self.station_job.take() {
            pending.job.abort(SHUTDOWN_DEADLINE).await;
        }
        if let Some(pending) = self.report_job.take() {
            pending.job.abort(SHUTDOWN_DEADLINE).await;
        }
    }
}

/// Load a fixed-column station file into the store.
pub async fn ingest_stations_file(store: &MetarStore, path: &Path) -> WxResult<u64> {
    let text = fs::read_to_string(path).await?;
    let stations: Vec<_> = text.lines().filter_map(parse_station_line).collect();
    store.upsert_stations(&stations).await
}

/// Apply a report download line by line. Returns `(seen, updated)`.
pub async fn ingest_report_file(
    store: &MetarStore,
    path: &Path,
    now: chrono::DateTime<Utc>,
) -> WxResult<(u64, u64)> {
    let text = fs::read_to_string(path).await?;
    let mut seen = 0u64;
    let mut updated = 0u64;

    for line in text.lines() {
        let Some(report) = scan_report_line(line) else {
            continue;
        };
        let Some(timestamp) = observation_timestamp(report.ddhhmm, now) else {
            continue;
        };
        seen += 1;
        if store.apply_report(report.icao, timestamp, report.report).await? {
            updated += 1;
        }
    }

    Ok((seen, updated))
}

/// Regenerate `METAR.rwx`: one `ICAO <report>` line per reporting station.
/// Written to a temp file and renamed so readers never see partial output.
pub async fn write_rwx(store: &MetarStore, target: &Path) -> WxResult<usize> {
    let reports = store.all_reports().await?;

    let mut out = String::with_capacity(reports.len() * 80);
    for (icao, metar) in &reports {
        out.push_str(icao);
        out.push(' ');
        out.push_str(metar);
        out.push('\n');
    }

    let tmp = target.with_extension("rwx.tmp");
    fs::write(&tmp, out).await?;
    fs::rename(&tmp, target).await?;
    Ok(reports.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use metar_parse::Station;

    async fn store_with_stations() -> MetarStore {
        let store = MetarStore::open_memory().await.unwrap();
        store
            .upsert_stations(&[
                Station { icao: "KJFK".into(), lat: 40.64, lon: -73.78, elevation_m: 4.0 },
                Station { icao: "EGLL".into(), lat: 51.47, lon: -0.46, elevation_m: 25.0 },
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn report_file_ingest_applies_fresh_lines() {
        let store = store_with_stations().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("NOAA_1_16Z.txt");

        tokio::fs::write(
            &path,
            "\
2024/01/12 16:51
KJFK 121651Z 27010KT 10SM FEW250 24/08 A3012
EGLL 121650Z 23015KT 9999 BKN012 15/12 Q1013
ZZZZ 121650Z unknown station report
garbage line
",
        )
        .await
        .unwrap();

        let now = Utc.with_ymd_and_hms(2024, 1, 12, 18, 0, 0).unwrap();
        let (seen, updated) = ingest_report_file(&store, &path, now).await.unwrap();
        assert_eq!(seen, 3);
        assert_eq!(updated, 2);

        let row = store.by_icao("KJFK").await.unwrap().unwrap();
        assert_eq!(row.timestamp, 202401121651);
        assert_eq!(row.metar.as_deref(), Some("121651Z 27010KT 10SM FEW250 24/08 A3012"));

        // A rerun of the same file changes nothing
        let (_, updated) = ingest_report_file(&store, &path, now).await.unwrap();
        assert_eq!(updated, 0);
    }

    #[tokio::test]
    async fn rwx_dump_lists_reports() {
        let store = store_with_stations().await;
        store
            .apply_report("KJFK", 202401121651, "121651Z 27010KT 10SM FEW250 24/08 A3012")
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("METAR.rwx");
        let count = write_rwx(&store, &target).await.unwrap();
        assert_eq!(count, 1);

        let content = tokio::fs::read_to_string(&target).await.unwrap();
        assert_eq!(content, "KJFK 121651Z 27010KT 10SM FEW250 24/08 A3012\n");
        assert!(!dir.path().join("METAR.rwx.tmp").exists());
    }

    #[tokio::test]
    async fn stations_file_ingest() {
        let store = MetarStore::open_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stations.txt");

        tokio::fs::write(
            &path,
            "!comment line\n\
SP BARCELONA/AEROP  LEBL  BCN   08181  41 18N  002 05E    4  X     T          6 SP  \n\
short line\n",
        )
        .await
        .unwrap();

        let count = ingest_stations_file(&store, &path).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.station_count().await.unwrap(), 1);
    }
}
