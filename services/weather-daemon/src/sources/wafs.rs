//! WAFS upper-air turbulence source.
//!
//! Downloads the unblended 0.25 degree WAFS grib (full file, no index
//! filter) and extracts a turbulence severity profile: per pressure level,
//! the larger of the clear-air turbulence index and the scaled
//! cumulonimbus top pressure, divided by 6.

use std::collections::BTreeMap;
use std::path::Path;

use grib_index::VarGroup;

use wx_common::units;
use wx_common::WxResult;
use wx_protocol::TurbulenceLayer;

use crate::sources::grib::{CycleDate, GribKind};
use crate::wgrib2;

const WAFS_BASE_URL: &str = "https://www.ftp.ncep.noaa.gov/data/nccf/com/gfs/prod";

/// Published forecast hops for the unblended WAFS product.
const FORECAST_STEPS: [u32; 7] = [6, 9, 12, 15, 18, 21, 24];

pub struct WafsKind;

impl GribKind for WafsKind {
    fn name(&self) -> &'static str {
        "wafs"
    }

    fn cache_dir(&self) -> &'static str {
        "wafs"
    }

    fn publish_delay(&self) -> chrono::Duration {
        chrono::Duration::hours(5)
    }

    fn step_forecast(&self, elapsed_hours: u32) -> u32 {
        FORECAST_STEPS
            .iter()
            .find(|&&step| elapsed_hours <= step)
            .copied()
            .unwrap_or(FORECAST_STEPS[FORECAST_STEPS.len() - 1])
    }

    fn remote_file(&self, cycle: &CycleDate) -> String {
        format!("gfs.t{:02}z.wafs_0p25_unblended.f{:02}.grib2", cycle.cycle, cycle.forecast)
    }

    fn url(&self, cycle: &CycleDate) -> String {
        format!(
            "{}/gfs.{}/{:02}/atmos/{}",
            WAFS_BASE_URL,
            &cycle.datecycle[..8],
            cycle.cycle,
            self.remote_file(cycle)
        )
    }

    fn variable_list(&self) -> Vec<VarGroup> {
        Vec::new()
    }
}

/// Extract the turbulence profile at `(lat, lon)` from a cached WAFS grib.
pub async fn parse_at(
    wgrib2_bin: &Path,
    grib: &Path,
    lat: f64,
    lon: f64,
) -> WxResult<Vec<TurbulenceLayer>> {
    let lines = wgrib2::extract_at(wgrib2_bin, grib, lat, lon).await?;
    Ok(shape_turbulence(&lines))
}

/// Merge CAT/CTP records into per-level severity, ascending by altitude.
pub fn shape_turbulence(lines: &[wgrib2::WgribLine]) -> Vec<TurbulenceLayer> {
    // keyed by integer level millibars so floating altitudes never collide
    let mut severity: BTreeMap<u32, f64> = BTreeMap::new();

    for line in lines {
        if line.maxave != "spatial max" {
            continue;
        }
        let tokens: Vec<&str> = line.level.split(' ').collect();
        if tokens.len() != 2 || tokens[1] != "mb" {
            continue;
        }
        let Ok(level_mb) = tokens[0].parse::<u32>() else {
            continue;
        };

        let mut value = line.value.max(0.0);
        match line.var.as_str() {
            "CTP" => value *= 100.0,
            "CAT" => {}
            _ => continue,
        }

        let entry = severity.entry(level_mb).or_insert(0.0);
        if value > *entry {
            *entry = value;
        }
    }

    let mut layers: Vec<TurbulenceLayer> = severity
        .into_iter()
        .filter_map(|(level_mb, value)| {
            let alt_m = units::mb2alt(level_mb as f64).ok()?;
            Some(TurbulenceLayer { alt_m, severity: value / 6.0 })
        })
        .collect();

    layers.sort_by(|a, b| a.alt_m.partial_cmp(&b.alt_m).unwrap_or(std::cmp::Ordering::Equal));
    layers
}
