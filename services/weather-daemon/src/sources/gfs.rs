//! NOAA GFS global forecast source.
//!
//! Downloads the 0.5 degree `pgrb2full` product through index-driven
//! partial transfers and extracts wind, cloud and pressure profiles at a
//! coordinate with `wgrib2 -s -lon`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use grib_index::VarGroup;
use tracing::warn;

use wx_common::units;
use wx_common::WxResult;
use wx_protocol::{CloudBand, GfsReport, WindExtras, WindLayer};

use crate::sources::grib::{CycleDate, GribKind};
use crate::wgrib2;

const GFS_BASE_URL: &str = "https://nomads.ncep.noaa.gov/pub/data/nccf/com/gfs/prod";

/// GFS naming and scheduling, parameterized by the variable list from
/// `gfs_levels_config.json`.
pub struct GfsKind {
    groups: Vec<VarGroup>,
}

impl GfsKind {
    pub fn new(groups: Vec<VarGroup>) -> Self {
        Self { groups }
    }
}

impl GribKind for GfsKind {
    fn name(&self) -> &'static str {
        "gfs"
    }

    fn cache_dir(&self) -> &'static str {
        "gfs"
    }

    fn publish_delay(&self) -> chrono::Duration {
        chrono::Duration::hours(4) + chrono::Duration::minutes(25)
    }

    fn step_forecast(&self, elapsed_hours: u32) -> u32 {
        elapsed_hours / 3 * 3
    }

    fn remote_file(&self, cycle: &CycleDate) -> String {
        format!("gfs.t{:02}z.pgrb2full.0p50.f0{:02}", cycle.cycle, cycle.forecast)
    }

    fn url(&self, cycle: &CycleDate) -> String {
        format!(
            "{}/gfs.{}/{:02}/{}",
            GFS_BASE_URL,
            &cycle.datecycle[..8],
            cycle.cycle,
            self.remote_file(cycle)
        )
    }

    fn variable_list(&self) -> Vec<VarGroup> {
        self.groups.clone()
    }
}

/// Extract the vertical profile at `(lat, lon)` from a cached GFS grib.
pub async fn parse_at(wgrib2_bin: &Path, grib: &Path, lat: f64, lon: f64) -> WxResult<GfsReport> {
    let lines = wgrib2::extract_at(wgrib2_bin, grib, lat, lon).await?;
    Ok(shape_report(&lines))
}

/// Shape raw wgrib2 records into wind layers, cloud bands and pressure.
pub fn shape_report(lines: &[wgrib2::WgribLine]) -> GfsReport {
    // level mb -> var -> value
    let mut levels: BTreeMap<String, HashMap<&str, f64>> = BTreeMap::new();
    // cloud band -> key (bottom/top/TCDC) -> value
    let mut clouds: BTreeMap<String, HashMap<&str, f64>> = BTreeMap::new();
    let mut pressure_inhg = None;

    for line in lines {
        let tokens: Vec<&str> = line.level.split(' ').collect();
        if tokens.len() < 2 {
            continue;
        }

        match tokens[1] {
            "cloud" => {
                let band = clouds.entry(tokens[0].to_string()).or_default();
                if line.var == "PRES" && tokens.len() > 3 {
                    // `<band> cloud bottom level` / `<band> cloud top level`
                    match tokens[2] {
                        "bottom" => band.insert("bottom", line.value),
                        "top" => band.insert("top", line.value),
                        _ => None,
                    };
                } else if line.var == "TCDC" {
                    band.insert("TCDC", line.value);
                }
            }
            "mb" => {
                let vars = levels.entry(tokens[0].to_string()).or_default();
                match line.var.as_str() {
                    "UGRD" => vars.insert("UGRD", line.value),
                    "VGRD" => vars.insert("VGRD", line.value),
                    "TMP" => vars.insert("TMP", line.value),
                    "RH" => vars.insert("RH", line.value),
                    _ => None,
                };
            }
            "sea" if tokens[0] == "mean" && line.var == "PRMSL" => {
                pressure_inhg = units::pa2inhg(line.value).ok();
            }
            _ => {}
        }
    }

    let mut winds = Vec::new();
    for (level, vars) in &levels {
        let (Some(&u), Some(&v)) = (vars.get("UGRD"), vars.get("VGRD")) else {
            continue;
        };
        let Ok(level_mb) = level.parse::<f64>() else {
            continue;
        };
        let alt_m = match units::mb2alt(level_mb) {
            Ok(alt) => alt,
            Err(e) => {
                warn!(level = %level, error = %e, "Skipping wind level");
                continue;
            }
        };

        let (heading, magnitude) = units::c2p(u, v);

        let temp = vars.get("TMP").copied();
        let rh = vars.get("RH").copied();
        let dew = match (temp, rh) {
            // Model temperature is Kelvin; the Magnus fit wants Celsius
            (Some(t), Some(rh)) => Some(units::dewpoint(units::kel2cel(t), rh)),
            _ => None,
        };

        winds.push(WindLayer {
            alt_m,
            heading,
            speed_kt: units::ms2knots(magnitude),
            extras: WindExtras { temp, rh, dew, gust_kt: 0.0 },
        });
    }

    let mut cloud_bands = Vec::new();
    for band in clouds.values() {
        let (Some(&bottom_pa), Some(&top_pa), Some(&cover)) =
            (band.get("bottom"), band.get("top"), band.get("TCDC"))
        else {
            continue;
        };
        let (Ok(base_m), Ok(top_m)) =
            (units::mb2alt(bottom_pa * 0.01), units::mb2alt(top_pa * 0.01))
        else {
            continue;
        };
        cloud_bands.push(CloudBand { base_m, top_m, coverage_pct: cover });
    }

    winds.sort_by(|a, b| a.alt_m.partial_cmp(&b.alt_m).unwrap_or(std::cmp::Ordering::Equal));
    cloud_bands
        .sort_by(|a, b| a.base_m.partial_cmp(&b.base_m).unwrap_or(std::cmp::Ordering::Equal));

    GfsReport { winds, clouds: cloud_bands, pressure_inhg }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::grib::cycle_date;
    use crate::wgrib2::parse_extract_output;
    use chrono::TimeZone;

    #[test]
    fn url_construction_is_bit_exact() {
        let kind = GfsKind::new(Vec::new());
        let cycle = CycleDate { datecycle: "2024011512".into(), cycle: 12, forecast: 6 };
        assert_eq!(
            kind.url(&cycle),
            "https://nomads.ncep.noaa.gov/pub/data/nccf/com/gfs/prod/gfs.20240115/12/gfs.t12z.pgrb2full.0p50.f006"
        );
    }

    #[test]
    fn forecast_hours_quantize_to_multiples_of_three() {
        let kind = GfsKind::new(Vec::new());
        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 15, 15, 0, 0).unwrap();
        let cycle = cycle_date(&kind, now);
        assert_eq!(cycle.forecast % 3, 0);
    }

    fn sample_lines() -> Vec<wgrib2::WgribLine> {
        parse_extract_output(
            "\
1:0:d=2024011512:UGRD:850 mb:6 hour fcst::lon=2.18,lat=41.38,val=5.0
2:100:d=2024011512:VGRD:850 mb:6 hour fcst::lon=2.18,lat=41.38,val=0.0
3:200:d=2024011512:TMP:850 mb:6 hour fcst::lon=2.18,lat=41.38,val=278.15
4:300:d=2024011512:RH:850 mb:6 hour fcst::lon=2.18,lat=41.38,val=80.0
5:400:d=2024011512:UGRD:500 mb:6 hour fcst::lon=2.18,lat=41.38,val=0.0
6:500:d=2024011512:VGRD:500 mb:6 hour fcst::lon=2.18,lat=41.38,val=10.0
7:600:d=2024011512:PRES:low cloud bottom level:6 hour fcst::lon=2.18,lat=41.38,val=95000
8:700:d=2024011512:PRES:low cloud top level:6 hour fcst::lon=2.18,lat=41.38,val=85000
9:800:d=2024011512:TCDC:low cloud layer:6 hour fcst::lon=2.18,lat=41.38,val=75
10:900:d=2024011512:PRMSL:mean sea level:6 hour fcst::lon=2.18,lat=41.38,val=101325
11:1000:d=2024011512:PRES:high cloud bottom level:6 hour fcst::lon=2.18,lat=41.38,val=30000
",
        )
    }

    #[test]
    fn shapes_winds_clouds_and_pressure() {
        let report = shape_report(&sample_lines());

        // Two complete wind levels, ascending by altitude
        assert_eq!(report.winds.len(), 2);
        assert!(report.winds[0].alt_m < report.winds[1].alt_m);

        // 850 mb layer: westerly 5 m/s
        let low = &report.winds[0];
        assert!((low.heading - 270.0).abs() < 1e-9);
        assert!((low.speed_kt - units::ms2knots(5.0)).abs() < 1e-9);
        assert_eq!(low.extras.temp, Some(278.15));
        assert_eq!(low.extras.rh, Some(80.0));
        let dew = low.extras.dew.unwrap();
        let expected = units::dewpoint(units::kel2cel(278.15), 80.0);
        assert!((dew - expected).abs() < 1e-9);

        // 500 mb layer has no TMP/RH
        assert_eq!(report.winds[1].extras.temp, None);
        assert_eq!(report.winds[1].extras.dew, None);

        // One complete cloud band (the high band is missing its top)
        assert_eq!(report.clouds.len(), 1);
        let cloud = &report.clouds[0];
        assert!(cloud.base_m < cloud.top_m);
        assert_eq!(cloud.coverage_pct, 75.0);

        let p = report.pressure_inhg.unwrap();
        assert!((p - 29.92).abs() < 0.01);
    }

    #[test]
    fn shaping_is_deterministic() {
        let lines = sample_lines();
        assert_eq!(shape_report(&lines), shape_report(&lines));
    }

    #[test]
    fn empty_extraction_gives_empty_report() {
        let report = shape_report(&[]);
        assert!(report.winds.is_empty());
        assert!(report.clouds.is_empty());
        assert_eq!(report.pressure_inhg, None);
    }
}
