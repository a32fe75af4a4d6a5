//! Settings and server-state persistence.
//!
//! Two versioned binary snapshots live in the daemon's resource directory:
//! the plugin-facing settings and the server's own state (current gribs,
//! station refresh stamp, pid). Both are written atomically and reset to
//! defaults when unreadable or older than the supported version floor.
//! The GFS variable selection is a separate human-editable JSON file.

use std::fs;
use std::path::{Path, PathBuf};

use grib_index::VarGroup;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{info, warn};

/// Daemon version, also reported in the HTTP user agent.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Snapshots written by versions older than this are ignored.
const CONFIG_VERSION_FLOOR: f64 = 2.0;

/// User agent for all upstream requests.
pub fn user_agent() -> String {
    format!("XPNOAAWeather/{}", VERSION)
}

/// Resolved filesystem layout for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    /// Resource directory: snapshots, levels config, cache live here.
    pub res_path: PathBuf,
    /// Simulator system directory, receives `METAR.rwx`.
    pub sim_path: PathBuf,
    /// External grib repacker/extractor.
    pub wgrib2_bin: PathBuf,
}

impl DaemonPaths {
    pub fn cache_path(&self) -> PathBuf {
        self.res_path.join("cache")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.res_path.join("settings.bin")
    }

    pub fn server_state_file(&self) -> PathBuf {
        self.res_path.join("weather_server.bin")
    }

    pub fn gfs_levels_file(&self) -> PathBuf {
        self.res_path.join("gfs_levels_config.json")
    }

    pub fn metar_db(&self) -> PathBuf {
        self.cache_path().join("metar").join("metar.db")
    }

    pub fn metar_rwx(&self) -> PathBuf {
        self.sim_path.join("METAR.rwx")
    }

    /// Create the cache layout the sources expect.
    pub fn ensure_cache_dirs(&self) -> std::io::Result<()> {
        for sub in ["gfs", "wafs", "metar"] {
            fs::create_dir_all(self.cache_path().join(sub))?;
        }
        Ok(())
    }
}

/// Where METAR reports are downloaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetarSourceKind {
    Noaa,
    Vatsim,
    Ivao,
}

impl MetarSourceKind {
    pub fn report_url(&self) -> &'static str {
        match self {
            Self::Noaa => {
                "https://aviationweather.gov/adds/dataserver_current/current/metars.cache.csv.gz"
            }
            Self::Vatsim => "https://metar.vatsim.net/metar.php?id=all",
            Self::Ivao => "https://wx.ivao.aero/metar.php",
        }
    }

    /// Report refresh period in minutes.
    pub fn update_rate_min(&self) -> i64 {
        match self {
            Self::Noaa => 5,
            Self::Vatsim | Self::Ivao => 10,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Noaa => "NOAA",
            Self::Vatsim => "VATSIM",
            Self::Ivao => "IVAO",
        }
    }
}

/// Plugin-facing settings, editable through the simulator UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub version: String,
    pub enabled: bool,
    pub set_wind: bool,
    pub set_clouds: bool,
    pub set_temp: bool,
    pub set_pressure: bool,
    pub set_turb: bool,
    pub set_visibility: bool,
    pub metar_source: MetarSourceKind,
    /// Meters; stations farther away are not applied by the plugin.
    pub metar_distance_limit: f64,
    /// Meters AGL below which METAR values win over the model.
    pub metar_agl_limit: f64,
    pub max_visibility: Option<f64>,
    pub max_cloud_height: Option<f64>,
    pub turbulence_probability: f64,
    pub download: bool,
    pub keep_old_files: bool,
    pub update_metar_rwx: bool,
    pub ignore_metar_stations: Vec<String>,
    pub tracker_uid: String,
    pub tracker_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: VERSION.to_string(),
            enabled: true,
            set_wind: true,
            set_clouds: true,
            set_temp: true,
            set_pressure: true,
            set_turb: true,
            set_visibility: false,
            metar_source: MetarSourceKind::Noaa,
            metar_distance_limit: 100_000.0,
            metar_agl_limit: 10.0,
            max_visibility: None,
            max_cloud_height: None,
            turbulence_probability: 1.0,
            download: true,
            keep_old_files: false,
            update_metar_rwx: true,
            ignore_metar_stations: Vec::new(),
            tracker_uid: String::new(),
            tracker_enabled: false,
        }
    }
}

/// Server-side state surviving restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    pub version: String,
    /// Cache-relative path of the current GFS grib.
    pub lastgrib: Option<String>,
    /// Cache-relative path of the current WAFS grib.
    pub lastwafsgrib: Option<String>,
    /// Epoch seconds of the last station-table refresh.
    pub ms_update: i64,
    pub weather_server_pid: Option<u32>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            version: VERSION.to_string(),
            lastgrib: None,
            lastwafsgrib: None,
            ms_update: 0,
            weather_server_pid: None,
        }
    }
}

fn version_number(version: &str) -> f64 {
    let mut parts = version.split('.');
    let major = parts.next().unwrap_or("0");
    let minor = parts.next().unwrap_or("0");
    format!("{}.{}", major, minor).parse().unwrap_or(0.0)
}

/// Load a versioned snapshot, resetting to defaults when the file is
/// missing, corrupt or below the version floor. Corrupt files are removed.
pub fn load_snapshot<T>(path: &Path, version_of: impl Fn(&T) -> &str) -> T
where
    T: DeserializeOwned + Default,
{
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return T::default(),
    };

    match bincode::deserialize::<T>(&bytes) {
        Ok(value) => {
            if version_number(version_of(&value)) < CONFIG_VERSION_FLOOR {
                warn!(path = %path.display(), "Snapshot below version floor, using defaults");
                return T::default();
            }
            value
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt snapshot, removing");
            fs::remove_file(path).ok();
            T::default()
        }
    }
}

/// Atomically persist a snapshot (write `.tmp`, then rename).
pub fn save_snapshot<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let encoded = bincode::serialize(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let tmp = path.with_extension("bin.tmp");
    fs::write(&tmp, encoded)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl Settings {
    pub fn load(path: &Path) -> Self {
        load_snapshot(path, |s: &Settings| &s.version)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        save_snapshot(path, self)
    }
}

impl ServerState {
    pub fn load(path: &Path) -> Self {
        load_snapshot(path, |s: &ServerState| &s.version)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        save_snapshot(path, self)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GfsLevelsFile {
    groups: Vec<VarGroup>,
}

fn group(levels: &[&str], vars: &[&str]) -> VarGroup {
    VarGroup {
        levels: levels.iter().map(|s| s.to_string()).collect(),
        vars: vars.iter().map(|s| s.to_string()).collect(),
    }
}

/// Default GFS download filter: wind/temperature pressure levels, the
/// three cloud bands, and mean sea level pressure.
pub fn default_gfs_groups() -> Vec<VarGroup> {
    vec![
        group(
            &["850 mb", "700 mb", "600 mb", "500 mb", "400 mb", "300 mb", "200 mb", "150 mb"],
            &["TMP", "UGRD", "VGRD"],
        ),
        group(
            &[
                "high cloud bottom level",
                "high cloud layer",
                "high cloud top level",
                "low cloud bottom level",
                "low cloud layer",
                "low cloud top level",
                "middle cloud bottom level",
                "middle cloud layer",
                "middle cloud top level",
            ],
            &["PRES", "TCDC"],
        ),
        group(&["mean sea level"], &["PRMSL"]),
    ]
}

/// Load the GFS variable list, creating the file with defaults on first
/// run. Parse failures fall back to the defaults.
pub fn load_gfs_groups(path: &Path) -> Vec<VarGroup> {
    if !path.exists() {
        let file = GfsLevelsFile { groups: default_gfs_groups() };
        match serde_json::to_string_pretty(&file) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    warn!(path = %path.display(), error = %e, "Could not write default levels config");
                }
            }
            Err(e) => warn!(error = %e, "Could not encode default levels config"),
        }
        return file.groups;
    }

    match fs::read_to_string(path).map_err(|e| e.to_string()).and_then(|text| {
        serde_json::from_str::<GfsLevelsFile>(&text).map_err(|e| e.to_string())
    }) {
        Ok(file) => {
            info!(path = %path.display(), groups = file.groups.len(), "Loaded GFS levels config");
            file.groups
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Bad levels config, using defaults");
            default_gfs_groups()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn settings_roundtrip_is_identical() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.bin");

        let mut settings = Settings::default();
        settings.metar_source = MetarSourceKind::Vatsim;
        settings.ignore_metar_stations = vec!["KXYZ".into()];
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path);
        assert_eq!(loaded, settings);
    }

    #[test]
    fn corrupt_snapshot_is_deleted_and_defaulted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.bin");
        std::fs::write(&path, b"\xff\xfe not a snapshot").unwrap();

        let loaded = Settings::load(&path);
        assert_eq!(loaded, Settings::default());
        assert!(!path.exists());
    }

    #[test]
    fn old_version_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.bin");

        let mut settings = Settings::default();
        settings.version = "1.9".into();
        settings.enabled = false;
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path);
        assert!(loaded.enabled);
        assert_eq!(loaded.version, VERSION);
    }

    #[test]
    fn missing_snapshot_defaults() {
        let dir = tempdir().unwrap();
        let state = ServerState::load(&dir.path().join("absent.bin"));
        assert_eq!(state, ServerState::default());
    }

    #[test]
    fn server_state_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("weather_server.bin");

        let state = ServerState {
            version: VERSION.into(),
            lastgrib: Some("gfs/2024011512_gfs.t12z.pgrb2full.0p50.f006.grib2".into()),
            lastwafsgrib: None,
            ms_update: 1_700_000_000,
            weather_server_pid: Some(4242),
        };
        state.save(&path).unwrap();
        assert_eq!(ServerState::load(&path), state);
    }

    #[test]
    fn levels_config_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gfs_levels_config.json");

        let groups = load_gfs_groups(&path);
        assert_eq!(groups, default_gfs_groups());
        assert!(path.exists());

        // Second load reads the file back
        assert_eq!(load_gfs_groups(&path), groups);
    }

    #[test]
    fn bad_levels_config_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gfs_levels_config.json");
        std::fs::write(&path, "{not json").unwrap();

        assert_eq!(load_gfs_groups(&path), default_gfs_groups());
    }

    #[test]
    fn metar_source_rates() {
        assert_eq!(MetarSourceKind::Noaa.update_rate_min(), 5);
        assert_eq!(MetarSourceKind::Vatsim.update_rate_min(), 10);
        assert_eq!(MetarSourceKind::Ivao.update_rate_min(), 10);
    }
}
