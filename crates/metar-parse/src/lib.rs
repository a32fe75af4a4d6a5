//! METAR report grammar and station table parsing.
//!
//! The grammar is a deterministic set of regular expressions applied to the
//! report text before any `TEMPO` or `RMK` section. Reports come from
//! several upstreams (NOAA cycle files, VATSIM, IVAO) that share the
//! `ICAO DDHHMMZ ...` line shape.

pub mod report;
pub mod stations;

pub use report::{
    parse_report, CloudLayer, ParsedMetar, Precipitation, RunwayVisualRange, Temperature, Wind,
};
pub use stations::{observation_timestamp, parse_station_line, scan_report_line, ReportLine, Station};
