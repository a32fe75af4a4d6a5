//! Station table and report file line handling.
//!
//! The NOAA station list is a fixed-column text file; report downloads are
//! line-oriented with an `ICAO DDHHMMZ ...` shape (the NOAA CSV variant
//! carries the same text in its first comma-separated field).

use chrono::{DateTime, Datelike, Duration, Utc};

/// One airport row from `stations.txt`.
#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub icao: String,
    pub lat: f64,
    pub lon: f64,
    pub elevation_m: f64,
}

fn col(line: &str, range: std::ops::Range<usize>) -> Option<&str> {
    line.get(range)
}

fn col_char(line: &str, idx: usize) -> Option<char> {
    line.get(idx..idx + 1).and_then(|s| s.chars().next())
}

// stations.txt packs minutes as a separate column, keep four decimals like
// the upstream table
fn degrees_minutes(deg: &str, min: &str) -> Option<f64> {
    let deg: f64 = deg.trim().parse().ok()?;
    let min: f64 = min.trim().parse().ok()?;
    Some(deg + (min / 60.0 * 10000.0).round() / 10000.0)
}

/// Parse one fixed-column station line. Comment lines, short lines and
/// sentinel rows (blank ICAO column, `9` longitude sentinel) yield `None`.
pub fn parse_station_line(line: &str) -> Option<Station> {
    if line.starts_with('!') || line.len() <= 80 {
        return None;
    }
    if col_char(line, 20)? == ' ' || col_char(line, 51)? == '9' {
        return None;
    }

    let icao = col(line, 20..24)?.trim().to_string();
    if icao.is_empty() {
        return None;
    }

    let mut lat = degrees_minutes(col(line, 39..41)?, col(line, 42..44)?)?;
    if col_char(line, 44)? == 'S' {
        lat = -lat;
    }
    let mut lon = degrees_minutes(col(line, 47..50)?, col(line, 51..53)?)?;
    if col_char(line, 53)? == 'W' {
        lon = -lon;
    }
    let elevation_m: f64 = col(line, 55..59)?.trim().parse().ok()?;

    Some(Station { icao, lat, lon, elevation_m })
}

/// A report line split into its stored pieces.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportLine<'a> {
    pub icao: &'a str,
    /// Observation day/time digits (`DDHHMM`).
    pub ddhhmm: &'a str,
    /// Report text as stored, beginning at the time group.
    pub report: &'a str,
}

/// Recognize an observation line: alphabetic first character and the time
/// group's `Z` at column 11. CSV rows are cut at the first comma.
pub fn scan_report_line(line: &str) -> Option<ReportLine<'_>> {
    let line = line.trim_end();
    let first = line.chars().next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if line.get(11..12) != Some("Z") {
        return None;
    }

    let end = line.find(',').unwrap_or(line.len());
    let icao = line.get(0..4)?;
    let ddhhmm = line.get(5..11)?;
    if !ddhhmm.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(ReportLine { icao, ddhhmm, report: line.get(5..end)? })
}

/// Expand a `DDHHMM` time group into a decimal `YYYYMMDDHHMM` timestamp.
///
/// The year and month are taken from `now` when the day-of-month matches
/// today, otherwise from the previous day (month/year boundaries roll over
/// with it).
pub fn observation_timestamp(ddhhmm: &str, now: DateTime<Utc>) -> Option<i64> {
    if ddhhmm.len() != 6 || !ddhhmm.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let day: u32 = ddhhmm[0..2].parse().ok()?;

    let reference = if day == now.day() { now } else { now - Duration::days(1) };

    let stamp = format!("{:04}{:02}{}", reference.year(), reference.month(), ddhhmm);
    stamp.parse().ok()
}
