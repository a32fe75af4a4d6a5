//! Invocation of the external `wgrib2` binary.
//!
//! Two forms are used: point extraction (`-s -lon <lon> <lat> <file>`)
//! whose stdout we parse line by line, and repacking a freshly downloaded
//! grib into simple packing so extraction stays fast.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, warn};

use wx_common::{WxError, WxResult};

/// One record extracted at a grid point.
#[derive(Debug, Clone, PartialEq)]
pub struct WgribLine {
    pub var: String,
    pub level: String,
    pub forecast: String,
    /// Statistical annotation column, e.g. `spatial max`; empty for plain
    /// records.
    pub maxave: String,
    pub value: f64,
}

fn command(bin: &Path) -> Command {
    let mut cmd = Command::new(bin);
    cmd.stdin(std::process::Stdio::null());
    cmd.kill_on_drop(true);
    #[cfg(windows)]
    {
        // CREATE_NO_WINDOW, keeps the console hidden on Windows hosts
        cmd.creation_flags(0x0800_0000);
    }
    cmd
}

/// Extract all records of `grib` at the nearest native grid point.
pub async fn extract_at(bin: &Path, grib: &Path, lat: f64, lon: f64) -> WxResult<Vec<WgribLine>> {
    let output = command(bin)
        .arg("-s")
        .arg("-lon")
        .arg(format!("{}", lon))
        .arg(format!("{}", lat))
        .arg(grib)
        .output()
        .await
        .map_err(|e| WxError::Subprocess { status: -1, message: e.to_string() })?;

    if !output.status.success() {
        return Err(WxError::Subprocess {
            status: output.status.code().unwrap_or(-1),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_extract_output(&stdout))
}

/// Parse `wgrib2 -s -lon` stdout. Lines that do not carry the expected
/// column count are dropped, not fatal.
pub fn parse_extract_output(stdout: &str) -> Vec<WgribLine> {
    let mut lines = Vec::new();

    for line in stdout.lines() {
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 8 {
            warn!(line = %line, "Unexpected wgrib2 column count, skipping");
            continue;
        }

        // Last column reads `lon=...,lat=...,val=...`
        let value = fields[7]
            .split(',')
            .nth(2)
            .and_then(|kv| kv.split('=').nth(1))
            .and_then(|v| v.trim().parse::<f64>().ok());

        let Some(value) = value else {
            warn!(line = %line, "Unparseable wgrib2 value, skipping");
            continue;
        };

        lines.push(WgribLine {
            var: fields[3].to_string(),
            level: fields[4].to_string(),
            forecast: fields[5].to_string(),
            maxave: fields[6].to_string(),
            value,
        });
    }

    lines
}

/// Repack a grib into simple packing: `wgrib2 <src> -set_grib_type simple
/// -grib_out <dst>`.
pub async fn repack(bin: &Path, src: &Path, dst: &Path) -> WxResult<()> {
    debug!(src = %src.display(), dst = %dst.display(), "Repacking grib");

    let output = command(bin)
        .arg(src)
        .args(["-set_grib_type", "simple", "-grib_out"])
        .arg(dst)
        .output()
        .await
        .map_err(|e| WxError::Subprocess { status: -1, message: e.to_string() })?;

    if !output.status.success() {
        return Err(WxError::Subprocess {
            status: output.status.code().unwrap_or(-1),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(())
}
