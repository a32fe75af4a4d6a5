//! Reply types and the versioned binary envelope.

use metar_parse::ParsedMetar;
use serde::{Deserialize, Serialize};

use wx_common::{WxError, WxResult};

/// Bumped whenever the reply layout changes; the plugin refuses mismatches.
pub const PROTOCOL_VERSION: u8 = 3;

/// Upper bound for an encoded reply so it fits a single UDP datagram.
pub const MAX_REPLY_BYTES: usize = 65_000;

/// One wind layer at a pressure altitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindLayer {
    pub alt_m: f64,
    pub heading: f64,
    pub speed_kt: f64,
    pub extras: WindExtras,
}

/// Optional per-layer data riding along with the wind vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindExtras {
    /// Raw model temperature in Kelvin.
    pub temp: Option<f64>,
    /// Relative humidity in percent.
    pub rh: Option<f64>,
    /// Dewpoint in °C.
    pub dew: Option<f64>,
    pub gust_kt: f64,
}

/// A cloud band between two pressure altitudes, coverage in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudBand {
    pub base_m: f64,
    pub top_m: f64,
    pub coverage_pct: f64,
}

/// Gridded-model output at one coordinate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GfsReport {
    /// Ascending by altitude.
    pub winds: Vec<WindLayer>,
    /// Ascending by base.
    pub clouds: Vec<CloudBand>,
    pub pressure_inhg: Option<f64>,
}

/// Turbulence severity at one altitude, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TurbulenceLayer {
    pub alt_m: f64,
    pub severity: f64,
}

/// Nearest-station METAR with its location relative to the query point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetarSection {
    pub report: ParsedMetar,
    pub latlon: (f64, f64),
    pub distance_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyInfo {
    pub lat: f64,
    pub lon: f64,
    /// Datecycle of the grib the reply was drawn from, `"na"` when none.
    pub gfs_cycle: String,
    pub wafs_cycle: String,
}

/// Weather at a coordinate. Sections the daemon cannot fill yet are `None`;
/// the client treats them as "not ready".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub gfs: Option<GfsReport>,
    pub wafs: Option<Vec<TurbulenceLayer>>,
    pub metar: Option<MetarSection>,
    pub info: ReplyInfo,
}

/// Everything the server can send back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    /// Out-of-range coordinate probe.
    False,
    Weather(Box<WeatherReport>),
    /// `?ICAO` lookup result.
    Metar(Box<ParsedMetar>),
    /// Control-verb acknowledgements (`!bye`, `!pong`).
    Text(String),
}

/// Encode a reply with the protocol version prefix.
pub fn encode_reply(reply: &Reply) -> WxResult<Vec<u8>> {
    let mut out = vec![PROTOCOL_VERSION];
    bincode::serialize_into(&mut out, reply)
        .map_err(|e| WxError::BadRequest(format!("encode failed: {}", e)))?;
    Ok(out)
}

/// Decode a versioned reply buffer.
pub fn decode_reply(buf: &[u8]) -> WxResult<Reply> {
    match buf.split_first() {
        Some((&PROTOCOL_VERSION, rest)) => bincode::deserialize(rest)
            .map_err(|e| WxError::BadRequest(format!("decode failed: {}", e))),
        Some((version, _)) => {
            Err(WxError::BadRequest(format!("protocol version mismatch: {}", version)))
        }
        None => Err(WxError::BadRequest("empty reply".into())),
    }
}

/// Encode a reply, pruning the deepest wind layers until it fits in
/// `max_len` bytes. Only weather replies carry enough bulk to need this.
pub fn encode_reply_bounded(reply: &Reply, max_len: usize) -> WxResult<Vec<u8>> {
    let encoded = encode_reply(reply)?;
    if encoded.len() <= max_len {
        return Ok(encoded);
    }

    let Reply::Weather(report) = reply else {
        return Ok(encoded);
    };

    let mut trimmed = report.clone();
    loop {
        let dropped = match trimmed.gfs.as_mut() {
            Some(gfs) => gfs.winds.pop().is_some(),
            None => false,
        };
        if !dropped {
            return Ok(encode_reply(&Reply::Weather(trimmed))?);
        }
        let encoded = encode_reply(&Reply::Weather(trimmed.clone()))?;
        if encoded.len() <= max_len {
            return Ok(encoded);
        }
    }
}
