//! Meteorological unit conversions and interpolation helpers.
//!
//! All heading math is in degrees, altitudes in meters, pressures in
//! millibars unless a function says otherwise. Callers must not compare
//! interpolated values for exact equality.

use std::f64::consts::PI;

use crate::error::{WxError, WxResult};

/// ISA sea-level pressure in millibars.
pub const ISA_MSL_PRESSURE_MB: f64 = 1013.25;

const PA_TO_INHG: f64 = 0.0002952998016471232;
const MS_TO_KNOTS: f64 = 1.94384;

fn check_finite(name: &str, v: f64) -> WxResult<f64> {
    if !v.is_finite() || v < 0.0 {
        return Err(WxError::InvalidArgument(format!("{}: {}", name, v)));
    }
    Ok(v)
}

/// Pressure altitude in meters for a pressure level, ICAO standard
/// atmosphere inverse.
pub fn mb2alt(mb: f64) -> WxResult<f64> {
    let mb = check_finite("pressure mb", mb)?;
    Ok((1.0 - (mb / ISA_MSL_PRESSURE_MB).powf(0.190284)) * 44307.0)
}

/// Cartesian wind components to polar `(heading_from_deg, magnitude)`.
///
/// The heading is the direction the wind comes from.
pub fn c2p(u: f64, v: f64) -> (f64, f64) {
    let r = u.hypot(v);
    let mut a = u.atan2(v).to_degrees();
    if a < 0.0 {
        a += 360.0;
    }
    if a <= 180.0 {
        a += 180.0;
    } else {
        a -= 180.0;
    }
    (a, r)
}

/// Layer temperature reduced to mean sea level.
///
/// Returns a temperature difference, applied by the consumer to Kelvin
/// values; no 273.15 offset is folded in here.
pub fn oat2msltemp(oat: f64, alt: f64) -> WxResult<f64> {
    let alt = check_finite("altitude", alt)?;
    if alt > 11000.0 {
        // Tropopause, temperature is constant above
        Ok(oat + 71.5)
    } else {
        Ok(oat + 0.0065 * alt)
    }
}

/// Linear interpolation between two layer values by altitude.
pub fn interpolate(v1: f64, v2: f64, alt1: f64, alt2: f64, alt: f64) -> f64 {
    if alt2 - alt1 == 0.0 {
        return v2;
    }
    v1 + (alt - alt1) * (v2 - v1) / (alt2 - alt1)
}

/// Cosine-smoothed interpolation between two layer values.
pub fn cosine_interpolate(v1: f64, v2: f64, alt1: f64, alt2: f64, alt: f64) -> f64 {
    if alt2 - alt1 == 0.0 {
        return v2;
    }
    let x = (alt - alt1) / (alt2 - alt1);
    v1 + (v2 - v1) * (1.0 - (x * PI).cos()) / 2.0
}

/// Cosine interpolation with the fraction raised to `expo`, biasing the
/// blend toward the lower layer.
pub fn expo_cosine_interpolate(v1: f64, v2: f64, alt1: f64, alt2: f64, alt: f64, expo: f64) -> f64 {
    if alt2 - alt1 == 0.0 {
        return v2;
    }
    let x = ((alt - alt1) / (alt2 - alt1)).powf(expo);
    v1 + (v2 - v1) * (1.0 - (x * PI).cos()) / 2.0
}

/// Signed shortest angular distance from `a` to `b` in degrees.
pub fn short_hdg(a: f64, b: f64) -> f64 {
    let a = if a == 360.0 { 0.0 } else { a };
    let b = if b == 360.0 { 0.0 } else { b };
    let (cw, ccw) = if a > b {
        (360.0 - a + b, -(a - b))
    } else {
        (-(360.0 - b + a), b - a)
    };
    if cw.abs() < ccw.abs() {
        cw
    } else {
        ccw
    }
}

fn wrap_heading(h: f64) -> f64 {
    let mut h = h % 360.0;
    if h < 0.0 {
        h += 360.0;
    }
    h
}

/// Interpolate two headings along the shortest arc, result in `[0, 360)`.
pub fn interpolate_heading(h1: f64, h2: f64, alt1: f64, alt2: f64, alt: f64) -> f64 {
    let diff = short_hdg(h1, h2);
    wrap_heading(h1 + interpolate(0.0, diff, alt1, alt2, alt))
}

/// Cosine-smoothed shortest-arc heading interpolation, result in `[0, 360)`.
pub fn cosine_interpolate_heading(h1: f64, h2: f64, alt1: f64, alt2: f64, alt: f64) -> f64 {
    let diff = short_hdg(h1, h2);
    wrap_heading(h1 + cosine_interpolate(0.0, diff, alt1, alt2, alt))
}

/// Visibility in meters estimated from relative humidity.
///
/// Gultepe et al. 2009, <http://journals.ametsoc.org/doi/pdf/10.1175/2009JAMC1927.1>
pub fn rh2visibility(rh: f64) -> f64 {
    1000.0 * (-5.19e-10 * rh.powf(5.44) + 40.10)
}

/// Relative humidity (%) from temperature and dewpoint, Magnus formula.
pub fn dewpoint2rh(temp: f64, dew: f64) -> f64 {
    100.0 * (((17.625 * dew) / (243.04 + dew)).exp() / ((17.625 * temp) / (243.04 + temp)).exp())
}

/// Dewpoint (°C) from temperature (°C) and relative humidity (%), Magnus formula.
pub fn dewpoint(temp: f64, rh: f64) -> f64 {
    let gamma = (rh / 100.0).ln() + (17.625 * temp) / (243.04 + temp);
    243.04 * gamma / (17.625 - gamma)
}

/// GFS percent cloud cover binned to the simulator's 0..4 coverage scale.
pub fn cc2xp(percent: f64) -> u8 {
    if percent < 1.0 {
        0
    } else if percent < 30.0 {
        1
    } else if percent < 55.0 {
        2
    } else if percent < 90.0 {
        3
    } else {
        4
    }
}

/// Pascals to inches of mercury.
pub fn pa2inhg(pa: f64) -> WxResult<f64> {
    let pa = check_finite("pressure pa", pa)?;
    Ok(pa * PA_TO_INHG)
}

/// Meters per second to knots.
pub fn ms2knots(ms: f64) -> f64 {
    ms * MS_TO_KNOTS
}

/// Kelvin to Celsius.
pub fn kel2cel(kelvin: f64) -> f64 {
    kelvin - 273.15
}
