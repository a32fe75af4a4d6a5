//! METAR report text parsing.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use wx_common::units;

lazy_static! {
    static ref RE_CLOUD: Regex =
        Regex::new(r"\b(FEW|BKN|SCT|OVC|VV)([0-9]+)([A-Z]{2,3})?\b").unwrap();
    static ref RE_WIND: Regex =
        Regex::new(r"\b(VRB|[0-9]{3})([0-9]{2,3})(G[0-9]{2,3})?(MPH|KT?|MPS|KMH)\b").unwrap();
    static ref RE_VARIABLE_WIND: Regex = Regex::new(r"\b([0-9]{3})V([0-9]{3})\b").unwrap();
    static ref RE_VISIBILITY: Regex = Regex::new(
        r"(?:^|\s)(?:(CAVOK)|([PM])?([0-9]{4})|([0-9] )?([0-9]{1,2})(/[0-9])?(SM|KM))(?:\s|$)"
    )
    .unwrap();
    static ref RE_PRESSURE: Regex = Regex::new(r"\b(QNH|Q|SLP|A) ?([0-9]{3,4})\b").unwrap();
    static ref RE_TEMPERATURE: Regex =
        Regex::new(r"(?:^|\s)(M|-)?([0-9]{1,2})/(M|-)?([0-9]{1,2})(?:\s|$)").unwrap();
    static ref RE_TEMPERATURE2: Regex =
        Regex::new(r"\bT([01])([0-9]{3})([01])([0-9]{3})\b").unwrap();
    static ref RE_PRECIPITATION: Regex =
        Regex::new(r"([-+])?(RE)?(DZ|SG|IC|PL|SH)?(DZ|RA|SN|TS)(NO|E)?").unwrap();
    static ref RE_RVR: Regex =
        Regex::new(r"\bR([0-9]{2}[LCR]?)/([PM])?([0-9]{4})([UDN])?\b").unwrap();
}

const STATUTE_MILE_M: f64 = 1609.34;

/// Surface wind. Gust is stored as the increment over the sustained speed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Wind {
    pub heading: f64,
    pub speed_kt: f64,
    pub gust_kt: f64,
}

/// A reported cloud layer. Altitude is MSL meters (report value is AGL
/// hundreds of feet, corrected with the field elevation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudLayer {
    pub alt_m: f64,
    pub coverage: String,
    pub cloud_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    pub temp_c: f64,
    pub dew_c: f64,
}

/// One precipitation kind present in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precipitation {
    /// `-`, `+` or empty.
    pub intensity: String,
    /// Descriptor such as `SH`, when present.
    pub modifier: Option<String>,
    pub recent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunwayVisualRange {
    pub runway: String,
    pub heading: f64,
    pub visibility_m: f64,
    /// `P` (more than) or `M` (less than).
    pub prefix: Option<String>,
    /// `U`, `D` or `N` tendency.
    pub trend: Option<String>,
}

/// A fully parsed METAR observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedMetar {
    pub icao: String,
    /// Raw report text as stored (without the leading ICAO).
    pub metar: String,
    pub elevation: f64,
    pub wind: Wind,
    /// `(from, to)` of a variable wind sector.
    pub variable_wind: Option<(f64, f64)>,
    pub clouds: Vec<CloudLayer>,
    pub temperature: Option<Temperature>,
    pub pressure_inhg: Option<f64>,
    pub visibility_m: f64,
    pub precipitation: BTreeMap<String, Precipitation>,
    pub rvr: Vec<RunwayVisualRange>,
}

impl ParsedMetar {
    fn new(icao: &str, metar: &str, elevation: f64) -> Self {
        Self {
            icao: icao.to_string(),
            metar: metar.to_string(),
            elevation,
            wind: Wind::default(),
            variable_wind: None,
            clouds: Vec::new(),
            temperature: None,
            pressure_inhg: None,
            visibility_m: 9999.0,
            precipitation: BTreeMap::new(),
            rvr: Vec::new(),
        }
    }
}

/// Parse a METAR report for an airport at `elevation` meters MSL.
///
/// The grammar only sees the part of the report before `TEMPO` and `RMK`.
/// Parsing is total: unrecognized groups are ignored, absent groups leave
/// defaults in place.
pub fn parse_report(icao: &str, metar: &str, elevation: f64) -> ParsedMetar {
    let mut parsed = ParsedMetar::new(icao, metar, elevation);

    let mut body = metar;
    if let Some(pos) = body.find("TEMPO") {
        body = &body[..pos];
    }
    if let Some(pos) = body.find("RMK") {
        body = &body[..pos];
    }

    parse_clouds(&mut parsed, body);
    parse_wind(&mut parsed, body);
    parse_visibility(&mut parsed, body);
    parse_pressure(&mut parsed, body);
    parse_temperature(&mut parsed, body);
    parse_precipitation(&mut parsed, body);
    parse_rvr(&mut parsed, body);

    extend_visibility(&mut parsed);

    parsed
}

fn parse_clouds(parsed: &mut ParsedMetar, body: &str) {
    for caps in RE_CLOUD.captures_iter(body) {
        let hundreds_ft: f64 = match caps[2].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        parsed.clouds.push(CloudLayer {
            alt_m: hundreds_ft * 30.48 + parsed.elevation,
            coverage: caps[1].to_string(),
            cloud_type: caps.get(3).map(|m| m.as_str().to_string()),
        });
    }
}

fn parse_wind(parsed: &mut ParsedMetar, body: &str) {
    if let Some(caps) = RE_WIND.captures(body) {
        let speed: f64 = caps[2].parse().unwrap_or(0.0);
        let gust = caps
            .get(3)
            .and_then(|g| g.as_str()[1..].parse::<f64>().ok())
            .map(|g| g - speed)
            .unwrap_or(0.0);

        let (speed_kt, gust_kt) = match &caps[4] {
            "MPS" => (units::ms2knots(speed), units::ms2knots(gust)),
            "KMH" => (speed / 1.852, gust / 1.852),
            "MPH" => (speed * 0.868976, gust * 0.868976),
            _ => (speed, gust),
        };

        if &caps[1] == "VRB" {
            parsed.wind = Wind { heading: 0.0, speed_kt, gust_kt };
            parsed.variable_wind = Some((0.0, 360.0));
        } else {
            let heading: f64 = caps[1].parse().unwrap_or(0.0);
            parsed.wind = Wind { heading, speed_kt, gust_kt };
        }
    }

    if let Some(caps) = RE_VARIABLE_WIND.captures(body) {
        let from: f64 = caps[1].parse().unwrap_or(0.0);
        let to: f64 = caps[2].parse().unwrap_or(0.0);
        parsed.variable_wind = Some((from, to));
    }
}

fn parse_visibility(parsed: &mut ParsedMetar, body: &str) {
    let Some(caps) = RE_VISIBILITY.captures(body) else {
        return;
    };

    if caps.get(1).is_some() {
        // CAVOK
        parsed.visibility_m = 9999.0;
        return;
    }

    if let Some(meters) = caps.get(3) {
        let mut vis: f64 = meters.as_str().parse().unwrap_or(9999.0);
        if caps.get(2).map(|p| p.as_str()) == Some("P") && vis >= 8000.0 {
            vis = 9999.0;
        }
        parsed.visibility_m = vis;
        return;
    }

    if let Some(value) = caps.get(5) {
        let mut vis: f64 = value.as_str().parse().unwrap_or(0.0);
        if let Some(div) = caps.get(6) {
            if let Ok(d) = div.as_str()[1..].parse::<f64>() {
                if d != 0.0 {
                    vis /= d;
                }
            }
        }
        if let Some(whole) = caps.get(4) {
            if let Ok(w) = whole.as_str().trim().parse::<f64>() {
                vis += w;
            }
        }
        match caps.get(7).map(|u| u.as_str()) {
            Some("SM") => vis *= STATUTE_MILE_M,
            Some("KM") => vis *= 1000.0,
            _ => {}
        }
        parsed.visibility_m = vis;
    }
}

fn parse_pressure(parsed: &mut ParsedMetar, body: &str) {
    let Some(caps) = RE_PRESSURE.captures(body) else {
        return;
    };
    let value: f64 = match caps[2].parse() {
        Ok(v) => v,
        Err(_) => return,
    };

    let inhg = match &caps[1] {
        "A" => Some(value / 100.0),
        "Q" | "QNH" => units::pa2inhg(value * 100.0).ok(),
        "SLP" => {
            // Coded tenths of millibars above 900 or 1000 mb
            let mb = if value > 500.0 { value / 10.0 + 900.0 } else { value / 10.0 + 1000.0 };
            units::pa2inhg(mb * 100.0).ok()
        }
        _ => None,
    };

    // Reject implausible decodes instead of feeding them downstream
    if let Some(inhg) = inhg {
        if inhg > 25.0 && inhg < 35.0 {
            parsed.pressure_inhg = Some(inhg);
        }
    }
}

fn parse_temperature(parsed: &mut ParsedMetar, body: &str) {
    if let Some(caps) = RE_TEMPERATURE2.captures(body) {
        let mut temp: f64 = caps[2].parse::<f64>().unwrap_or(0.0) * 0.1;
        let mut dew: f64 = caps[4].parse::<f64>().unwrap_or(0.0) * 0.1;
        if &caps[1] == "1" {
            temp = -temp;
        }
        if &caps[3] == "1" {
            dew = -dew;
        }
        parsed.temperature = Some(Temperature { temp_c: temp, dew_c: dew });
        return;
    }

    if let Some(caps) = RE_TEMPERATURE.captures(body) {
        let mut temp: f64 = caps[2].parse().unwrap_or(0.0);
        let mut dew: f64 = caps[4].parse().unwrap_or(0.0);
        if caps.get(1).is_some() {
            temp = -temp;
        }
        if caps.get(3).is_some() {
            dew = -dew;
        }
        parsed.temperature = Some(Temperature { temp_c: temp, dew_c: dew });
    }
}

fn parse_precipitation(parsed: &mut ParsedMetar, body: &str) {
    for caps in RE_PRECIPITATION.captures_iter(body) {
        let suffix = caps.get(5).map(|m| m.as_str());
        if suffix == Some("NO") {
            continue;
        }
        let kind = caps[4].to_string();
        let recent = caps.get(2).is_some() || suffix == Some("E");
        parsed.precipitation.insert(
            kind,
            Precipitation {
                intensity: caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string(),
                modifier: caps.get(3).map(|m| m.as_str().to_string()),
                recent,
            },
        );
    }
}

fn parse_rvr(parsed: &mut ParsedMetar, body: &str) {
    for caps in RE_RVR.captures_iter(body) {
        let runway = caps[1].to_string();
        let number: f64 = runway
            .trim_end_matches(|c: char| c.is_ascii_alphabetic())
            .parse()
            .unwrap_or(0.0);
        let visibility_m: f64 = caps[3].parse().unwrap_or(0.0);
        parsed.rvr.push(RunwayVisualRange {
            heading: number * 10.0,
            runway,
            visibility_m,
            prefix: caps.get(2).map(|m| m.as_str().to_string()),
            trend: caps.get(4).map(|m| m.as_str().to_string()),
        });
    }
}

/// When the reported visibility saturates its field, estimate the real
/// value from humidity, never lowering it below the saturated reading.
fn extend_visibility(parsed: &mut ParsedMetar) {
    if parsed.visibility_m < 9999.0 {
        return;
    }
    if let Some(t) = parsed.temperature {
        let rh = units::dewpoint2rh(t.temp_c, t.dew_c);
        parsed.visibility_m = units::rh2visibility(rh).max(9999.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inhg_pressure_and_sm_visibility() {
        let parsed =
            parse_report("KJFK", "121651Z 27010KT 10SM FEW250 24/08 A3012 RMK AO2", 0.0);

        assert_eq!(parsed.pressure_inhg, Some(30.12));
        assert_eq!(parsed.wind, Wind { heading: 270.0, speed_kt: 10.0, gust_kt: 0.0 });
        assert_eq!(parsed.clouds.len(), 1);
        assert!((parsed.clouds[0].alt_m - 7620.0).abs() < 1e-9);
        assert_eq!(parsed.clouds[0].coverage, "FEW");
        let t = parsed.temperature.unwrap();
        assert_eq!((t.temp_c, t.dew_c), (24.0, 8.0));
        // 10SM saturates the field and gets extended via humidity
        assert!(parsed.visibility_m >= 9999.0);
    }

    #[test]
    fn sm_visibility_below_saturation_is_kept() {
        let parsed = parse_report("KJFK", "121651Z 27010KT 4SM FEW250 24/08 A3012", 0.0);
        assert!((parsed.visibility_m - 4.0 * 1609.34).abs() < 1e-6);
    }

    #[test]
    fn hpa_pressure_and_meter_visibility() {
        let parsed = parse_report("EGLL", "121650Z 23015KT 9999 BKN012 15/12 Q1013", 25.0);

        let p = parsed.pressure_inhg.unwrap();
        assert!((p - 29.912).abs() < 0.01);
        assert_eq!(parsed.clouds.len(), 1);
        assert!((parsed.clouds[0].alt_m - (1200.0 * 0.3048 + 25.0)).abs() < 1e-9);
        assert_eq!(parsed.clouds[0].coverage, "BKN");
        // Raw 9999 saturates, extension applies and never lowers it
        assert!(parsed.visibility_m >= 9999.0);
    }

    #[test]
    fn negative_short_temperature() {
        let parsed = parse_report("ESSA", "121650Z 36005KT 9999 M03/M07 Q1020", 0.0);
        let t = parsed.temperature.unwrap();
        assert_eq!((t.temp_c, t.dew_c), (-3.0, -7.0));
    }

    #[test]
    fn t_group_overrides_short_form() {
        let parsed = parse_report("ESSA", "121650Z 36005KT 9999 M03/M07 Q1020 T10031007", 0.0);
        let t = parsed.temperature.unwrap();
        assert!((t.temp_c - -0.3).abs() < 1e-9);
        assert!((t.dew_c - -0.7).abs() < 1e-9);
    }

    #[test]
    fn variable_wind_sector() {
        let parsed = parse_report("LFPG", "121650Z VRB03KT 050V110 CAVOK 18/09 Q1018", 0.0);
        assert_eq!(parsed.wind, Wind { heading: 0.0, speed_kt: 3.0, gust_kt: 0.0 });
        assert_eq!(parsed.variable_wind, Some((50.0, 110.0)));
    }

    #[test]
    fn vrb_without_sector_is_full_circle() {
        let parsed = parse_report("LFPG", "121650Z VRB03KT 2000 18/09 Q1018", 0.0);
        assert_eq!(parsed.variable_wind, Some((0.0, 360.0)));
        assert_eq!(parsed.visibility_m, 2000.0);
    }

    #[test]
    fn gust_is_stored_as_increment() {
        let parsed = parse_report("KORD", "121651Z 27015G25KT 10SM 24/08 A3012", 0.0);
        assert_eq!(parsed.wind.speed_kt, 15.0);
        assert_eq!(parsed.wind.gust_kt, 10.0);
    }

    #[test]
    fn mps_wind_is_converted() {
        let parsed = parse_report("UUEE", "121650Z 18007MPS 9999 15/12 Q1013", 0.0);
        assert!((parsed.wind.speed_kt - 7.0 * 1.94384).abs() < 1e-6);
    }

    #[test]
    fn cavok_reads_9999() {
        let parsed = parse_report("LEBL", "121650Z 23010KT CAVOK 28/04 Q1016", 0.0);
        // Dry air, extension pushes visibility well past the coded limit
        assert!(parsed.visibility_m > 9999.0);
    }

    #[test]
    fn fractional_statute_miles() {
        let parsed = parse_report("KBOS", "121651Z 27010KT 1 1/2SM BR 10/09 A2992", 0.0);
        assert!((parsed.visibility_m - 1.5 * 1609.34).abs() < 1e-6);
    }

    #[test]
    fn slp_pressure_high_and_low_codes() {
        let parsed = parse_report("XXXX", "121650Z 00000KT 9999 SLP132", 0.0);
        // 1013.2 mb
        let p = parsed.pressure_inhg.unwrap();
        assert!((p - 29.92).abs() < 0.02);

        let parsed = parse_report("XXXX", "121650Z 00000KT 9999 SLP982", 0.0);
        // 998.2 mb
        let p = parsed.pressure_inhg.unwrap();
        assert!((p - 29.48).abs() < 0.02);
    }

    #[test]
    fn implausible_pressure_is_dropped() {
        let parsed = parse_report("XXXX", "121650Z 00000KT 9999 Q0013", 0.0);
        assert_eq!(parsed.pressure_inhg, None);
    }

    #[test]
    fn precipitation_kinds() {
        let parsed = parse_report("KSEA", "121651Z 22012KT 4SM -SHRA BKN020 12/10 A2990", 0.0);
        let rain = parsed.precipitation.get("RA").unwrap();
        assert_eq!(rain.intensity, "-");
        assert_eq!(rain.modifier.as_deref(), Some("SH"));
        assert!(!rain.recent);
    }

    #[test]
    fn recent_precipitation_suffix() {
        let parsed = parse_report("KSEA", "121651Z 22012KT 9999 RERA 12/10 Q1013", 0.0);
        assert!(parsed.precipitation.get("RA").unwrap().recent);
    }

    #[test]
    fn tsno_is_dropped() {
        let parsed = parse_report("CYVR", "121651Z 22012KT 9999 TSNO 12/10 Q1013", 0.0);
        assert!(parsed.precipitation.is_empty());
    }

    #[test]
    fn rvr_groups() {
        let parsed =
            parse_report("EDDF", "121650Z 25012KT 0400 R25L/P1500N R07/0900U FG 08/08 Q1022", 0.0);
        assert_eq!(parsed.rvr.len(), 2);
        assert_eq!(parsed.rvr[0].runway, "25L");
        assert_eq!(parsed.rvr[0].heading, 250.0);
        assert_eq!(parsed.rvr[0].visibility_m, 1500.0);
        assert_eq!(parsed.rvr[0].prefix.as_deref(), Some("P"));
        assert_eq!(parsed.rvr[1].runway, "07");
        assert_eq!(parsed.rvr[1].trend.as_deref(), Some("U"));
    }

    #[test]
    fn tempo_section_is_ignored() {
        let parsed =
            parse_report("LOWI", "121650Z 26005KT 9999 FEW030 20/10 Q1019 TEMPO 28020G35KT", 0.0);
        assert_eq!(parsed.wind.heading, 260.0);
        assert_eq!(parsed.wind.speed_kt, 5.0);
    }

    #[test]
    fn parsing_is_idempotent() {
        let raw = "121651Z 27010G20KT 250V300 3/4SM R04R/2000V3000FT RA BR BKN008 OVC012 22/22 A2990";
        let a = parse_report("KJFK", raw, 4.0);
        let b = parse_report("KJFK", raw, 4.0);
        assert_eq!(a, b);
    }

    #[test]
    fn vertical_visibility_is_a_cloud_group() {
        let parsed = parse_report("EDDM", "121650Z 00000KT 0100 FG VV001 08/08 Q1022", 448.0);
        assert_eq!(parsed.clouds.len(), 1);
        assert_eq!(parsed.clouds[0].coverage, "VV");
        assert!((parsed.clouds[0].alt_m - (30.48 + 448.0)).abs() < 1e-9);
    }
}
