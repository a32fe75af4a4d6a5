//! Request grammar for the UDP query server.

/// A decoded client request. Anything else is silently dropped by the
/// server.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `?<lat>|<lon>`: weather at a coordinate.
    Weather { lat: f64, lon: f64 },
    /// `?<ICAO>`: METAR lookup for one station.
    MetarIcao(String),
    /// `!shutdown`: persist state and stop the server.
    Shutdown,
    /// `!reload`: reload the plugin-facing settings.
    Reload,
    /// `!resetMetar`: clear stored reports and force a redownload.
    ResetMetar,
    /// `!ping`: liveness probe.
    Ping,
}

impl Request {
    /// Parse a datagram payload. Surrounding whitespace is ignored.
    pub fn parse(data: &str) -> Option<Request> {
        let data = data.trim_matches(|c: char| c.is_ascii_whitespace() || c == '\0');

        if let Some(rest) = data.strip_prefix('?') {
            if let Some((lat, lon)) = rest.split_once('|') {
                let lat: f64 = lat.trim().parse().ok()?;
                let lon: f64 = lon.trim().parse().ok()?;
                return Some(Request::Weather { lat, lon });
            }
            if data.len() == 5 {
                return Some(Request::MetarIcao(rest.to_ascii_uppercase()));
            }
            return None;
        }

        match data {
            "!shutdown" => Some(Request::Shutdown),
            "!reload" => Some(Request::Reload),
            "!resetMetar" => Some(Request::ResetMetar),
            "!ping" => Some(Request::Ping),
            _ => None,
        }
    }
}
