//! UDP wire contract between the weather daemon and the simulator plugin.
//!
//! Requests are short ASCII strings; replies are bincode-encoded values
//! behind a one-byte protocol version. The exact bytes are private to the
//! daemon/plugin pair and versioned in lockstep.

pub mod reply;
pub mod request;

pub use reply::{
    decode_reply, encode_reply, encode_reply_bounded, CloudBand, GfsReport, MetarSection, Reply,
    ReplyInfo, TurbulenceLayer, WeatherReport, WindExtras, WindLayer, MAX_REPLY_BYTES,
    PROTOCOL_VERSION,
};
pub use request::Request;
