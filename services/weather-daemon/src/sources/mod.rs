//! Weather sources driven by the worker ticker.

use std::time::Duration;

use async_trait::async_trait;

pub mod gfs;
pub mod grib;
pub mod metar;
pub mod wafs;

/// Capability every periodically refreshed source provides. Errors never
/// escape `run`: a source records its own failure state and retries later.
#[async_trait]
pub trait WeatherSource: Send {
    /// One worker tick. `elapsed` is the time since the previous tick.
    async fn run(&mut self, elapsed: Duration);

    /// Cancel in-flight work; must return within the shutdown deadline.
    async fn shutdown(&mut self);
}

/// Per-task deadline honored by `shutdown` implementations.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(3);
