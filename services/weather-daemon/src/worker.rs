//! Single ticker driving all weather sources.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use crate::sources::WeatherSource;

/// Runs each source's `run(elapsed)` at a fixed rate and coordinates
/// shutdown. Sources are ticked in registration order.
pub struct Worker {
    sources: Vec<Box<dyn WeatherSource>>,
    rate: Duration,
}

impl Worker {
    pub fn new(sources: Vec<Box<dyn WeatherSource>>, rate: Duration) -> Self {
        Self { sources, rate }
    }

    /// Tick until the shutdown channel fires, then stop every source.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.rate);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    for source in &mut self.sources {
                        source.run(self.rate).await;
                    }
                }
            }
        }

        for source in &mut self.sources {
            source.shutdown().await;
        }
        info!("Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingSource {
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    #[async_trait]
    impl WeatherSource for CountingSource {
        async fn run(&mut self, _elapsed: Duration) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
        async fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn ticks_then_shuts_down_each_source() {
        let ticks = Arc::new(AtomicU32::new(0));
        let shutdowns = Arc::new(AtomicU32::new(0));

        let worker = Worker::new(
            vec![Box::new(CountingSource { ticks: ticks.clone(), shutdowns: shutdowns.clone() })],
            Duration::from_millis(10),
        );

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(worker.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
