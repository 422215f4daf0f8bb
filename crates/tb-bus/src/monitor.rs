//! Bus liveness tracking for the health endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lapin::Connection;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Records when the AMQP connection was last observed alive.
#[derive(Default)]
pub struct BusMonitor {
    last_beat: RwLock<Option<Instant>>,
}

impl BusMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self) {
        *self.last_beat.write() = Some(Instant::now());
    }

    pub fn seconds_since_last_beat(&self) -> Option<f64> {
        self.last_beat.read().map(|t| t.elapsed().as_secs_f64())
    }
}

/// Periodically check the connection state and stamp the monitor while the
/// connection reports itself connected.
pub fn spawn_bus_monitor(
    connection: Arc<Connection>,
    monitor: Arc<BusMonitor>,
    shutdown_tx: broadcast::Sender<()>,
) -> JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if connection.status().connected() {
                        monitor.touch();
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Bus monitor shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_reports_elapsed_time_after_touch() {
        let monitor = BusMonitor::new();
        assert!(monitor.seconds_since_last_beat().is_none());
        monitor.touch();
        let elapsed = monitor.seconds_since_last_beat().unwrap();
        assert!(elapsed >= 0.0 && elapsed < 1.0);
    }
}
