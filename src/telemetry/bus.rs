//! Telemetry Bus: fan-out of sampler readings and Budget violations.
//!
//! Not named as a distinct component in the distilled spec, but every
//! consumer of C2-C5 needs a way to observe what the Scheduler sees without
//! polling it — this is the observability layer the rest of the system
//! assumes exists. It carries no business logic, only a `broadcast` channel
//! per event kind, mirrored from the teacher's `ReservationBroadcaster`.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::budget::Violation;
use crate::telemetry::thermal::ThermalLevel;

const CHANNEL_CAPACITY: usize = 256;

/// A single telemetry reading, serializable so host bindings can marshal it
/// across a language boundary (no wire format is defined; this is
/// marshaling only).
#[derive(Debug, Clone, Serialize)]
pub enum TelemetryEvent {
    Latency { p50_ms: f64, p95_ms: f64, p99_ms: f64 },
    Thermal { level: i8 },
    Battery { drain_per_600s: Option<f32> },
    Resource { rss_mb: f64, peak_rss_mb: f64 },
    Violation(Violation),
}

impl From<ThermalLevel> for TelemetryEvent {
    fn from(level: ThermalLevel) -> Self {
        TelemetryEvent::Thermal { level: level as i8 }
    }
}

/// Broadcast fan-out of telemetry events. Cloning shares the same
/// underlying channel; subscribers that lag behind the capacity miss the
/// oldest events (`broadcast::error::RecvError::Lagged`), which is
/// acceptable for a dashboard/logging consumer.
#[derive(Clone)]
pub struct TelemetryBus {
    sender: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event; returns silently if there are no subscribers.
    pub fn publish(&self, event: TelemetryEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = TelemetryBus::new();
        let mut rx = bus.subscribe();
        bus.publish(TelemetryEvent::Thermal { level: 2 });
        let event = rx.recv().await.unwrap();
        matches!(event, TelemetryEvent::Thermal { level: 2 });
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = TelemetryBus::new();
        bus.publish(TelemetryEvent::Resource { rss_mb: 10.0, peak_rss_mb: 10.0 });
    }
}
