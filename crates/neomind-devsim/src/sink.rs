//! Message sink exposed by the simulator to its caller.
//!
//! The engine fires the sink on every log line, control-plane transition,
//! stat mutation and successful transform.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::stats::Stats;
use crate::tags::ControlPlane;

/// Outbound observation channel of the simulator.
pub trait MessageSink: Send + Sync {
    /// A formatted console line.
    fn send_console_update(&self, line: &str);

    /// A control-plane transition for one device.
    fn send_as_control_plane(&self, device_id: &str, event: ControlPlane);

    /// The full stats table of one device after a mutation.
    fn send_as_stats(&self, device_id: &str, stats: &Stats);

    /// Live values keyed by property id, after a successful transform.
    fn send_as_live_update(&self, device_id: &str, values: &Map<String, Value>);
}

/// Sink that writes everything to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn send_console_update(&self, line: &str) {
        tracing::info!(target: "neomind_devsim::console", "{}", line);
    }

    fn send_as_control_plane(&self, device_id: &str, event: ControlPlane) {
        tracing::debug!(
            device_id = %device_id,
            scope = %event.0,
            op = %event.1,
            event = %event.2,
            "Control plane"
        );
    }

    fn send_as_stats(&self, device_id: &str, stats: &Stats) {
        tracing::trace!(
            device_id = %device_id,
            msg_count = stats.msg.count,
            twin_count = stats.twin.count,
            errors = stats.errors,
            "Stats updated"
        );
    }

    fn send_as_live_update(&self, device_id: &str, values: &Map<String, Value>) {
        let values = Value::Object(values.clone());
        tracing::trace!(device_id = %device_id, values = %values, "Live update");
    }
}

/// Event forwarded by [`BroadcastSink`] and stored by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Console(String),
    ControlPlane {
        device_id: String,
        event: ControlPlane,
    },
    Stats {
        device_id: String,
        stats: Stats,
    },
    Live {
        device_id: String,
        values: Map<String, Value>,
    },
}

/// Sink that fans events out to subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<SinkEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: SinkEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MessageSink for BroadcastSink {
    fn send_console_update(&self, line: &str) {
        self.publish(SinkEvent::Console(line.to_string()));
    }

    fn send_as_control_plane(&self, device_id: &str, event: ControlPlane) {
        self.publish(SinkEvent::ControlPlane {
            device_id: device_id.to_string(),
            event,
        });
    }

    fn send_as_stats(&self, device_id: &str, stats: &Stats) {
        self.publish(SinkEvent::Stats {
            device_id: device_id.to_string(),
            stats: stats.clone(),
        });
    }

    fn send_as_live_update(&self, device_id: &str, values: &Map<String, Value>) {
        self.publish(SinkEvent::Live {
            device_id: device_id.to_string(),
            values: values.clone(),
        });
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SinkEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    /// Console lines containing `needle`.
    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Console(line) if line.contains(needle) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    /// Latest stats published for a device.
    pub fn last_stats(&self, device_id: &str) -> Option<Stats> {
        self.events.lock().iter().rev().find_map(|e| match e {
            SinkEvent::Stats { device_id: id, stats } if id == device_id => Some(stats.clone()),
            _ => None,
        })
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: SinkEvent) {
        self.events.lock().push(event);
    }
}

impl MessageSink for MemorySink {
    fn send_console_update(&self, line: &str) {
        self.push(SinkEvent::Console(line.to_string()));
    }

    fn send_as_control_plane(&self, device_id: &str, event: ControlPlane) {
        self.push(SinkEvent::ControlPlane {
            device_id: device_id.to_string(),
            event,
        });
    }

    fn send_as_stats(&self, device_id: &str, stats: &Stats) {
        self.push(SinkEvent::Stats {
            device_id: device_id.to_string(),
            stats: stats.clone(),
        });
    }

    fn send_as_live_update(&self, device_id: &str, values: &Map<String, Value>) {
        self.push(SinkEvent::Live {
            device_id: device_id.to_string(),
            values: values.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{ControlEvent, Operation, Scope};

    #[test]
    fn test_memory_sink_records() {
        let sink = MemorySink::new();
        sink.send_console_update("[HUB][PROC][d1] connected");
        sink.send_as_control_plane(
            "d1",
            ControlPlane(Scope::Hub, Operation::Proc, ControlEvent::Connected),
        );
        let mut stats = Stats::new();
        stats.errors = 2;
        sink.send_as_stats("d1", &stats);

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.lines_containing("connected").len(), 1);
        assert_eq!(sink.last_stats("d1").map(|s| s.errors), Some(2));
        assert!(sink.last_stats("d2").is_none());
    }

    #[test]
    fn test_tracing_sink_live_update() {
        let mut values = Map::new();
        values.insert("p1".to_string(), Value::from(42));
        TracingSink.send_as_live_update("d1", &values);
        TracingSink.send_as_stats("d1", &Stats::new());
    }

    #[tokio::test]
    async fn test_broadcast_sink() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.send_console_update("hello");
        assert_eq!(rx.recv().await.unwrap(), SinkEvent::Console("hello".to_string()));
    }
}
