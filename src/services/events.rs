// Pipeline Events
// Typed fan-out of supervisor events to every subscriber

use std::sync::{Arc, RwLock};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::PipelineState;

/// Severity attached to routed log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Receiver of supervisor events
///
/// Implementations must not block: callbacks run on the supervisor's tasks.
pub trait PipelineEventSink: Send + Sync {
    fn on_log(&self, station_id: &str, severity: LogSeverity, source: &str, message: &str);
    fn on_status_change(&self, station_id: &str, state: PipelineState);
    fn on_now_playing(&self, station_id: &str, track: &str);
}

/// Registry of subscribers; every event goes to every sink in registration order
#[derive(Default)]
pub struct EventHub {
    sinks: RwLock<Vec<Arc<dyn PipelineEventSink>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn PipelineEventSink>) {
        let mut sinks = self.sinks.write().unwrap_or_else(|e| {
            log::warn!("Event hub lock poisoned (subscribe), recovering: {e}");
            e.into_inner()
        });
        sinks.push(sink);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.read().map(|s| s.len()).unwrap_or(0)
    }

    fn snapshot(&self) -> Vec<Arc<dyn PipelineEventSink>> {
        self.sinks.read().map(|s| s.clone()).unwrap_or_default()
    }
}

impl PipelineEventSink for EventHub {
    fn on_log(&self, station_id: &str, severity: LogSeverity, source: &str, message: &str) {
        for sink in self.snapshot() {
            sink.on_log(station_id, severity, source, message);
        }
    }

    fn on_status_change(&self, station_id: &str, state: PipelineState) {
        for sink in self.snapshot() {
            sink.on_status_change(station_id, state);
        }
    }

    fn on_now_playing(&self, station_id: &str, track: &str) {
        for sink in self.snapshot() {
            sink.on_now_playing(station_id, track);
        }
    }
}

/// Serializable form of an event, as pushed to SSE clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PipelineEvent {
    Log {
        station_id: String,
        severity: LogSeverity,
        source: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    StatusChanged {
        station_id: String,
        state: PipelineState,
    },
    NowPlayingChanged {
        station_id: String,
        track: String,
    },
}

impl PipelineEvent {
    pub fn station_id(&self) -> &str {
        match self {
            Self::Log { station_id, .. }
            | Self::StatusChanged { station_id, .. }
            | Self::NowPlayingChanged { station_id, .. } => station_id,
        }
    }

    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::StatusChanged { .. } => "statusChanged",
            Self::NowPlayingChanged { .. } => "nowPlayingChanged",
        }
    }
}

/// Broadcast-channel sink feeding the SSE endpoint
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(512);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: PipelineEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineEventSink for EventBus {
    fn on_log(&self, station_id: &str, severity: LogSeverity, source: &str, message: &str) {
        self.publish(PipelineEvent::Log {
            station_id: station_id.to_string(),
            severity,
            source: source.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn on_status_change(&self, station_id: &str, state: PipelineState) {
        self.publish(PipelineEvent::StatusChanged {
            station_id: station_id.to_string(),
            state,
        });
    }

    fn on_now_playing(&self, station_id: &str, track: &str) {
        self.publish(PipelineEvent::NowPlayingChanged {
            station_id: station_id.to_string(),
            track: track.to_string(),
        });
    }
}

/// Collects events in memory for assertions
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub logs: std::sync::Mutex<Vec<(String, LogSeverity, String, String)>>,
    pub states: std::sync::Mutex<Vec<(String, PipelineState)>>,
    pub tracks: std::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn states_for(&self, station_id: &str) -> Vec<PipelineState> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == station_id)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn log_messages(&self, severity: LogSeverity) -> Vec<String> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, sev, _, _)| *sev == severity)
            .map(|(_, _, _, msg)| msg.clone())
            .collect()
    }
}

#[cfg(test)]
impl PipelineEventSink for RecordingSink {
    fn on_log(&self, station_id: &str, severity: LogSeverity, source: &str, message: &str) {
        self.logs.lock().unwrap().push((
            station_id.to_string(),
            severity,
            source.to_string(),
            message.to_string(),
        ));
    }

    fn on_status_change(&self, station_id: &str, state: PipelineState) {
        self.states.lock().unwrap().push((station_id.to_string(), state));
    }

    fn on_now_playing(&self, station_id: &str, track: &str) {
        self.tracks.lock().unwrap().push((station_id.to_string(), track.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_fans_out_to_every_subscriber() {
        let hub = EventHub::new();
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        hub.subscribe(first.clone());
        hub.subscribe(second.clone());

        hub.on_status_change("st-1", PipelineState::Running);
        hub.on_now_playing("st-1", "Artist - Title");
        hub.on_log("st-1", LogSeverity::Error, "ffmpeg", "boom");

        for sink in [&first, &second] {
            assert_eq!(sink.states_for("st-1"), vec![PipelineState::Running]);
            assert_eq!(sink.tracks.lock().unwrap().len(), 1);
            assert_eq!(sink.log_messages(LogSeverity::Error), vec!["boom".to_string()]);
        }
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_bus_serializes_tagged_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.on_status_change("st-9", PipelineState::Error);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "statusChanged");
        assert_eq!(event.station_id(), "st-9");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "statusChanged");
        assert_eq!(json["stationId"], "st-9");
        assert_eq!(json["state"], "error");
    }
}
