use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use skyguide_core::context::{EventSink, GuiderSnapshot};
use skyguide_core::events::GuideEvent;
use skyguide_telemetry::MetricsRecorder;

use crate::codec::encode_json;
use crate::rpc::{build_event_envelope, unix_timestamp, EnvelopeHeader};
use crate::session::{Delivery, SessionRegistry};

/// Fans engine events out to every connected client.
pub struct EventBroadcaster {
    sessions: Arc<SessionRegistry>,
    host: String,
    instance: AtomicU32,
    config_debounce: Duration,
    last_config_change: Mutex<Option<Instant>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl EventBroadcaster {
    pub fn new(sessions: Arc<SessionRegistry>, header: EnvelopeHeader, config_debounce: Duration) -> Self {
        Self {
            sessions,
            host: header.host,
            instance: AtomicU32::new(header.instance),
            config_debounce,
            last_config_change: Mutex::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn header(&self) -> EnvelopeHeader {
        EnvelopeHeader {
            host: self.host.clone(),
            instance: self.instance.load(Ordering::Relaxed),
        }
    }

    /// Instance number reported in the `Inst` field.
    pub fn set_instance(&self, instance: u32) {
        self.instance.store(instance, Ordering::Relaxed);
    }

    /// Stamp an event with the envelope header, using the current time.
    pub fn envelope(&self, name: &str, fields: Map<String, Value>) -> Value {
        build_event_envelope(name, fields, &self.header(), unix_timestamp())
    }

    /// Send one event to every client. Skips all work when nobody is
    /// connected.
    pub fn broadcast(&self, name: &str, fields: Map<String, Value>) -> Delivery {
        if self.sessions.is_empty() {
            return Delivery::default();
        }
        let frame = match encode_json(&self.envelope(name, fields)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(event = name, error = %e, "could not encode event");
                return Delivery::default();
            }
        };

        let outcome = self.sessions.broadcast(&frame);
        tracing::trace!(event = name, delivered = outcome.delivered, "event broadcast");
        if let Some(m) = &self.metrics {
            m.counter_inc("events.broadcast_total", &[("event", name)], 1);
            m.counter_inc("events.delivered_total", &[], outcome.delivered as u64);
            if outcome.dropped > 0 {
                m.counter_inc("server.sessions_dropped_total", &[], outcome.dropped as u64);
            }
        }
        outcome
    }

    /// Broadcast a typed event. Repeated `ConfigurationChange` events
    /// inside the debounce window are collapsed into the first one.
    pub fn publish(&self, event: &GuideEvent) -> Delivery {
        if matches!(event, GuideEvent::ConfigurationChange) && self.debounced() {
            tracing::trace!("configuration change debounced");
            return Delivery::default();
        }
        self.broadcast(event.name(), event.fields())
    }

    fn debounced(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_config_change.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.config_debounce => true,
            _ => {
                *last = Some(now);
                false
            }
        }
    }

    /// Encoded catch-up events for a client that has just connected.
    pub fn catchup_frames(&self, snapshot: &GuiderSnapshot) -> Vec<Bytes> {
        let header = self.header();
        let timestamp = unix_timestamp();
        snapshot
            .catchup_events()
            .iter()
            .filter_map(|event| {
                let env = build_event_envelope(event.name(), event.fields(), &header, timestamp);
                encode_json(&env).ok()
            })
            .collect()
    }
}

impl EventSink for EventBroadcaster {
    fn notify(&self, event: GuideEvent) {
        self.publish(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyguide_core::events::{AppState, GuideStep, Point};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn header() -> EnvelopeHeader {
        EnvelopeHeader {
            host: "obs".into(),
            instance: 1,
        }
    }

    fn setup(debounce: Duration) -> (EventBroadcaster, Arc<SessionRegistry>) {
        let sessions = Arc::new(SessionRegistry::new());
        (
            EventBroadcaster::new(Arc::clone(&sessions), header(), debounce),
            sessions,
        )
    }

    fn connect(sessions: &SessionRegistry) -> mpsc::UnboundedReceiver<Bytes> {
        let (session, rx) = sessions.open(None, CancellationToken::new());
        sessions.insert(session);
        rx
    }

    fn decode(frame: Bytes) -> Value {
        serde_json::from_slice(&frame).unwrap()
    }

    #[test]
    fn guide_step_reaches_all_clients() {
        let (b, sessions) = setup(Duration::ZERO);
        let mut rx1 = connect(&sessions);
        let mut rx2 = connect(&sessions);

        let step = GuideStep {
            frame: 12,
            mount: "Mount".into(),
            dx: 0.5,
            dy: -0.25,
            ..Default::default()
        };
        let outcome = b.publish(&GuideEvent::GuideStep(step));
        assert_eq!(outcome.delivered, 2);

        for rx in [&mut rx1, &mut rx2] {
            let env = decode(rx.try_recv().unwrap());
            assert_eq!(env["Event"], "GuideStep");
            assert_eq!(env["Frame"], 12);
            assert_eq!(env["dx"], 0.5);
            assert_eq!(env["Host"], "obs");
        }
    }

    #[test]
    fn instance_number_can_change() {
        let (b, sessions) = setup(Duration::ZERO);
        let mut rx = connect(&sessions);
        b.set_instance(3);
        b.publish(&GuideEvent::StartGuiding);
        assert_eq!(decode(rx.try_recv().unwrap())["Inst"], 3);
    }

    #[test]
    fn late_client_does_not_see_earlier_events() {
        let (b, sessions) = setup(Duration::ZERO);
        let _rx1 = connect(&sessions);
        b.publish(&GuideEvent::StartGuiding);
        let mut rx2 = connect(&sessions);
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn no_clients_is_a_no_op() {
        let (b, _sessions) = setup(Duration::ZERO);
        assert_eq!(b.publish(&GuideEvent::StartGuiding), Delivery::default());
    }

    #[test]
    fn configuration_change_is_debounced() {
        let (b, sessions) = setup(Duration::from_secs(60));
        let mut rx = connect(&sessions);
        b.publish(&GuideEvent::ConfigurationChange);
        b.publish(&GuideEvent::ConfigurationChange);
        b.publish(&GuideEvent::StartGuiding);

        assert_eq!(decode(rx.try_recv().unwrap())["Event"], "ConfigurationChange");
        assert_eq!(decode(rx.try_recv().unwrap())["Event"], "StartGuiding");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn catchup_frames_follow_snapshot_order() {
        let (b, _sessions) = setup(Duration::ZERO);
        let snapshot = GuiderSnapshot {
            version: "0.1.0".into(),
            subversion: String::new(),
            app_state: AppState::Guiding,
            lock_position: Some(Point::new(1.0, 2.0)),
            star_position: None,
            calibrated_mounts: vec![("Mount".into(), None)],
            calibrating_mount: None,
        };
        let names: Vec<Value> = b
            .catchup_frames(&snapshot)
            .into_iter()
            .map(|f| decode(f)["Event"].clone())
            .collect();
        assert_eq!(
            names,
            vec!["Version", "LockPositionSet", "CalibrationComplete", "StartGuiding", "AppState"]
        );
    }

    #[test]
    fn metrics_count_deliveries() {
        let (b, sessions) = setup(Duration::ZERO);
        let metrics = Arc::new(MetricsRecorder::new());
        let b = b.with_metrics(Some(Arc::clone(&metrics)));
        let _rx = connect(&sessions);
        let dead = connect(&sessions);
        drop(dead);

        b.publish(&GuideEvent::Paused);
        assert_eq!(metrics.counter_get("events.broadcast_total", &[("event", "Paused")]), 1);
        assert_eq!(metrics.counter_get("events.delivered_total", &[]), 1);
        assert_eq!(metrics.counter_get("server.sessions_dropped_total", &[]), 1);
    }
}
