use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{BusError, Delta, TelemetryBus, ValueEvent};

const DEFAULT_SOURCE: &str = "unknown";

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<ValueEvent>>>;

/// In-process telemetry bus scoped to a single vessel context.
///
/// Ingested deltas for that context are split into per-path [`ValueEvent`]s
/// and fanned out to every live subscriber of the path. Deltas for other
/// contexts are ignored.
#[derive(Clone)]
pub struct MemoryBus {
    context: String,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl MemoryBus {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Delivers one event to the subscribers of its path and returns how many
    /// received it. Closed subscriptions are pruned on the way.
    pub fn publish(&self, event: ValueEvent) -> Result<usize, BusError> {
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|e| BusError::Registry(e.to_string()))?;

        let Some(senders) = subscribers.get_mut(&event.path) else {
            debug!("No subscribers for {}", event.path);
            return Ok(0);
        };

        senders.retain(|sender| sender.send(event.clone()).is_ok());
        let delivered = senders.len();
        if senders.is_empty() {
            subscribers.remove(&event.path);
        }
        Ok(delivered)
    }

    pub fn subscriber_count(&self, path: &str) -> usize {
        match self.subscribers.lock() {
            Ok(subscribers) => subscribers
                .get(path)
                .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
                .unwrap_or(0),
            Err(e) => {
                warn!("Subscriber registry poisoned: {}", e);
                0
            }
        }
    }
}

impl TelemetryBus for MemoryBus {
    fn subscribe(&self, path: &str) -> Result<mpsc::UnboundedReceiver<ValueEvent>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|e| BusError::Registry(e.to_string()))?
            .entry(path.to_string())
            .or_default()
            .push(tx);
        debug!("New bus subscription for {}", path);
        Ok(rx)
    }

    fn ingest(&self, delta: Delta) -> Result<(), BusError> {
        if delta.context != self.context {
            debug!("Ignoring delta for foreign context {}", delta.context);
            return Ok(());
        }

        for update in delta.updates {
            let timestamp = update.timestamp.unwrap_or_else(Utc::now);
            let source = update
                .source
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string());

            for entry in update.values {
                self.publish(ValueEvent::new(
                    entry.path,
                    entry.value,
                    timestamp,
                    source.clone(),
                ))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Update;
    use serde_json::json;

    #[test]
    fn ingest_fans_out_to_path_subscribers() {
        let bus = MemoryBus::new("vessels.self");
        let mut speed = bus.subscribe("navigation.speedOverGround").unwrap();
        let mut depth = bus.subscribe("environment.depth.belowKeel").unwrap();

        bus.ingest(Delta::single(
            "vessels.self",
            Update::single_value(
                None,
                Some("mqtt.gps".into()),
                "navigation.speedOverGround",
                json!(5.2),
            ),
        ))
        .unwrap();

        let event = speed.try_recv().unwrap();
        assert_eq!(event.value, json!(5.2));
        assert_eq!(event.source, "mqtt.gps");
        assert!(depth.try_recv().is_err());
    }

    #[test]
    fn foreign_context_is_ignored() {
        let bus = MemoryBus::new("vessels.self");
        let mut rx = bus.subscribe("a").unwrap();

        bus.ingest(Delta::single(
            "vessels.other",
            Update::single_value(None, None, "a", json!(1)),
        ))
        .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = MemoryBus::new("vessels.self");
        let rx = bus.subscribe("a").unwrap();
        let _kept = bus.subscribe("a").unwrap();
        drop(rx);

        let delivered = bus
            .publish(ValueEvent::new("a", json!(1), Utc::now(), "test"))
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(bus.subscriber_count("a"), 1);
    }
}
