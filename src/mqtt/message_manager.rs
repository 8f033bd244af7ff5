use rumqttc::QoS;

use crate::bus::{Delta, Update, ValueEvent};

/// Topic every forwarded delta is published on.
pub const DELTA_TOPIC: &str = "signalk/delta";

/// A delta ready to be handed to the remote transport.
///
/// Built once from a debounced value and never mutated afterwards, so the
/// same message can sit in the outgoing queue and be replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
        }
    }

    /// Wraps a value into a single-update delta for `context`, published at
    /// least once on [`DELTA_TOPIC`].
    pub fn from_value(context: &str, event: &ValueEvent) -> Result<Self, serde_json::Error> {
        let delta = Delta::single(
            context,
            Update::single_value(
                Some(event.timestamp),
                Some(event.source.clone()),
                event.path.clone(),
                event.value.clone(),
            ),
        );

        Ok(Self::new(DELTA_TOPIC, delta.to_json_bytes()?, QoS::AtLeastOnce))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }
}
