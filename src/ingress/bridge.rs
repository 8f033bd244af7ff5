use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::translator::{InboundRecord, InboundTranslator, Translation};
use crate::broker::BrokerEvent;
use crate::bus::{BusError, Delta, TelemetryBus, Update};

const SOURCE_PREFIX: &str = "mqtt";

/// Source tag for values published by a local MQTT client. Path separators in
/// the client id are replaced so the tag stays a single token.
pub fn source_tag(client_id: &str) -> String {
    format!("{}.{}", SOURCE_PREFIX, client_id.replace(['/', '.'], "_"))
}

/// Structured update for one translated record. NaN becomes JSON `null`.
pub fn to_delta(record: InboundRecord, client_id: &str) -> Delta {
    let value = serde_json::Number::from_f64(record.value)
        .map(Value::Number)
        .unwrap_or(Value::Null);

    Delta::single(
        record.context,
        Update::single_value(None, Some(source_tag(client_id)), record.path, value),
    )
}

/// Routes one broker event into the bus. Returns whether a delta was
/// ingested.
pub fn handle_broker_event<B: TelemetryBus + ?Sized>(
    bus: &B,
    translator: &InboundTranslator,
    event: BrokerEvent,
) -> Result<bool, BusError> {
    match event {
        BrokerEvent::Publish {
            topic,
            payload,
            client: Some(client_id),
        } => match translator.translate(&topic, &payload) {
            Translation::Valid(record) => {
                debug!("{} from {} → {}", topic, client_id, record.path);
                bus.ingest(to_delta(record, &client_id))?;
                Ok(true)
            }
            Translation::Invalid => {
                debug!("Ignoring publish on {}", topic);
                Ok(false)
            }
        },
        BrokerEvent::Publish { topic, client: None, .. } => {
            debug!("Ignoring broker-originated publish on {}", topic);
            Ok(false)
        }
        BrokerEvent::ClientConnected(id) => {
            debug!("Ingress sees client {}", id);
            Ok(false)
        }
        BrokerEvent::ClientDisconnected(id) => {
            debug!("Ingress lost client {}", id);
            Ok(false)
        }
    }
}

/// Task feeding local broker publishes into the telemetry bus.
pub struct LocalIngressBridge {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<usize>>,
}

impl LocalIngressBridge {
    pub fn spawn<B: TelemetryBus>(
        bus: Arc<B>,
        translator: InboundTranslator,
        mut events: mpsc::Receiver<BrokerEvent>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task_handle = tokio::spawn(async move {
            info!("Local ingress bridge started for {}", translator.context());
            let mut ingested = 0;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,

                    event = events.recv() => match event {
                        Some(event) => match handle_broker_event(bus.as_ref(), &translator, event) {
                            Ok(true) => ingested += 1,
                            Ok(false) => {}
                            Err(e) => error!("Failed to ingest delta: {}", e),
                        },
                        None => {
                            debug!("Local broker event stream closed");
                            break;
                        }
                    },
                }
            }

            info!("Local ingress bridge stopped after {} deltas", ingested);
            ingested
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        }
    }

    /// Stops the bridge, returning how many deltas it ingested.
    pub async fn shutdown(&mut self) -> usize {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                debug!("Ingress bridge already stopped");
            }
        }

        match self.task_handle.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                warn!("Ingress bridge task panicked: {}", e);
                0
            }),
            None => 0,
        }
    }
}
