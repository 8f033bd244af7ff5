//! Wires the forwarding and ingress paths together according to the
//! configuration and owns every task they start.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::{AllowAll, BrokerError, BrokerSettings, LocalBroker};
use crate::bus::{BusError, TelemetryBus};
use crate::config::GatewayConfig;
use crate::forwarding::{ForwardingPipeline, PathSpec, PathSubscription, PipelineHandle};
use crate::ingress::{InboundTranslator, LocalIngressBridge};
use crate::mqtt::{DeliveryError, OutgoingQueue, RemoteTransport};

const VALUE_CHANNEL_CAPACITY: usize = 256;
const BROKER_EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Remote delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Local broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Telemetry bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Invalid forwarded path: {0}")]
    InvalidPath(String),
}

/// Something the gateway started and must release on stop.
pub enum ResourceHandle {
    Subscription(PathSubscription),
    Pipeline(PipelineHandle),
    Transport(RemoteTransport),
    Broker(LocalBroker),
    Ingress(LocalIngressBridge),
}

impl ResourceHandle {
    /// Releases the resource. Calling it again is a no-op.
    pub async fn shutdown(&mut self) {
        match self {
            ResourceHandle::Subscription(subscription) => subscription.shutdown().await,
            ResourceHandle::Pipeline(pipeline) => {
                let report = pipeline.shutdown().await;
                if report.queued > 0 {
                    warn!("Dropping {} undelivered outgoing messages", report.queued);
                }
                if report.evicted > 0 {
                    info!("{} outgoing messages were evicted from the queue", report.evicted);
                }
            }
            ResourceHandle::Transport(transport) => {
                if let Err(e) = transport.shutdown().await {
                    error!("Failed to close remote transport: {}", e);
                }
            }
            ResourceHandle::Broker(broker) => broker.shutdown().await,
            ResourceHandle::Ingress(bridge) => {
                let ingested = bridge.shutdown().await;
                debug!("Ingress bridge released after {} deltas", ingested);
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ResourceHandle::Subscription(_) => "subscription",
            ResourceHandle::Pipeline(_) => "pipeline",
            ResourceHandle::Transport(_) => "transport",
            ResourceHandle::Broker(_) => "broker",
            ResourceHandle::Ingress(_) => "ingress",
        }
    }
}

/// A started gateway. Resources are released in the order they were
/// registered.
pub struct Gateway {
    resources: Vec<ResourceHandle>,
    broker_addr: Option<SocketAddr>,
}

impl Gateway {
    pub async fn start<B: TelemetryBus>(
        config: &GatewayConfig,
        bus: Arc<B>,
    ) -> Result<Self, GatewayError> {
        let mut gateway = Self {
            resources: Vec::new(),
            broker_addr: None,
        };

        if let Err(e) = gateway.register_all(config, bus).await {
            error!("Gateway start failed: {}", e);
            gateway.stop().await;
            return Err(e);
        }

        info!(
            "Gateway started with {} resources (remote: {}, local server: {})",
            gateway.resources.len(),
            config.send_to_remote,
            config.run_local_server
        );
        Ok(gateway)
    }

    async fn register_all<B: TelemetryBus>(
        &mut self,
        config: &GatewayConfig,
        bus: Arc<B>,
    ) -> Result<(), GatewayError> {
        if config.send_to_remote {
            self.start_forwarding(config, bus.as_ref())?;
        }
        if config.run_local_server {
            self.start_ingress(config, bus).await?;
        }
        Ok(())
    }

    fn start_forwarding<B: TelemetryBus>(
        &mut self,
        config: &GatewayConfig,
        bus: &B,
    ) -> Result<(), GatewayError> {
        let specs = config
            .path_specs()
            .map_err(|e| GatewayError::InvalidPath(e.to_string()))?;
        for spec in &specs {
            validate_spec(spec)?;
        }

        let (values_tx, values_rx) = mpsc::channel(VALUE_CHANNEL_CAPACITY);
        for spec in specs {
            let subscription = PathSubscription::spawn(bus, spec, values_tx.clone())?;
            self.resources.push(ResourceHandle::Subscription(subscription));
        }
        drop(values_tx);

        let (delivery, transport) = RemoteTransport::connect(&config.remote_options())?;
        let pipeline = ForwardingPipeline::new(
            config.context(),
            OutgoingQueue::new(config.max_queued_messages),
            delivery,
            values_rx,
        );
        self.resources.push(ResourceHandle::Pipeline(pipeline.spawn()));
        self.resources.push(ResourceHandle::Transport(transport));
        Ok(())
    }

    async fn start_ingress<B: TelemetryBus>(
        &mut self,
        config: &GatewayConfig,
        bus: Arc<B>,
    ) -> Result<(), GatewayError> {
        let (events_tx, events_rx) = mpsc::channel(BROKER_EVENT_CAPACITY);
        let broker = LocalBroker::bind(
            BrokerSettings::new(config.port),
            Arc::new(AllowAll),
            events_tx,
        )
        .await?;
        self.broker_addr = Some(broker.local_addr());
        self.resources.push(ResourceHandle::Broker(broker));

        let translator = InboundTranslator::new(&config.self_id, config.non_numeric_payload);
        let bridge = LocalIngressBridge::spawn(bus, translator, events_rx);
        self.resources.push(ResourceHandle::Ingress(bridge));
        Ok(())
    }

    /// Address of the local broker, if one is running.
    pub fn broker_addr(&self) -> Option<SocketAddr> {
        self.broker_addr
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Releases every resource in registration order. Safe to call more than
    /// once.
    pub async fn stop(&mut self) {
        for resource in &mut self.resources {
            debug!("Releasing {}", resource.name());
            resource.shutdown().await;
        }
        info!("Gateway stopped");
    }
}

fn validate_spec(spec: &PathSpec) -> Result<(), GatewayError> {
    if spec.path.trim().is_empty() {
        return Err(GatewayError::InvalidPath(
            "path must not be empty".to_string(),
        ));
    }
    Ok(())
}
