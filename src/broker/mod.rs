//! # Local MQTT Broker Endpoint
//!
//! A small TCP listener that lets MQTT clients on the boat network publish
//! into the gateway. Each connection runs a [`session::Session`] in its own
//! task; everything the gateway cares about is reported as a [`BrokerEvent`]
//! on an mpsc channel:
//!
//! ```text
//! TcpListener ──► Session ──► BrokerEvent ──► LocalIngressBridge
//!                   │  ▲
//!                   ▼  │ (QoS 0 fan-out to matching subscriptions)
//!              broadcast routes
//! ```
//!
//! Access control goes through [`Authorizer`]; the gateway installs
//! [`AllowAll`].

pub mod auth;
pub mod session;

pub use auth::{AllowAll, Authorizer};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use session::{Session, SessionContext};

const ROUTE_CAPACITY: usize = 1024;
const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

/// What the broker tells the rest of the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    ClientConnected(String),
    ClientDisconnected(String),
    /// `client` is `None` for publishes the broker makes itself, such as a
    /// last will.
    Publish {
        topic: String,
        payload: Bytes,
        client: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Failed to bind local broker on {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[error("Connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed MQTT packet: {0}")]
    Codec(#[from] rumqttc::mqttbytes::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Client {0} not authorized")]
    Unauthorized(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub bind_address: IpAddr,
    pub port: u16,
    pub max_packet_size: usize,
}

impl BrokerSettings {
    /// Listens on every interface.
    pub fn new(port: u16) -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn loopback(port: u16) -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::new(port)
        }
    }
}

/// Handle for the running listener.
pub struct LocalBroker {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl LocalBroker {
    pub async fn bind(
        settings: BrokerSettings,
        authorizer: Arc<dyn Authorizer>,
        events: mpsc::Sender<BrokerEvent>,
    ) -> Result<Self, BrokerError> {
        let address = SocketAddr::new(settings.bind_address, settings.port);
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| BrokerError::Bind { address, source })?;
        let local_addr = listener.local_addr()?;
        info!("MQTT server is up and running on port {}", local_addr.port());

        let (routes, _) = broadcast::channel(ROUTE_CAPACITY);
        let ctx = SessionContext {
            authorizer,
            events,
            routes,
            max_packet_size: settings.max_packet_size,
        };

        let cancel = CancellationToken::new();
        let task_handle = tokio::spawn(accept_loop(listener, ctx, cancel.clone()));

        Ok(Self {
            local_addr,
            cancel,
            task_handle: Some(task_handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Closes the listener and every open session. Safe to call more than
    /// once.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                error!("Local broker task panicked: {}", e);
            }
            info!("MQTT server on port {} closed", self.local_addr.port());
        }
    }
}

async fn accept_loop(listener: TcpListener, ctx: SessionContext, cancel: CancellationToken) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    sessions.spawn(run_session(stream, peer, ctx.clone(), cancel.child_token()));
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },

            Some(finished) = sessions.join_next() => {
                if let Err(e) = finished {
                    error!("Client session task panicked: {}", e);
                }
            }
        }
    }

    drop(listener);
    while sessions.join_next().await.is_some() {}
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: SessionContext,
    cancel: CancellationToken,
) {
    let routes = ctx.routes.subscribe();
    let events = ctx.events.clone();

    let session = match Session::accept(stream, peer, ctx).handshake().await {
        Ok(session) => session,
        Err(e) => {
            warn!("Client error {}: {}", peer, e);
            return;
        }
    };

    let client_id = session.client_id();
    info!("Client connected: {}", client_id);
    if events
        .send(BrokerEvent::ClientConnected(client_id.clone()))
        .await
        .is_err()
    {
        debug!("No consumer for broker events");
    }

    if let Err(e) = session.serve(cancel, routes).await {
        warn!("Client error {}: {}", client_id, e);
    }

    info!("Client disconnected: {}", client_id);
    if events
        .send(BrokerEvent::ClientDisconnected(client_id))
        .await
        .is_err()
    {
        debug!("No consumer for broker events");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct DenyAll;

    impl Authorizer for DenyAll {
        fn authenticate(&self, _: &str, _: Option<&str>, _: Option<&str>) -> bool {
            false
        }
    }

    async fn start(authorizer: Arc<dyn Authorizer>) -> (LocalBroker, mpsc::Receiver<BrokerEvent>) {
        let (tx, rx) = mpsc::channel(32);
        let broker = LocalBroker::bind(BrokerSettings::loopback(0), authorizer, tx)
            .await
            .unwrap();
        (broker, rx)
    }

    fn client(id: &str, broker: &LocalBroker) -> (AsyncClient, EventLoop) {
        let options = MqttOptions::new(id, "127.0.0.1", broker.local_addr().port());
        AsyncClient::new(options, 10)
    }

    async fn next_event(rx: &mut mpsc::Receiver<BrokerEvent>) -> BrokerEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    async fn poll_until<F>(eventloop: &mut EventLoop, mut done: F)
    where
        F: FnMut(&Event) -> bool,
    {
        timeout(WAIT, async {
            loop {
                let event = eventloop.poll().await.unwrap();
                if done(&event) {
                    break;
                }
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn client_publish_is_reported_with_client_id() {
        let (mut broker, mut rx) = start(Arc::new(AllowAll)).await;
        let (client, mut eventloop) = client("depth/sounder", &broker);

        client
            .publish("vessels/self/environment/depth/belowKeel", QoS::AtLeastOnce, false, "3.4")
            .await
            .unwrap();
        poll_until(&mut eventloop, |e| matches!(e, Event::Incoming(Packet::PubAck(_)))).await;

        assert_eq!(
            next_event(&mut rx).await,
            BrokerEvent::ClientConnected("depth/sounder".into())
        );
        assert_eq!(
            next_event(&mut rx).await,
            BrokerEvent::Publish {
                topic: "vessels/self/environment/depth/belowKeel".into(),
                payload: Bytes::from_static(b"3.4"),
                client: Some("depth/sounder".into()),
            }
        );

        drop(eventloop);
        assert_eq!(
            next_event(&mut rx).await,
            BrokerEvent::ClientDisconnected("depth/sounder".into())
        );

        broker.shutdown().await;
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn publishes_are_routed_to_matching_subscribers() {
        let (mut broker, _rx) = start(Arc::new(AllowAll)).await;
        let (listener, mut listener_loop) = client("display", &broker);
        let (sensor, mut sensor_loop) = client("sensor", &broker);

        listener.subscribe("vessels/self/#", QoS::AtMostOnce).await.unwrap();
        poll_until(&mut listener_loop, |e| matches!(e, Event::Incoming(Packet::SubAck(_)))).await;

        sensor
            .publish("vessels/self/a", QoS::AtLeastOnce, false, "1")
            .await
            .unwrap();
        poll_until(&mut sensor_loop, |e| matches!(e, Event::Incoming(Packet::PubAck(_)))).await;

        let mut received = None;
        poll_until(&mut listener_loop, |e| {
            if let Event::Incoming(Packet::Publish(p)) = e {
                received = Some((p.topic.clone(), p.payload.clone()));
                true
            } else {
                false
            }
        })
        .await;

        assert_eq!(
            received,
            Some(("vessels/self/a".to_string(), Bytes::from_static(b"1")))
        );
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_credentials_refuse_connection() {
        let (mut broker, mut rx) = start(Arc::new(DenyAll)).await;
        let (_client, mut eventloop) = client("intruder", &broker);

        let result = timeout(WAIT, eventloop.poll()).await.unwrap();

        assert!(result.is_err());
        assert!(rx.try_recv().is_err());
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn bind_failure_names_address() {
        let (broker, _rx) = start(Arc::new(AllowAll)).await;
        let (tx, _rx2) = mpsc::channel(1);

        let result = LocalBroker::bind(
            BrokerSettings::loopback(broker.local_addr().port()),
            Arc::new(AllowAll),
            tx,
        )
        .await;

        assert!(matches!(result, Err(BrokerError::Bind { .. })));
    }
}
