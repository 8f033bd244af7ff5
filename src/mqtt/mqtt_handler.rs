use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Packet};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::{build_mqtt_options, RemoteOptions};
use super::message_manager::OutgoingMessage;

/// Capacity of the rumqttc request channel between client and event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 100;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Invalid remote url: {0}")]
    InvalidUrl(String),

    #[error("Unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Publish rejected by transport: {0}")]
    Rejected(#[from] rumqttc::ClientError),

    #[error("Transport task failed: {0}")]
    Task(String),
}

/// Non-blocking publish into the remote transport.
///
/// Implementations hand the message over and return; broker acknowledgement
/// is never awaited.
pub trait RemotePublisher: Send + Sync + 'static {
    fn publish(&self, message: &OutgoingMessage) -> Result<(), DeliveryError>;
}

impl RemotePublisher for AsyncClient {
    fn publish(&self, message: &OutgoingMessage) -> Result<(), DeliveryError> {
        self.try_publish(
            message.topic(),
            message.qos(),
            false,
            message.payload().to_vec(),
        )?;
        Ok(())
    }
}

/// The gateway's view of the remote broker connection.
pub struct DeliveryClient<P: RemotePublisher = AsyncClient> {
    publisher: P,
    state: watch::Receiver<ConnectionState>,
}

impl<P: RemotePublisher> DeliveryClient<P> {
    pub fn new(publisher: P, state: watch::Receiver<ConnectionState>) -> Self {
        Self { publisher, state }
    }

    pub fn connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub fn publish(&self, message: &OutgoingMessage) -> Result<(), DeliveryError> {
        self.publisher.publish(message)
    }

    /// Waits for the next connection transition. `None` once the transport is
    /// gone for good.
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        match self.state.changed().await {
            Ok(()) => Some(*self.state.borrow_and_update()),
            Err(_) => None,
        }
    }
}

/// Handle for the task driving the rumqttc event loop.
pub struct RemoteTransport {
    client: AsyncClient,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl RemoteTransport {
    /// Creates the client and starts polling its event loop. Connection
    /// attempts begin immediately and repeat every `reconnect_period` after a
    /// failure.
    pub fn connect(
        options: &RemoteOptions,
    ) -> Result<(DeliveryClient<AsyncClient>, Self), DeliveryError> {
        let mqtt_options = build_mqtt_options(options)?;
        let (host, port) = mqtt_options.broker_address();
        info!("Connecting to remote MQTT server {}:{}", host, port);

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let reconnect_period = options.reconnect_period;
        let task_handle = tokio::spawn(async move {
            run_event_loop(eventloop, state_tx, reconnect_period, shutdown_rx).await;
        });

        Ok((
            DeliveryClient::new(client.clone(), state_rx),
            Self {
                client,
                shutdown_tx: Some(shutdown_tx),
                task_handle: Some(task_handle),
            },
        ))
    }

    /// Disconnects from the broker and stops the event loop. Safe to call more
    /// than once.
    pub async fn shutdown(&mut self) -> Result<(), DeliveryError> {
        let Some(tx) = self.shutdown_tx.take() else {
            debug!("Remote transport already shut down");
            return Ok(());
        };

        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        if tx.send(()).is_err() {
            warn!("Remote transport task already terminated");
        }

        if let Some(handle) = self.task_handle.take() {
            handle
                .await
                .map_err(|e| DeliveryError::Task(e.to_string()))?;
        }
        info!("Remote transport closed");
        Ok(())
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_period: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("Shutdown signal received for remote transport");
                break;
            }

            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("Connected to remote MQTT server");
                        set_state(&state_tx, ConnectionState::Connected);
                    } else {
                        warn!("Remote MQTT server refused connection: {:?}", ack.code);
                    }
                }
                Ok(event) => debug!("Remote transport event: {:?}", event),
                Err(e) => {
                    error!("Remote MQTT connection error: {}", e);
                    if set_state(&state_tx, ConnectionState::Disconnected) {
                        info!("Disconnected from remote MQTT server");
                    }

                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = tokio::time::sleep(reconnect_period) => {
                            debug!("Retrying remote MQTT connection");
                        }
                    }
                }
            }
        }
    }

    set_state(&state_tx, ConnectionState::Disconnected);
}

/// Publishes `next` only when it differs from the current state. Returns
/// whether a transition happened.
fn set_state(state_tx: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state_tx.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    })
}
