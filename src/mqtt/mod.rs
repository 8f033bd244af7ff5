//! # Remote MQTT Delivery
//!
//! Everything the forwarding side needs to talk to the remote broker.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - remote url/credentials/TLS → rumqttc options
//! ├── message_manager.rs  - OutgoingMessage, the `signalk/delta` topic
//! ├── mqtt_handler.rs     - connection state, DeliveryClient, event loop task
//! └── queue.rs            - FIFO of messages awaiting a connection
//! ```
//!
//! The transport task owns the rumqttc event loop and is the only writer of
//! the [`ConnectionState`] watch channel. Reconnects are left to the event
//! loop: after an error it waits one reconnect period and polls again.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod queue;

pub use config::RemoteOptions;
pub use message_manager::{OutgoingMessage, DELTA_TOPIC};
pub use mqtt_handler::{ConnectionState, DeliveryClient, DeliveryError, RemotePublisher, RemoteTransport};
pub use queue::OutgoingQueue;
