//! # Telemetry Bus Seam
//!
//! The gateway never owns the telemetry bus. It talks to it through the
//! [`TelemetryBus`] trait: per-path subscriptions deliver [`ValueEvent`]s, and
//! structured updates ([`Delta`]) are handed back through `ingest`.
//!
//! ```text
//! bus/
//! ├── delta.rs   - structured update documents (serde)
//! └── memory.rs  - in-process bus used by the binary and the tests
//! ```

pub mod delta;
pub mod memory;

pub use delta::{Delta, PathValue, Update};
pub use memory::MemoryBus;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// A single value observed on the bus for one path.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueEvent {
    pub path: String,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl ValueEvent {
    pub fn new(
        path: impl Into<String>,
        value: serde_json::Value,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            value,
            timestamp,
            source: source.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Subscriber registry unavailable: {0}")]
    Registry(String),

    #[error("Delta rejected: {0}")]
    Rejected(String),
}

/// Publish/subscribe operations the gateway consumes.
///
/// Dropping the receiver returned by `subscribe` releases the subscription.
pub trait TelemetryBus: Send + Sync + 'static {
    fn subscribe(&self, path: &str) -> Result<mpsc::UnboundedReceiver<ValueEvent>, BusError>;

    fn ingest(&self, delta: Delta) -> Result<(), BusError>;
}
