//! Incoming data path: local broker → telemetry bus
//!
//! A publish on `vessels/self/navigation/speedOverGround` with payload `5.2`
//! becomes a delta for `navigation.speedOverGround` tagged with the publishing
//! client. Everything else on the broker is left alone.

pub mod bridge;
pub mod translator;

pub use bridge::{handle_broker_event, source_tag, LocalIngressBridge};
pub use translator::{InboundRecord, InboundTranslator, NonNumericPolicy, Translation};
