//! Outgoing data path: telemetry bus → remote broker
//!
//! ```text
//! Bus ──► PathSubscription ──┐
//! Bus ──► PathSubscription ──┼──► ForwardingPipeline ──► DeliveryClient ──► remote
//! Bus ──► PathSubscription ──┘          │   ▲
//!          (debounced)                  ▼   │ (drain on Connected)
//!                                  OutgoingQueue
//! ```
//!
//! 1. [`debounce`] - leading-edge rate limiting, independent of any clock
//! 2. [`subscription`] - one task per configured path
//! 3. [`pipeline`] - publish-or-queue, reconnect flush

pub mod debounce;
pub mod pipeline;
pub mod subscription;

pub use debounce::{DebounceMode, Debouncer};
pub use pipeline::{ForwardingPipeline, PipelineHandle, PipelineReport};
pub use subscription::{PathSpec, PathSubscription};
