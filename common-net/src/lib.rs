//! Shared plumbing for the signaling workspace: wire protocol, broadcast
//! fabric, metric sets, tracing and shutdown helpers.

pub mod fabric;
pub mod message;
pub mod metrics;
pub mod shutdown;
pub mod telemetry;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
