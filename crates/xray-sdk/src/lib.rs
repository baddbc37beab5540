//! Client SDK for recording pipeline runs and steps.
//!
//! Delivery is fail-open: the first failed send disables the [`Transport`]
//! and every later event from clients sharing it is dropped silently.

#![forbid(unsafe_code)]

mod client;
mod transport;

pub use client::{CaptureMode, ClientConfig, StepGuard, TraceClient};
pub use transport::{DeliveryChannel, DeliveryOutcome, HttpChannel, Transport, DEFAULT_TIMEOUT};
pub use xray_trace_domain::{CandidateSample, RunId, StepId, StepType, StructuredMap};
