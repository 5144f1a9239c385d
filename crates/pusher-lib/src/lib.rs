//! Container metrics pusher library
//!
//! This crate provides the core functionality for:
//! - Reading per-container sample histories from cAdvisor
//! - Deriving CPU, memory, disk and network rates
//! - Pushing the results to a local open-falcon agent
//! - Health checks and observability

pub mod collector;
pub mod emitter;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;

pub use emitter::{FalconSink, MetricSink};
pub use error::{CollectorError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{PusherMetrics, StructuredLogger};
