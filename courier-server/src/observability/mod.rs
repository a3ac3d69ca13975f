//! Observability subsystem for courier
//!
//! Connection statistics, Prometheus export and the operational HTTP
//! endpoint.

pub mod http;
pub mod metrics;

pub use http::run_stats_server;
pub use metrics::{ConnectionStats, GaugeSnapshot, Metrics};
