//! Observability: health endpoints and service metrics.

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::CoreMetrics;
