pub mod buffer;
pub mod health;

pub use buffer::{BufferConfig, SamplingStrategy, TelemetryBuffer, TelemetrySample};
pub use health::{derive_health, ConnectionHealthState, HealthLevel, HealthMonitor};
