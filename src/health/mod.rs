//! Host vitals sampling and threshold-driven self-preservation.

mod monitor;
mod sample;

pub use monitor::{HealthMonitor, Hook, MonitorSettings, ThermalHooks};
pub use sample::{HealthSample, Sampler, SysinfoSampler};
