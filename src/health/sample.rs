//! # Host vitals sampling.
//!
//! [`HealthSample`] is one snapshot of CPU, memory, disk and temperature.
//! [`Sampler`] is the capability the monitor polls; [`SysinfoSampler`] is
//! the production implementation. Temperature is optional: VMs, WSL and
//! some boards expose no thermal zone, in which case the overheat logic
//! stays inert.

use serde::Serialize;
use sysinfo::{Components, CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use time::OffsetDateTime;
use tracing::warn;

use crate::error::SampleError;

/// Thermal sensors worth trusting, in priority order. Covers Raspberry Pi
/// (`cpu_thermal`), generic ARM boards (`thermal_zone0`), and Intel/AMD
/// (`coretemp` / `k10temp`).
const PREFERRED_SENSORS: [&str; 4] = ["cpu_thermal", "thermal_zone0", "coretemp", "k10temp"];

/// One snapshot of host vitals.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSample {
    /// Global CPU utilisation, percent.
    pub cpu_pct: f64,
    /// Memory utilisation, percent.
    pub mem_pct: f64,
    /// Root filesystem utilisation, percent.
    pub disk_pct: f64,
    /// CPU temperature in Celsius; `None` when no sensor is exposed.
    pub temp_c: Option<f64>,
    /// Collection time.
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Capability polled by the health monitor.
pub trait Sampler: Send + 'static {
    /// Takes one snapshot of host vitals.
    fn sample(&mut self) -> Result<HealthSample, SampleError>;
}

/// Production sampler backed by `sysinfo`.
pub struct SysinfoSampler {
    system: System,
    components: Components,
    disks: Disks,
    warned_no_sensor: bool,
}

impl SysinfoSampler {
    /// Initialises the sampler and takes the warm-up CPU reading.
    ///
    /// CPU utilisation is a delta between refreshes, so the first real
    /// sample needs this baseline to be meaningful.
    pub fn new() -> Self {
        let refresh = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything());
        let system = System::new_with_specifics(refresh);
        Self {
            system,
            components: Components::new_with_refreshed_list(),
            disks: Disks::new_with_refreshed_list(),
            warned_no_sensor: false,
        }
    }

    /// Reads the CPU temperature, trying known sensors first and falling
    /// back to the hottest component. Warns once when nothing is exposed.
    fn read_temperature(&mut self) -> Option<f64> {
        self.components.refresh(true);

        for wanted in PREFERRED_SENSORS {
            for comp in self.components.iter() {
                if comp.label().to_lowercase().contains(wanted) {
                    if let Some(t) = comp.temperature() {
                        return Some(f64::from(t));
                    }
                }
            }
        }

        let hottest = self
            .components
            .iter()
            .filter_map(|c| c.temperature())
            .fold(None::<f32>, |acc, t| {
                Some(acc.map_or(t, |m| if t > m { t } else { m }))
            });

        match hottest {
            Some(t) if t > 0.0 => Some(f64::from(t)),
            _ => {
                if !self.warned_no_sensor {
                    warn!("no usable thermal sensor found; overheat protection disabled");
                    self.warned_no_sensor = true;
                }
                None
            }
        }
    }

    fn read_disk_pct(&mut self) -> f64 {
        self.disks.refresh(true);
        let root = self
            .disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| self.disks.iter().next());
        match root {
            Some(d) if d.total_space() > 0 => {
                let used = d.total_space().saturating_sub(d.available_space());
                used as f64 / d.total_space() as f64 * 100.0
            }
            _ => 0.0,
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for SysinfoSampler {
    fn sample(&mut self) -> Result<HealthSample, SampleError> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let cpu_pct = f64::from(self.system.global_cpu_usage());
        let total = self.system.total_memory();
        let mem_pct = if total > 0 {
            self.system.used_memory() as f64 / total as f64 * 100.0
        } else {
            return Err(SampleError::Unavailable {
                reason: "total memory reported as zero".into(),
            });
        };

        Ok(HealthSample {
            cpu_pct,
            mem_pct,
            disk_pct: self.read_disk_pct(),
            temp_c: self.read_temperature(),
            at: OffsetDateTime::now_utc(),
        })
    }
}
