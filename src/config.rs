//! # Runtime configuration.
//!
//! [`Config`] is an explicit record built once at startup from
//! `EDGEVISOR_*` environment variables and passed into every component;
//! there is no process-wide mutable configuration. Parsing reads from a
//! plain key/value map, so tests never touch the process environment.
//!
//! ## Worker spec grammar
//! ```text
//! WORKERS := ENTRY ("," ENTRY)*
//! ENTRY   := NAME ":" COMMAND ":" BOOL
//! BOOL    := "true" | "false"
//! ```
//! `COMMAND` is whitespace-split into argv. Any malformed entry is fatal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::orchestrator::WorkerSpec;

/// Environment variable prefix.
const ENV_PREFIX: &str = "EDGEVISOR_";

/// Immutable runtime configuration record.
#[derive(Clone, Debug)]
pub struct Config {
    /// Label stamped on every telemetry payload.
    pub device_id: String,
    /// Minimum log severity (`trace`..`error`).
    pub log_level: String,
    /// Telemetry POST target.
    pub telemetry_endpoint: String,
    /// State directory holding the persistent queue.
    pub data_dir: PathBuf,
    /// Persistent queue drain cadence.
    pub flush_interval: Duration,
    /// Heartbeat payload cadence.
    pub heartbeat_interval: Duration,
    /// Consecutive failures that trip the circuit breaker.
    pub circuit_failure_threshold: u32,
    /// Open → half-open delay.
    pub circuit_timeout: Duration,
    /// Attempts per telemetry send.
    pub retry_max_attempts: u32,
    /// Backoff base delay.
    pub retry_initial_delay: Duration,
    /// Vitals sampling cadence.
    pub health_interval: Duration,
    /// Overheat trigger, Celsius.
    pub temp_threshold: f64,
    /// Release margin below the trigger, Celsius.
    pub hysteresis_margin: f64,
    /// CPU warning threshold, percent.
    pub cpu_threshold: f64,
    /// Memory warning threshold, percent.
    pub memory_threshold: f64,
    /// Minimum spacing between resource pressure events.
    pub warn_debounce: Duration,
    /// Watchdog liveness cadence.
    pub watchdog_interval: Duration,
    /// Per-worker restart ceiling.
    pub max_restarts: u32,
    /// Continuous uptime that resets the restart streak.
    pub stability_window: Duration,
    /// Grace period for stopping workers before SIGKILL.
    pub stop_grace: Duration,
    /// In-memory send channel capacity.
    pub send_queue_capacity: usize,
    /// Optional persistent queue row cap; `None` keeps retention
    /// unbounded.
    pub queue_max_rows: Option<u64>,
    /// Configured workers; empty means the demo worker.
    pub workers: Vec<WorkerSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: "edge-001".into(),
            log_level: "info".into(),
            telemetry_endpoint: "https://localhost/telemetry".into(),
            data_dir: PathBuf::from("/var/lib/edgevisor"),
            flush_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(60),
            circuit_failure_threshold: 3,
            circuit_timeout: Duration::from_secs(60),
            retry_max_attempts: 3,
            retry_initial_delay: Duration::from_secs(2),
            health_interval: Duration::from_secs(10),
            temp_threshold: 75.0,
            hysteresis_margin: 5.0,
            cpu_threshold: 95.0,
            memory_threshold: 90.0,
            warn_debounce: Duration::from_secs(60),
            watchdog_interval: Duration::from_secs(5),
            max_restarts: 10,
            stability_window: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
            send_queue_capacity: 256,
            queue_max_rows: None,
            workers: Vec::new(),
        }
    }
}

impl Config {
    /// Builds the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let map: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&map)
    }

    /// Builds the configuration from a key/value map (testable core).
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        if let Some(v) = lookup(map, "DEVICE_ID") {
            cfg.device_id = v.clone();
        }
        if let Some(v) = lookup(map, "LOG_LEVEL") {
            cfg.log_level = v.to_lowercase();
        }
        if let Some(v) = lookup(map, "TELEMETRY_ENDPOINT") {
            cfg.telemetry_endpoint = v.clone();
        }
        if let Some(v) = lookup(map, "DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }

        cfg.flush_interval = duration_key(map, "FLUSH_INTERVAL", cfg.flush_interval)?;
        cfg.heartbeat_interval = duration_key(map, "HEARTBEAT_INTERVAL", cfg.heartbeat_interval)?;
        cfg.circuit_failure_threshold = parse_key(
            map,
            "CIRCUIT_FAILURE_THRESHOLD",
            cfg.circuit_failure_threshold,
        )?;
        cfg.circuit_timeout = duration_key(map, "CIRCUIT_TIMEOUT", cfg.circuit_timeout)?;
        cfg.retry_max_attempts = parse_key(map, "RETRY_MAX_ATTEMPTS", cfg.retry_max_attempts)?;
        cfg.retry_initial_delay =
            duration_key(map, "RETRY_INITIAL_DELAY", cfg.retry_initial_delay)?;
        cfg.health_interval = duration_key(map, "HEALTH_INTERVAL", cfg.health_interval)?;
        cfg.temp_threshold = parse_key(map, "TEMP_THRESHOLD", cfg.temp_threshold)?;
        cfg.hysteresis_margin = parse_key(map, "HYSTERESIS_MARGIN", cfg.hysteresis_margin)?;
        cfg.cpu_threshold = parse_key(map, "CPU_THRESHOLD", cfg.cpu_threshold)?;
        cfg.memory_threshold = parse_key(map, "MEMORY_THRESHOLD", cfg.memory_threshold)?;
        cfg.warn_debounce = duration_key(map, "WARN_DEBOUNCE", cfg.warn_debounce)?;
        cfg.watchdog_interval = duration_key(map, "WATCHDOG_INTERVAL", cfg.watchdog_interval)?;
        cfg.max_restarts = parse_key(map, "MAX_RESTARTS", cfg.max_restarts)?;
        cfg.stability_window = duration_key(map, "STABILITY_WINDOW", cfg.stability_window)?;
        cfg.stop_grace = duration_key(map, "STOP_GRACE", cfg.stop_grace)?;
        cfg.send_queue_capacity =
            parse_key(map, "SEND_QUEUE_CAPACITY", cfg.send_queue_capacity)?;
        if let Some(v) = lookup(map, "QUEUE_MAX_ROWS") {
            cfg.queue_max_rows = Some(parse_value("QUEUE_MAX_ROWS", v)?);
        }
        if let Some(v) = lookup(map, "WORKERS") {
            cfg.workers = parse_workers(v)?;
        }

        Ok(cfg)
    }

    /// Configured workers, or the demo worker when none were given.
    pub fn workers_or_demo(&self) -> Vec<WorkerSpec> {
        if self.workers.is_empty() {
            vec![WorkerSpec::new(
                "demo",
                vec!["sleep".into(), "3600".into()],
                false,
            )]
        } else {
            self.workers.clone()
        }
    }
}

fn lookup<'m>(map: &'m HashMap<String, String>, key: &str) -> Option<&'m String> {
    map.get(&format!("{ENV_PREFIX}{key}"))
        .filter(|v| !v.trim().is_empty())
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_key<T: std::str::FromStr>(
    map: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(map, key) {
        Some(v) => parse_value(key, v),
        None => Ok(default),
    }
}

/// Durations are configured in (possibly fractional) seconds.
fn duration_key(
    map: &HashMap<String, String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(map, key) {
        Some(v) => {
            let secs: f64 = parse_value(key, v)?;
            if !secs.is_finite() || secs < 0.0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}{key}"),
                    value: v.to_string(),
                    reason: "must be a non-negative number of seconds".into(),
                });
            }
            Ok(Duration::from_secs_f64(secs))
        }
        None => Ok(default),
    }
}

/// Parses the `NAME:COMMAND:BOOL` comma-separated worker list.
fn parse_workers(raw: &str) -> Result<Vec<WorkerSpec>, ConfigError> {
    let mut specs = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let parts: Vec<&str> = entry.splitn(3, ':').collect();
        if parts.len() != 3 {
            return Err(ConfigError::InvalidWorkerSpec {
                entry: entry.to_string(),
                reason: "expected NAME:COMMAND:BOOL".into(),
            });
        }
        let name = parts[0].trim();
        if name.is_empty() {
            return Err(ConfigError::InvalidWorkerSpec {
                entry: entry.to_string(),
                reason: "empty worker name".into(),
            });
        }
        let command: Vec<String> = parts[1].split_whitespace().map(str::to_string).collect();
        if command.is_empty() {
            return Err(ConfigError::InvalidWorkerSpec {
                entry: entry.to_string(),
                reason: "empty command".into(),
            });
        }
        let essential = match parts[2].trim() {
            "true" => true,
            "false" => false,
            other => {
                return Err(ConfigError::InvalidWorkerSpec {
                    entry: entry.to_string(),
                    reason: format!("essential flag must be true or false, got '{other}'"),
                });
            }
        };
        specs.push(WorkerSpec::new(name, command, essential));
    }
    Ok(specs)
}
