//! Configuration module for the portnote scan core

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Floor for the deadline of a full-range scan
pub const MIN_FULL_RANGE_DEADLINE: Duration = Duration::from_secs(120);

/// Main configuration structure for the orchestrator and the prober
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Per-port connect timeout in milliseconds, also the base for job deadlines
    pub timeout_ms: u64,

    /// Number of worker tasks consuming the job queue
    pub workers: usize,

    /// Connect attempts per second, per probe
    pub rate: u64,

    /// Extra connect attempts on a timed-out port
    pub retries: u32,

    /// Maximum in-flight connects per probe
    pub probe_concurrency: usize,

    /// Read a greeting banner from open ports to label the service
    pub service_discovery: bool,

    /// Where the inventory snapshot is kept
    pub snapshot_path: PathBuf,

    /// Periodic sweep interval in seconds (0 disables the sweep)
    pub sweep_interval_secs: u64,

    /// Delivery queue capacity for each event subscriber
    pub subscriber_buffer: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            workers: 50,
            rate: 3000,
            retries: 1,
            probe_concurrency: 512,
            service_discovery: true,
            snapshot_path: PathBuf::from("data/portnote.json"),
            sweep_interval_secs: 0,
            subscriber_buffer: 8,
        }
    }
}

impl ScanConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-port timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the probe rate limit
    pub fn with_rate(mut self, rate: u64) -> Self {
        self.rate = rate;
        self
    }

    /// Set the probe concurrency
    pub fn with_probe_concurrency(mut self, concurrency: usize) -> Self {
        self.probe_concurrency = concurrency;
        self
    }

    /// Set the snapshot location
    pub fn with_snapshot_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.snapshot_path = path.into();
        self
    }

    /// Set the periodic sweep interval; zero disables the sweep
    ///
    /// The interval is kept in whole seconds. A nonzero interval under one
    /// second is a [`crate::ScanError::ConfigError`].
    pub fn with_sweep_interval(mut self, interval: Duration) -> crate::Result<Self> {
        self.sweep_interval_secs = sweep_secs(interval)?;
        Ok(self)
    }

    /// Get timeout as Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Deadline for a full-range job: 500 × timeout, never below two minutes
    pub fn full_range_deadline(&self) -> Duration {
        std::cmp::max(
            self.timeout_duration().saturating_mul(500),
            MIN_FULL_RANGE_DEADLINE,
        )
    }

    /// Deadline for a targeted job: 10 × timeout
    pub fn targeted_deadline(&self) -> Duration {
        self.timeout_duration().saturating_mul(10)
    }

    /// Job queue capacity, twice the worker count
    pub fn queue_capacity(&self) -> usize {
        self.workers.max(1) * 2
    }

    /// Sweep interval, `None` when disabled
    pub fn sweep_interval(&self) -> Option<Duration> {
        match self.sweep_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::ScanError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: ScanConfig = toml::from_str(&content)
            .map_err(|e| crate::ScanError::ConfigError(format!("Failed to parse TOML: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load_default_config() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let config_path = home_dir.join(".portnote.toml");

        if config_path.exists() {
            match Self::from_toml_file(&config_path) {
                Ok(config) => {
                    log::info!("Loaded config from {}", config_path.display());
                    return config;
                }
                Err(e) => log::warn!("Ignoring {}: {}", config_path.display(), e),
            }
        }

        Self::default()
    }

    /// Apply `PORTNOTE_*` environment overrides
    pub fn apply_env(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(value) = get("PORTNOTE_SCAN_TIMEOUT") {
            match parse_duration(&value) {
                Some(timeout) => self.timeout_ms = timeout.as_millis() as u64,
                None => log::warn!("Ignoring PORTNOTE_SCAN_TIMEOUT={}", value),
            }
        }
        if let Some(value) = get("PORTNOTE_SCAN_CONCURRENCY") {
            match value.parse() {
                Ok(workers) => self.workers = workers,
                Err(_) => log::warn!("Ignoring PORTNOTE_SCAN_CONCURRENCY={}", value),
            }
        }
        if let Some(value) = get("PORTNOTE_DB_PATH") {
            self.snapshot_path = PathBuf::from(value);
        }
        if let Some(value) = get("PORTNOTE_SCAN_INTERVAL") {
            match parse_duration(&value).map(sweep_secs) {
                Some(Ok(secs)) => self.sweep_interval_secs = secs,
                Some(Err(e)) => log::warn!("Ignoring PORTNOTE_SCAN_INTERVAL={}: {}", value, e),
                None => log::warn!("Ignoring PORTNOTE_SCAN_INTERVAL={}", value),
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.workers == 0 {
            return Err(crate::ScanError::ConfigError(
                "Scan concurrency must be positive".to_string(),
            ));
        }

        if self.timeout_ms == 0 {
            return Err(crate::ScanError::ConfigError(
                "Scan timeout must be positive".to_string(),
            ));
        }

        if self.probe_concurrency == 0 {
            return Err(crate::ScanError::ConfigError(
                "Probe concurrency must be positive".to_string(),
            ));
        }

        if self.subscriber_buffer == 0 {
            return Err(crate::ScanError::ConfigError(
                "Subscriber buffer must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn sweep_secs(interval: Duration) -> crate::Result<u64> {
    if !interval.is_zero() && interval < Duration::from_secs(1) {
        return Err(crate::ScanError::ConfigError(format!(
            "Sweep interval {:?} is shorter than one second",
            interval
        )));
    }
    Ok(interval.as_secs())
}

/// Parse `1500ms`, `2s`, `5m`, `1h` or a bare number of seconds
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().ok()?;

    match unit.trim() {
        "ms" => Some(Duration::from_millis(amount)),
        "" | "s" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_secs(amount.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(amount.checked_mul(3600)?)),
        _ => None,
    }
}
