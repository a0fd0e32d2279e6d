pub mod capture;
pub mod display;
pub mod pipeline;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{Frame, PixelFormat, StreamEndpoint};
pub use pipeline::{AcquisitionService, AcquisitionState};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variables with this prefix override file settings,
/// e.g. `ARGUS__STREAM__ENDPOINT=rtsp://...`.
pub const ENV_PREFIX: &str = "ARGUS";

#[derive(Debug, thiserror::Error)]
#[error("failed to load configuration: {0}")]
pub struct ConfigError(#[from] config::ConfigError);

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub acquisition: AcquisitionConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Connection string handed to the source adapter unmodified.
    pub endpoint: String,
    /// Upper bound on a single blocking pull before it reports a stall.
    pub pull_timeout_ms: u64,
    /// Jitter buffer latency for RTSP sources.
    pub latency_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Pause after a failed pull, clamped to a non-zero bound.
    pub failure_pause_ms: u64,
    /// Throughput window; never shorter than one second.
    pub rate_window_ms: u64,
    /// Consecutive failures after which a stalled source is reported at warn level.
    pub stall_warn_after: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub cadence_ms: u64,
    pub report_interval_ms: u64,
    /// Stop after this many rendered frames; 0 runs until interrupted.
    pub max_frames: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "stub://pattern?width=640&height=480&fps=30".into(),
            pull_timeout_ms: 2_000,
            latency_ms: 0,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            failure_pause_ms: 50,
            rate_window_ms: 1_000,
            stall_warn_after: 20,
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            // cadence_ms: 16, // 60fps display
            cadence_ms: 33, // 30fps display
            report_interval_ms: 1_000,
            max_frames: 0,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `ARGUS__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}

impl StreamConfig {
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }
}

impl RenderConfig {
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms.max(1))
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}
