//! Resource-pressure sampling.
//!
//! A [`PressureSampler`] produces a load fraction in `[0, 1]`. Samples are
//! pushed into the controller by a background task; a failed sample leaves
//! the controller on its last-known-good value.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::controller::AdaptiveAdmissionController;

/// Why a pressure sample could not be taken.
#[derive(Error, Debug)]
pub enum SampleError {
    /// The sampler needs a second reading before it can report a delta
    #[error("sampler is warming up")]
    Warmup,

    #[error("failed to read CPU statistics: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed CPU statistics: {0}")]
    Parse(String),
}

/// Source of resource-pressure readings.
pub trait PressureSampler: Send + 'static {
    /// Take one reading in `[0, 1]`.
    fn sample(&mut self) -> Result<f64, SampleError>;
}

/// Aggregate CPU jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

fn parse_cpu_line(line: &str) -> Result<CpuTimes, SampleError> {
    let mut fields = line.split_whitespace();
    if fields.next() != Some("cpu") {
        return Err(SampleError::Parse(format!("unexpected line: {:?}", line)));
    }

    let values = fields
        .map(|f| f.parse::<u64>().map_err(|e| SampleError::Parse(format!("{}: {:?}", e, f))))
        .collect::<Result<Vec<u64>, _>>()?;
    if values.len() < 4 {
        return Err(SampleError::Parse(format!("expected at least 4 fields, got {}", values.len())));
    }

    // user nice system idle iowait irq softirq steal ...
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total: u64 = values.iter().take(8).sum();
    Ok(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Samples whole-machine CPU utilisation from `/proc/stat`.
#[derive(Debug)]
pub struct ProcStatSampler {
    path: std::path::PathBuf,
    previous: Option<CpuTimes>,
}

impl ProcStatSampler {
    pub fn new() -> Self {
        Self::with_path("/proc/stat")
    }

    pub fn with_path(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            previous: None,
        }
    }

    fn read(&self) -> Result<CpuTimes, SampleError> {
        let contents = std::fs::read_to_string(&self.path)?;
        let line = contents
            .lines()
            .next()
            .ok_or_else(|| SampleError::Parse("empty file".to_string()))?;
        parse_cpu_line(line)
    }
}

impl Default for ProcStatSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl PressureSampler for ProcStatSampler {
    fn sample(&mut self) -> Result<f64, SampleError> {
        let current = self.read()?;
        let Some(previous) = self.previous.replace(current) else {
            return Err(SampleError::Warmup);
        };

        let total = current.total.saturating_sub(previous.total);
        if total == 0 {
            return Err(SampleError::Warmup);
        }
        let busy = current.busy.saturating_sub(previous.busy);
        Ok((busy as f64 / total as f64).clamp(0.0, 1.0))
    }
}

/// Poll `sampler` every `interval` and feed the readings to `controller`
/// until `shutdown` fires.
pub fn spawn_pressure_sampler<S: PressureSampler>(
    controller: Arc<AdaptiveAdmissionController>,
    mut sampler: S,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Starting pressure sampler");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match sampler.sample() {
                Ok(value) => {
                    let smoothed = controller.record_pressure(value);
                    debug!(sample = value, pressure = smoothed, "Pressure sampled");
                }
                Err(SampleError::Warmup) => {}
                Err(e) => {
                    warn!(
                        error = %e,
                        pressure = controller.pressure(),
                        "Pressure sample failed, keeping last value"
                    );
                }
            }
        }

        info!("Pressure sampler stopped");
    })
}
