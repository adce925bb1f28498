//! Global adaptive admission control.
//!
//! Detects process-wide overload by comparing the number of requests in
//! flight against a capacity ceiling estimated from recent throughput and
//! latency, tightened when resource pressure crosses a threshold.

mod controller;
mod estimator;
mod pressure;
mod window;

pub use controller::{
    AdaptiveAdmissionController, AdmissionToken, ControllerSnapshot, Outcome, Overloaded,
};
pub use estimator::{BbrEstimator, CapacityEstimator, EstimateInput, FixedCeiling};
pub use pressure::{spawn_pressure_sampler, PressureSampler, ProcStatSampler, SampleError};
pub use window::{RollingWindow, WindowSummary, WindowTotals};
