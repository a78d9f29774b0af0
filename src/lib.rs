//! Adaptive exhaustive Hamiltonian Monte Carlo.
//!
//! Transitions build a multinomial trajectory tree by repeated doubling
//! and stop once the weighted mean of `d(p·q)/dt` over the trajectory is
//! close to zero. During warm-up the step size is tuned by dual averaging
//! and a diagonal or dense metric is estimated in expanding windows.
//!
//! ```no_run
//! use xhmc_rs::{sample_sequentially, ArrowTraceWriter, CpuLogpFunc, LogpError, XhmcSettings};
//! use thiserror::Error;
//!
//! struct StdNormal;
//!
//! #[derive(Debug, Error)]
//! enum NoError {}
//!
//! impl LogpError for NoError {
//!     fn is_recoverable(&self) -> bool {
//!         false
//!     }
//! }
//!
//! impl CpuLogpFunc for StdNormal {
//!     type LogpError = NoError;
//!
//!     fn dim(&self) -> usize {
//!         2
//!     }
//!
//!     fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NoError> {
//!         let mut logp = 0.;
//!         for (x, grad) in position.iter().zip(gradient.iter_mut()) {
//!             logp -= x * x / 2.;
//!             *grad = -x;
//!         }
//!         Ok(logp)
//!     }
//! }
//!
//! let settings = XhmcSettings::default();
//! let mut writer = ArrowTraceWriter::new(2);
//! let summary = sample_sequentially(StdNormal, &settings, &[0., 0.], 0, &mut writer).unwrap();
//! println!("{} divergences", summary.divergences());
//! let trace = writer.finalize();
//! ```

mod adapt_strategy;
mod chain;
mod euclidean_hamiltonian;
mod hamiltonian;
mod linalg;
mod mass_matrix;
mod mass_matrix_adapt;
mod math;
mod model;
mod sampler;
mod schedule;
mod state;
mod stepsize;
mod trajectory;
mod writer;

pub use adapt_strategy::{AdaptOutcome, DualAverageSettings, WindowedAdaptation};
pub use chain::{Chain, ChainSummary, Sample, SampleStats, XhmcChain};
pub use euclidean_hamiltonian::{EuclideanHamiltonian, EuclideanPoint};
pub use hamiltonian::{Direction, DivergenceInfo, Hamiltonian, LeapfrogResult, Point};
pub use linalg::{check_pos_definite, check_pos_diagonal};
pub use mass_matrix::{DenseMassMatrix, DiagMassMatrix, MassMatrix};
pub use mass_matrix_adapt::{
    DenseMetricAdapter, DiagMetricAdapter, MetricAdaptOptions, MetricAdapter, RunningCovariance,
    RunningVariance,
};
pub use model::{CpuLogpFunc, LogpError, NutsError};
pub use sampler::{sample_sequentially, AdaptOptions, MetricKind, XhmcSettings};
pub use schedule::{AdaptationSchedule, WindowOptions};
pub use state::{State, StateInUse, StatePool};
pub use stepsize::{
    find_reasonable_step_size, AcceptanceRateCollector, DualAverage, DualAverageOptions,
};
pub use trajectory::{draw, Collector, NutsOptions, SampleInfo, TerminationCriterion};
pub use writer::{ArrowTrace, ArrowTraceWriter, Diagnostic, NullWriter, SampleWriter};
