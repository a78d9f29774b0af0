use std::fmt::Debug;

use thiserror::Error;

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + Send + Sync {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

/// The log density of the target distribution together with its gradient.
///
/// Chains only read the model, but they need `&mut self` so that
/// implementations can keep scratch buffers.
pub trait CpuLogpFunc {
    type LogpError: Debug + LogpError + 'static;

    /// The number of parameters.
    fn dim(&self) -> usize;

    /// Compute the log density at `position` and write its gradient
    /// into `gradient`.
    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NutsError {
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Logp or gradient is not finite at position")]
    NonFiniteEvaluation,

    #[error("Could not initialize state because of bad initial gradient")]
    BadInitGrad(),

    #[error("Invalid sampler settings: {0}")]
    InvalidSettings(String),

    #[error("Metric estimate is not positive definite: {0}")]
    MetricNotPositiveDefinite(String),

    #[error("Posterior is improper, the step size search diverged")]
    ImproperPosterior,

    #[error("Step size search found a step size of zero")]
    StepSizeVanished,

    #[error("Chain position was not initialized")]
    NotInitialized,
}
