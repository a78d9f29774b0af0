use anyhow::{Context, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{
    adapt_strategy::{DualAverageSettings, WindowedAdaptation},
    chain::{Chain, ChainSummary, XhmcChain},
    euclidean_hamiltonian::EuclideanHamiltonian,
    mass_matrix::{DenseMassMatrix, DiagMassMatrix},
    mass_matrix_adapt::{DenseMetricAdapter, DiagMetricAdapter, MetricAdaptOptions, MetricAdapter},
    model::CpuLogpFunc,
    schedule::{AdaptationSchedule, WindowOptions},
    stepsize::DualAverageOptions,
    trajectory::{NutsOptions, TerminationCriterion},
    NutsError,
};

/// The metric (inverse mass matrix) used by the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricKind {
    /// The identity, never adapted.
    Unit,
    /// A diagonal metric estimated from the draw variances.
    #[default]
    Diag,
    /// A full metric estimated from the draw covariance.
    Dense,
}

/// Settings for warm-up.
#[derive(Debug, Clone, Default)]
pub struct AdaptOptions {
    pub dual_average: DualAverageOptions,
    pub windows: WindowOptions,
    pub metric: MetricAdaptOptions,
    /// Explicit last draw of every slow window. If set, this replaces
    /// the doubling schedule of `windows`; the first window still starts
    /// after `windows.init_buffer` draws.
    pub window_schedule: Option<Vec<u64>>,
}

/// Settings for adaptive exhaustive HMC
#[derive(Debug, Clone)]
pub struct XhmcSettings {
    /// The number of tuning steps, where we fit the step size and metric.
    pub num_tune: u64,
    /// The number of draws after tuning
    pub num_draws: u64,
    /// The maximum tree depth. The number of leapfrog steps
    /// is smaller than 2 ^ maxdepth.
    pub maxdepth: u64,
    /// If the energy error is larger than this threshold we treat the leapfrog
    /// step as a divergence.
    pub max_energy_error: f64,
    pub target_accept: f64,
    /// Start value of the step size, search for one if `None`.
    pub initial_step_size: Option<f64>,
    /// Relative amount of uniform noise on the step size of each transition.
    pub step_size_jitter: f64,
    pub metric: MetricKind,
    pub termination: TerminationCriterion,
    pub adapt_options: AdaptOptions,
    pub seed: u64,
}

impl Default for XhmcSettings {
    fn default() -> Self {
        Self {
            num_tune: 1000,
            num_draws: 1000,
            maxdepth: 10,
            max_energy_error: 1000f64,
            target_accept: 0.8,
            initial_step_size: None,
            step_size_jitter: 0.,
            metric: MetricKind::Diag,
            termination: TerminationCriterion::default(),
            adapt_options: AdaptOptions::default(),
            seed: 0,
        }
    }
}

fn invalid(message: impl Into<String>) -> NutsError {
    NutsError::InvalidSettings(message.into())
}

impl XhmcSettings {
    pub fn validate(&self) -> Result<(), NutsError> {
        if self.num_tune == 0 {
            return Err(invalid("num_tune must be positive"));
        }
        if self.maxdepth == 0 || self.maxdepth > 30 {
            return Err(invalid(format!(
                "maxdepth must be between 1 and 30, got {}",
                self.maxdepth
            )));
        }
        if !(self.target_accept > 0. && self.target_accept < 1.) {
            return Err(invalid(format!(
                "target_accept must be in (0, 1), got {}",
                self.target_accept
            )));
        }
        if let Some(step_size) = self.initial_step_size {
            if !(step_size.is_finite() && step_size > 0.) {
                return Err(invalid(format!(
                    "initial_step_size must be positive and finite, got {}",
                    step_size
                )));
            }
        }
        if !(self.max_energy_error > 0.) {
            return Err(invalid(format!(
                "max_energy_error must be positive, got {}",
                self.max_energy_error
            )));
        }
        if !(self.step_size_jitter >= 0. && self.step_size_jitter < 1.) {
            return Err(invalid(format!(
                "step_size_jitter must be in [0, 1), got {}",
                self.step_size_jitter
            )));
        }
        if let TerminationCriterion::Exhaustive { threshold } = self.termination {
            if !(threshold.is_finite() && threshold > 0.) {
                return Err(invalid(format!(
                    "Exhaustive termination threshold must be positive, got {}",
                    threshold
                )));
            }
        }
        self.validate_adapt_options()?;
        self.schedule()?;
        Ok(())
    }

    fn validate_adapt_options(&self) -> Result<(), NutsError> {
        let DualAverageOptions { k, t0, gamma } = self.adapt_options.dual_average;
        if !(gamma.is_finite() && gamma > 0.) {
            return Err(invalid(format!(
                "Dual averaging gamma must be positive, got {}",
                gamma
            )));
        }
        if !(t0.is_finite() && t0 >= 0.) {
            return Err(invalid(format!(
                "Dual averaging t0 must be non-negative, got {}",
                t0
            )));
        }
        if !(k > 0. && k <= 1.) {
            return Err(invalid(format!("Dual averaging k must be in (0, 1], got {}", k)));
        }

        let metric = &self.adapt_options.metric;
        if metric.min_window_samples < 2 {
            return Err(invalid(format!(
                "min_window_samples must be at least 2, got {}",
                metric.min_window_samples
            )));
        }
        if !(metric.shrinkage_count.is_finite() && metric.shrinkage_count >= 0.) {
            return Err(invalid(format!(
                "shrinkage_count must be non-negative, got {}",
                metric.shrinkage_count
            )));
        }
        if !(metric.shrinkage_target.is_finite() && metric.shrinkage_target >= 0.) {
            return Err(invalid(format!(
                "shrinkage_target must be non-negative, got {}",
                metric.shrinkage_target
            )));
        }
        Ok(())
    }

    fn schedule(&self) -> Result<AdaptationSchedule, NutsError> {
        let options = &self.adapt_options;
        let min_window = options.metric.min_window_samples;
        match options.window_schedule.as_ref() {
            Some(ends) => AdaptationSchedule::from_explicit(
                self.num_tune,
                options.windows.init_buffer,
                ends.clone(),
                min_window,
            ),
            None => Ok(AdaptationSchedule::new(
                self.num_tune,
                options.windows,
                min_window,
            )),
        }
    }

    fn dual_average_settings(&self) -> DualAverageSettings {
        DualAverageSettings {
            target_accept: self.target_accept,
            initial_step: self.initial_step_size,
            params: self.adapt_options.dual_average,
        }
    }

    fn options(&self) -> NutsOptions {
        NutsOptions {
            maxdepth: self.maxdepth,
            termination: self.termination,
        }
    }

    fn rng(&self, chain: u64) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(chain);
        rng
    }

    fn build_chain<F, A>(
        &self,
        chain: u64,
        hamiltonian: EuclideanHamiltonian<F, A::MassMatrix>,
        metric_adapt: Option<A>,
    ) -> Result<XhmcChain<F, A, ChaCha8Rng>, NutsError>
    where
        F: CpuLogpFunc,
        A: MetricAdapter,
    {
        let strategy =
            WindowedAdaptation::new(self.dual_average_settings(), self.schedule()?, metric_adapt);
        Ok(XhmcChain::new(
            hamiltonian,
            strategy,
            self.options(),
            self.rng(chain),
            chain,
            self.step_size_jitter,
        ))
    }

    /// Create a chain for the density `logp` with the metric selected
    /// in the settings.
    pub fn new_chain<F: CpuLogpFunc + 'static>(
        &self,
        chain: u64,
        logp: F,
    ) -> Result<Box<dyn Chain>, NutsError> {
        self.validate()?;
        let dim = logp.dim();
        let step_size = self.initial_step_size.unwrap_or(1.);
        let metric_options = self.adapt_options.metric;
        Ok(match self.metric {
            MetricKind::Unit => {
                let hamiltonian = EuclideanHamiltonian::new(
                    logp,
                    DiagMassMatrix::new(dim),
                    self.max_energy_error,
                    step_size,
                );
                Box::new(self.build_chain::<F, DiagMetricAdapter>(chain, hamiltonian, None)?)
            }
            MetricKind::Diag => {
                let hamiltonian = EuclideanHamiltonian::new(
                    logp,
                    DiagMassMatrix::new(dim),
                    self.max_energy_error,
                    step_size,
                );
                let adapt = DiagMetricAdapter::new(dim, metric_options);
                Box::new(self.build_chain(chain, hamiltonian, Some(adapt))?)
            }
            MetricKind::Dense => {
                let hamiltonian = EuclideanHamiltonian::new(
                    logp,
                    DenseMassMatrix::new(dim),
                    self.max_energy_error,
                    step_size,
                );
                let adapt = DenseMetricAdapter::new(dim, metric_options);
                Box::new(self.build_chain(chain, hamiltonian, Some(adapt))?)
            }
        })
    }
}

/// Run warm-up and sampling of a single chain starting at `start`,
/// passing all draws and diagnostics to `writer`.
pub fn sample_sequentially<F, W>(
    logp: F,
    settings: &XhmcSettings,
    start: &[f64],
    chain: u64,
    writer: &mut W,
) -> Result<ChainSummary>
where
    F: CpuLogpFunc + 'static,
    W: crate::writer::SampleWriter + ?Sized,
{
    let mut sampler = settings
        .new_chain(chain, logp)
        .context("Could not create chain")?;
    sampler
        .set_position(start)
        .context("Could not initialize chain")?;
    let total = settings.num_tune + settings.num_draws;
    for draw in 0..total {
        let sample = sampler
            .draw()
            .with_context(|| format!("Chain {} failed at draw {}", chain, draw))?;
        writer.append_sample(&sample)?;
        for diagnostic in sample.diagnostics.iter() {
            writer.append_diagnostic(chain, diagnostic)?;
        }
    }
    let summary = sampler.summary();
    log::info!(
        "Chain {} finished: {} divergences, {} max depth hits after warm-up, step size {:.4}",
        chain,
        summary.divergences_sampling,
        summary.maxdepth_sampling,
        summary.step_size
    );
    Ok(summary)
}
