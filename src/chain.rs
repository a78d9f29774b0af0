use rand::Rng;

use crate::{
    adapt_strategy::WindowedAdaptation,
    euclidean_hamiltonian::{EuclideanHamiltonian, EuclideanPoint},
    hamiltonian::{Hamiltonian, Point},
    mass_matrix::MassMatrix,
    mass_matrix_adapt::MetricAdapter,
    model::CpuLogpFunc,
    state::State,
    stepsize::AcceptanceRateCollector,
    trajectory::{draw, NutsOptions, SampleInfo},
    writer::Diagnostic,
    NutsError,
};

/// Draw samples from the posterior distribution using adaptive
/// exhaustive Hamiltonian Monte Carlo.
pub trait Chain {
    /// Initialize the sampler to a position. This should be called
    /// before calling draw.
    ///
    /// This fails if the logp function returns an error.
    fn set_position(&mut self, position: &[f64]) -> Result<(), NutsError>;

    /// Run one transition and return the new draw with its statistics.
    fn draw(&mut self) -> Result<Sample, NutsError>;

    /// The dimensionality of the posterior.
    fn dim(&self) -> usize;

    /// Whether the next draw is part of the warm-up.
    fn is_tuning(&self) -> bool;

    /// The nominal step size for the next transition.
    fn step_size(&self) -> f64;

    fn summary(&self) -> ChainSummary;
}

/// Statistics of a single transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleStats {
    pub logp: f64,
    pub energy: f64,
    pub energy_error: f64,
    /// Mean acceptance statistic over all leapfrog steps of the transition.
    pub accept_stat: f64,
    /// The step size used for this transition, including jitter.
    pub step_size: f64,
    pub depth: u64,
    pub n_steps: u64,
    pub index_in_trajectory: i64,
    pub diverging: bool,
    pub maxdepth_reached: bool,
    pub tuning: bool,
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub chain: u64,
    pub draw: u64,
    pub position: Box<[f64]>,
    pub stats: SampleStats,
    /// Diagnostics raised during this transition.
    pub diagnostics: Vec<Diagnostic>,
}

/// Counts of problems and final adaptation state of a chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainSummary {
    pub chain: u64,
    pub num_draws: u64,
    pub divergences_tuning: u64,
    pub divergences_sampling: u64,
    pub maxdepth_tuning: u64,
    pub maxdepth_sampling: u64,
    pub num_metric_updates: u64,
    pub step_size: f64,
    pub condition_number: f64,
    /// All logp evaluations of the chain, step size searches included.
    pub gradient_evaluations: u64,
}

impl ChainSummary {
    pub fn divergences(&self) -> u64 {
        self.divergences_tuning + self.divergences_sampling
    }
}

pub struct XhmcChain<F, A, R>
where
    F: CpuLogpFunc,
    A: MetricAdapter,
    R: rand::Rng,
{
    hamiltonian: EuclideanHamiltonian<F, A::MassMatrix>,
    strategy: WindowedAdaptation<A>,
    options: NutsOptions,
    rng: R,
    state: Option<State<EuclideanPoint>>,
    chain: u64,
    draw_count: u64,
    step_size_jitter: f64,
    summary: ChainSummary,
}

impl<F, A, R> XhmcChain<F, A, R>
where
    F: CpuLogpFunc,
    A: MetricAdapter,
    R: rand::Rng,
{
    pub fn new(
        hamiltonian: EuclideanHamiltonian<F, A::MassMatrix>,
        strategy: WindowedAdaptation<A>,
        options: NutsOptions,
        rng: R,
        chain: u64,
        step_size_jitter: f64,
    ) -> Self {
        XhmcChain {
            hamiltonian,
            strategy,
            options,
            rng,
            state: None,
            chain,
            draw_count: 0,
            step_size_jitter,
            summary: ChainSummary {
                chain,
                ..Default::default()
            },
        }
    }

    pub fn hamiltonian(&self) -> &EuclideanHamiltonian<F, A::MassMatrix> {
        &self.hamiltonian
    }

    fn jittered_step_size(&mut self) -> f64 {
        let nominal = self.hamiltonian.step_size();
        if self.step_size_jitter == 0. {
            return nominal;
        }
        let u: f64 = self.rng.random();
        nominal * (1. + self.step_size_jitter * (2. * u - 1.))
    }

    fn record_problems(&mut self, info: &SampleInfo, tuning: bool, diagnostics: &mut Vec<Diagnostic>) {
        let iteration = self.draw_count;
        if let Some(div_info) = info.divergence_info.as_ref() {
            if tuning {
                self.summary.divergences_tuning += 1;
                log::debug!(
                    "Chain {}: divergence during warm-up at draw {}",
                    self.chain,
                    iteration
                );
            } else {
                self.summary.divergences_sampling += 1;
                log::warn!(
                    "Chain {}: divergence at draw {}, energy error {:?}",
                    self.chain,
                    iteration,
                    div_info.energy_error
                );
            }
            diagnostics.push(Diagnostic::Divergence {
                iteration,
                tuning,
                energy_error: div_info.energy_error,
            });
        }
        if info.reached_maxdepth {
            if tuning {
                self.summary.maxdepth_tuning += 1;
                log::debug!(
                    "Chain {}: maximum tree depth reached during warm-up at draw {}",
                    self.chain,
                    iteration
                );
            } else {
                self.summary.maxdepth_sampling += 1;
                log::warn!(
                    "Chain {}: maximum tree depth {} reached at draw {}",
                    self.chain,
                    info.depth,
                    iteration
                );
            }
            diagnostics.push(Diagnostic::MaxTreeDepth {
                iteration,
                tuning,
                depth: info.depth,
            });
        }
    }
}

impl<F, A, R> Chain for XhmcChain<F, A, R>
where
    F: CpuLogpFunc,
    A: MetricAdapter,
    R: rand::Rng,
{
    fn set_position(&mut self, position: &[f64]) -> Result<(), NutsError> {
        let state = self.hamiltonian.init_state(position)?;
        self.strategy
            .init(&mut self.hamiltonian, &state, &mut self.rng)?;
        self.state = Some(state);
        Ok(())
    }

    fn draw(&mut self) -> Result<Sample, NutsError> {
        if self.state.is_none() {
            return Err(NutsError::NotInitialized);
        }
        let tuning = self.strategy.is_tuning(self.draw_count);
        let nominal = self.hamiltonian.step_size();
        let step_size = self.jittered_step_size();
        *self.hamiltonian.step_size_mut() = step_size;

        let mut collector = AcceptanceRateCollector::new();
        let init = self.state.as_mut().ok_or(NutsError::NotInitialized)?;
        let result = draw(
            init,
            &mut self.rng,
            &mut self.hamiltonian,
            &self.options,
            &mut collector,
        );
        *self.hamiltonian.step_size_mut() = nominal;
        let (state, info) = result?;

        let mut diagnostics = vec![];
        self.record_problems(&info, tuning, &mut diagnostics);

        let outcome = self.strategy.adapt(
            &mut self.hamiltonian,
            &state,
            self.draw_count,
            collector.mean_accept(),
            &mut self.rng,
        )?;
        if outcome.metric_updated {
            diagnostics.push(Diagnostic::MetricUpdated {
                iteration: self.draw_count,
                step_size: self.hamiltonian.step_size(),
                condition_number: self.hamiltonian.mass_matrix().condition_number(),
            });
        }
        if outcome.warmup_complete {
            diagnostics.push(Diagnostic::WarmupComplete {
                iteration: self.draw_count,
                step_size: self.hamiltonian.step_size(),
            });
        }

        let point = state.point();
        let sample = Sample {
            chain: self.chain,
            draw: self.draw_count,
            position: point.position.clone(),
            stats: SampleStats {
                logp: point.logp(),
                energy: point.energy(),
                energy_error: point.energy_error(),
                accept_stat: collector.mean_accept(),
                step_size,
                depth: info.depth,
                n_steps: collector.n_steps(),
                index_in_trajectory: point.index_in_trajectory(),
                diverging: info.divergence_info.is_some(),
                maxdepth_reached: info.reached_maxdepth,
                tuning,
            },
            diagnostics,
        };

        self.draw_count += 1;
        self.summary.num_draws = self.draw_count;
        self.state = Some(state);
        Ok(sample)
    }

    fn dim(&self) -> usize {
        self.hamiltonian.dim()
    }

    fn is_tuning(&self) -> bool {
        self.strategy.is_tuning(self.draw_count)
    }

    fn step_size(&self) -> f64 {
        self.hamiltonian.step_size()
    }

    fn summary(&self) -> ChainSummary {
        ChainSummary {
            step_size: self.hamiltonian.step_size(),
            condition_number: self.hamiltonian.mass_matrix().condition_number(),
            num_metric_updates: self.strategy.num_metric_updates(),
            gradient_evaluations: self.hamiltonian.num_evaluations(),
            ..self.summary.clone()
        }
    }
}
