use crate::{
    euclidean_hamiltonian::{EuclideanHamiltonian, EuclideanPoint},
    hamiltonian::Hamiltonian,
    mass_matrix_adapt::MetricAdapter,
    model::CpuLogpFunc,
    schedule::AdaptationSchedule,
    state::State,
    stepsize::{find_reasonable_step_size, DualAverage, DualAverageOptions},
    NutsError,
};

/// Settings for the step size part of the adaptation
#[derive(Debug, Clone, Copy)]
pub struct DualAverageSettings {
    pub target_accept: f64,
    /// Start value of the step size. If `None`, search for a step size
    /// with acceptance statistic close to `target_accept`.
    pub initial_step: Option<f64>,
    pub params: DualAverageOptions,
}

impl Default for DualAverageSettings {
    fn default() -> Self {
        Self {
            target_accept: 0.8,
            initial_step: None,
            params: DualAverageOptions::default(),
        }
    }
}

/// What happened during a call to [`WindowedAdaptation::adapt`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdaptOutcome {
    /// A window ended and the metric was replaced.
    pub metric_updated: bool,
    /// This was the last warm-up draw, step size and metric are now fixed.
    pub warmup_complete: bool,
}

/// Step size adaptation during the whole warm-up, and metric
/// re-estimation at the end of each slow window.
///
/// Without a metric adapter only the step size is tuned.
pub struct WindowedAdaptation<A: MetricAdapter> {
    step_size_adapt: DualAverage,
    settings: DualAverageSettings,
    schedule: AdaptationSchedule,
    metric_adapt: Option<A>,
    num_metric_updates: u64,
}

impl<A: MetricAdapter> WindowedAdaptation<A> {
    pub fn new(
        settings: DualAverageSettings,
        schedule: AdaptationSchedule,
        metric_adapt: Option<A>,
    ) -> Self {
        Self {
            step_size_adapt: DualAverage::new(settings.params, settings.initial_step.unwrap_or(1.)),
            settings,
            schedule,
            metric_adapt,
            num_metric_updates: 0,
        }
    }

    /// Choose the initial step size at the start position of the chain.
    pub fn init<F, R>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F, A::MassMatrix>,
        state: &State<EuclideanPoint>,
        rng: &mut R,
    ) -> Result<(), NutsError>
    where
        F: CpuLogpFunc,
        R: rand::Rng + ?Sized,
    {
        let step_size = match self.settings.initial_step {
            Some(step_size) => step_size,
            None => find_reasonable_step_size(
                hamiltonian,
                state,
                1.,
                self.settings.target_accept,
                rng,
            )?,
        };
        self.step_size_adapt = DualAverage::new(self.settings.params, step_size);
        *hamiltonian.step_size_mut() = step_size;
        Ok(())
    }

    /// Update step size and metric after warm-up draw number `draw`.
    ///
    /// `state` is the draw and `accept_stat` the mean acceptance statistic
    /// of the transition that produced it. Does nothing after warm-up.
    pub fn adapt<F, R>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F, A::MassMatrix>,
        state: &State<EuclideanPoint>,
        draw: u64,
        accept_stat: f64,
        rng: &mut R,
    ) -> Result<AdaptOutcome, NutsError>
    where
        F: CpuLogpFunc,
        R: rand::Rng + ?Sized,
    {
        let mut outcome = AdaptOutcome::default();
        if !self.is_tuning(draw) {
            return Ok(outcome);
        }

        let target = self.settings.target_accept;
        self.step_size_adapt.advance(accept_stat, target);
        *hamiltonian.step_size_mut() = self.step_size_adapt.current_step_size();

        if let (Some(metric_adapt), Some(window)) =
            (self.metric_adapt.as_mut(), self.schedule.window_index(draw))
        {
            if draw == self.schedule.window_start(window) {
                metric_adapt.set_window(self.schedule.window_len(window));
            }
            if metric_adapt.learn(hamiltonian.mass_matrix_mut(), &state.position)? {
                let initial = hamiltonian.step_size();
                let step_size =
                    find_reasonable_step_size(hamiltonian, state, initial, target, rng)?;
                self.step_size_adapt.set_shrinkage_target(step_size);
                self.step_size_adapt.restart();
                self.num_metric_updates += 1;
                log::debug!(
                    "Metric updated at draw {} (window {}), new step size {:.4}",
                    draw,
                    window,
                    step_size
                );
                outcome.metric_updated = true;
            }
        }

        if draw + 1 == self.schedule.num_tune() {
            let step_size = self.step_size_adapt.complete_adaptation();
            *hamiltonian.step_size_mut() = step_size;
            log::info!(
                "Warm-up complete after {} draws, step size {:.4}, {} metric updates",
                draw + 1,
                step_size,
                self.num_metric_updates
            );
            outcome.warmup_complete = true;
        }
        Ok(outcome)
    }

    pub fn is_tuning(&self, draw: u64) -> bool {
        draw < self.schedule.num_tune()
    }

    pub fn schedule(&self) -> &AdaptationSchedule {
        &self.schedule
    }

    pub fn num_metric_updates(&self) -> u64 {
        self.num_metric_updates
    }

    pub fn step_size_bar(&self) -> f64 {
        self.step_size_adapt.current_step_size_adapted()
    }
}
