use crate::{
    hamiltonian::{Direction, DivergenceInfo, Hamiltonian, LeapfrogResult, Point},
    state::State,
    trajectory::{Collector, NutsOptions},
    NutsError,
};

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

/// Dual averaging of the log step size towards a target acceptance statistic.
#[derive(Debug, Clone)]
pub struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    adapting: bool,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            adapting: true,
            settings,
        }
    }

    pub fn advance(&mut self, accept_stat: f64, target: f64) {
        if !self.adapting {
            return;
        }
        let accept_stat = accept_stat.min(1.);
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    pub fn current_step_size(&self) -> f64 {
        self.log_step.exp()
    }

    pub fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    /// Switch to the averaged step size and ignore further updates.
    pub fn complete_adaptation(&mut self) -> f64 {
        self.log_step = self.log_step_adapted;
        self.adapting = false;
        self.current_step_size()
    }

    /// Forget the iterates but keep the shrinkage target.
    pub fn restart(&mut self) {
        self.hbar = 0.;
        self.log_step_adapted = 0.;
        self.count = 1;
    }

    /// Shrink the iterates towards `10 * step_size`.
    pub fn set_shrinkage_target(&mut self, step_size: f64) {
        self.mu = (10. * step_size).ln();
        self.log_step = step_size.ln();
    }

    pub fn shrinkage_target(&self) -> f64 {
        self.mu
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Mean of `min(1, exp(H0 - H))` over the leapfrog steps of a transition.
/// Divergent steps count as zero.
#[derive(Debug, Clone, Default)]
pub struct AcceptanceRateCollector {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
}

impl AcceptanceRateCollector {
    pub fn new() -> AcceptanceRateCollector {
        Default::default()
    }

    fn start(&mut self, initial_energy: f64) {
        self.initial_energy = initial_energy;
        self.mean.reset();
    }

    pub fn mean_accept(&self) -> f64 {
        self.mean.current()
    }

    pub fn n_steps(&self) -> u64 {
        self.mean.count()
    }
}

impl<P: Point> Collector<P> for AcceptanceRateCollector {
    fn register_leapfrog(
        &mut self,
        _start: &State<P>,
        end: &State<P>,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match divergence_info {
            Some(_) => {
                self.mean.add(0.);
            }
            None => {
                let diff = self.initial_energy - end.energy();
                self.mean.add(diff.min(0.).exp());
            }
        };
    }

    fn register_init(&mut self, state: &State<P>, _options: &NutsOptions) {
        self.start(state.energy());
    }
}

fn one_step_accept<H, R>(
    hamiltonian: &mut H,
    state: &mut State<H::Point>,
    rng: &mut R,
) -> Result<f64, NutsError>
where
    H: Hamiltonian,
    R: rand::Rng + ?Sized,
{
    hamiltonian.initialize_trajectory(state, rng)?;
    let mut collector = AcceptanceRateCollector::new();
    collector.start(state.energy());
    match hamiltonian.leapfrog(state, Direction::Forward, &mut collector) {
        LeapfrogResult::Err(err) => Err(err),
        LeapfrogResult::Ok(_) | LeapfrogResult::Divergence(_) => Ok(collector.mean_accept()),
    }
}

/// Double or halve the step size until the acceptance statistic of a
/// single leapfrog step from `state` crosses `target_accept`.
///
/// The step size of `hamiltonian` is set to the result.
pub fn find_reasonable_step_size<H, R>(
    hamiltonian: &mut H,
    state: &State<H::Point>,
    initial_step: f64,
    target_accept: f64,
    rng: &mut R,
) -> Result<f64, NutsError>
where
    H: Hamiltonian,
    R: rand::Rng + ?Sized,
{
    let mut state = hamiltonian.copy_state(state);
    *hamiltonian.step_size_mut() = initial_step;

    let increase = one_step_accept(hamiltonian, &mut state, rng)? > target_accept;

    loop {
        let step_size = if increase {
            2. * hamiltonian.step_size()
        } else {
            0.5 * hamiltonian.step_size()
        };
        if step_size > 1e7 {
            return Err(NutsError::ImproperPosterior);
        }
        if step_size == 0. {
            return Err(NutsError::StepSizeVanished);
        }
        *hamiltonian.step_size_mut() = step_size;

        let accept_stat = one_step_accept(hamiltonian, &mut state, rng)?;
        let crossed = if increase {
            !(accept_stat > target_accept)
        } else {
            !(accept_stat < target_accept)
        };
        if crossed {
            return Ok(step_size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::euclidean_hamiltonian::{EuclideanHamiltonian, EuclideanPoint};
    use crate::mass_matrix::DiagMassMatrix;
    use crate::model::test_logps::{Flat, NormalLogp};
    use crate::state::StatePool;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn step_size_decreases_below_target() {
        let mut adapt = DualAverage::new(DualAverageOptions::default(), 1.);
        let mut last = f64::INFINITY;
        for _ in 0..500 {
            adapt.advance(0.5, 0.8);
            assert!(adapt.current_step_size() < last);
            last = adapt.current_step_size();
        }
        assert!(adapt.current_step_size_adapted() < 1.);
    }

    #[test]
    fn step_size_increases_above_target() {
        let mut adapt = DualAverage::new(DualAverageOptions::default(), 1.);
        let mut last = 0.;
        for _ in 0..500 {
            adapt.advance(1.0, 0.8);
            assert!(adapt.current_step_size() > last);
            last = adapt.current_step_size();
        }
        assert!(adapt.current_step_size_adapted() > 1.);
    }

    #[test]
    fn first_update_from_shrinkage_target() {
        let mut adapt = DualAverage::new(DualAverageOptions::default(), 0.5);
        adapt.advance(0.8, 0.8);
        assert_abs_diff_eq!(adapt.current_step_size(), 5., epsilon = 1e-12);
        assert_abs_diff_eq!(adapt.current_step_size_adapted(), 5., epsilon = 1e-12);

        // η = 1/12, s̄ = 0.3 / 12, x = ln(5) - s̄ √2 / 0.05
        adapt.advance(0.5, 0.8);
        let hbar = 0.3 / 12.;
        let expected = 5f64.ln() - hbar * 2f64.sqrt() / 0.05;
        assert_abs_diff_eq!(adapt.current_step_size().ln(), expected, epsilon = 1e-12);
    }

    #[test]
    fn restart_keeps_shrinkage_target() {
        let mut adapt = DualAverage::new(DualAverageOptions::default(), 1.);
        for _ in 0..100 {
            adapt.advance(0.3, 0.8);
        }
        adapt.set_shrinkage_target(0.2);
        adapt.restart();
        assert_abs_diff_eq!(adapt.shrinkage_target(), 2f64.ln());
        assert_abs_diff_eq!(adapt.current_step_size(), 0.2);
        adapt.advance(0.8, 0.8);
        assert_abs_diff_eq!(adapt.current_step_size(), 2., epsilon = 1e-12);
        assert_abs_diff_eq!(adapt.current_step_size_adapted(), 2., epsilon = 1e-12);
    }

    #[test]
    fn completed_adaptation_is_frozen() {
        let mut adapt = DualAverage::new(DualAverageOptions::default(), 1.);
        for _ in 0..50 {
            adapt.advance(0.6, 0.8);
        }
        let averaged = adapt.current_step_size_adapted();
        assert_abs_diff_eq!(adapt.complete_adaptation(), averaged);
        adapt.advance(0.1, 0.8);
        assert_abs_diff_eq!(adapt.current_step_size(), averaged);
        assert_abs_diff_eq!(adapt.current_step_size_adapted(), averaged);
    }

    #[test]
    fn acceptance_collector() {
        let pool: StatePool<EuclideanPoint> = StatePool::new(1, 4);
        let state_with_energy = |energy: f64| {
            let mut state = pool.new_state();
            state.try_point_mut().unwrap().potential_energy = energy;
            state
        };
        let options = NutsOptions {
            maxdepth: 10,
            termination: Default::default(),
        };

        let init = state_with_energy(1.);
        let mut collector = AcceptanceRateCollector::new();
        collector.register_init(&init, &options);
        collector.register_leapfrog(&init, &state_with_energy(0.5), None);
        collector.register_leapfrog(&init, &state_with_energy(1. + 2f64.ln()), None);
        let info = DivergenceInfo {
            start_momentum: None,
            start_location: None,
            start_gradient: None,
            end_location: None,
            energy_error: None,
            end_idx_in_trajectory: None,
            start_idx_in_trajectory: None,
            logp_function_error: None,
        };
        collector.register_leapfrog(&init, &init, Some(&info));
        assert_eq!(collector.n_steps(), 3);
        assert_abs_diff_eq!(collector.mean_accept(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn find_step_size_for_normal() {
        let mut hamiltonian = EuclideanHamiltonian::new(
            NormalLogp { dim: 5, mu: 0. },
            DiagMassMatrix::new(5),
            1000.,
            1.,
        );
        let state = hamiltonian.init_state(&[0.5, -0.5, 1., 0., 0.2]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for initial in [1e-4, 1., 100.] {
            let step_size =
                find_reasonable_step_size(&mut hamiltonian, &state, initial, 0.8, &mut rng).unwrap();
            assert!((0.01..10.).contains(&step_size), "{}", step_size);
            assert_eq!(hamiltonian.step_size(), step_size);
        }
    }

    #[test]
    fn improper_posterior() {
        let mut hamiltonian =
            EuclideanHamiltonian::new(Flat { dim: 2 }, DiagMassMatrix::new(2), 1000., 1.);
        let state = hamiltonian.init_state(&[0., 0.]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(matches!(
            find_reasonable_step_size(&mut hamiltonian, &state, 1., 0.8, &mut rng),
            Err(NutsError::ImproperPosterior)
        ));
    }
}
