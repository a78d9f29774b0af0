use std::sync::Arc;

use crate::hamiltonian::{Direction, DivergenceInfo, Hamiltonian, LeapfrogResult, Point};
use crate::mass_matrix::MassMatrix;
use crate::math::{all_finite, axpy, axpy_out, scalar_prods2, scalar_prods3, vector_dot};
use crate::model::{CpuLogpFunc, LogpError};
use crate::state::{State, StatePool};
use crate::trajectory::Collector;
use crate::NutsError;

/// Hamiltonian dynamics with a position independent metric.
pub struct EuclideanHamiltonian<F: CpuLogpFunc, Mass: MassMatrix> {
    logp: F,
    pub(crate) mass_matrix: Mass,
    max_energy_error: f64,
    step_size: f64,
    pool: StatePool<EuclideanPoint>,
    num_evaluations: u64,
}

impl<F: CpuLogpFunc, Mass: MassMatrix> EuclideanHamiltonian<F, Mass> {
    pub fn new(logp: F, mass_matrix: Mass, max_energy_error: f64, step_size: f64) -> Self {
        let pool = StatePool::new(logp.dim(), 10);
        EuclideanHamiltonian {
            logp,
            mass_matrix,
            max_energy_error,
            step_size,
            pool,
            num_evaluations: 0,
        }
    }

    pub fn logp_func_mut(&mut self) -> &mut F {
        &mut self.logp
    }

    /// Number of logp and gradient evaluations so far, including failed ones.
    pub fn num_evaluations(&self) -> u64 {
        self.num_evaluations
    }

    pub fn mass_matrix(&self) -> &Mass {
        &self.mass_matrix
    }

    pub fn mass_matrix_mut(&mut self) -> &mut Mass {
        &mut self.mass_matrix
    }

    /// Potential energy `-logp(position)`, writing the gradient of logp.
    ///
    /// Recoverable model errors and non-finite values are reported as
    /// [`NutsError::NonFiniteEvaluation`].
    pub fn potential(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NutsError> {
        self.num_evaluations += 1;
        let logp = match self.logp.logp(position, gradient) {
            Ok(logp) => logp,
            Err(err) if err.is_recoverable() => return Err(NutsError::NonFiniteEvaluation),
            Err(err) => return Err(NutsError::LogpFailure(Box::new(err))),
        };
        if !logp.is_finite() || !all_finite(gradient) {
            return Err(NutsError::NonFiniteEvaluation);
        }
        Ok(-logp)
    }

    /// Kinetic energy `½ pᵀ M⁻¹ p` under the current metric.
    pub fn kinetic(&self, momentum: &[f64]) -> f64 {
        let mut state = self.pool.new_state();
        let point = state
            .try_point_mut()
            .expect("New state should not have references");
        point.momentum.copy_from_slice(momentum);
        self.mass_matrix.update_velocity(point);
        self.mass_matrix.update_kinetic_energy(point);
        point.kinetic_energy
    }

    fn update_potential_gradient(&mut self, point: &mut EuclideanPoint) -> Result<(), F::LogpError> {
        self.num_evaluations += 1;
        let logp = self.logp.logp(&point.position, &mut point.gradient)?;
        point.potential_energy = -logp;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EuclideanPoint {
    pub position: Box<[f64]>,
    pub velocity: Box<[f64]>,
    pub gradient: Box<[f64]>,
    pub momentum: Box<[f64]>,
    pub kinetic_energy: f64,
    pub potential_energy: f64,
    pub index_in_trajectory: i64,
    pub p_sum: Box<[f64]>,
    pub initial_energy: f64,
}

impl EuclideanPoint {
    fn is_turning(&self, other: &Self) -> bool {
        let (start, end) = if self.index_in_trajectory() < other.index_in_trajectory() {
            (self, other)
        } else {
            (other, self)
        };

        let a = start.index_in_trajectory();
        let b = end.index_in_trajectory();

        assert!(a < b);
        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(
                &end.p_sum,
                &start.p_sum,
                &start.momentum,
                &end.velocity,
                &start.velocity,
            )
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.velocity, &start.velocity)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(
                &start.p_sum,
                &end.p_sum,
                &end.momentum,
                &end.velocity,
                &start.velocity,
            )
        };

        (turn1 < 0.) | (turn2 < 0.)
    }

    fn first_momentum_halfstep(&self, out: &mut Self, epsilon: f64) {
        axpy_out(&self.gradient, &self.momentum, epsilon / 2., &mut out.momentum);
    }

    fn position_step(&self, out: &mut Self, epsilon: f64) {
        axpy_out(&out.velocity, &self.position, epsilon, &mut out.position);
    }

    fn second_momentum_halfstep(&mut self, epsilon: f64) {
        axpy(&self.gradient, &mut self.momentum, epsilon / 2.);
    }

    fn set_psum(&self, out: &mut Self) {
        assert!(out.index_in_trajectory != 0);

        if out.index_in_trajectory == -1 {
            out.p_sum.copy_from_slice(&out.momentum);
        } else {
            axpy_out(&out.momentum, &self.p_sum, 1., &mut out.p_sum);
        }
    }

    fn box_position(&self) -> Box<[f64]> {
        self.position.clone()
    }
}

impl Point for EuclideanPoint {
    fn position(&self) -> &[f64] {
        &self.position
    }

    fn gradient(&self) -> &[f64] {
        &self.gradient
    }

    fn energy(&self) -> f64 {
        self.potential_energy + self.kinetic_energy
    }

    fn initial_energy(&self) -> f64 {
        self.initial_energy
    }

    // p·M⁻¹p + q·∇logp
    fn virial_rate(&self) -> f64 {
        2. * self.kinetic_energy + vector_dot(&self.position, &self.gradient)
    }

    fn new(dim: usize) -> Self {
        Self {
            position: vec![0f64; dim].into(),
            velocity: vec![0f64; dim].into(),
            gradient: vec![0f64; dim].into(),
            momentum: vec![0f64; dim].into(),
            kinetic_energy: 0f64,
            potential_energy: 0f64,
            index_in_trajectory: 0,
            p_sum: vec![0f64; dim].into(),
            initial_energy: 0f64,
        }
    }

    fn index_in_trajectory(&self) -> i64 {
        self.index_in_trajectory
    }

    fn logp(&self) -> f64 {
        -self.potential_energy
    }

    fn copy_into(&self, other: &mut Self) {
        let Self {
            position,
            velocity,
            gradient,
            momentum,
            kinetic_energy,
            potential_energy,
            index_in_trajectory,
            p_sum,
            initial_energy,
        } = self;
        other.position.copy_from_slice(position);
        other.velocity.copy_from_slice(velocity);
        other.gradient.copy_from_slice(gradient);
        other.momentum.copy_from_slice(momentum);
        other.p_sum.copy_from_slice(p_sum);
        other.kinetic_energy = *kinetic_energy;
        other.potential_energy = *potential_energy;
        other.initial_energy = *initial_energy;
        other.index_in_trajectory = *index_in_trajectory;
    }
}

impl<F: CpuLogpFunc, Mass: MassMatrix> Hamiltonian for EuclideanHamiltonian<F, Mass> {
    type Point = EuclideanPoint;

    fn leapfrog<C: Collector<Self::Point>>(
        &mut self,
        start: &State<Self::Point>,
        dir: Direction,
        collector: &mut C,
    ) -> LeapfrogResult<Self::Point> {
        let mut out = self.pool.new_state();
        let out_point = out
            .try_point_mut()
            .expect("New point has other references");

        out_point.initial_energy = start.point().initial_energy();

        let sign = dir.sign();
        let epsilon = (sign as f64) * self.step_size;

        start.point().first_momentum_halfstep(out_point, epsilon);
        self.mass_matrix.update_velocity(out_point);

        start.point().position_step(out_point, epsilon);
        if let Err(logp_error) = self.update_potential_gradient(out_point) {
            if !logp_error.is_recoverable() {
                return LeapfrogResult::Err(NutsError::LogpFailure(Box::new(logp_error)));
            }
            let div_info = DivergenceInfo {
                logp_function_error: Some(Arc::new(logp_error)),
                start_location: Some(start.point().box_position()),
                start_gradient: Some(start.point().gradient.clone()),
                start_momentum: Some(start.point().momentum.clone()),
                end_location: None,
                start_idx_in_trajectory: Some(start.point().index_in_trajectory()),
                end_idx_in_trajectory: None,
                energy_error: None,
            };
            collector.register_leapfrog(start, &out, Some(&div_info));
            return LeapfrogResult::Divergence(div_info);
        }

        out_point.second_momentum_halfstep(epsilon);

        self.mass_matrix.update_velocity(out_point);
        self.mass_matrix.update_kinetic_energy(out_point);

        out_point.index_in_trajectory = start.index_in_trajectory() + sign;

        start.point().set_psum(out_point);

        let energy_error = out_point.energy_error();
        if (energy_error.abs() > self.max_energy_error) | !energy_error.is_finite() {
            let divergence_info = DivergenceInfo {
                logp_function_error: None,
                start_location: Some(start.point().box_position()),
                start_gradient: Some(start.point().gradient.clone()),
                end_location: Some(out_point.box_position()),
                start_momentum: Some(start.point().momentum.clone()),
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                end_idx_in_trajectory: Some(out_point.index_in_trajectory()),
                energy_error: Some(energy_error),
            };
            collector.register_leapfrog(start, &out, Some(&divergence_info));
            return LeapfrogResult::Divergence(divergence_info);
        }

        collector.register_leapfrog(start, &out, None);

        LeapfrogResult::Ok(out)
    }

    fn init_state(&mut self, init: &[f64]) -> Result<State<Self::Point>, NutsError> {
        if init.len() != self.dim() {
            return Err(NutsError::InvalidSettings(format!(
                "initial position has length {}, expected {}",
                init.len(),
                self.dim()
            )));
        }
        let mut state = self.pool.new_state();
        let point = state.try_point_mut().expect("State already in use");
        point.position.copy_from_slice(init);
        point.p_sum.fill(0.);
        point.index_in_trajectory = 0;

        self.update_potential_gradient(point)
            .map_err(|e| NutsError::LogpFailure(Box::new(e)))?;
        if !point.potential_energy.is_finite() {
            Err(NutsError::NonFiniteEvaluation)
        } else if !all_finite(&point.gradient) {
            Err(NutsError::BadInitGrad())
        } else {
            Ok(state)
        }
    }

    fn initialize_trajectory<R: rand::Rng + ?Sized>(
        &self,
        state: &mut State<Self::Point>,
        rng: &mut R,
    ) -> Result<(), NutsError> {
        let inner = state.try_point_mut().expect("State has other references");
        self.mass_matrix.randomize_momentum(inner, rng);
        self.mass_matrix.update_velocity(inner);
        self.mass_matrix.update_kinetic_energy(inner);
        inner.index_in_trajectory = 0;
        inner.initial_energy = inner.energy();
        inner.p_sum.copy_from_slice(&inner.momentum);
        Ok(())
    }

    fn is_turning(&self, state1: &State<Self::Point>, state2: &State<Self::Point>) -> bool {
        state1.point().is_turning(state2.point())
    }

    fn copy_state(&mut self, state: &State<Self::Point>) -> State<Self::Point> {
        self.pool.copy_state(state)
    }

    fn step_size(&self) -> f64 {
        self.step_size
    }

    fn step_size_mut(&mut self) -> &mut f64 {
        &mut self.step_size
    }

    fn dim(&self) -> usize {
        self.logp.dim()
    }
}
