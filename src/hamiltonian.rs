use std::sync::Arc;

use rand_distr::{Distribution, StandardUniform};

use crate::{
    state::State,
    trajectory::Collector,
    NutsError,
};

/// Details about a divergence that might have occured during sampling
///
/// There are two reasons why we might observe a divergence:
/// - The integration error of the Hamiltonian is larger than
///   a cutoff value or nan.
/// - The logp function caused a recoverable error (eg if an ODE solver
///   failed)
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    pub start_momentum: Option<Box<[f64]>>,
    pub start_location: Option<Box<[f64]>>,
    pub start_gradient: Option<Box<[f64]>>,
    pub end_location: Option<Box<[f64]>>,
    pub energy_error: Option<f64>,
    pub end_idx_in_trajectory: Option<i64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

pub enum LeapfrogResult<P: Point> {
    Ok(State<P>),
    Divergence(DivergenceInfo),
    Err(NutsError),
}

/// A point in phase space together with its location in the
/// current trajectory.
pub trait Point: Sized {
    fn position(&self) -> &[f64];
    fn gradient(&self) -> &[f64];
    fn index_in_trajectory(&self) -> i64;
    fn energy(&self) -> f64;
    fn logp(&self) -> f64;

    fn energy_error(&self) -> f64 {
        self.energy() - self.initial_energy()
    }

    fn initial_energy(&self) -> f64;

    /// Time derivative of the virial `p·q` along the trajectory.
    fn virial_rate(&self) -> f64;

    fn new(dim: usize) -> Self;
    fn copy_into(&self, other: &mut Self);
}

/// The hamiltonian defined by the potential energy and the kinetic energy
pub trait Hamiltonian: Sized {
    /// The type that stores a point in phase space, together
    /// with some information about the location inside the
    /// integration trajectory.
    type Point: Point;

    /// Perform one leapfrog step.
    ///
    /// Return either an unrecoverable error, a new state or a divergence.
    fn leapfrog<C: Collector<Self::Point>>(
        &mut self,
        start: &State<Self::Point>,
        dir: Direction,
        collector: &mut C,
    ) -> LeapfrogResult<Self::Point>;

    /// Generalized no-U-turn check between two points of a trajectory.
    fn is_turning(&self, state1: &State<Self::Point>, state2: &State<Self::Point>) -> bool;

    /// Initialize a state at a new location.
    ///
    /// The momentum is left in an arbitrary state, it will later be
    /// set using Self::initialize_trajectory.
    fn init_state(&mut self, init: &[f64]) -> Result<State<Self::Point>, NutsError>;

    /// Resample the momentum and make the state the first point
    /// of a new trajectory.
    fn initialize_trajectory<R: rand::Rng + ?Sized>(
        &self,
        state: &mut State<Self::Point>,
        rng: &mut R,
    ) -> Result<(), NutsError>;

    fn copy_state(&mut self, state: &State<Self::Point>) -> State<Self::Point>;

    fn step_size(&self) -> f64;
    fn step_size_mut(&mut self) -> &mut f64;

    /// The dimension of the hamiltonian (position only).
    fn dim(&self) -> usize;
}
