use std::marker::PhantomData;

use crate::hamiltonian::{Direction, DivergenceInfo, Hamiltonian, LeapfrogResult, Point};
use crate::math::{log_weighted_mean, logaddexp};
use crate::state::State;
use crate::NutsError;

/// Callbacks for various events during a trajectory.
///
/// Collectors can compute statistics like the mean acceptance rate
/// or collect data for mass matrix adaptation.
pub trait Collector<P: Point> {
    fn register_leapfrog(
        &mut self,
        _start: &State<P>,
        _end: &State<P>,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }
    fn register_draw(&mut self, _state: &State<P>, _info: &SampleInfo) {}
    fn register_init(&mut self, _state: &State<P>, _options: &NutsOptions) {}
}

/// When to stop doubling the trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TerminationCriterion {
    /// Stop once the weighted mean of `d(p·q)/dt` over a (sub)trajectory
    /// falls below `threshold` in absolute value.
    Exhaustive { threshold: f64 },
    /// The generalized no-U-turn criterion on the momentum sums.
    NoUTurn,
}

impl Default for TerminationCriterion {
    fn default() -> Self {
        TerminationCriterion::Exhaustive { threshold: 0.1 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NutsOptions {
    pub maxdepth: u64,
    pub termination: TerminationCriterion,
}

/// Information about a draw, exported as part of the sampler stats
#[derive(Debug)]
pub struct SampleInfo {
    /// The depth of the trajectory that this point was sampled from
    pub depth: u64,

    /// More detailed information about a divergence that might have
    /// occured in the trajectory.
    pub divergence_info: Option<DivergenceInfo>,

    /// Whether the trajectory was terminated because it reached
    /// the maximum tree depth.
    pub reached_maxdepth: bool,
}

/// A part of the trajectory tree.
struct NutsTree<H: Hamiltonian, C: Collector<H::Point>> {
    /// The left position of the tree.
    ///
    /// The left side always has the smaller index_in_trajectory.
    /// Leapfrogs in backward direction will replace the left.
    left: State<H::Point>,
    right: State<H::Point>,

    /// A draw from the trajectory between left and right using
    /// multinomial sampling.
    draw: State<H::Point>,
    log_size: f64,
    depth: u64,

    /// Mean of the virial rate over the leaves, weighted like the draw.
    mean_virial: f64,
    collector: PhantomData<C>,
}

enum ExtendResult<H: Hamiltonian, C: Collector<H::Point>> {
    /// The tree extension succeeded properly, and the termination
    /// criterion was not reached.
    Ok(NutsTree<H, C>),
    /// An unrecoverable error happend during a leapfrog step
    Err(NutsError),
    /// Tree extension succeeded and the termination criterion
    /// was reached.
    Turning(NutsTree<H, C>),
    /// A divergence happend during tree extension.
    Diverging(NutsTree<H, C>, DivergenceInfo),
}

impl<H: Hamiltonian, C: Collector<H::Point>> NutsTree<H, C> {
    fn new(state: State<H::Point>) -> NutsTree<H, C> {
        let mean_virial = state.point().virial_rate();
        NutsTree {
            right: state.clone(),
            left: state.clone(),
            draw: state,
            depth: 0,
            log_size: 0.,
            mean_virial,
            collector: PhantomData,
        }
    }

    #[inline]
    fn extend<R>(
        mut self,
        rng: &mut R,
        hamiltonian: &mut H,
        direction: Direction,
        options: &NutsOptions,
        collector: &mut C,
    ) -> ExtendResult<H, C>
    where
        R: rand::Rng + ?Sized,
    {
        let mut other = match self.single_step(hamiltonian, direction, collector) {
            Ok(Ok(tree)) => tree,
            Ok(Err(info)) => return ExtendResult::Diverging(self, info),
            Err(err) => return ExtendResult::Err(err),
        };

        while other.depth < self.depth {
            use ExtendResult::*;
            other = match other.extend(rng, hamiltonian, direction, options, collector) {
                Ok(tree) => tree,
                Turning(_) => {
                    return Turning(self);
                }
                Diverging(_, info) => {
                    return Diverging(self, info);
                }
                Err(error) => {
                    return Err(error);
                }
            };
        }

        let turning = self.check_termination(&other, hamiltonian, direction, options);

        self.merge_into(other, rng, direction);

        if turning {
            ExtendResult::Turning(self)
        } else {
            ExtendResult::Ok(self)
        }
    }

    /// Evaluate the termination criterion on the union of `self` and `other`.
    fn check_termination(
        &self,
        other: &NutsTree<H, C>,
        hamiltonian: &H,
        direction: Direction,
        options: &NutsOptions,
    ) -> bool {
        match options.termination {
            TerminationCriterion::Exhaustive { threshold } => {
                let mean = log_weighted_mean(
                    self.mean_virial,
                    self.log_size,
                    other.mean_virial,
                    other.log_size,
                );
                mean.abs() < threshold
            }
            TerminationCriterion::NoUTurn => {
                let (first, last) = match direction {
                    Direction::Forward => (&self.left, &other.right),
                    Direction::Backward => (&other.left, &self.right),
                };

                let mut turning = hamiltonian.is_turning(first, last);
                if self.depth > 0 {
                    if !turning {
                        turning = hamiltonian.is_turning(&self.right, &other.right);
                    }
                    if !turning {
                        turning = hamiltonian.is_turning(&self.left, &other.left);
                    }
                }
                turning
            }
        }
    }

    #[inline]
    fn merge_into<R: rand::Rng + ?Sized>(
        &mut self,
        other: NutsTree<H, C>,
        rng: &mut R,
        direction: Direction,
    ) {
        assert!(self.depth == other.depth);
        assert!(self.left.index_in_trajectory() <= self.right.index_in_trajectory());
        match direction {
            Direction::Forward => {
                self.right = other.right;
            }
            Direction::Backward => {
                self.left = other.left;
            }
        }
        let log_size = logaddexp(self.log_size, other.log_size);

        // Take the draw of `other` with probability W_other / (W_self + W_other).
        if other.log_size >= log_size || rng.random::<f64>() < (other.log_size - log_size).exp() {
            self.draw = other.draw;
        }

        self.mean_virial =
            log_weighted_mean(self.mean_virial, self.log_size, other.mean_virial, other.log_size);
        self.depth += 1;
        self.log_size = log_size;
    }

    #[inline]
    fn single_step(
        &self,
        hamiltonian: &mut H,
        direction: Direction,
        collector: &mut C,
    ) -> Result<Result<NutsTree<H, C>, DivergenceInfo>, NutsError> {
        let start = match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        };
        let end = match hamiltonian.leapfrog(start, direction, collector) {
            LeapfrogResult::Ok(end) => end,
            LeapfrogResult::Divergence(info) => return Ok(Err(info)),
            LeapfrogResult::Err(error) => return Err(error),
        };

        let log_size = -end.point().energy_error();
        let mean_virial = end.point().virial_rate();
        Ok(Ok(NutsTree {
            right: end.clone(),
            left: end.clone(),
            draw: end,
            depth: 0,
            log_size,
            mean_virial,
            collector: PhantomData,
        }))
    }

    fn info(&self, maxdepth: bool, divergence_info: Option<DivergenceInfo>) -> SampleInfo {
        SampleInfo {
            depth: self.depth,
            divergence_info,
            reached_maxdepth: maxdepth,
        }
    }
}

/// Run one transition starting at `init`.
///
/// The momentum of `init` is resampled, so there must not be any
/// other references to it.
pub fn draw<H, R, C>(
    init: &mut State<H::Point>,
    rng: &mut R,
    hamiltonian: &mut H,
    options: &NutsOptions,
    collector: &mut C,
) -> Result<(State<H::Point>, SampleInfo), NutsError>
where
    H: Hamiltonian,
    R: rand::Rng + ?Sized,
    C: Collector<H::Point>,
{
    hamiltonian.initialize_trajectory(init, rng)?;
    collector.register_init(init, options);

    let mut tree = NutsTree::new(init.clone());
    while tree.depth < options.maxdepth {
        let direction: Direction = rng.random();
        tree = match tree.extend(rng, hamiltonian, direction, options, collector) {
            ExtendResult::Ok(tree) => tree,
            ExtendResult::Turning(tree) => {
                let info = tree.info(false, None);
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Diverging(tree, info) => {
                let info = tree.info(false, Some(info));
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Err(error) => {
                return Err(error);
            }
        };
    }
    let info = tree.info(true, None);
    collector.register_draw(&tree.draw, &info);
    Ok((tree.draw, info))
}
