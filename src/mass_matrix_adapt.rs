use faer::Mat;
use itertools::izip;

use crate::{
    mass_matrix::{DenseMassMatrix, DiagMassMatrix, MassMatrix},
    NutsError,
};

/// Settings for the windowed metric estimates
#[derive(Clone, Copy, Debug)]
pub struct MetricAdaptOptions {
    /// Never estimate a metric from fewer draws than this.
    pub min_window_samples: u64,
    /// Number of pseudo draws at `shrinkage_target` mixed into every estimate.
    pub shrinkage_count: f64,
    /// The estimate is shrunk towards `shrinkage_target * I`.
    pub shrinkage_target: f64,
}

impl Default for MetricAdaptOptions {
    fn default() -> Self {
        Self {
            min_window_samples: 20,
            shrinkage_count: 5.,
            shrinkage_target: 1e-3,
        }
    }
}

impl MetricAdaptOptions {
    /// Weights `(a, b)` of the regularized estimate `a Σ + b I`.
    fn shrinkage_weights(&self, count: u64) -> (f64, f64) {
        let n = count as f64;
        let total = n + self.shrinkage_count;
        (
            n / total,
            self.shrinkage_target * self.shrinkage_count / total,
        )
    }
}

/// Welford estimate of the elementwise variance.
pub struct RunningVariance {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
    arch: pulp::Arch,
}

impl RunningVariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim].into(),
            count: 0,
            arch: pulp::Arch::new(),
        }
    }

    pub fn add_sample(&mut self, value: &[f64]) {
        assert!(value.len() == self.mean.len());
        self.count += 1;
        let diff_scale = (self.count as f64).recip();
        let Self { mean, m2, arch, .. } = self;
        arch.dispatch(|| {
            izip!(mean.iter_mut(), m2.iter_mut(), value).for_each(|(mean, m2, x)| {
                let diff = x - *mean;
                *mean += diff * diff_scale;
                *m2 += diff * (x - *mean);
            });
        })
    }

    /// The unbiased sample variance.
    pub fn current(&self) -> Box<[f64]> {
        assert!(self.count > 1);
        let scale = ((self.count - 1) as f64).recip();
        self.m2.iter().map(|m2| m2 * scale).collect()
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        self.mean.fill(0.);
        self.m2.fill(0.);
        self.count = 0;
    }
}

/// Welford estimate of the covariance matrix.
pub struct RunningCovariance {
    mean: Box<[f64]>,
    diff: Box<[f64]>,
    m2: Mat<f64>,
    count: u64,
}

impl RunningCovariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            diff: vec![0f64; dim].into(),
            m2: Mat::zeros(dim, dim),
            count: 0,
        }
    }

    pub fn add_sample(&mut self, value: &[f64]) {
        assert!(value.len() == self.mean.len());
        self.count += 1;
        let diff_scale = (self.count as f64).recip();
        izip!(self.diff.iter_mut(), self.mean.iter_mut(), value).for_each(|(diff, mean, x)| {
            *diff = x - *mean;
            *mean += *diff * diff_scale;
        });

        // m2 += (x - old_mean)(x - new_mean)ᵀ, with x - new_mean = (1 - 1/n)(x - old_mean)
        let factor = 1. - diff_scale;
        let dim = self.mean.len();
        for j in 0..dim {
            for i in 0..dim {
                self.m2[(i, j)] += factor * self.diff[i] * self.diff[j];
            }
        }
    }

    /// The unbiased sample covariance.
    pub fn current(&self) -> Mat<f64> {
        assert!(self.count > 1);
        let scale = ((self.count - 1) as f64).recip();
        let dim = self.mean.len();
        Mat::from_fn(dim, dim, |i, j| self.m2[(i, j)] * scale)
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        self.mean.fill(0.);
        self.m2 = Mat::zeros(self.mean.len(), self.mean.len());
        self.count = 0;
    }
}

/// Learns a metric from the draws of one adaptation window.
pub trait MetricAdapter {
    type MassMatrix: MassMatrix;

    /// Add a draw to the current window.
    ///
    /// Once the window is full, write the regularized estimate into
    /// `metric`, start a new window and return `true`.
    fn learn(&mut self, metric: &mut Self::MassMatrix, position: &[f64]) -> Result<bool, NutsError>;

    /// Set the number of draws in the current window.
    fn set_window(&mut self, num_samples: u64);

    /// Number of draws in the current window so far.
    fn count(&self) -> u64;
}

pub struct DiagMetricAdapter {
    estimator: RunningVariance,
    window: u64,
    options: MetricAdaptOptions,
}

impl DiagMetricAdapter {
    pub fn new(dim: usize, options: MetricAdaptOptions) -> Self {
        Self {
            estimator: RunningVariance::new(dim),
            window: options.min_window_samples,
            options,
        }
    }

    fn is_full(&self) -> bool {
        let needed = self.window.max(self.options.min_window_samples).max(2);
        self.estimator.count() >= needed
    }
}

impl MetricAdapter for DiagMetricAdapter {
    type MassMatrix = DiagMassMatrix;

    fn learn(&mut self, metric: &mut DiagMassMatrix, position: &[f64]) -> Result<bool, NutsError> {
        self.estimator.add_sample(position);
        if !self.is_full() {
            return Ok(false);
        }

        let (weight, shrink) = self.options.shrinkage_weights(self.estimator.count());
        let mut variance = self.estimator.current();
        variance
            .iter_mut()
            .for_each(|var| *var = weight.mul_add(*var, shrink));
        metric.update_diag(&variance)?;
        self.estimator.reset();
        Ok(true)
    }

    fn set_window(&mut self, num_samples: u64) {
        self.window = num_samples;
    }

    fn count(&self) -> u64 {
        self.estimator.count()
    }
}

pub struct DenseMetricAdapter {
    estimator: RunningCovariance,
    window: u64,
    options: MetricAdaptOptions,
}

impl DenseMetricAdapter {
    pub fn new(dim: usize, options: MetricAdaptOptions) -> Self {
        Self {
            estimator: RunningCovariance::new(dim),
            window: options.min_window_samples,
            options,
        }
    }

    fn is_full(&self) -> bool {
        let needed = self.window.max(self.options.min_window_samples).max(2);
        self.estimator.count() >= needed
    }
}

impl MetricAdapter for DenseMetricAdapter {
    type MassMatrix = DenseMassMatrix;

    fn learn(&mut self, metric: &mut DenseMassMatrix, position: &[f64]) -> Result<bool, NutsError> {
        self.estimator.add_sample(position);
        if !self.is_full() {
            return Ok(false);
        }

        let (weight, shrink) = self.options.shrinkage_weights(self.estimator.count());
        let mut covariance = self.estimator.current();
        let dim = covariance.nrows();
        for j in 0..dim {
            for i in 0..dim {
                covariance[(i, j)] *= weight;
            }
            covariance[(j, j)] += shrink;
        }
        metric.update(covariance)?;
        self.estimator.reset();
        Ok(true)
    }

    fn set_window(&mut self, num_samples: u64) {
        self.window = num_samples;
    }

    fn count(&self) -> u64 {
        self.estimator.count()
    }
}
