use faer::Mat;
use itertools::izip;
use multiversion::multiversion;
use rand_distr::StandardNormal;

use crate::{
    euclidean_hamiltonian::EuclideanPoint,
    linalg::{check_pos_definite, check_pos_diagonal},
    math::{multiply, vector_dot},
    NutsError,
};

/// The metric of the euclidean hamiltonian.
///
/// Implementations store the inverse metric `M⁻¹`, which is the
/// quantity the metric adapters estimate.
pub trait MassMatrix {
    fn update_velocity(&self, point: &mut EuclideanPoint);
    fn update_kinetic_energy(&self, point: &mut EuclideanPoint);
    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, point: &mut EuclideanPoint, rng: &mut R);

    /// Ratio of the largest to the smallest eigenvalue of the inverse metric.
    fn condition_number(&self) -> f64;
}

#[derive(Debug, Clone)]
pub struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    variance: Box<[f64]>,
}

impl DiagMassMatrix {
    /// The unit metric.
    pub fn new(ndim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; ndim].into(),
            variance: vec![1f64; ndim].into(),
        }
    }

    pub fn variance(&self) -> &[f64] {
        &self.variance
    }

    pub fn update_diag(&mut self, new_variance: &[f64]) -> Result<(), NutsError> {
        assert!(new_variance.len() == self.variance.len());
        check_pos_diagonal("variance", new_variance)?;
        update_diag(&mut self.variance, &mut self.inv_stds, new_variance);
        Ok(())
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
fn update_diag(variance_out: &mut [f64], inv_std_out: &mut [f64], new_variance: &[f64]) {
    izip!(variance_out, inv_std_out, new_variance).for_each(|(var, inv_std, &x)| {
        *var = x;
        *inv_std = (1. / x).sqrt();
    });
}

impl MassMatrix for DiagMassMatrix {
    fn update_velocity(&self, point: &mut EuclideanPoint) {
        multiply(&self.variance, &point.momentum, &mut point.velocity);
    }

    fn update_kinetic_energy(&self, point: &mut EuclideanPoint) {
        point.kinetic_energy = 0.5 * vector_dot(&point.momentum, &point.velocity);
    }

    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, point: &mut EuclideanPoint, rng: &mut R) {
        point
            .momentum
            .iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(p, &s)| {
                let norm: f64 = rng.sample(StandardNormal);
                *p = s * norm;
            });
    }

    fn condition_number(&self) -> f64 {
        let (min, max) = self
            .variance
            .iter()
            .fold((f64::INFINITY, 0f64), |(min, max), &x| (min.min(x), max.max(x)));
        max / min
    }
}

/// A full inverse metric `Σ` together with its cholesky factor `L`.
#[derive(Debug, Clone)]
pub struct DenseMassMatrix {
    inv_metric: Mat<f64>,
    factor: Mat<f64>,
}

impl DenseMassMatrix {
    pub fn new(ndim: usize) -> Self {
        let identity = Mat::from_fn(ndim, ndim, |i, j| if i == j { 1. } else { 0. });
        Self {
            factor: identity.clone(),
            inv_metric: identity,
        }
    }

    pub fn inv_metric(&self) -> &Mat<f64> {
        &self.inv_metric
    }

    /// Replace the inverse metric, leaving it unchanged if the new
    /// matrix is not positive definite.
    pub fn update(&mut self, inv_metric: Mat<f64>) -> Result<(), NutsError> {
        assert!(inv_metric.nrows() == self.inv_metric.nrows());
        self.factor = check_pos_definite("covariance", &inv_metric)?;
        self.inv_metric = inv_metric;
        Ok(())
    }
}

impl MassMatrix for DenseMassMatrix {
    fn update_velocity(&self, point: &mut EuclideanPoint) {
        let n = point.momentum.len();
        for i in 0..n {
            let mut acc = 0f64;
            for (j, &p) in point.momentum.iter().enumerate() {
                acc = self.inv_metric[(i, j)].mul_add(p, acc);
            }
            point.velocity[i] = acc;
        }
    }

    fn update_kinetic_energy(&self, point: &mut EuclideanPoint) {
        point.kinetic_energy = 0.5 * vector_dot(&point.momentum, &point.velocity);
    }

    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, point: &mut EuclideanPoint, rng: &mut R) {
        point
            .momentum
            .iter_mut()
            .for_each(|p| *p = rng.sample(StandardNormal));

        // Solve Lᵀp = z, so that p has covariance (L Lᵀ)⁻¹.
        let n = point.momentum.len();
        for i in (0..n).rev() {
            let mut acc = point.momentum[i];
            for k in (i + 1)..n {
                acc -= self.factor[(k, i)] * point.momentum[k];
            }
            point.momentum[i] = acc / self.factor[(i, i)];
        }
    }

    fn condition_number(&self) -> f64 {
        let Ok(eigs) = self.inv_metric.self_adjoint_eigen(faer::Side::Lower) else {
            return f64::NAN;
        };
        let eigs = eigs.S().column_vector().to_owned();
        let (min, max) = (0..eigs.nrows())
            .map(|i| eigs[i])
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), x| {
                (min.min(x), max.max(x))
            });
        max / min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use crate::hamiltonian::Point;

    #[test]
    fn diag_velocity_and_energy() {
        let mut mass = DiagMassMatrix::new(3);
        mass.update_diag(&[1., 4., 0.25]).unwrap();

        let mut point = EuclideanPoint::new(3);
        point.momentum.copy_from_slice(&[1., 1., 2.]);
        mass.update_velocity(&mut point);
        mass.update_kinetic_energy(&mut point);
        assert_eq!(&point.velocity[..], &[1., 4., 0.5]);
        assert_abs_diff_eq!(point.kinetic_energy, 0.5 * (1. + 4. + 1.));
        assert_abs_diff_eq!(mass.condition_number(), 16.);
    }

    #[test]
    fn diag_rejects_bad_variance() {
        let mut mass = DiagMassMatrix::new(2);
        assert!(mass.update_diag(&[1., -1.]).is_err());
        assert!(mass.update_diag(&[1., f64::NAN]).is_err());
        assert_eq!(mass.variance(), &[1., 1.]);
    }

    #[test]
    fn dense_matches_diag_for_diagonal_matrix() {
        let variance = [2., 0.5];
        let mut diag = DiagMassMatrix::new(2);
        diag.update_diag(&variance).unwrap();
        let mut dense = DenseMassMatrix::new(2);
        dense
            .update(Mat::from_fn(2, 2, |i, j| if i == j { variance[i] } else { 0. }))
            .unwrap();

        let mut a = EuclideanPoint::new(2);
        a.momentum.copy_from_slice(&[0.3, -1.2]);
        let mut b = EuclideanPoint::new(2);
        a.copy_into(&mut b);

        diag.update_velocity(&mut a);
        diag.update_kinetic_energy(&mut a);
        dense.update_velocity(&mut b);
        dense.update_kinetic_energy(&mut b);
        assert_abs_diff_eq!(a.kinetic_energy, b.kinetic_energy, epsilon = 1e-14);
        assert_abs_diff_eq!(&a.velocity[..], &b.velocity[..], epsilon = 1e-14);
        assert_abs_diff_eq!(dense.condition_number(), 4., epsilon = 1e-10);
    }

    #[test]
    fn dense_momentum_covariance() {
        // Σ = [[1, 0.8], [0.8, 1]], so the momentum covariance is Σ⁻¹.
        let mut dense = DenseMassMatrix::new(2);
        dense
            .update(Mat::from_fn(2, 2, |i, j| if i == j { 1. } else { 0.8 }))
            .unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut point = EuclideanPoint::new(2);
        let n = 50_000;
        let mut cov = [[0f64; 2]; 2];
        for _ in 0..n {
            dense.randomize_momentum(&mut point, &mut rng);
            for i in 0..2 {
                for j in 0..2 {
                    cov[i][j] += point.momentum[i] * point.momentum[j] / n as f64;
                }
            }
        }
        let det = 1. - 0.8 * 0.8;
        assert_abs_diff_eq!(cov[0][0], 1. / det, epsilon = 0.1);
        assert_abs_diff_eq!(cov[1][1], 1. / det, epsilon = 0.1);
        assert_abs_diff_eq!(cov[0][1], -0.8 / det, epsilon = 0.1);
    }

    #[test]
    fn dense_rejects_indefinite() {
        let mut dense = DenseMassMatrix::new(2);
        let err = dense
            .update(Mat::from_fn(2, 2, |i, j| if i == j { 1. } else { 3. }))
            .unwrap_err();
        assert!(matches!(err, NutsError::MetricNotPositiveDefinite(_)));
        assert_eq!(dense.inv_metric()[(0, 1)], 0.);
    }
}
