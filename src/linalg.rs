//! Validity checks for metric estimates.
//!
//! Symmetry is not checked, only the lower triangle is read.

use faer::{Mat, Side};

use crate::NutsError;

/// Smallest value a pivot of a positive definite matrix may take.
pub(crate) const CONSTRAINT_TOLERANCE: f64 = 1e-8;

/// Check that `matrix` is positive definite and return its lower
/// cholesky factor `L` with `matrix = L Lᵀ`.
///
/// The error carries a human readable diagnostic that names the matrix.
pub fn check_pos_definite(name: &str, matrix: &Mat<f64>) -> Result<Mat<f64>, NutsError> {
    let n = matrix.nrows();
    if n != matrix.ncols() {
        return Err(NutsError::MetricNotPositiveDefinite(format!(
            "{name} is not square ({} x {})",
            n,
            matrix.ncols()
        )));
    }
    if n == 0 {
        return Ok(Mat::zeros(0, 0));
    }
    if n == 1 && !(matrix[(0, 0)] > CONSTRAINT_TOLERANCE) {
        return Err(not_pos_definite(name, matrix));
    }
    for i in 0..n {
        for j in 0..=i {
            if !matrix[(i, j)].is_finite() {
                return Err(NutsError::MetricNotPositiveDefinite(format!(
                    "{name} is not positive definite. {name}({i},{j}) is {}",
                    matrix[(i, j)]
                )));
            }
        }
    }

    let llt = matrix
        .llt(Side::Lower)
        .map_err(|_| not_pos_definite(name, matrix))?;
    let factor = llt.L().to_owned();

    // The pivots of the LDLᵀ decomposition are the squared diagonal of L.
    for i in 0..n {
        let pivot = factor[(i, i)] * factor[(i, i)];
        if !(pivot > CONSTRAINT_TOLERANCE) {
            return Err(not_pos_definite(name, matrix));
        }
    }
    Ok(factor)
}

/// Check a diagonal matrix given by its diagonal.
pub fn check_pos_diagonal(name: &str, diagonal: &[f64]) -> Result<(), NutsError> {
    match diagonal
        .iter()
        .enumerate()
        .find(|(_, &val)| !(val.is_finite() && val > CONSTRAINT_TOLERANCE))
    {
        None => Ok(()),
        Some((i, val)) => Err(NutsError::MetricNotPositiveDefinite(format!(
            "{name} is not positive definite. {name}({i},{i}) is {val}"
        ))),
    }
}

fn not_pos_definite(name: &str, matrix: &Mat<f64>) -> NutsError {
    NutsError::MetricNotPositiveDefinite(format!(
        "{name} is not positive definite. {name}(0,0) is {}",
        matrix[(0, 0)]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn accepts_spd() {
        let matrix = Mat::from_fn(3, 3, |i, j| match (i, j) {
            (i, j) if i == j => 4.,
            _ => 1.,
        });
        let factor = check_pos_definite("covariance", &matrix).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let mut value = 0.;
                for k in 0..3 {
                    value += factor[(i, k)] * factor[(j, k)];
                }
                assert_abs_diff_eq!(value, matrix[(i, j)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn rejects_indefinite() {
        let matrix = Mat::from_fn(2, 2, |i, j| if i == j { 1. } else { 2. });
        let err = check_pos_definite("covariance", &matrix).unwrap_err();
        assert!(matches!(err, NutsError::MetricNotPositiveDefinite(_)));
        assert!(err.to_string().contains("covariance is not positive definite"));
    }

    #[test]
    fn rejects_scalar_below_tolerance() {
        let matrix = Mat::from_fn(1, 1, |_, _| 1e-12);
        assert!(check_pos_definite("metric", &matrix).is_err());
        let matrix = Mat::from_fn(1, 1, |_, _| f64::NAN);
        assert!(check_pos_definite("metric", &matrix).is_err());
    }

    #[test]
    fn checks_diagonal() {
        assert!(check_pos_diagonal("variance", &[1., 2., 3.]).is_ok());
        let err = check_pos_diagonal("variance", &[1., 0., 3.]).unwrap_err();
        assert!(err.to_string().contains("variance(1,1) is 0"));
        assert!(check_pos_diagonal("variance", &[1., f64::INFINITY]).is_err());
    }
}
