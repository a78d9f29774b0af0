use itertools::izip;
use multiversion::multiversion;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// Average of two values weighted by `exp(log_weight)`.
///
/// Computed relative to the larger weight so that neither weight
/// has to be exponentiated directly.
#[inline]
pub(crate) fn log_weighted_mean(value1: f64, log_weight1: f64, value2: f64, log_weight2: f64) -> f64 {
    if log_weight1 == f64::NEG_INFINITY {
        return value2;
    }
    if log_weight2 == f64::NEG_INFINITY {
        return value1;
    }
    if log_weight2 > log_weight1 {
        let ratio = (log_weight1 - log_weight2).exp();
        (ratio * value1 + value2) / (1. + ratio)
    } else {
        let ratio = (log_weight2 - log_weight1).exp();
        (value1 + ratio * value2) / (1. + ratio)
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn scalar_prods2(
    positive1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(positive2.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, positive2, x, y).fold((0f64, 0f64), |(s1, s2), (a, b, x, y)| {
        let sum = a + b;
        (sum.mul_add(*x, s1), sum.mul_add(*y, s2))
    })
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn scalar_prods3(
    positive1: &[f64],
    negative1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(negative1.len() == n);
    assert!(positive2.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, negative1, positive2, x, y).fold(
        (0f64, 0f64),
        |(s1, s2), (a, b, c, x, y)| {
            let sum = a - b + c;
            (sum.mul_add(*x, s1), sum.mul_add(*y, s2))
        },
    )
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    izip!(a, b).fold(0f64, |acc, (x, y)| x.mul_add(*y, acc))
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| *out = x * y);
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(y.len() == x.len());

    izip!(x, y).for_each(|(x, y)| {
        *y = a.mul_add(*x, *y);
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = a.mul_add(*x, *y);
    });
}

pub(crate) fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|x| x.is_finite())
}
