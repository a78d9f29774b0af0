use arrow::{
    array::{Array, AsArray, FixedSizeListArray},
    datatypes::Float64Type,
};
use thiserror::Error;
use xhmc_rs::{
    sample_sequentially, ArrowTrace, ArrowTraceWriter, CpuLogpFunc, Diagnostic, LogpError,
    MetricKind, TerminationCriterion, XhmcSettings,
};

#[derive(Error, Debug)]
enum NormalLogpError {
    #[error("position outside of the support")]
    OutOfSupport,
}

impl LogpError for NormalLogpError {
    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Gaussian with mean `mu` and precision matrix `precision`.
struct CorrelatedNormal {
    mu: Vec<f64>,
    precision: Vec<Vec<f64>>,
}

impl CorrelatedNormal {
    fn standard(dim: usize) -> Self {
        let precision = (0..dim)
            .map(|i| (0..dim).map(|j| if i == j { 1. } else { 0. }).collect())
            .collect();
        Self {
            mu: vec![0.; dim],
            precision,
        }
    }

    fn bivariate(sigma1: f64, sigma2: f64, rho: f64) -> Self {
        let det = (1. - rho * rho) * sigma1 * sigma1 * sigma2 * sigma2;
        let cov = [
            [sigma1 * sigma1, rho * sigma1 * sigma2],
            [rho * sigma1 * sigma2, sigma2 * sigma2],
        ];
        let precision = vec![
            vec![cov[1][1] / det, -cov[0][1] / det],
            vec![-cov[1][0] / det, cov[0][0] / det],
        ];
        Self {
            mu: vec![0.; 2],
            precision,
        }
    }
}

impl CpuLogpFunc for CorrelatedNormal {
    type LogpError = NormalLogpError;

    fn dim(&self) -> usize {
        self.mu.len()
    }

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError> {
        let diff: Vec<f64> = position
            .iter()
            .zip(self.mu.iter())
            .map(|(&x, &mu)| x - mu)
            .collect();
        let mut logp = 0.;
        for (i, row) in self.precision.iter().enumerate() {
            let prec_diff: f64 = row.iter().zip(diff.iter()).map(|(a, b)| a * b).sum();
            grad[i] = -prec_diff;
            logp -= diff[i] * prec_diff / 2.;
        }
        Ok(logp)
    }
}

/// A standard normal restricted to the positive half line.
struct HalfNormal;

impl CpuLogpFunc for HalfNormal {
    type LogpError = NormalLogpError;

    fn dim(&self) -> usize {
        1
    }

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError> {
        if position[0] < 0. {
            return Err(NormalLogpError::OutOfSupport);
        }
        grad[0] = -position[0];
        Ok(-position[0] * position[0] / 2.)
    }
}

fn posterior_draws(trace: &ArrowTrace, num_tune: usize) -> Vec<Vec<f64>> {
    let draws = trace
        .draws
        .as_any()
        .downcast_ref::<FixedSizeListArray>()
        .unwrap();
    let dim = draws.value_length() as usize;
    let values = draws.values().as_primitive::<Float64Type>();
    (num_tune..draws.len())
        .map(|row| values.values()[row * dim..(row + 1) * dim].to_vec())
        .collect()
}

fn mean_and_cov(draws: &[Vec<f64>]) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n = draws.len() as f64;
    let dim = draws[0].len();
    let mean: Vec<f64> = (0..dim)
        .map(|i| draws.iter().map(|draw| draw[i]).sum::<f64>() / n)
        .collect();
    let cov = (0..dim)
        .map(|i| {
            (0..dim)
                .map(|j| {
                    draws
                        .iter()
                        .map(|draw| (draw[i] - mean[i]) * (draw[j] - mean[j]))
                        .sum::<f64>()
                        / (n - 1.)
                })
                .collect()
        })
        .collect();
    (mean, cov)
}

fn run(
    logp: impl CpuLogpFunc + 'static,
    settings: &XhmcSettings,
    start: &[f64],
) -> (xhmc_rs::ChainSummary, ArrowTrace) {
    let mut writer = ArrowTraceWriter::new(start.len());
    let summary = sample_sequentially(logp, settings, start, 0, &mut writer).unwrap();
    (summary, writer.finalize())
}

#[test]
fn standard_normal_1d() {
    let settings = XhmcSettings {
        num_tune: 1000,
        num_draws: 10000,
        target_accept: 0.8,
        seed: 1,
        ..Default::default()
    };
    let (summary, trace) = run(CorrelatedNormal::standard(1), &settings, &[2.]);

    assert!(
        (0.5..2.0).contains(&summary.step_size),
        "step size {}",
        summary.step_size
    );
    assert_eq!(summary.divergences_sampling, 0);
    assert_eq!(summary.num_metric_updates, 5);

    let draws = posterior_draws(&trace, 1000);
    assert_eq!(draws.len(), 10000);
    let (mean, cov) = mean_and_cov(&draws);
    assert!(mean[0].abs() < 0.05, "mean {}", mean[0]);
    assert!((cov[0][0] - 1.).abs() < 0.1, "variance {}", cov[0][0]);
}

#[test]
fn dense_metric_correlated_normal() {
    let settings = XhmcSettings {
        num_tune: 1000,
        num_draws: 4000,
        metric: MetricKind::Dense,
        seed: 2,
        ..Default::default()
    };
    let (summary, trace) = run(CorrelatedNormal::bivariate(1., 2., 0.8), &settings, &[0.5, -0.5]);

    // The adapted metric makes the target close to isotropic.
    assert!(summary.condition_number > 1.);
    assert!(summary.step_size > 0.3, "step size {}", summary.step_size);

    let draws = posterior_draws(&trace, 1000);
    let (mean, cov) = mean_and_cov(&draws);
    assert!(mean[0].abs() < 0.15, "{:?}", mean);
    assert!(mean[1].abs() < 0.3, "{:?}", mean);
    assert!((cov[0][0] - 1.).abs() < 0.2, "{:?}", cov);
    assert!((cov[1][1] - 4.).abs() < 0.8, "{:?}", cov);
    assert!((cov[0][1] - 1.6).abs() < 0.4, "{:?}", cov);
}

#[test]
fn no_u_turn_variant() {
    let settings = XhmcSettings {
        num_tune: 1000,
        num_draws: 4000,
        termination: TerminationCriterion::NoUTurn,
        seed: 3,
        ..Default::default()
    };
    let (_, trace) = run(CorrelatedNormal::standard(1), &settings, &[-1.]);
    let draws = posterior_draws(&trace, 1000);
    let (mean, cov) = mean_and_cov(&draws);
    assert!(mean[0].abs() < 0.1, "mean {}", mean[0]);
    assert!((cov[0][0] - 1.).abs() < 0.15, "variance {}", cov[0][0]);
}

#[test]
fn arrow_trace_has_one_row_per_draw() {
    let settings = XhmcSettings {
        num_tune: 200,
        num_draws: 100,
        ..Default::default()
    };
    let (_, trace) = run(CorrelatedNormal::standard(5), &settings, &[0.1; 5]);
    assert_eq!(trace.draws.len(), 300);
    let draws = trace
        .draws
        .as_any()
        .downcast_ref::<FixedSizeListArray>()
        .unwrap();
    assert_eq!(draws.value_length(), 5);
    assert_eq!(trace.stats.len(), 300);

    let tuning = trace.stats.column_by_name("tuning").unwrap().as_boolean();
    assert_eq!(tuning.true_count(), 200);
    let step_size = trace
        .stats
        .column_by_name("step_size")
        .unwrap()
        .as_primitive::<Float64Type>();
    assert!(step_size.values().iter().all(|&step| step > 0.));
    // Fixed step size after warm-up
    assert!(step_size.values()[200..].windows(2).all(|w| w[0] == w[1]));

    let warmup_complete: Vec<u64> = trace
        .diagnostics
        .iter()
        .filter(|(_, diagnostic)| matches!(diagnostic, Diagnostic::WarmupComplete { .. }))
        .map(|(_, diagnostic)| diagnostic.iteration())
        .collect();
    assert_eq!(warmup_complete, vec![199]);
}

#[test]
fn boundary_hits_are_divergences() {
    let settings = XhmcSettings {
        num_tune: 300,
        num_draws: 500,
        seed: 4,
        ..Default::default()
    };
    let (summary, trace) = run(HalfNormal, &settings, &[1.]);
    assert!(summary.divergences() > 0);
    let draws = posterior_draws(&trace, 0);
    assert!(draws.iter().all(|draw| draw[0] >= 0.));

    let diverging = trace.stats.column_by_name("diverging").unwrap().as_boolean();
    let reported = trace
        .diagnostics
        .iter()
        .filter(|(_, diagnostic)| matches!(diagnostic, Diagnostic::Divergence { .. }))
        .count();
    assert_eq!(diverging.true_count(), reported);
    assert_eq!(reported as u64, summary.divergences());
}
