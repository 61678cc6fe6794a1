//! # Statistical Analyst
//!
//! ## Responsibility
//! Compare per-window metric series of a control and a candidate arm and
//! issue a recommendation. Uses Welch's t-test on the composite score for
//! significance and Cohen's d for effect size. p-values come from the
//! Student t distribution with Welch-Satterthwaite degrees of freedom, so
//! small arms are not graded as if they were large.
//!
//! ## Guarantees
//! - Pure: [`analyze`] depends only on its inputs
//! - Conservative: ADOPT needs significance, a medium effect, a meaningful
//!   improvement and no critical per-metric regression, all at once
//!
//! ## NOT Responsible For
//! - Producing the series (see [`super::score`])
//! - Acting on the recommendation (see [`super::gate`])

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use super::experiment::ExperimentError;
use super::score::{CompositeWeights, MetricVector, METRIC_NAMES};

/// Effect size reported when both arms have zero variance but different means.
const SATURATED_EFFECT_SIZE: f64 = 10.0;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Decision thresholds for [`analyze`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AnalystConfig {
    /// Significance level for the two-sided Welch test.
    pub alpha: f64,
    /// Minimum Cohen's d.
    pub min_effect_size: f64,
    /// Minimum relative composite improvement.
    pub min_improvement: f64,
    /// Relative drop of any single metric that counts as a critical regression.
    pub critical_regression: f64,
    /// Minimum windows per arm.
    pub min_samples_per_arm: usize,
    /// Composite weights.
    pub weights: CompositeWeights,
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            alpha: 0.01,
            min_effect_size: 0.5,
            min_improvement: 0.05,
            critical_regression: 0.20,
            min_samples_per_arm: 2,
            weights: CompositeWeights::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// The analyst's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    /// Candidate is significantly and meaningfully better.
    Adopt,
    /// Candidate critically regresses at least one metric.
    Reject,
    /// Neither of the above.
    Inconclusive,
}

impl Recommendation {
    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Recommendation::Adopt => "adopt",
            Recommendation::Reject => "reject",
            Recommendation::Inconclusive => "inconclusive",
        }
    }
}

/// Per-arm summary statistics.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricSummary {
    /// Per-metric mean.
    pub mean: MetricVector,
    /// Per-metric sample standard deviation.
    pub std_dev: MetricVector,
    /// Mean composite score.
    pub composite_mean: f64,
    /// Sample standard deviation of the composite score.
    pub composite_std_dev: f64,
    /// Number of windows.
    pub sample_count: usize,
}

/// A metric whose candidate mean fell below control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRegression {
    /// Metric name.
    pub metric: String,
    /// Control mean.
    pub control: f64,
    /// Candidate mean.
    pub candidate: f64,
    /// `(control - candidate) / control`.
    pub relative_drop: f64,
    /// Drop exceeds the critical threshold.
    pub critical: bool,
}

/// Everything [`analyze`] computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Control arm statistics.
    pub control: MetricSummary,
    /// Candidate arm statistics.
    pub candidate: MetricSummary,
    /// Welch t statistic on the composite (candidate minus control).
    pub t_statistic: f64,
    /// Two-sided p-value from the Student t distribution.
    pub p_value: f64,
    /// Cohen's d, candidate minus control over pooled standard deviation.
    pub effect_size: f64,
    /// `(candidate - control) / control` on the composite mean.
    pub improvement_pct: f64,
    /// Metrics that got worse.
    pub regressions: Vec<MetricRegression>,
    /// Verdict.
    pub recommendation: Recommendation,
}

// ---------------------------------------------------------------------------
// Statistical helpers
// ---------------------------------------------------------------------------

/// Abramowitz & Stegun approximation 26.2.17 for the standard normal CDF.
///
/// # Panics
/// This function never panics.
pub fn normal_cdf(x: f64) -> f64 {
    if x < -8.0 {
        return 0.0;
    }
    if x > 8.0 {
        return 1.0;
    }
    let t = 1.0 / (1.0 + 0.2316419 * x.abs());
    let d = 0.3989422804014327; // 1/sqrt(2*pi)
    let p = d
        * (-x * x / 2.0).exp()
        * (t * (0.3193815 + t * (-0.3565638 + t * (1.781478 + t * (-1.8212560 + t * 1.3302744)))));
    if x > 0.0 {
        1.0 - p
    } else {
        p
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Unbiased sample variance; `0.0` below two samples.
fn variance(samples: &[f64]) -> f64 {
    let n = samples.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(samples);
    let sum_sq: f64 = samples.iter().map(|x| (x - m) * (x - m)).sum();
    sum_sq / (n as f64 - 1.0)
}

/// Welch-Satterthwaite degrees of freedom for two samples.
///
/// Infinite when both standard errors are zero.
pub fn welch_dof(control: &[f64], treatment: &[f64]) -> f64 {
    let term = |samples: &[f64]| {
        let n = samples.len() as f64;
        let v = variance(samples) / n.max(1.0);
        (v, if n > 1.0 { v * v / (n - 1.0) } else { 0.0 })
    };
    let (a, a_tail) = term(control);
    let (b, b_tail) = term(treatment);
    let denom = a_tail + b_tail;
    if denom == 0.0 {
        return f64::INFINITY;
    }
    (a + b) * (a + b) / denom
}

/// Welch's t statistic and two-sided p-value of `treatment - control`.
///
/// Zero standard error with equal means gives `p = 1`; with different means
/// the difference is exact and `p = 0`.
pub fn welch_t_test(control: &[f64], treatment: &[f64]) -> (f64, f64) {
    let diff = mean(treatment) - mean(control);
    let n1 = control.len().max(1) as f64;
    let n2 = treatment.len().max(1) as f64;
    let se = (variance(control) / n1 + variance(treatment) / n2).sqrt();

    if diff == 0.0 {
        return (0.0, 1.0);
    }
    if se == 0.0 {
        return (diff.signum() * f64::MAX, 0.0);
    }
    let t = diff / se;
    let tail = match StudentsT::new(0.0, 1.0, welch_dof(control, treatment)) {
        Ok(dist) => dist.sf(t.abs()),
        Err(_) => 1.0 - normal_cdf(t.abs()),
    };
    (t, (2.0 * tail).clamp(0.0, 1.0))
}

/// Cohen's d with pooled standard deviation.
pub fn cohens_d(control: &[f64], treatment: &[f64]) -> f64 {
    let n1 = control.len() as f64;
    let n2 = treatment.len() as f64;
    let diff = mean(treatment) - mean(control);
    let dof = n1 + n2 - 2.0;
    if dof <= 0.0 {
        return 0.0;
    }
    let pooled = (((n1 - 1.0) * variance(control) + (n2 - 1.0) * variance(treatment)) / dof).sqrt();
    if pooled == 0.0 {
        if diff == 0.0 {
            0.0
        } else {
            diff.signum() * SATURATED_EFFECT_SIZE
        }
    } else {
        diff / pooled
    }
}

fn summarize(series: &[MetricVector], weights: &CompositeWeights) -> (MetricSummary, Vec<f64>) {
    let composites: Vec<f64> = series.iter().map(|m| m.composite(weights)).collect();
    let mut means = [0.0; 6];
    let mut stds = [0.0; 6];
    for k in 0..6 {
        let column: Vec<f64> = series.iter().map(|m| m.values()[k]).collect();
        means[k] = mean(&column);
        stds[k] = variance(&column).sqrt();
    }
    let summary = MetricSummary {
        mean: MetricVector::from_values(means),
        std_dev: MetricVector::from_values(stds),
        composite_mean: mean(&composites),
        composite_std_dev: variance(&composites).sqrt(),
        sample_count: series.len(),
    };
    (summary, composites)
}

// ---------------------------------------------------------------------------
// analyze
// ---------------------------------------------------------------------------

/// Compare two arms and recommend.
///
/// # Errors
/// [`ExperimentError::InsufficientSamples`] when either arm has fewer than
/// `min_samples_per_arm` windows.
///
/// # Panics
/// This function never panics.
pub fn analyze(
    control: &[MetricVector],
    candidate: &[MetricVector],
    config: &AnalystConfig,
) -> Result<Analysis, ExperimentError> {
    let have = control.len().min(candidate.len());
    let need = config.min_samples_per_arm.max(2);
    if have < need {
        return Err(ExperimentError::InsufficientSamples { have, need });
    }

    let (control_summary, control_composites) = summarize(control, &config.weights);
    let (candidate_summary, candidate_composites) = summarize(candidate, &config.weights);

    let (t_statistic, p_value) = welch_t_test(&control_composites, &candidate_composites);
    let effect_size = cohens_d(&control_composites, &candidate_composites);

    let ctrl = control_summary.composite_mean;
    let cand = candidate_summary.composite_mean;
    let improvement_pct = if ctrl != 0.0 {
        (cand - ctrl) / ctrl
    } else if cand > 0.0 {
        1.0
    } else {
        0.0
    };

    let regressions: Vec<MetricRegression> = METRIC_NAMES
        .iter()
        .zip(control_summary.mean.values())
        .zip(candidate_summary.mean.values())
        .filter_map(|((name, c), k)| {
            if k >= c || c <= 0.0 {
                return None;
            }
            let relative_drop = (c - k) / c;
            Some(MetricRegression {
                metric: (*name).to_owned(),
                control: c,
                candidate: k,
                relative_drop,
                critical: relative_drop > config.critical_regression,
            })
        })
        .collect();
    let critical = regressions.iter().any(|r| r.critical);

    let recommendation = if critical {
        Recommendation::Reject
    } else if p_value < config.alpha
        && effect_size > config.min_effect_size
        && improvement_pct > config.min_improvement
    {
        Recommendation::Adopt
    } else {
        Recommendation::Inconclusive
    };

    Ok(Analysis {
        control: control_summary,
        candidate: candidate_summary,
        t_statistic,
        p_value,
        effect_size,
        improvement_pct,
        regressions,
        recommendation,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(v: f64) -> MetricVector {
        MetricVector::from_values([v; 6])
    }

    fn composites(series: &[MetricVector]) -> Vec<f64> {
        series.iter().map(|m| m.composite(&CompositeWeights::default())).collect()
    }

    fn series(center: f64, spread: f64, n: usize) -> Vec<MetricVector> {
        (0..n)
            .map(|i| vector(center + spread * ((i % 5) as f64 - 2.0)))
            .collect()
    }

    #[test]
    fn test_normal_cdf_symmetry() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 0.01);
        for x in [0.5, 1.0, 2.0, 3.0] {
            assert!((normal_cdf(x) + normal_cdf(-x) - 1.0).abs() < 0.02);
        }
        assert!((normal_cdf(1.96) - 0.975).abs() < 0.01);
    }

    #[test]
    fn test_identical_series_not_significant() {
        let s = series(0.6, 0.02, 50);
        let a = analyze(&s, &s, &AnalystConfig::default()).unwrap();
        assert!((a.p_value - 1.0).abs() < 1e-12);
        assert_eq!(a.improvement_pct, 0.0);
        assert_eq!(a.effect_size, 0.0);
        assert_eq!(a.recommendation, Recommendation::Inconclusive);
        assert!(a.regressions.is_empty());
    }

    #[test]
    fn test_constant_identical_series() {
        let s = vec![vector(0.5); 10];
        let a = analyze(&s, &s, &AnalystConfig::default()).unwrap();
        assert!((a.p_value - 1.0).abs() < 1e-12);
        assert_eq!(a.recommendation, Recommendation::Inconclusive);
    }

    #[test]
    fn test_clear_improvement_adopts() {
        let ctrl = series(0.60, 0.01, 60);
        let cand = series(0.70, 0.01, 60);
        let a = analyze(&ctrl, &cand, &AnalystConfig::default()).unwrap();
        assert!(a.p_value < 0.01, "p={}", a.p_value);
        assert!(a.effect_size > 0.5);
        assert!(a.improvement_pct > 0.05);
        assert_eq!(a.recommendation, Recommendation::Adopt);
    }

    #[test]
    fn test_small_improvement_is_inconclusive() {
        let ctrl = series(0.60, 0.01, 60);
        let cand = series(0.62, 0.01, 60);
        let a = analyze(&ctrl, &cand, &AnalystConfig::default()).unwrap();
        assert!(a.improvement_pct < 0.05);
        assert_eq!(a.recommendation, Recommendation::Inconclusive);
    }

    #[test]
    fn test_critical_regression_rejects() {
        let ctrl = vec![vector(0.8); 20];
        let cand: Vec<MetricVector> = (0..20)
            .map(|_| MetricVector {
                efficiency: 0.5,
                ..vector(0.95)
            })
            .collect();
        let a = analyze(&ctrl, &cand, &AnalystConfig::default()).unwrap();
        assert_eq!(a.recommendation, Recommendation::Reject);
        let eff = a.regressions.iter().find(|r| r.metric == "efficiency").unwrap();
        assert!(eff.critical);
    }

    #[test]
    fn test_zero_variance_different_means_saturates() {
        let ctrl = vec![vector(0.5); 10];
        let cand = vec![vector(0.6); 10];
        let a = analyze(&ctrl, &cand, &AnalystConfig::default()).unwrap();
        assert_eq!(a.p_value, 0.0);
        assert_eq!(a.effect_size, SATURATED_EFFECT_SIZE);
        assert_eq!(a.recommendation, Recommendation::Adopt);
    }

    #[test]
    fn test_zero_control_composite() {
        let ctrl = vec![vector(0.0); 5];
        let cand = vec![vector(0.2); 5];
        let a = analyze(&ctrl, &cand, &AnalystConfig::default()).unwrap();
        assert_eq!(a.improvement_pct, 1.0);
    }

    #[test]
    fn test_two_windows_per_arm_use_t_tail() {
        let (t, p) = welch_t_test(&[0.60, 0.62], &[0.70, 0.72]);
        assert!((t - 7.0710678).abs() < 1e-6);
        assert!((welch_dof(&[0.60, 0.62], &[0.70, 0.72]) - 2.0).abs() < 1e-9);
        // Exact two-sided tail of t=7.07 with 2 degrees of freedom.
        assert!((p - 0.0194).abs() < 1e-3, "p={p}");
        assert!(p >= 0.01);
    }

    #[test]
    fn test_two_windows_per_arm_do_not_adopt() {
        let ctrl = vec![vector(0.60), vector(0.62)];
        let cand = vec![vector(0.70), vector(0.72)];
        let a = analyze(&ctrl, &cand, &AnalystConfig::default()).unwrap();
        assert!(a.improvement_pct > 0.05);
        assert!(a.effect_size > 0.5);
        assert!(a.p_value >= 0.01, "p={}", a.p_value);
        assert_eq!(a.recommendation, Recommendation::Inconclusive);
    }

    #[test]
    fn test_large_samples_match_normal_tail() {
        let ctrl = series(0.60, 0.01, 400);
        let cand = series(0.601, 0.01, 400);
        let (t, p) = welch_t_test(&composites(&ctrl), &composites(&cand));
        let normal = 2.0 * (1.0 - normal_cdf(t.abs()));
        assert!((p - normal).abs() < 0.01, "p={p} normal={normal}");
    }

    #[test]
    fn test_insufficient_samples() {
        let err = analyze(&[vector(0.5)], &[vector(0.5)], &AnalystConfig::default()).unwrap_err();
        assert!(matches!(err, ExperimentError::InsufficientSamples { have: 1, need: 2 }));
    }
}
