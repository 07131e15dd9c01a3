//! Generic, model-agnostic RANSAC engine.
//!
//! Implement [`Estimator`] for a model and call [`ransac_fit`] with a slice of
//! data and some [`RansacOptions`]. The loop always terminates after at most
//! `max_iters` hypotheses; when no consensus is found the result has
//! `success == false` and `model == None`.

use log::trace;
use rand::prelude::IndexedRandom;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Configuration parameters for the generic RANSAC engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacOptions {
    /// Hard cap on the number of hypotheses.
    pub max_iters: usize,
    /// Inlier residual threshold, in the units of [`Estimator::residual`].
    pub thresh: f64,
    /// Minimum number of inliers required to accept a model.
    pub min_inliers: usize,
    /// Desired probability in `[0, 1]` of drawing at least one all-inlier sample.
    pub confidence: f64,
    /// When `true` the iteration count shrinks with the best inlier ratio seen so far.
    pub adaptive: bool,
    /// Random-number generator seed (for reproducibility).
    pub seed: u64,
    /// If `true`, refit the model on all inliers before scoring.
    pub refit_on_inliers: bool,
}

impl Default for RansacOptions {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            thresh: 2.0,
            min_inliers: 8,
            confidence: 0.999,
            adaptive: true,
            seed: 1_234_567,
            refit_on_inliers: true,
        }
    }
}

/// Output of a RANSAC run.
#[derive(Debug, Clone)]
pub struct RansacResult<M> {
    /// Whether a consensus set satisfying the options was found.
    pub success: bool,
    /// Best model found (if any).
    pub model: Option<M>,
    /// Indices of inlier data points, ascending.
    pub inliers: Vec<usize>,
    /// Root-mean-square residual over inliers.
    pub inlier_rms: f64,
    /// Number of hypotheses actually drawn.
    pub iters: usize,
}

impl<M> Default for RansacResult<M> {
    fn default() -> Self {
        Self {
            success: false,
            model: None,
            inliers: Vec::new(),
            inlier_rms: f64::INFINITY,
            iters: 0,
        }
    }
}

impl<M> RansacResult<M> {
    pub fn inlier_ratio(&self, num_data: usize) -> f64 {
        if num_data == 0 {
            0.0
        } else {
            self.inliers.len() as f64 / num_data as f64
        }
    }
}

/// Model estimator plugged into [`ransac_fit`].
///
/// Estimators carry their own configuration (thresholds in model units,
/// camera matrices, ...), so all hooks take `&self`.
pub trait Estimator {
    type Datum;
    type Model;

    /// Minimal number of samples needed to estimate a model.
    const MIN_SAMPLES: usize;

    /// Fit a model from a subset of data indices; `None` on failure.
    fn fit(&self, data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model>;

    /// Non-negative residual of one datum, in the same units as `opts.thresh`.
    fn residual(&self, model: &Self::Model, datum: &Self::Datum) -> f64;

    /// Degeneracy check on a drawn sample.
    fn is_degenerate(&self, _data: &[Self::Datum], _sample: &[usize]) -> bool {
        false
    }

    /// Optional refit on the full inlier set.
    fn refit(&self, _data: &[Self::Datum], _inliers: &[usize]) -> Option<Self::Model> {
        None
    }

    /// Draw `MIN_SAMPLES` distinct indices into `out`. Uniform by default.
    fn draw_sample(&self, data: &[Self::Datum], rng: &mut StdRng, out: &mut Vec<usize>) {
        let all: Vec<usize> = (0..data.len()).collect();
        out.clear();
        out.extend(all.choose_multiple(rng, Self::MIN_SAMPLES).copied());
    }
}

fn rms(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return f64::INFINITY;
    }
    let ss: f64 = vals.iter().map(|&v| v * v).sum();
    (ss / (vals.len() as f64)).sqrt()
}

/// Number of hypotheses needed to reach `confidence` at the given inlier ratio.
///
/// `N = log(1 - p) / log(1 - w^m)`, clamped to `[iters_so_far, max_iters]`.
pub fn required_iterations(
    confidence: f64,
    inlier_ratio: f64,
    min_samples: usize,
    iters_so_far: usize,
    max_iters: usize,
) -> usize {
    if confidence <= 0.0 || inlier_ratio <= 0.0 {
        return max_iters;
    }
    if confidence >= 1.0 {
        return max_iters;
    }
    let denom = (1.0 - inlier_ratio.powi(min_samples as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return max_iters;
    }
    let n_iter = ((1.0 - confidence).ln() / denom).ceil();
    if !n_iter.is_finite() {
        return max_iters;
    }
    (n_iter as usize).clamp(iters_so_far, max_iters)
}

fn score<E: Estimator>(
    est: &E,
    model: &E::Model,
    data: &[E::Datum],
    thresh: f64,
    inliers: &mut Vec<usize>,
    residuals: &mut Vec<f64>,
) {
    inliers.clear();
    residuals.clear();
    for (i, datum) in data.iter().enumerate() {
        let r = est.residual(model, datum);
        if r <= thresh {
            inliers.push(i);
            residuals.push(r);
        }
    }
}

/// Run the RANSAC loop for an [`Estimator`].
///
/// Models are ranked by inlier count, ties broken by inlier RMS.
pub fn ransac_fit<E: Estimator>(
    est: &E,
    data: &[E::Datum],
    opts: &RansacOptions,
) -> RansacResult<E::Model> {
    let mut best: RansacResult<E::Model> = RansacResult::default();
    if data.len() < E::MIN_SAMPLES || opts.max_iters == 0 {
        return best;
    }

    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut sample = Vec::with_capacity(E::MIN_SAMPLES);
    let mut inliers = Vec::with_capacity(data.len());
    let mut residuals = Vec::with_capacity(data.len());

    let mut budget = opts.max_iters;
    let mut iters = 0;
    while iters < budget {
        iters += 1;
        est.draw_sample(data, &mut rng, &mut sample);
        if sample.len() != E::MIN_SAMPLES || est.is_degenerate(data, &sample) {
            continue;
        }
        let Some(mut model) = est.fit(data, &sample) else {
            continue;
        };

        score(est, &model, data, opts.thresh, &mut inliers, &mut residuals);
        if inliers.len() < opts.min_inliers.max(E::MIN_SAMPLES) {
            continue;
        }

        if opts.refit_on_inliers {
            if let Some(refined) = est.refit(data, &inliers) {
                let mut refined_inliers = Vec::with_capacity(data.len());
                let mut refined_residuals = Vec::with_capacity(data.len());
                score(
                    est,
                    &refined,
                    data,
                    opts.thresh,
                    &mut refined_inliers,
                    &mut refined_residuals,
                );
                if refined_inliers.len() >= inliers.len() {
                    model = refined;
                    inliers = refined_inliers;
                    residuals = refined_residuals;
                }
            }
        }

        let inlier_rms = rms(&residuals);
        let better = !best.success
            || inliers.len() > best.inliers.len()
            || (inliers.len() == best.inliers.len() && inlier_rms < best.inlier_rms);
        if better {
            best.success = true;
            best.model = Some(model);
            best.inliers.clone_from(&inliers);
            best.inlier_rms = inlier_rms;

            if opts.adaptive {
                let ratio = best.inliers.len() as f64 / data.len() as f64;
                budget = required_iterations(
                    opts.confidence,
                    ratio,
                    E::MIN_SAMPLES,
                    iters,
                    opts.max_iters,
                );
            }
        }
    }

    best.iters = iters;
    trace!(
        "ransac: {} hypotheses, {} of {} inliers",
        iters,
        best.inliers.len(),
        data.len()
    );
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Line {
        slope: f64,
        intercept: f64,
    }

    struct LineEstimator;

    impl Estimator for LineEstimator {
        type Datum = (f64, f64);
        type Model = Line;

        const MIN_SAMPLES: usize = 2;

        fn fit(&self, data: &[Self::Datum], sample: &[usize]) -> Option<Line> {
            let (x0, y0) = data[sample[0]];
            let (x1, y1) = data[sample[1]];
            if (x1 - x0).abs() < 1e-9 {
                return None;
            }
            let slope = (y1 - y0) / (x1 - x0);
            Some(Line {
                slope,
                intercept: y0 - slope * x0,
            })
        }

        fn residual(&self, m: &Line, &(x, y): &Self::Datum) -> f64 {
            (m.slope * x - y + m.intercept).abs() / (m.slope * m.slope + 1.0).sqrt()
        }

        fn refit(&self, data: &[Self::Datum], inliers: &[usize]) -> Option<Line> {
            let n = inliers.len() as f64;
            let (mut sx, mut sy, mut sxx, mut sxy) = (0.0, 0.0, 0.0, 0.0);
            for &i in inliers {
                let (x, y) = data[i];
                sx += x;
                sy += y;
                sxx += x * x;
                sxy += x * y;
            }
            let denom = n * sxx - sx * sx;
            if denom.abs() < 1e-12 {
                return None;
            }
            let slope = (n * sxy - sx * sy) / denom;
            Some(Line {
                slope,
                intercept: (sy - slope * sx) / n,
            })
        }
    }

    fn opts() -> RansacOptions {
        RansacOptions {
            max_iters: 300,
            thresh: 0.05,
            min_inliers: 6,
            seed: 7,
            ..RansacOptions::default()
        }
    }

    #[test]
    fn too_little_data_fails_cleanly() {
        let res = ransac_fit(&LineEstimator, &[(0.0, 0.0)], &opts());
        assert!(!res.success);
        assert!(res.model.is_none());
        assert_eq!(res.iters, 0);
    }

    #[test]
    fn recovers_line_despite_gross_outliers() {
        let mut data: Vec<(f64, f64)> = (0..12)
            .map(|i| {
                let x = i as f64 * 0.5;
                (x, 2.0 * x + 1.0 + if i % 2 == 0 { 0.01 } else { -0.01 })
            })
            .collect();
        data.extend([(5.0, -3.0), (6.0, 10.0), (7.0, -8.0)]);

        let res = ransac_fit(&LineEstimator, &data, &opts());
        assert!(res.success);
        let m = res.model.unwrap();
        assert!((m.slope - 2.0).abs() < 0.05);
        assert!((m.intercept - 1.0).abs() < 0.05);
        assert!(res.inliers.len() >= 10);
        assert!(res.inliers.iter().all(|&i| i < 12));
        assert!(res.iters <= 300);
    }

    #[test]
    fn adaptive_bound_stops_early_on_clean_data() {
        let data: Vec<(f64, f64)> = (0..50).map(|i| (i as f64, 3.0 - i as f64)).collect();
        let res = ransac_fit(&LineEstimator, &data, &opts());
        assert!(res.success);
        assert!(res.iters < 10, "iters = {}", res.iters);

        let fixed = RansacOptions {
            adaptive: false,
            ..opts()
        };
        assert_eq!(ransac_fit(&LineEstimator, &data, &fixed).iters, 300);
    }

    #[test]
    fn required_iterations_clamps() {
        assert_eq!(required_iterations(0.99, 0.0, 4, 0, 100), 100);
        assert_eq!(required_iterations(0.99, 1.0, 4, 3, 100), 3);
        let n = required_iterations(0.99, 0.5, 2, 0, 10_000);
        assert_eq!(n, 17);
    }
}
