//! Bundle adjustment over camera poses, calibrations and track points.
//!
//! Each observation contributes a residual block with two residuals (u, v),
//! so the robust loss acts per observation. Poses are stored as `cTw` SE3
//! blocks; the first camera is held constant and a baseline prior on the
//! second camera removes the scale freedom.

use crate::backend::{solve_with_backend, BackendSolveOptions};
use crate::ir::{FactorKind, FixedMask, ManifoldKind, ParamId, ProblemIR, RobustLoss};
use crate::params::calibration::{calibration_fixed_indices, calibration_to_dvec, dvec_to_calibration, CALIB_DIM};
use crate::params::pose_se3::{iso3_to_se3_dvec, se3_dvec_to_iso3};
use anyhow::{anyhow, ensure, Result};
use log::{debug, info, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use sfm_core::{CameraCalibration, Iso3, Pt3, Real, Track};
use std::collections::{BTreeMap, HashMap};

/// Solve options for bundle adjustment.
#[derive(Debug, Clone)]
pub struct BundleAdjustmentOptions {
    /// Observations reprojecting worse than this (pixels) are removed after the solve.
    pub output_reproj_error_thresh: Real,
    /// Apply a Huber loss to every observation.
    pub robust_measurement_noise: bool,
    /// Huber threshold in pixels.
    pub huber_scale_px: Real,
    /// One calibration block for all cameras instead of one per camera.
    pub shared_calib: bool,
    pub refine_focal: bool,
    pub refine_distortion: bool,
    /// Tracks left with fewer observations after filtering are dropped.
    pub min_track_len: usize,
    /// Weight of the baseline prior on the second camera.
    pub baseline_prior_weight: Real,
    pub solve: BackendSolveOptions,
}

impl Default for BundleAdjustmentOptions {
    fn default() -> Self {
        Self {
            output_reproj_error_thresh: 3.0,
            robust_measurement_noise: true,
            huber_scale_px: 2.0,
            shared_calib: true,
            refine_focal: true,
            refine_distortion: true,
            min_track_len: 2,
            baseline_prior_weight: 1.0e4,
            solve: BackendSolveOptions::default(),
        }
    }
}

/// Reprojection statistics of a reconstruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReprojectionMetrics {
    pub num_tracks: usize,
    pub num_observations: usize,
    pub mean_error_px: Real,
    pub median_error_px: Real,
}

/// Metrics before optimization, after optimization and after filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleAdjustmentMetrics {
    pub before: ReprojectionMetrics,
    pub after: ReprojectionMetrics,
    pub filtered: ReprojectionMetrics,
}

/// Refined reconstruction returned by [`bundle_adjust`].
#[derive(Debug, Clone)]
pub struct BundleAdjustmentResult {
    /// Camera-to-world poses keyed by image index.
    pub poses: BTreeMap<usize, Iso3>,
    pub calibrations: BTreeMap<usize, CameraCalibration>,
    pub tracks: Vec<Track>,
    pub metrics: BundleAdjustmentMetrics,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub converged: bool,
}

/// Reprojection error of every observation whose camera is known.
fn observation_errors(
    poses: &BTreeMap<usize, Iso3>,
    calibrations: &BTreeMap<usize, CameraCalibration>,
    tracks: &[Track],
) -> Vec<Real> {
    let mut errors = Vec::new();
    for track in tracks {
        for obs in &track.observations {
            if let (Some(pose), Some(cal)) = (poses.get(&obs.image), calibrations.get(&obs.image)) {
                errors.push(cal.reprojection_error(pose, &track.point, &obs.uv));
            }
        }
    }
    errors
}

/// Mean and median reprojection error over all observations.
pub fn reprojection_metrics(
    poses: &BTreeMap<usize, Iso3>,
    calibrations: &BTreeMap<usize, CameraCalibration>,
    tracks: &[Track],
) -> ReprojectionMetrics {
    let mut errors = observation_errors(poses, calibrations, tracks);
    if errors.is_empty() {
        return ReprojectionMetrics {
            num_tracks: tracks.len(),
            ..ReprojectionMetrics::default()
        };
    }
    let n = errors.len();
    let mean = errors.iter().sum::<Real>() / n as Real;
    errors.sort_by(|a, b| a.total_cmp(b));
    let median = if n % 2 == 1 {
        errors[n / 2]
    } else {
        0.5 * (errors[n / 2 - 1] + errors[n / 2])
    };
    ReprojectionMetrics {
        num_tracks: tracks.len(),
        num_observations: n,
        mean_error_px: mean,
        median_error_px: median,
    }
}

/// Removes observations above `thresh` and tracks left shorter than `min_track_len`.
pub fn filter_tracks(
    poses: &BTreeMap<usize, Iso3>,
    calibrations: &BTreeMap<usize, CameraCalibration>,
    tracks: &[Track],
    thresh: Real,
    min_track_len: usize,
) -> Vec<Track> {
    tracks
        .iter()
        .filter_map(|track| {
            let observations: Vec<_> = track
                .observations
                .iter()
                .filter(|obs| {
                    match (poses.get(&obs.image), calibrations.get(&obs.image)) {
                        (Some(pose), Some(cal)) => {
                            cal.reprojection_error(pose, &track.point, &obs.uv) <= thresh
                        }
                        _ => false,
                    }
                })
                .copied()
                .collect();
            (observations.len() >= min_track_len.max(2)).then(|| Track {
                point: track.point,
                observations,
            })
        })
        .collect()
}

fn pose_name(image: usize) -> String {
    format!("pose/{image}")
}

fn point_name(track: usize) -> String {
    format!("point/{track}")
}

fn calib_name(image: usize, shared: bool) -> String {
    if shared {
        "calib/shared".to_string()
    } else {
        format!("calib/{image}")
    }
}

/// Build the IR and initial parameter map.
///
/// Observations of cameras without a pose are ignored; tracks with fewer
/// than two usable observations are left out of the problem.
pub fn build_bundle_adjustment_problem(
    poses: &BTreeMap<usize, Iso3>,
    calibrations: &BTreeMap<usize, CameraCalibration>,
    tracks: &[Track],
    opts: &BundleAdjustmentOptions,
) -> Result<(ProblemIR, HashMap<String, DVector<f64>>)> {
    ensure!(poses.len() >= 2, "bundle adjustment needs at least two cameras");
    for image in poses.keys() {
        ensure!(
            calibrations.contains_key(image),
            "camera {} has a pose but no calibration",
            image
        );
    }

    let mut ir = ProblemIR::new();
    let mut initial = HashMap::new();

    let calib_fixed = FixedMask::fix_indices(&calibration_fixed_indices(
        opts.refine_focal,
        opts.refine_distortion,
    ));
    let mut calib_ids: HashMap<usize, ParamId> = HashMap::new();
    if opts.shared_calib {
        let (first, cal) = calibrations
            .iter()
            .find(|(image, _)| poses.contains_key(image))
            .ok_or_else(|| anyhow!("no calibration for any posed camera"))?;
        debug!("shared calibration initialised from camera {}", first);
        let name = calib_name(*first, true);
        let id = ir.add_param_block(&name, CALIB_DIM, ManifoldKind::Euclidean, calib_fixed.clone());
        initial.insert(name, calibration_to_dvec(cal));
        for image in poses.keys() {
            calib_ids.insert(*image, id);
        }
    } else {
        for image in poses.keys() {
            let name = calib_name(*image, false);
            let id = ir.add_param_block(&name, CALIB_DIM, ManifoldKind::Euclidean, calib_fixed.clone());
            initial.insert(name, calibration_to_dvec(&calibrations[image]));
            calib_ids.insert(*image, id);
        }
    }

    let mut pose_ids: HashMap<usize, ParamId> = HashMap::new();
    for (k, (image, w_t_i)) in poses.iter().enumerate() {
        let name = pose_name(*image);
        let fixed = if k == 0 {
            FixedMask::all_fixed(7)
        } else {
            FixedMask::all_free()
        };
        let id = ir.add_param_block(&name, 7, ManifoldKind::SE3, fixed);
        initial.insert(name, iso3_to_se3_dvec(&w_t_i.inverse()));
        pose_ids.insert(*image, id);
    }

    let loss = if opts.robust_measurement_noise {
        RobustLoss::Huber {
            scale: opts.huber_scale_px,
        }
    } else {
        RobustLoss::None
    };

    for (j, track) in tracks.iter().enumerate() {
        let usable: Vec<_> = track
            .observations
            .iter()
            .filter(|obs| pose_ids.contains_key(&obs.image))
            .collect();
        if usable.len() < 2 {
            continue;
        }
        let name = point_name(j);
        let point_id = ir.add_param_block(&name, 3, ManifoldKind::Euclidean, FixedMask::all_free());
        initial.insert(name, DVector::from_column_slice(track.point.coords.as_slice()));
        for obs in usable {
            ir.add_residual_block(
                vec![calib_ids[&obs.image], pose_ids[&obs.image], point_id],
                FactorKind::ReprojPoint {
                    uv: [obs.uv.x, obs.uv.y],
                    w: 1.0,
                },
                loss,
            );
        }
    }

    let mut posed = poses.iter();
    if let (Some((_, first)), Some((second_idx, second))) = (posed.next(), posed.next()) {
        let anchor = first.translation.vector;
        let distance = (second.translation.vector - anchor).norm();
        if distance > 1e-9 {
            ir.add_residual_block(
                vec![pose_ids[second_idx]],
                FactorKind::BaselinePrior {
                    anchor: [anchor.x, anchor.y, anchor.z],
                    distance,
                    w: opts.baseline_prior_weight,
                },
                RobustLoss::None,
            );
        } else {
            warn!("first two cameras coincide; scale is left to the solver");
        }
    }

    Ok((ir, initial))
}

/// Jointly refine poses, calibrations and points, then filter observations.
///
/// Poses are camera-to-world and keyed by image index. If the solver returns
/// nothing, the initial values come back with `converged = false`.
pub fn bundle_adjust(
    poses: &BTreeMap<usize, Iso3>,
    calibrations: &BTreeMap<usize, CameraCalibration>,
    tracks: &[Track],
    opts: &BundleAdjustmentOptions,
) -> Result<BundleAdjustmentResult> {
    let before = reprojection_metrics(poses, calibrations, tracks);
    let (ir, initial) = build_bundle_adjustment_problem(poses, calibrations, tracks, opts)?;
    debug!(
        "bundle adjustment: {} param blocks, {} residual blocks",
        ir.params.len(),
        ir.residuals.len()
    );
    let solution = solve_with_backend(&ir, &initial, &opts.solve)?;

    let mut out_poses = BTreeMap::new();
    let mut out_calibrations = BTreeMap::new();
    for image in poses.keys() {
        let c_t_w = solution
            .params
            .get(&pose_name(*image))
            .ok_or_else(|| anyhow!("solution missing pose {}", image))?;
        out_poses.insert(*image, se3_dvec_to_iso3(c_t_w.as_view())?.inverse());
        let calib = solution
            .params
            .get(&calib_name(*image, opts.shared_calib))
            .ok_or_else(|| anyhow!("solution missing calibration for {}", image))?;
        out_calibrations.insert(*image, dvec_to_calibration(calib.as_view())?);
    }

    let mut out_tracks = Vec::with_capacity(tracks.len());
    for (j, track) in tracks.iter().enumerate() {
        let point = match solution.params.get(&point_name(j)) {
            Some(v) => Pt3::new(v[0], v[1], v[2]),
            None => continue,
        };
        out_tracks.push(Track {
            point,
            observations: track
                .observations
                .iter()
                .filter(|obs| out_poses.contains_key(&obs.image))
                .copied()
                .collect(),
        });
    }

    let after = reprojection_metrics(&out_poses, &out_calibrations, &out_tracks);
    let filtered_tracks = filter_tracks(
        &out_poses,
        &out_calibrations,
        &out_tracks,
        opts.output_reproj_error_thresh,
        opts.min_track_len,
    );
    let filtered = reprojection_metrics(&out_poses, &out_calibrations, &filtered_tracks);

    info!(
        "bundle adjustment: mean reprojection {:.3} px -> {:.3} px, {} -> {} tracks after filtering",
        before.mean_error_px, after.mean_error_px, after.num_tracks, filtered.num_tracks
    );
    if !solution.converged {
        warn!("bundle adjustment stopped before convergence");
    }

    Ok(BundleAdjustmentResult {
        poses: out_poses,
        calibrations: out_calibrations,
        tracks: filtered_tracks,
        metrics: BundleAdjustmentMetrics {
            before,
            after,
            filtered,
        },
        initial_cost: solution.initial_cost,
        final_cost: solution.final_cost,
        converged: solution.converged,
    })
}
