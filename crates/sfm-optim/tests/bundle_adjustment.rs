//! Bundle adjustment on a jittered synthetic rig.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sfm_core::synthetic::{SceneConfig, SyntheticScene};
use sfm_core::{align_poses, CameraCalibration, Iso3, Observation, Track, Vec3};
use sfm_optim::{bundle_adjust, BundleAdjustmentOptions};
use std::collections::BTreeMap;

fn scene_tracks(scene: &SyntheticScene) -> Vec<Track> {
    let mut tracks: Vec<Track> = scene
        .points
        .iter()
        .map(|p| Track {
            point: *p,
            observations: Vec::new(),
        })
        .collect();
    for (cam, obs) in scene.observations.iter().enumerate() {
        for (k, (point, uv)) in obs.iter().enumerate() {
            tracks[*point].observations.push(Observation {
                image: cam,
                keypoint: k,
                uv: *uv,
            });
        }
    }
    tracks.retain(|t| t.len() >= 2);
    tracks
}

fn jitter(
    scene: &SyntheticScene,
    seed: u64,
) -> (BTreeMap<usize, Iso3>, BTreeMap<usize, CameraCalibration>, Vec<Track>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut small = |s: f64| Vec3::new(
        rng.random_range(-s..s),
        rng.random_range(-s..s),
        rng.random_range(-s..s),
    );

    let mut poses = BTreeMap::new();
    for (i, pose) in scene.poses.iter().enumerate() {
        let p = if i == 0 {
            *pose
        } else {
            Iso3::new(small(0.05), small(0.01)) * pose
        };
        poses.insert(i, p);
    }
    let calibrations = poses.keys().map(|k| (*k, scene.calibration)).collect();
    let tracks = scene_tracks(scene)
        .into_iter()
        .map(|t| Track {
            point: t.point + small(0.05),
            observations: t.observations,
        })
        .collect();
    (poses, calibrations, tracks)
}

fn assert_poses_close(estimated: &BTreeMap<usize, Iso3>, gt: &[Iso3], tol: f64) {
    let est: Vec<Iso3> = estimated.values().copied().collect();
    let aligned = align_poses(&est, gt);
    for (a, b) in aligned.iter().zip(gt) {
        assert!(a.rotation.angle_to(&b.rotation) < tol, "rotation off");
        assert!(
            (a.translation.vector - b.translation.vector).norm() < tol * 10.0,
            "centre off: {} vs {}",
            a.translation.vector,
            b.translation.vector
        );
    }
}

#[test]
fn jittered_scene_converges_below_threshold() {
    let scene = SyntheticScene::generate(&SceneConfig::default());
    let (poses, calibrations, tracks) = jitter(&scene, 17);
    let opts = BundleAdjustmentOptions::default();

    let result = bundle_adjust(&poses, &calibrations, &tracks, &opts).unwrap();

    assert!(result.metrics.before.mean_error_px > 1.0);
    assert!(
        result.metrics.after.mean_error_px < 1e-3,
        "mean error {}",
        result.metrics.after.mean_error_px
    );
    assert!(result.metrics.filtered.mean_error_px < opts.output_reproj_error_thresh);
    assert_eq!(result.tracks.len(), tracks.len());
    assert!(result.converged);
    assert!(result.final_cost < result.initial_cost);
    assert_poses_close(&result.poses, &scene.poses, 1e-4);

    let f = result.calibrations[&0].intrinsics.fx;
    assert!((f - scene.calibration.intrinsics.fx).abs() < 1e-2, "fx {f}");
}

#[test]
fn robust_loss_isolates_a_bad_observation() {
    let scene = SyntheticScene::generate(&SceneConfig::default());
    let (poses, calibrations, mut tracks) = jitter(&scene, 23);
    tracks[3].observations[0].uv.x += 25.0;

    let opts = BundleAdjustmentOptions {
        shared_calib: false,
        ..BundleAdjustmentOptions::default()
    };
    let result = bundle_adjust(&poses, &calibrations, &tracks, &opts).unwrap();

    assert_eq!(
        result.metrics.filtered.num_observations + 1,
        result.metrics.after.num_observations
    );
    assert!(result.metrics.filtered.mean_error_px < 0.05);
    assert_eq!(result.calibrations.len(), scene.poses.len());
}

#[test]
fn iteration_cap_reports_unconverged_solve() {
    let scene = SyntheticScene::generate(&SceneConfig::default());
    let (poses, calibrations, tracks) = jitter(&scene, 31);
    let mut opts = BundleAdjustmentOptions::default();
    opts.solve.max_iters = 1;

    let result = bundle_adjust(&poses, &calibrations, &tracks, &opts).unwrap();

    assert!(!result.converged);
    assert_eq!(result.poses.len(), poses.len());
    assert_eq!(result.tracks.len(), tracks.len());
    assert!(result.final_cost <= result.initial_cost);
}
