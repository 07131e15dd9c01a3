//! Robustness of rotation averaging to a corrupted view-graph edge.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sfm_core::{align_rotations, Rot3, Vec3, ViewGraph};
use sfm_optim::{
    RotationAveraging, RotationMeasurement, ShonanOptions, ShonanRotationAveraging,
    SpanningTreeRotationAveraging,
};

const N: usize = 10;

fn ground_truth(seed: u64) -> Vec<Rot3> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..N)
        .map(|_| {
            Rot3::from_euler_angles(
                rng.random_range(-0.8..0.8),
                rng.random_range(-0.8..0.8),
                rng.random_range(-0.8..0.8),
            )
        })
        .collect()
}

/// Ring with skip-one chords, so every edge lies on a triangle.
fn chord_ring(gt: &[Rot3], corrupt: Option<(usize, Rot3)>) -> ViewGraph<RotationMeasurement> {
    let mut g = ViewGraph::new(N);
    for i in 0..N {
        for step in [1, 2] {
            let j = (i + step) % N;
            let rel = gt[j].inverse() * gt[i];
            let idx = g.num_edges();
            let rel = match corrupt {
                Some((bad, noise)) if bad == idx => noise * rel,
                _ => rel,
            };
            g.add_edge(i, j, RotationMeasurement::new(rel));
        }
    }
    g
}

fn errors_deg(estimated: &[Option<Rot3>], gt: &[Rot3]) -> Vec<f64> {
    let est: Vec<Rot3> = estimated.iter().map(|r| r.expect("registered")).collect();
    align_rotations(&est, gt)
        .iter()
        .zip(gt)
        .map(|(a, b)| a.angle_to(b).to_degrees())
        .collect()
}

#[test]
fn corrupted_edge_does_not_spoil_rotations() {
    let gt = ground_truth(99);
    let noise = Rot3::from_axis_angle(&Vec3::z_axis(), 60f64.to_radians());
    let graph = chord_ring(&gt, Some((4, noise)));

    let result = ShonanRotationAveraging::default().average(&graph).unwrap();
    assert_eq!(result.components.len(), 1);
    let errors = errors_deg(&result.rotations, &gt);
    let worst = errors.iter().copied().fold(0.0, f64::max);
    assert!(worst < 1.0, "errors {errors:?}");
}

#[test]
fn spanning_tree_matches_lifted_solver_on_clean_ring() {
    let gt = ground_truth(5);
    let graph = chord_ring(&gt, None);

    let tree = SpanningTreeRotationAveraging.average(&graph).unwrap();
    let lifted = ShonanRotationAveraging::default().average(&graph).unwrap();
    for errors in [errors_deg(&tree.rotations, &gt), errors_deg(&lifted.rotations, &gt)] {
        assert!(errors.iter().all(|e| *e < 1e-4), "errors {errors:?}");
    }
    assert!(lifted.converged);
}

#[test]
fn sweep_cap_reports_unconverged_rotations() {
    let gt = ground_truth(41);
    let graph = chord_ring(&gt, None);
    let averaging = ShonanRotationAveraging::new(ShonanOptions {
        max_iters: 1,
        refine: false,
        ..ShonanOptions::default()
    });

    let result = averaging.average(&graph).unwrap();
    assert!(!result.converged);
    assert!(result.rotations.iter().all(|r| r.is_some()));
    assert_eq!(result.components.len(), 1);
}
