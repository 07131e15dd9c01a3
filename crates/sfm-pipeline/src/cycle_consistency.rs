//! Rotation cycle consistency over view-graph triangles.
//!
//! Composing the three relative rotations of a triangle `(a, b, c)` should
//! give the identity. An edge is dropped when the median cycle error of the
//! triangles it belongs to exceeds the threshold. Edges that are not part of
//! any triangle cannot be checked and are kept.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use sfm_core::{Real, RelativePose, Rot3, ViewGraph};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConsistencyOptions {
    pub max_cycle_error_deg: Real,
}

impl Default for CycleConsistencyOptions {
    fn default() -> Self {
        Self {
            max_cycle_error_deg: 5.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleConsistencyReport {
    pub num_triangles: usize,
    /// Edges that belong to no triangle.
    pub num_unchecked_edges: usize,
    /// `(i1, i2)` of every discarded edge.
    pub dropped_edges: Vec<(usize, usize)>,
    /// Median cycle error per input edge, degrees; `None` when unchecked.
    pub edge_errors_deg: Vec<Option<Real>>,
}

/// Rotation taking frame `from` to frame `to` along an edge.
fn rotation_between(edge: &(usize, usize, RelativePose), from: usize, to: usize) -> Rot3 {
    let (i1, i2, pose) = edge;
    debug_assert!((*i1 == from && *i2 == to) || (*i1 == to && *i2 == from));
    if *i1 == from {
        pose.rotation
    } else {
        pose.rotation.inverse()
    }
}

fn median(values: &mut [Real]) -> Real {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Keep the cycle-consistent edges of `graph`.
pub fn filter_to_cycle_consistent_edges(
    graph: &ViewGraph<RelativePose>,
    opts: &CycleConsistencyOptions,
) -> (ViewGraph<RelativePose>, CycleConsistencyReport) {
    let triangles = graph.triangles();
    let mut per_edge: Vec<Vec<Real>> = vec![Vec::new(); graph.num_edges()];

    for &[e_ab, e_bc, e_ac] in &triangles {
        let (a, b, _) = *graph.edge(e_ab);
        let a_min = a.min(b);
        let b_mid = a.max(b);
        let (x, y, _) = *graph.edge(e_bc);
        let c = if x == b_mid { y } else { x };

        let r_ab = rotation_between(graph.edge(e_ab), a_min, b_mid);
        let r_bc = rotation_between(graph.edge(e_bc), b_mid, c);
        let r_ca = rotation_between(graph.edge(e_ac), c, a_min);
        let error = (r_ca * r_bc * r_ab).angle().to_degrees();
        for e in [e_ab, e_bc, e_ac] {
            per_edge[e].push(error);
        }
    }

    let mut report = CycleConsistencyReport {
        num_triangles: triangles.len(),
        ..CycleConsistencyReport::default()
    };
    report.edge_errors_deg = per_edge
        .iter_mut()
        .map(|errors| (!errors.is_empty()).then(|| median(errors)))
        .collect();
    report.num_unchecked_edges = report.edge_errors_deg.iter().filter(|e| e.is_none()).count();

    let filtered = graph.filter_edges(|idx, (i1, i2, _)| {
        match report.edge_errors_deg[idx] {
            Some(err) if err > opts.max_cycle_error_deg => {
                debug!("edge ({}, {}) fails cycle consistency: {:.2} deg", i1, i2, err);
                false
            }
            _ => true,
        }
    });
    report.dropped_edges = graph
        .edges()
        .iter()
        .enumerate()
        .filter(|(idx, _)| {
            report.edge_errors_deg[*idx].is_some_and(|err| err > opts.max_cycle_error_deg)
        })
        .map(|(_, (i1, i2, _))| (*i1, *i2))
        .collect();

    info!(
        "cycle consistency: {} triangles, kept {} of {} edges ({} unchecked)",
        report.num_triangles,
        filtered.num_edges(),
        graph.num_edges(),
        report.num_unchecked_edges
    );
    (filtered, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Unit;
    use sfm_core::Vec3;

    fn edge(i1: usize, i2: usize, w_r: &[Rot3]) -> RelativePose {
        // i2Ri1 = wRi2^T * wRi1
        RelativePose {
            i1,
            i2,
            rotation: w_r[i2].inverse() * w_r[i1],
            translation_dir: Unit::new_normalize(Vec3::x()),
            inliers: Vec::new(),
            num_putative: 0,
        }
    }

    #[test]
    fn corrupted_edge_is_dropped_and_pendant_edge_kept() {
        let w_r: Vec<Rot3> = (0..6)
            .map(|i| Rot3::from_euler_angles(0.1 * i as f64, -0.2 * i as f64, 0.05))
            .collect();
        let mut g = ViewGraph::new(6);
        for a in 0..5 {
            for b in (a + 1)..5 {
                let mut payload = edge(a, b, &w_r);
                if (a, b) == (0, 2) {
                    payload.rotation =
                        Rot3::from_euler_angles(0.0, 0.0, 30f64.to_radians()) * payload.rotation;
                }
                g.add_edge(a, b, payload);
            }
        }
        // Pendant edge (4, 5) lives in no triangle.
        g.add_edge(4, 5, edge(4, 5, &w_r));

        let (filtered, report) =
            filter_to_cycle_consistent_edges(&g, &CycleConsistencyOptions::default());
        assert_eq!(report.num_triangles, 10);
        assert_eq!(report.num_unchecked_edges, 1);
        assert_eq!(report.dropped_edges, vec![(0, 2)]);
        assert_eq!(filtered.num_edges(), 10);
        assert!(filtered.find_edge(0, 2).is_none());
        assert!(filtered.find_edge(4, 5).is_some());
        let err = report.edge_errors_deg[g.find_edge(0, 1).unwrap()].unwrap();
        assert!(err < 1e-4);
    }
}
