//! Data association: pairwise correspondences to triangulated 3D tracks.
//!
//! Tracks are built with a disjoint-set forest over `(image, keypoint)`
//! elements, so chains and cycles of matches collapse into a single track.
//! A merged track that contains two keypoints of the same image is
//! inconsistent and dropped whole. Every remaining track with enough
//! observations is triangulated independently (in parallel), either in
//! closed form from all observations or by sampling consensus over view
//! pairs.

use crate::error::PipelineError;
use disjoint_sets::UnionFind;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sfm_core::{CameraCalibration, Correspondence, Iso3, KeypointSet, Observation, Real, Track, Track2d};
use sfm_linear::{
    triangulate_views, triangulate_views_ransac, PairSampling, TriangulationExitCode,
    TriangulationOutcome, TriangulationParams, TriangulationView,
};
use std::collections::{BTreeMap, HashMap};

/// Triangulation strategy; the integer codes are the configuration values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataAssociationMode {
    /// Closed-form DLT over all observations.
    NoRansac,
    RansacSampleUniform,
    RansacSampleBiasedBaseline,
    RansacTopkBaselines,
}

impl DataAssociationMode {
    pub fn code(self) -> u8 {
        match self {
            DataAssociationMode::NoRansac => 0,
            DataAssociationMode::RansacSampleUniform => 1,
            DataAssociationMode::RansacSampleBiasedBaseline => 2,
            DataAssociationMode::RansacTopkBaselines => 3,
        }
    }

    fn sampling(self) -> Option<PairSampling> {
        match self {
            DataAssociationMode::NoRansac => None,
            DataAssociationMode::RansacSampleUniform => Some(PairSampling::Uniform),
            DataAssociationMode::RansacSampleBiasedBaseline => Some(PairSampling::BiasedBaseline),
            DataAssociationMode::RansacTopkBaselines => Some(PairSampling::TopKBaselines),
        }
    }
}

impl TryFrom<u8> for DataAssociationMode {
    type Error = PipelineError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(DataAssociationMode::NoRansac),
            1 => Ok(DataAssociationMode::RansacSampleUniform),
            2 => Ok(DataAssociationMode::RansacSampleBiasedBaseline),
            3 => Ok(DataAssociationMode::RansacTopkBaselines),
            other => Err(PipelineError::Config(format!(
                "unknown data association mode {other} (expected 0..=3)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataAssociationOptions {
    pub mode: DataAssociationMode,
    /// Maximum mean reprojection error of an accepted track, pixels.
    pub reproj_error_thresh: Real,
    pub min_track_len: usize,
    /// RANSAC hypotheses per track (ignored by `NoRansac`).
    pub num_ransac_hypotheses: usize,
    /// Tracks whose widest ray angle is below this are rejected.
    pub min_tri_angle_deg: Real,
    /// Keep only the largest camera/track component.
    pub select_largest_component: bool,
    pub seed: u64,
}

impl Default for DataAssociationOptions {
    fn default() -> Self {
        Self {
            mode: DataAssociationMode::NoRansac,
            reproj_error_thresh: 4.0,
            min_track_len: 2,
            num_ransac_hypotheses: 20,
            min_tri_angle_deg: 1.0,
            select_largest_component: true,
            seed: 0,
        }
    }
}

/// Number of tracks per triangulation exit code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCodeCounts {
    pub success: usize,
    pub degenerate: usize,
    pub cheirality_failure: usize,
    pub small_baseline: usize,
    pub exceeds_reproj_thresh: usize,
    pub insufficient_inliers: usize,
}

impl ExitCodeCounts {
    fn record(&mut self, code: TriangulationExitCode) {
        let slot = match code {
            TriangulationExitCode::Success => &mut self.success,
            TriangulationExitCode::Degenerate => &mut self.degenerate,
            TriangulationExitCode::CheiralityFailure => &mut self.cheirality_failure,
            TriangulationExitCode::SmallBaseline => &mut self.small_baseline,
            TriangulationExitCode::ExceedsReprojThresh => &mut self.exceeds_reproj_thresh,
            TriangulationExitCode::InsufficientInliers => &mut self.insufficient_inliers,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.success
            + self.degenerate
            + self.cheirality_failure
            + self.small_baseline
            + self.exceeds_reproj_thresh
            + self.insufficient_inliers
    }
}

/// Summary of one data association run.
///
/// Ratios are relative to `num_track_candidates`, the consistent 2D tracks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataAssociationMetrics {
    pub num_cameras: usize,
    pub num_track_candidates: usize,
    /// Merged tracks with two keypoints in one image.
    pub num_inconsistent_tracks: usize,
    /// Candidates shorter than `min_track_len`, not triangulated.
    pub num_short_tracks: usize,
    pub mean_2d_track_length: Real,
    pub exit_codes: ExitCodeCounts,
    pub triangulation_success_ratio: Real,
    pub cheirality_failure_ratio: Real,
    pub small_baseline_failure_ratio: Real,
    /// Accepted tracks dropped by largest component selection.
    pub num_tracks_outside_largest_component: usize,
    pub num_accepted_tracks: usize,
    pub accepted_tracks_ratio: Real,
    pub mean_3d_track_length: Real,
    pub accepted_mean_reproj_error_px: Option<Real>,
    /// Mean error of the tracks rejected for exceeding the threshold.
    pub rejected_mean_reproj_error_px: Option<Real>,
}

#[derive(Debug, Clone, Default)]
pub struct DataAssociationResult {
    pub tracks: Vec<Track>,
    pub metrics: DataAssociationMetrics,
}

/// Pairwise matches between images `i1` and `i2`.
pub type PairMatches<'a> = (usize, usize, &'a [Correspondence]);

fn ratio(num: usize, den: usize) -> Real {
    if den == 0 {
        0.0
    } else {
        num as Real / den as Real
    }
}

fn mean(values: impl Iterator<Item = Real>) -> Option<Real> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as Real)
}

/// Link pairwise matches into 2D tracks.
///
/// Returns the consistent tracks (ordered by their smallest `(image,
/// keypoint)` element) and the number of inconsistent tracks dropped.
/// Matches referring to unknown images or keypoints are ignored.
pub fn generate_tracks(matches: &[PairMatches<'_>], keypoints: &[KeypointSet]) -> (Vec<Track2d>, usize) {
    let mut offsets = Vec::with_capacity(keypoints.len() + 1);
    let mut total = 0usize;
    offsets.push(0);
    for set in keypoints {
        total += set.len();
        offsets.push(total);
    }

    let mut uf = UnionFind::<usize>::new(total);
    let mut used = vec![false; total];
    let valid = |image: usize, kp: usize| image < keypoints.len() && kp < keypoints[image].len();
    for &(i1, i2, correspondences) in matches {
        for c in correspondences {
            if !valid(i1, c.a) || !valid(i2, c.b) {
                debug!("ignoring out-of-range match ({}:{}, {}:{})", i1, c.a, i2, c.b);
                continue;
            }
            let (a, b) = (offsets[i1] + c.a, offsets[i2] + c.b);
            uf.union(a, b);
            used[a] = true;
            used[b] = true;
        }
    }

    let mut slot_of_root: HashMap<usize, usize> = HashMap::new();
    let mut tracks: Vec<Track2d> = Vec::new();
    for elem in (0..total).filter(|&e| used[e]) {
        let root = uf.find(elem);
        let slot = *slot_of_root.entry(root).or_insert_with(|| {
            tracks.push(Track2d::default());
            tracks.len() - 1
        });
        let image = offsets.partition_point(|&o| o <= elem) - 1;
        let keypoint = elem - offsets[image];
        tracks[slot].observations.push(Observation {
            image,
            keypoint,
            uv: keypoints[image].point(keypoint),
        });
    }

    let merged = tracks.len();
    tracks.retain(Track2d::has_unique_images);
    let dropped = merged - tracks.len();
    (tracks, dropped)
}

/// Keep the tracks of the largest connected camera/track component.
///
/// Cameras are linked when a track observes both. Ties go to the component
/// holding the lowest camera index. Returns the kept tracks and the number
/// dropped.
pub fn largest_connected_component(tracks: Vec<Track>) -> (Vec<Track>, usize) {
    let Some(num_cameras) = tracks
        .iter()
        .flat_map(|t| t.observations.iter().map(|o| o.image + 1))
        .max()
    else {
        return (tracks, 0);
    };

    let mut uf = UnionFind::<usize>::new(num_cameras);
    let mut seen = vec![false; num_cameras];
    for track in &tracks {
        for pair in track.observations.windows(2) {
            uf.union(pair[0].image, pair[1].image);
        }
        for obs in &track.observations {
            seen[obs.image] = true;
        }
    }

    let mut sizes: BTreeMap<usize, usize> = BTreeMap::new();
    let mut order: Vec<usize> = Vec::new();
    for cam in (0..num_cameras).filter(|&c| seen[c]) {
        let root = uf.find(cam);
        let size = sizes.entry(root).or_insert(0);
        if *size == 0 {
            order.push(root);
        }
        *size += 1;
    }
    let Some(&first) = order.first() else {
        return (tracks, 0);
    };
    let mut best = first;
    for root in &order {
        if sizes[root] > sizes[&best] {
            best = *root;
        }
    }

    let before = tracks.len();
    let kept: Vec<Track> = tracks
        .into_iter()
        .filter(|t| t.observations.first().is_some_and(|o| uf.find(o.image) == best))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// Track construction plus triangulation for one set of registered cameras.
#[derive(Debug, Clone, Default)]
pub struct DataAssociation {
    options: DataAssociationOptions,
}

impl DataAssociation {
    pub fn new(options: DataAssociationOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DataAssociationOptions {
        &self.options
    }

    fn triangulation_params(&self) -> TriangulationParams {
        TriangulationParams {
            reproj_error_thresh: self.options.reproj_error_thresh,
            min_tri_angle_deg: self.options.min_tri_angle_deg,
            min_track_len: self.options.min_track_len,
        }
    }

    fn triangulate(&self, idx: usize, views: &[TriangulationView]) -> TriangulationOutcome {
        let params = self.triangulation_params();
        match self.options.mode.sampling() {
            None => triangulate_views(views, &params),
            Some(sampling) => triangulate_views_ransac(
                views,
                &params,
                sampling,
                self.options.num_ransac_hypotheses,
                self.options.seed.wrapping_add(idx as u64),
            ),
        }
    }

    /// Build and triangulate the tracks seen by the cameras in `poses`.
    ///
    /// `poses` are camera-to-world. Matches touching a camera without a pose
    /// or calibration are skipped.
    pub fn run(
        &self,
        poses: &BTreeMap<usize, Iso3>,
        calibrations: &BTreeMap<usize, CameraCalibration>,
        keypoints: &[KeypointSet],
        matches: &[PairMatches<'_>],
    ) -> DataAssociationResult {
        let registered = |i: usize| poses.contains_key(&i) && calibrations.contains_key(&i);
        let usable: Vec<PairMatches<'_>> = matches
            .iter()
            .filter(|(i1, i2, _)| registered(*i1) && registered(*i2))
            .copied()
            .collect();

        let (tracks_2d, num_inconsistent) = generate_tracks(&usable, keypoints);
        let mut metrics = DataAssociationMetrics {
            num_cameras: poses.len(),
            num_track_candidates: tracks_2d.len(),
            num_inconsistent_tracks: num_inconsistent,
            mean_2d_track_length: mean(tracks_2d.iter().map(|t| t.len() as Real)).unwrap_or(0.0),
            ..DataAssociationMetrics::default()
        };

        let min_len = self.options.min_track_len.max(2);
        let (candidates, short): (Vec<&Track2d>, Vec<&Track2d>) =
            tracks_2d.iter().partition(|t| t.len() >= min_len);
        metrics.num_short_tracks = short.len();

        let outcomes: Vec<(TriangulationOutcome, &Track2d)> = candidates
            .par_iter()
            .enumerate()
            .map(|(idx, track)| {
                let views: Vec<TriangulationView> = track
                    .observations
                    .iter()
                    .map(|o| TriangulationView::new(poses[&o.image], calibrations[&o.image], o.uv))
                    .collect();
                (self.triangulate(idx, &views), *track)
            })
            .collect();

        let mut accepted = Vec::new();
        let mut accepted_errors = Vec::new();
        let mut rejected_errors = Vec::new();
        for (outcome, track) in outcomes {
            metrics.exit_codes.record(outcome.exit_code);
            match (outcome.exit_code, outcome.point) {
                (TriangulationExitCode::Success, Some(point)) if outcome.inliers.len() >= min_len => {
                    accepted_errors.push(outcome.mean_reproj_error);
                    accepted.push(Track {
                        point,
                        observations: outcome
                            .inliers
                            .iter()
                            .map(|&i| track.observations[i])
                            .collect(),
                    });
                }
                (TriangulationExitCode::ExceedsReprojThresh, _) => {
                    rejected_errors.push(outcome.mean_reproj_error)
                }
                _ => {}
            }
        }

        if self.options.select_largest_component && !accepted.is_empty() {
            let (kept, dropped) = largest_connected_component(accepted);
            accepted = kept;
            metrics.num_tracks_outside_largest_component = dropped;
        }

        let n = metrics.num_track_candidates;
        metrics.triangulation_success_ratio = ratio(metrics.exit_codes.success, n);
        metrics.cheirality_failure_ratio = ratio(metrics.exit_codes.cheirality_failure, n);
        metrics.small_baseline_failure_ratio = ratio(metrics.exit_codes.small_baseline, n);
        metrics.num_accepted_tracks = accepted.len();
        metrics.accepted_tracks_ratio = ratio(accepted.len(), n);
        metrics.mean_3d_track_length =
            mean(accepted.iter().map(|t| t.len() as Real)).unwrap_or(0.0);
        metrics.accepted_mean_reproj_error_px = mean(accepted_errors.into_iter());
        metrics.rejected_mean_reproj_error_px = mean(rejected_errors.into_iter());

        info!(
            "data association: {} of {} candidate tracks accepted ({} inconsistent, {} short)",
            metrics.num_accepted_tracks,
            metrics.num_track_candidates,
            metrics.num_inconsistent_tracks,
            metrics.num_short_tracks
        );
        debug!("triangulation exit codes: {:?}", metrics.exit_codes);

        DataAssociationResult {
            tracks: accepted,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfm_core::synthetic::{SceneConfig, SyntheticScene};
    use sfm_core::{Keypoint, Pt2, Pt3};

    fn grid_keypoints(num_images: usize, per_image: usize) -> Vec<KeypointSet> {
        (0..num_images)
            .map(|i| {
                let kps = (0..per_image)
                    .map(|k| Keypoint::at(i as f64, k as f64))
                    .collect();
                KeypointSet::new(kps, vec![[0u8; 32]; per_image])
            })
            .collect()
    }

    fn scene_matches(scene: &SyntheticScene) -> Vec<(usize, usize, Vec<Correspondence>)> {
        let mut out = Vec::new();
        let n = scene.num_cameras();
        for i1 in 0..n {
            for i2 in (i1 + 1)..n {
                let corrs = (0..scene.points.len())
                    .filter_map(|j| {
                        Some(Correspondence::new(
                            scene.keypoint_of(i1, j)?,
                            scene.keypoint_of(i2, j)?,
                        ))
                    })
                    .collect();
                out.push((i1, i2, corrs));
            }
        }
        out
    }

    fn borrowed(matches: &[(usize, usize, Vec<Correspondence>)]) -> Vec<PairMatches<'_>> {
        matches.iter().map(|(a, b, c)| (*a, *b, c.as_slice())).collect()
    }

    fn scene_cameras(
        scene: &SyntheticScene,
    ) -> (BTreeMap<usize, Iso3>, BTreeMap<usize, CameraCalibration>) {
        let poses = scene.poses.iter().copied().enumerate().collect();
        let calibrations = (0..scene.num_cameras()).map(|i| (i, scene.calibration)).collect();
        (poses, calibrations)
    }

    #[test]
    fn transitive_matches_merge_and_inconsistent_tracks_drop() {
        let kps = grid_keypoints(3, 3);
        let m01 = [Correspondence::new(0, 0), Correspondence::new(1, 1)];
        let m12 = [Correspondence::new(0, 0), Correspondence::new(1, 2)];
        let m02 = [Correspondence::new(1, 1)];
        let matches: Vec<PairMatches<'_>> = vec![(0, 1, &m01[..]), (1, 2, &m12[..]), (0, 2, &m02[..])];

        let (tracks, inconsistent) = generate_tracks(&matches, &kps);
        assert_eq!(inconsistent, 1);
        assert_eq!(tracks.len(), 1);
        let t = &tracks[0];
        assert_eq!(t.len(), 3);
        let ids: Vec<(usize, usize)> = t.observations.iter().map(|o| (o.image, o.keypoint)).collect();
        assert_eq!(ids, vec![(0, 0), (1, 0), (2, 0)]);
        assert_eq!(t.observations[2].uv, Pt2::new(2.0, 0.0));
    }

    #[test]
    fn out_of_range_matches_are_ignored() {
        let kps = grid_keypoints(2, 2);
        let bad = [Correspondence::new(0, 5), Correspondence::new(1, 1)];
        let (tracks, _) = generate_tracks(&[(0, 1, &bad[..]), (0, 7, &bad[..])], &kps);
        assert_eq!(tracks.len(), 1);
    }

    #[test]
    fn noise_free_scene_triangulates_every_point() {
        let scene = SyntheticScene::generate(&SceneConfig::default());
        let kps = scene.keypoint_sets();
        let owned = scene_matches(&scene);
        let (poses, calibrations) = scene_cameras(&scene);

        let da = DataAssociation::new(DataAssociationOptions::default());
        let result = da.run(&poses, &calibrations, &kps, &borrowed(&owned));

        let views_of = |j: usize| {
            scene
                .observations
                .iter()
                .filter(|obs| obs.iter().any(|(p, _)| *p == j))
                .count()
        };
        let expected = (0..scene.points.len()).filter(|&j| views_of(j) >= 2).count();
        assert_eq!(result.metrics.num_inconsistent_tracks, 0);
        assert_eq!(result.metrics.num_accepted_tracks, expected);
        assert!((result.metrics.accepted_tracks_ratio - 1.0).abs() < 1e-12);
        for track in &result.tracks {
            let o = track.observations[0];
            let j = scene.observations[o.image][o.keypoint].0;
            assert!((track.point - scene.points[j]).norm() < 1e-6);
            assert_eq!(track.len(), views_of(j));
        }
        assert!(result.metrics.accepted_mean_reproj_error_px.unwrap() < 1e-6);
    }

    #[test]
    fn ransac_mode_drops_mismatched_observation() {
        let scene = SyntheticScene::generate(&SceneConfig::default());
        let mut kps = scene.keypoint_sets();
        let bad_kp = scene.keypoint_of(3, 0).unwrap();
        kps[3].keypoints[bad_kp].pt += sfm_core::Vec2::new(40.0, -35.0);
        let owned = scene_matches(&scene);
        let (poses, calibrations) = scene_cameras(&scene);

        let da = DataAssociation::new(DataAssociationOptions {
            mode: DataAssociationMode::RansacSampleUniform,
            ..DataAssociationOptions::default()
        });
        let result = da.run(&poses, &calibrations, &kps, &borrowed(&owned));

        let first_kp = scene.keypoint_of(0, 0).unwrap();
        let track = result
            .tracks
            .iter()
            .find(|t| t.observations.iter().any(|o| o.image == 0 && o.keypoint == first_kp))
            .expect("track of point 0");
        assert_eq!(track.len(), scene.num_cameras() - 1);
        assert!(track.observations.iter().all(|o| o.image != 3));
        assert!((track.point - scene.points[0]).norm() < 1e-6);
    }

    #[test]
    fn tracks_below_min_length_are_not_triangulated() {
        let scene = SyntheticScene::generate(&SceneConfig::default());
        let kps = scene.keypoint_sets();
        let owned = scene_matches(&scene);
        let only_first_pair: Vec<PairMatches<'_>> = borrowed(&owned).into_iter().take(1).collect();
        let (poses, calibrations) = scene_cameras(&scene);

        let da = DataAssociation::new(DataAssociationOptions {
            min_track_len: 3,
            ..DataAssociationOptions::default()
        });
        let result = da.run(&poses, &calibrations, &kps, &only_first_pair);
        assert!(result.tracks.is_empty());
        assert_eq!(result.metrics.num_short_tracks, result.metrics.num_track_candidates);
        assert_eq!(result.metrics.exit_codes.total(), 0);
    }

    #[test]
    fn largest_component_keeps_biggest_camera_group() {
        let obs = |image| Observation {
            image,
            keypoint: 0,
            uv: Pt2::origin(),
        };
        let track = |images: &[usize]| Track {
            point: Pt3::origin(),
            observations: images.iter().map(|&i| obs(i)).collect(),
        };
        let tracks = vec![track(&[0, 1]), track(&[4, 5]), track(&[5, 6]), track(&[6, 4])];
        let (kept, dropped) = largest_connected_component(tracks);
        assert_eq!(dropped, 1);
        assert_eq!(kept.len(), 3);
        assert!(kept.iter().all(|t| t.observations[0].image >= 4));
    }

    #[test]
    fn mode_codes_round_trip_and_reject_unknown() {
        for code in 0..4u8 {
            assert_eq!(DataAssociationMode::try_from(code).unwrap().code(), code);
        }
        assert!(matches!(
            DataAssociationMode::try_from(4),
            Err(PipelineError::Config(_))
        ));
    }
}
