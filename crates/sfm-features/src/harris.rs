//! Harris corner detection with radius non-maximum suppression.

use image::GrayImage;
use serde::{Deserialize, Serialize};
use sfm_core::{Keypoint, Real};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarrisOptions {
    /// Harris sensitivity `k` in `det - k * trace²`.
    pub k: Real,
    /// Half-size of the structure tensor window.
    pub block_radius: u32,
    /// Minimum response relative to the strongest response in the image.
    pub response_threshold: Real,
    /// Radius of the non-maximum suppression window.
    pub nms_radius: u32,
    /// Pixels within this distance of the border are ignored.
    pub border: u32,
    pub max_keypoints: usize,
}

impl Default for HarrisOptions {
    fn default() -> Self {
        Self {
            k: 0.04,
            block_radius: 1,
            response_threshold: 0.01,
            nms_radius: 3,
            border: 16,
            max_keypoints: 2000,
        }
    }
}

/// Harris response per pixel, row major.
pub fn harris_response(image: &GrayImage, k: Real, block_radius: u32) -> Vec<Real> {
    let (w, h) = image.dimensions();
    let (w, h) = (w as i64, h as i64);
    let mut response = vec![0.0; (w * h) as usize];
    if w < 3 || h < 3 {
        return response;
    }
    let px = |x: i64, y: i64| image.get_pixel(x.clamp(0, w - 1) as u32, y.clamp(0, h - 1) as u32)[0] as Real;

    let mut ixx = vec![0.0; (w * h) as usize];
    let mut iyy = vec![0.0; (w * h) as usize];
    let mut ixy = vec![0.0; (w * h) as usize];
    for y in 0..h {
        for x in 0..w {
            let gx = (px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x - 1, y) + px(x - 1, y + 1));
            let gy = (px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x, y - 1) + px(x + 1, y - 1));
            let idx = (y * w + x) as usize;
            ixx[idx] = gx * gx;
            iyy[idx] = gy * gy;
            ixy[idx] = gx * gy;
        }
    }

    let r = block_radius as i64;
    for y in r..h - r {
        for x in r..w - r {
            let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
            for by in -r..=r {
                for bx in -r..=r {
                    let idx = ((y + by) * w + (x + bx)) as usize;
                    sxx += ixx[idx];
                    syy += iyy[idx];
                    sxy += ixy[idx];
                }
            }
            let det = sxx * syy - sxy * sxy;
            let trace = sxx + syy;
            response[(y * w + x) as usize] = det - k * trace * trace;
        }
    }
    response
}

/// Detect corners, strongest first. Ties are broken by raster order so the
/// output is deterministic.
pub fn detect_harris(image: &GrayImage, opts: &HarrisOptions) -> Vec<(Keypoint, Real)> {
    let (w, h) = image.dimensions();
    let response = harris_response(image, opts.k, opts.block_radius);
    let max_response = response.iter().copied().fold(0.0, Real::max);
    if max_response <= 0.0 {
        return Vec::new();
    }
    let thresh = opts.response_threshold * max_response;
    let border = opts.border.max(opts.block_radius + 1);
    if w <= 2 * border || h <= 2 * border {
        return Vec::new();
    }

    let nms = opts.nms_radius as i64;
    let (wi, hi) = (w as i64, h as i64);
    let mut corners = Vec::new();
    for y in border..h - border {
        for x in border..w - border {
            let idx = (y * w + x) as usize;
            let value = response[idx];
            if value <= thresh {
                continue;
            }
            let mut is_max = true;
            'window: for dy in -nms..=nms {
                for dx in -nms..=nms {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                    if nx < 0 || ny < 0 || nx >= wi || ny >= hi {
                        continue;
                    }
                    let other = response[(ny * wi + nx) as usize];
                    // Earlier pixels win ties.
                    let earlier = (dy, dx) < (0, 0);
                    if other > value || (other == value && earlier) {
                        is_max = false;
                        break 'window;
                    }
                }
            }
            if is_max {
                corners.push((Keypoint::at(x as Real, y as Real), value));
            }
        }
    }

    corners.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then(a.0.pt.y.total_cmp(&b.0.pt.y))
            .then(a.0.pt.x.total_cmp(&b.0.pt.x))
    });
    corners.truncate(opts.max_keypoints);
    corners
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn square_corners_are_detected() {
        let mut img = GrayImage::new(80, 80);
        for y in 30..50 {
            for x in 30..50 {
                img.put_pixel(x, y, Luma([200]));
            }
        }
        let corners = detect_harris(&img, &HarrisOptions::default());
        assert_eq!(corners.len(), 4, "{corners:?}");
        for (kp, _) in &corners {
            let near = |v: f64| (v - 29.5).abs() < 2.0 || (v - 49.5).abs() < 2.0;
            assert!(near(kp.pt.x) && near(kp.pt.y), "{:?}", kp.pt);
        }
    }

    #[test]
    fn flat_image_has_no_corners() {
        let img = GrayImage::from_pixel(64, 48, Luma([90]));
        assert!(detect_harris(&img, &HarrisOptions::default()).is_empty());
    }
}
