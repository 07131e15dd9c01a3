//! Extraction on a textured image and matching against a shifted copy.

use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sfm_core::Image;
use sfm_features::{FeatureExtractor, HarrisBriefExtractor, Matcher, TwoWayMatcher};

/// Random axis-aligned rectangles on a mid-gray background.
fn textured(width: u32, height: u32, seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = GrayImage::from_pixel(width, height, Luma([128]));
    for _ in 0..60 {
        let x0 = rng.random_range(0..width - 10);
        let y0 = rng.random_range(0..height - 10);
        let w = rng.random_range(6..30).min(width - x0);
        let h = rng.random_range(6..30).min(height - y0);
        let v: u8 = rng.random();
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                img.put_pixel(x, y, Luma([v]));
            }
        }
    }
    img
}

fn shifted(src: &GrayImage, dx: u32, dy: u32) -> GrayImage {
    let (w, h) = src.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        if x >= dx && y >= dy {
            *src.get_pixel(x - dx, y - dy)
        } else {
            Luma([128])
        }
    })
}

#[test]
fn extraction_is_deterministic() {
    let img = Image::from_pixels("a", textured(240, 180, 3));
    let extractor = HarrisBriefExtractor::default();
    let a = extractor.extract(&img);
    let b = extractor.extract(&img);
    assert!(!a.is_empty());
    assert_eq!(a, b);
}

#[test]
fn image_without_pixels_yields_zero_keypoints() {
    let img = Image::with_size("blank", 320, 240);
    assert!(HarrisBriefExtractor::default().extract(&img).is_empty());
}

#[test]
fn mutual_matches_follow_the_shift() {
    let base = textured(320, 240, 11);
    let (dx, dy) = (7, 5);
    let a = Image::from_pixels("a", base.clone());
    let b = Image::from_pixels("b", shifted(&base, dx, dy));

    let extractor = HarrisBriefExtractor::default();
    let ka = extractor.extract(&a);
    let kb = extractor.extract(&b);
    let matches = TwoWayMatcher::default().match_keypoints(&ka, &kb);
    assert!(matches.len() >= 20, "only {} matches", matches.len());

    let correct = matches
        .iter()
        .filter(|m| {
            let pa = ka.point(m.a);
            let pb = kb.point(m.b);
            (pb.x - pa.x - dx as f64).abs() < 0.5 && (pb.y - pa.y - dy as f64).abs() < 0.5
        })
        .count();
    assert!(
        correct * 10 >= matches.len() * 8,
        "{correct} of {} matches follow the shift",
        matches.len()
    );
}
