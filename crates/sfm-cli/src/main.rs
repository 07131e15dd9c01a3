use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use serde::{Deserialize, Serialize};
use sfm::{
    CameraCalibration, Image, Iso3, KeypointSet, SceneInput, SceneOptimizer, SceneOptimizerConfig,
    SceneResult,
};

/// Global structure-from-motion on a JSON scene description.
#[derive(Debug, Parser)]
#[command(author, version, about = "Global structure-from-motion pipeline")]
struct Args {
    /// Path to the JSON scene file.
    #[arg(long)]
    input: PathBuf,

    /// Optional path to a JSON SceneOptimizerConfig. Defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the report here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

/// On-disk scene description.
#[derive(Debug, Serialize, Deserialize)]
struct SceneFile {
    images: Vec<ImageEntry>,
    /// Pre-computed features, one set per image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    keypoints: Option<Vec<KeypointSet>>,
    /// Camera-to-world poses for evaluation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ground_truth: Option<Vec<Iso3>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ImageEntry {
    #[serde(default)]
    name: Option<String>,
    /// Image file, relative to the scene file. Decoded to grayscale.
    #[serde(default)]
    path: Option<PathBuf>,
    /// Required when `path` is absent.
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    calibration: Option<CameraCalibration>,
}

fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Failed to parse {}", path.display()))
}

fn load_image(entry: &ImageEntry, index: usize, base: &Path) -> Result<Image> {
    let name = entry
        .name
        .clone()
        .or_else(|| {
            entry
                .path
                .as_ref()
                .map(|p| p.display().to_string())
        })
        .unwrap_or_else(|| format!("image{index}"));

    let image = match &entry.path {
        Some(rel) => {
            let path = base.join(rel);
            let pixels = image::ImageReader::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?
                .decode()
                .with_context(|| format!("Failed to decode {}", path.display()))?
                .to_luma8();
            Image::from_pixels(name, pixels)
        }
        None => {
            let (Some(width), Some(height)) = (entry.width, entry.height) else {
                anyhow::bail!("image {index} has neither a path nor a width and height");
            };
            Image::with_size(name, width, height)
        }
    };
    Ok(match entry.calibration {
        Some(calibration) => image.with_calibration(calibration),
        None => image,
    })
}

fn load_scene(path: &Path) -> Result<SceneInput> {
    let scene: SceneFile = load_json_file(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let images = scene
        .images
        .iter()
        .enumerate()
        .map(|(i, entry)| load_image(entry, i, base))
        .collect::<Result<Vec<_>>>()?;
    info!("loaded {} images from {}", images.len(), path.display());

    Ok(SceneInput {
        images,
        keypoints: scene.keypoints,
        ground_truth: scene.ground_truth,
    })
}

fn run_from_files(input_path: &Path, config_path: Option<&Path>) -> Result<SceneResult> {
    let input = load_scene(input_path)?;
    let config = match config_path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            SceneOptimizerConfig::from_json(&text)?
        }
        None => SceneOptimizerConfig::default(),
    };
    let optimizer = SceneOptimizer::new(config)?;
    Ok(optimizer.run(&input)?)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = try_main() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let args = Args::parse();
    let result = run_from_files(&args.input, args.config.as_deref())?;
    let json = serde_json::to_string_pretty(&result)?;
    match &args.output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            info!("report written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
