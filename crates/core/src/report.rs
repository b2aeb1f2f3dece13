//! Run artifacts: the serialized model, the validation loss file and the
//! target/input/output comparison grid.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};
use ndarray::{ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::autoencoder::ARCHITECTURE_NAME;
use crate::model::DenoisingAutoencoder;
use crate::validate::Preview;

const MODEL_FORMAT_VERSION: u32 = 1;
const GRID_PADDING: u32 = 2;

/// Output file locations derived from `--output` and `--name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub model: PathBuf,
    pub losses: PathBuf,
    pub grid: PathBuf,
    pub config: PathBuf,
}

impl ArtifactPaths {
    pub fn new(output_dir: &Path, name: &str) -> Self {
        Self {
            model: output_dir.join(format!("{name}-model.pkl")),
            losses: output_dir.join(format!("{name}-val-loss.txt")),
            grid: output_dir.join(format!("{name}-imgs.png")),
            config: output_dir.join(format!("{name}-config.toml")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelArtifact<M> {
    format_version: u32,
    architecture: String,
    saved_at: DateTime<Utc>,
    model: M,
}

pub fn save_model(model: &DenoisingAutoencoder, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let file = File::create(path)
        .with_context(|| format!("failed to create model file: {}", path.display()))?;
    let artifact = ModelArtifact {
        format_version: MODEL_FORMAT_VERSION,
        architecture: ARCHITECTURE_NAME.to_string(),
        saved_at: Utc::now(),
        model,
    };
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &artifact)
        .with_context(|| format!("failed to serialize model to {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to write model file: {}", path.display()))?;
    info!(path = %path.display(), "Saved model");
    Ok(())
}

pub fn load_model(path: &Path) -> Result<DenoisingAutoencoder> {
    let file = File::open(path)
        .with_context(|| format!("failed to open model file: {}", path.display()))?;
    let artifact: ModelArtifact<DenoisingAutoencoder> =
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse model file: {}", path.display()))?;

    if artifact.format_version != MODEL_FORMAT_VERSION {
        bail!(
            "model file {} has format version {}, expected {MODEL_FORMAT_VERSION}",
            path.display(),
            artifact.format_version
        );
    }
    if artifact.architecture != ARCHITECTURE_NAME {
        bail!(
            "model file {} holds a '{}' model, expected '{ARCHITECTURE_NAME}'",
            path.display(),
            artifact.architecture
        );
    }
    info!(
        path = %path.display(),
        saved_at = %artifact.saved_at,
        "Loaded model"
    );
    Ok(artifact.model)
}

/// One loss per line, in order.
pub fn save_losses(losses: &[f32], path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let mut encoded = String::new();
    for loss in losses {
        encoded.push_str(&format!("{loss}\n"));
    }
    fs::write(path, encoded)
        .with_context(|| format!("failed to write loss file: {}", path.display()))
}

/// Rows are target, input and output; one column per preview sample.
pub fn save_comparison_grid(preview: &Preview, path: &Path) -> Result<()> {
    let rows = [&preview.clean, &preview.noisy, &preview.denoised];
    let (samples, _, height, width) = preview.clean.dim();
    for row in &rows[1..] {
        let (n, _, h, w) = row.dim();
        if n != samples || h != height || w != width {
            bail!(
                "comparison rows disagree: {:?} vs {:?}",
                row.shape(),
                preview.clean.shape()
            );
        }
    }
    if samples == 0 {
        bail!("nothing to draw in the comparison grid");
    }

    let tile_w = width as u32;
    let tile_h = height as u32;
    let grid_w = samples as u32 * (tile_w + GRID_PADDING) + GRID_PADDING;
    let grid_h = rows.len() as u32 * (tile_h + GRID_PADDING) + GRID_PADDING;
    let mut canvas = RgbImage::new(grid_w, grid_h);

    for (row_index, row) in rows.iter().enumerate() {
        for (col_index, tile) in row.axis_iter(Axis(0)).enumerate() {
            let left = GRID_PADDING + col_index as u32 * (tile_w + GRID_PADDING);
            let top = GRID_PADDING + row_index as u32 * (tile_h + GRID_PADDING);
            draw_tile(&mut canvas, tile, left, top);
        }
    }

    ensure_parent(path)?;
    canvas
        .save(path)
        .with_context(|| format!("failed to write comparison grid: {}", path.display()))?;
    info!(path = %path.display(), samples, "Saved comparison grid");
    Ok(())
}

fn draw_tile(canvas: &mut RgbImage, tile: ArrayView3<'_, f32>, left: u32, top: u32) {
    let (channels, height, width) = tile.dim();
    let pick = |c: usize| if channels >= 3 { c } else { 0 };
    for y in 0..height {
        for x in 0..width {
            let pixel = Rgb([
                to_u8(tile[[pick(0), y, x]]),
                to_u8(tile[[pick(1), y, x]]),
                to_u8(tile[[pick(2), y, x]]),
            ]);
            canvas.put_pixel(left + x as u32, top + y as u32, pixel);
        }
    }
}

fn to_u8(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}
