//! Colour filter array handling for raw single-channel mosaics.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use ndarray::{s, Array2, Array3, ArrayView2};

/// Turns a raw `(H, W)` mosaic into a `(3, H, W)` RGB array.
pub trait Colorizer: Send + Sync {
    fn colorize(&self, mosaic: ArrayView2<'_, f32>) -> Result<Array3<f32>>;
}

/// A 2x2 periodic colour filter layout such as `RGGB`, read row-major.
///
/// Colours are channel indices: 0 = R, 1 = G, 2 = B.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CfaPattern {
    cells: [[usize; 2]; 2],
}

impl CfaPattern {
    pub const RGGB: Self = Self {
        cells: [[0, 1], [1, 2]],
    };

    /// Channel index sampled at mosaic position `(y, x)`.
    pub fn color_at(&self, y: usize, x: usize) -> usize {
        self.cells[y % 2][x % 2]
    }
}

impl Default for CfaPattern {
    fn default() -> Self {
        Self::RGGB
    }
}

impl FromStr for CfaPattern {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let letters: Vec<char> = s.trim().chars().collect();
        if letters.len() != 4 {
            bail!("CFA pattern '{s}' must have exactly 4 letters (e.g. RGGB)");
        }
        let mut flat = [0usize; 4];
        for (slot, letter) in flat.iter_mut().zip(&letters) {
            *slot = match letter.to_ascii_uppercase() {
                'R' => 0,
                'G' => 1,
                'B' => 2,
                other => bail!("CFA pattern '{s}' has unknown colour '{other}'"),
            };
        }
        for channel in 0..3 {
            if !flat.contains(&channel) {
                bail!("CFA pattern '{s}' does not sample every RGB channel");
            }
        }
        Ok(Self {
            cells: [[flat[0], flat[1]], [flat[2], flat[3]]],
        })
    }
}

impl fmt::Display for CfaPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in &self.cells {
            for &channel in row {
                let letter = match channel {
                    0 => 'R',
                    1 => 'G',
                    _ => 'B',
                };
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

/// Neighbour-average demosaic: every output channel at a pixel is the mean of
/// the same-colour samples in its 3x3 window (clipped at the borders).
impl Colorizer for CfaPattern {
    fn colorize(&self, mosaic: ArrayView2<'_, f32>) -> Result<Array3<f32>> {
        let (height, width) = mosaic.dim();
        if height < 2 || width < 2 {
            bail!("mosaic must be at least 2x2, got {height}x{width}");
        }

        let mut rgb = Array3::<f32>::zeros((3, height, width));
        for y in 0..height {
            let y0 = y.saturating_sub(1);
            let y1 = (y + 1).min(height - 1);
            for x in 0..width {
                let x0 = x.saturating_sub(1);
                let x1 = (x + 1).min(width - 1);

                let mut sums = [0.0f32; 3];
                let mut counts = [0u32; 3];
                for ny in y0..=y1 {
                    for nx in x0..=x1 {
                        let channel = self.color_at(ny, nx);
                        sums[channel] += mosaic[[ny, nx]];
                        counts[channel] += 1;
                    }
                }

                for channel in 0..3 {
                    // A 2x2 window always covers every cell of the pattern.
                    rgb[[channel, y, x]] = sums[channel] / counts[channel].max(1) as f32;
                }
            }
        }
        // Measured samples are kept as-is.
        for y in 0..height {
            for x in 0..width {
                rgb[[self.color_at(y, x), y, x]] = mosaic[[y, x]];
            }
        }
        Ok(rgb)
    }
}

/// Wrap a raw mosaic into `channels` channels: channel 0 holds the mosaic and
/// the rest are zero.
pub fn expand_mosaic(mosaic: ArrayView2<'_, f32>, channels: usize) -> Result<Array3<f32>> {
    if channels == 0 {
        bail!("expand mode needs at least one channel");
    }
    let (height, width) = mosaic.dim();
    let mut expanded = Array3::<f32>::zeros((channels, height, width));
    expanded.slice_mut(s![0, .., ..]).assign(&mosaic);
    Ok(expanded)
}

/// Build a mosaic by sampling an RGB image through `pattern`.
pub fn mosaic_from_rgb(rgb: &Array3<f32>, pattern: &CfaPattern) -> Array2<f32> {
    let (_, height, width) = rgb.dim();
    Array2::from_shape_fn((height, width), |(y, x)| rgb[[pattern.color_at(y, x), y, x]])
}
