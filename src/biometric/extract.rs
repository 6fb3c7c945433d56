//! Feature extraction: image bytes to a low-frequency descriptor.
//!
//! Pipeline:
//! ```text
//! header check -> decode -> luma -> center crop -> 128x128 -> quality stats
//!                                                         -> 4x4 block means (32x32) -> DCT-II -> 8x8 block
//! ```
//!
//! Everything after decoding is plain `f64` arithmetic in a fixed order, so the
//! same bytes give the same descriptor on every run.

use std::f64::consts::PI;
use std::fmt;
use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageReader, Limits};
use tracing::debug;

use super::{BiometricSample, COEFFICIENTS, Descriptor, Modality, QualityStats};
use crate::error::{Error, Result};

/// Side of the normalized square image.
pub const NORMALIZED_SIDE: u32 = 128;
/// Default minimum side accepted for a capture.
pub const DEFAULT_MIN_SIDE: u32 = 64;
/// Default maximum side accepted for a capture.
pub const DEFAULT_MAX_SIDE: u32 = 8192;

const GRID_SIDE: usize = 32;
const CELL: usize = NORMALIZED_SIDE as usize / GRID_SIDE;
const BLOCK_SIDE: usize = 8;
const EDGE_THRESHOLD: f64 = 8.0;

#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractor {
    min_side: u32,
    max_side: u32,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self {
            min_side: DEFAULT_MIN_SIDE,
            max_side: DEFAULT_MAX_SIDE,
        }
    }
}

impl FeatureExtractor {
    pub fn new(min_side: u32, max_side: u32) -> Self {
        Self { min_side, max_side }
    }

    pub fn min_side(&self) -> u32 {
        self.min_side
    }

    pub fn max_side(&self) -> u32 {
        self.max_side
    }

    /// Extract the descriptor of one capture.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidImage`] if the bytes are not a decodable image or
    /// the image is outside the accepted size range.
    pub fn extract(&self, sample: &BiometricSample<'_>) -> Result<Descriptor> {
        let modality = sample.modality();
        let decoded = self.decode(sample)?;
        let (width, height) = (decoded.width(), decoded.height());

        let luma = normalize(decoded.to_luma8());
        drop(decoded);

        let quality = quality_stats(&luma);
        let grid = block_means(&luma);
        let coefficients = low_frequency_dct(&grid);

        debug!(
            %modality,
            width,
            height,
            contrast = quality.contrast,
            edge_density = quality.edge_density,
            "descriptor extracted"
        );

        Ok(Descriptor::new(modality, coefficients, quality))
    }

    /// Decode a capture, checking its declared size before any pixel data is
    /// read.
    fn decode(&self, sample: &BiometricSample<'_>) -> Result<DynamicImage> {
        let modality = sample.modality();
        let reader = || {
            ImageReader::new(Cursor::new(sample.bytes()))
                .with_guessed_format()
                .map_err(|e| undecodable(modality, e))
        };

        let (width, height) = reader()?
            .into_dimensions()
            .map_err(|e| undecodable(modality, e))?;
        self.check_size(modality, width, height)?;

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_side);
        limits.max_image_height = Some(self.max_side);
        let mut reader = reader()?;
        reader.limits(limits);
        reader.decode().map_err(|e| undecodable(modality, e))
    }

    fn check_size(&self, modality: Modality, width: u32, height: u32) -> Result<()> {
        if width.min(height) < self.min_side {
            return Err(Error::InvalidImage(format!(
                "{modality} image is {width}x{height}, minimum side is {}",
                self.min_side
            )));
        }
        if width.max(height) > self.max_side {
            return Err(Error::InvalidImage(format!(
                "{modality} image is {width}x{height}, maximum side is {}",
                self.max_side
            )));
        }
        Ok(())
    }
}

fn undecodable(modality: Modality, e: impl fmt::Display) -> Error {
    Error::InvalidImage(format!("cannot decode {modality} image: {e}"))
}

/// Center-crop to a square and scale to [`NORMALIZED_SIDE`].
fn normalize(luma: GrayImage) -> GrayImage {
    let (width, height) = luma.dimensions();
    let side = width.min(height);
    let square = if width == height {
        luma
    } else {
        imageops::crop_imm(&luma, (width - side) / 2, (height - side) / 2, side, side).to_image()
    };

    if side == NORMALIZED_SIDE {
        square
    } else {
        imageops::resize(&square, NORMALIZED_SIDE, NORMALIZED_SIDE, FilterType::Triangle)
    }
}

fn quality_stats(luma: &GrayImage) -> QualityStats {
    let (width, height) = luma.dimensions();
    let total = (width * height) as f64;

    let mut histogram = [0u64; 256];
    let mut sum = 0.0;
    for pixel in luma.pixels() {
        histogram[pixel[0] as usize] += 1;
        sum += pixel[0] as f64;
    }
    let mean = sum / total;

    let variance = luma
        .pixels()
        .map(|p| (p[0] as f64 - mean).powi(2))
        .sum::<f64>()
        / total;

    let entropy = histogram
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum::<f64>();

    let saturated = histogram[0] + histogram[255];

    let mut edges = 0u64;
    let mut interior = 0u64;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = luma.get_pixel(x + 1, y)[0] as f64 - luma.get_pixel(x - 1, y)[0] as f64;
            let gy = luma.get_pixel(x, y + 1)[0] as f64 - luma.get_pixel(x, y - 1)[0] as f64;
            if (gx * gx + gy * gy).sqrt() / 2.0 > EDGE_THRESHOLD {
                edges += 1;
            }
            interior += 1;
        }
    }

    QualityStats {
        contrast: (variance.sqrt() / 127.5).min(1.0),
        edge_density: edges as f64 / interior.max(1) as f64,
        entropy: entropy / 8.0,
        saturation: saturated as f64 / total,
    }
}

/// Mean of each `CELL x CELL` block, giving a `GRID_SIDE x GRID_SIDE` grid.
fn block_means(luma: &GrayImage) -> Vec<f64> {
    let mut grid = vec![0.0; GRID_SIDE * GRID_SIDE];
    for (x, y, pixel) in luma.enumerate_pixels() {
        let cell = (y as usize / CELL) * GRID_SIDE + x as usize / CELL;
        grid[cell] += pixel[0] as f64;
    }
    let area = (CELL * CELL) as f64;
    for value in grid.iter_mut() {
        *value /= area;
    }
    grid
}

/// Orthonormal 2-D DCT-II of the grid, restricted to the top-left 8x8 block.
///
/// Output is row-major: index `v * 8 + u` holds vertical frequency `v` and
/// horizontal frequency `u`.
fn low_frequency_dct(grid: &[f64]) -> Vec<f64> {
    let n = GRID_SIDE as f64;
    let mut basis = [[0.0; GRID_SIDE]; BLOCK_SIDE];
    for (k, row) in basis.iter_mut().enumerate() {
        let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
        for (i, b) in row.iter_mut().enumerate() {
            *b = scale * ((2 * i + 1) as f64 * k as f64 * PI / (2.0 * n)).cos();
        }
    }

    // rows first: partial[y][u]
    let mut partial = vec![[0.0; BLOCK_SIDE]; GRID_SIDE];
    for y in 0..GRID_SIDE {
        for u in 0..BLOCK_SIDE {
            let mut acc = 0.0;
            for x in 0..GRID_SIDE {
                acc += grid[y * GRID_SIDE + x] * basis[u][x];
            }
            partial[y][u] = acc;
        }
    }

    let mut out = Vec::with_capacity(COEFFICIENTS);
    for v in 0..BLOCK_SIDE {
        for u in 0..BLOCK_SIDE {
            let mut acc = 0.0;
            for y in 0..GRID_SIDE {
                acc += partial[y][u] * basis[v][y];
            }
            out.push(acc);
        }
    }
    out
}
