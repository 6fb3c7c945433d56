//! Visual watermark derived from a descriptor pair.
//!
//! Each modality paints an 8x8 grid of coloured tiles whose colours come from
//! HKDF over the quantized descriptor. The fingerprint layer is scrambled with a
//! fixed tile permutation and blended over the iris layer.

use std::io::Cursor;

use hkdf::Hkdf;
use image::{ImageFormat, Rgb, RgbImage};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::biometric::{Modality, QuantizedDescriptor};
use crate::error::{Error, Result};

/// Tiles per side.
pub const TILES: u32 = 8;
/// Pixels per tile side.
pub const TILE_SIDE: u32 = 16;
/// Side of the rendered image.
pub const SIDE: u32 = TILES * TILE_SIDE;
/// Weight of the fingerprint layer.
pub const BLEND_ALPHA: f32 = 0.5;

const TILE_COUNT: usize = (TILES * TILES) as usize;
const PALETTE_SALT: &[u8] = b"biolock/watermark";

type Palette = [[u8; 3]; TILE_COUNT];

fn palette(descriptor: &QuantizedDescriptor) -> Result<Palette> {
    let material = Zeroizing::new(descriptor.key_material());
    let hkdf = Hkdf::<Sha256>::new(Some(PALETTE_SALT), &material[..]);

    let mut bytes = [0u8; TILE_COUNT * 3];
    hkdf.expand(descriptor.modality().as_str().as_bytes(), &mut bytes)
        .map_err(|e| Error::Crypto(format!("HKDF expand failed: {e}")))?;

    let mut out = [[0u8; 3]; TILE_COUNT];
    for (tile, rgb) in out.iter_mut().zip(bytes.chunks_exact(3)) {
        tile.copy_from_slice(rgb);
    }
    Ok(out)
}

/// Rubik-style scramble: row `r` is rotated right by `r + 1` tiles, then
/// column `c` is rotated down by `c + 1` tiles. Returns the source tile for
/// every destination tile.
fn rubik_permutation() -> [usize; TILE_COUNT] {
    let n = TILES as usize;
    let mut grid: [usize; TILE_COUNT] = std::array::from_fn(|i| i);

    for r in 0..n {
        grid[r * n..(r + 1) * n].rotate_right((r + 1) % n);
    }

    let mut out = grid;
    for c in 0..n {
        for r in 0..n {
            out[((r + c + 1) % n) * n + c] = grid[r * n + c];
        }
    }
    out
}

fn blend(under: [u8; 3], over: [u8; 3], alpha: f32) -> [u8; 3] {
    std::array::from_fn(|i| {
        (under[i] as f32 * (1.0 - alpha) + over[i] as f32 * alpha).round() as u8
    })
}

/// Render the watermark of a descriptor pair as PNG bytes.
///
/// # Errors
///
/// Returns [`Error::Crypto`] if the descriptors are not an iris and a
/// fingerprint, or an I/O error if PNG encoding fails.
pub fn render(iris: &QuantizedDescriptor, fingerprint: &QuantizedDescriptor) -> Result<Vec<u8>> {
    if iris.modality() != Modality::Iris || fingerprint.modality() != Modality::Fingerprint {
        return Err(Error::Crypto(
            "watermark expects an iris and a fingerprint descriptor".into(),
        ));
    }

    let iris_tiles = palette(iris)?;
    let fingerprint_tiles = palette(fingerprint)?;
    let permutation = rubik_permutation();

    let image = RgbImage::from_fn(SIDE, SIDE, |x, y| {
        let tile = ((y / TILE_SIDE) * TILES + x / TILE_SIDE) as usize;
        Rgb(blend(
            iris_tiles[tile],
            fingerprint_tiles[permutation[tile]],
            BLEND_ALPHA,
        ))
    });

    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    Ok(png)
}
