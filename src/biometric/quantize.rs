//! Noise-tolerant quantization of descriptors.
//!
//! Each AC coefficient is divided by the L2 norm of all AC coefficients and
//! snapped to a cell of width [`CELL_WIDTH`]. At registration the position of
//! the value inside its cell is recorded as public [`HelperData`]; at access
//! the fresh value is shifted by that offset before rounding, so it lands in
//! the registered cell as long as it moved less than half a cell.
//!
//! ```text
//! register: t = v / w          cell = floor(t)         offset = frac(t)   (stored)
//! access:   t' = v' / w        cell' = round(t' - offset)
//! ```
//!
//! The offsets reveal where a value sits inside its cell, never which cell.

use std::fmt;

use zeroize::Zeroize;

use super::{AC_COEFFICIENTS, Descriptor, Modality};
use crate::error::{Error, Result};

/// Width of a quantization cell on the norm-scaled coefficients.
pub const CELL_WIDTH: f64 = 0.25;
/// Bytes of helper data per modality, one offset per AC coefficient.
pub const HELPER_LEN: usize = AC_COEFFICIENTS;

/// Resolution of a stored offset within a cell.
const OFFSET_STEPS: f64 = 256.0;
/// AC norm below which an image counts as flat.
const MIN_AC_NORM: f64 = 1e-6;

/// Public per-coefficient offsets recorded at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperData([u8; HELPER_LEN]);

impl HelperData {
    pub fn from_bytes(bytes: [u8; HELPER_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HELPER_LEN] {
        &self.0
    }
}

/// Helper data of both modalities, stored in the container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperPair {
    pub iris: HelperData,
    pub fingerprint: HelperData,
}

/// Cell indices of one descriptor. This is the only biometric input of the
/// key derivation.
#[derive(Clone, PartialEq, Eq)]
pub struct QuantizedDescriptor {
    modality: Modality,
    cells: [i8; HELPER_LEN],
}

impl QuantizedDescriptor {
    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// Number of coefficients that landed in a different cell.
    pub fn differing_cells(&self, other: &QuantizedDescriptor) -> usize {
        self.cells
            .iter()
            .zip(other.cells.iter())
            .filter(|(a, b)| a != b)
            .count()
    }

    /// Domain-tagged key material: modality tag followed by the cell indices.
    pub(crate) fn key_material(&self) -> [u8; HELPER_LEN + 1] {
        let mut out = [0u8; HELPER_LEN + 1];
        out[0] = self.modality.tag();
        for (byte, cell) in out[1..].iter_mut().zip(self.cells.iter()) {
            *byte = *cell as u8;
        }
        out
    }
}

impl Drop for QuantizedDescriptor {
    fn drop(&mut self) {
        self.cells.zeroize();
    }
}

impl fmt::Debug for QuantizedDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuantizedDescriptor")
            .field("modality", &self.modality)
            .field("cells", &"[REDACTED]")
            .finish()
    }
}

/// AC coefficients over their L2 norm, in units of cells. A flat image has
/// no AC energy and maps to all zeros.
fn scaled_ac(descriptor: &Descriptor) -> [f64; HELPER_LEN] {
    let ac = &descriptor.coefficients()[1..];
    let norm = ac.iter().map(|c| c * c).sum::<f64>().sqrt();

    let mut out = [0.0; HELPER_LEN];
    if norm > MIN_AC_NORM {
        for (slot, c) in out.iter_mut().zip(ac) {
            *slot = c / norm / CELL_WIDTH;
        }
    }
    out
}

fn clamp_cell(cell: i64) -> i8 {
    cell.clamp(i8::MIN as i64, i8::MAX as i64) as i8
}

/// Quantize a registration capture and record its helper data.
pub fn enroll(descriptor: &Descriptor) -> (QuantizedDescriptor, HelperData) {
    let mut cells = [0i8; HELPER_LEN];
    let mut offsets = [0u8; HELPER_LEN];

    for (i, t) in scaled_ac(descriptor).iter().enumerate() {
        let steps = (t * OFFSET_STEPS).round() as i64;
        cells[i] = clamp_cell(steps.div_euclid(OFFSET_STEPS as i64));
        offsets[i] = steps.rem_euclid(OFFSET_STEPS as i64) as u8;
    }

    (
        QuantizedDescriptor {
            modality: descriptor.modality(),
            cells,
        },
        HelperData(offsets),
    )
}

/// Quantize an access capture against the helper data of its registration.
pub fn reproduce(descriptor: &Descriptor, helper: &HelperData) -> QuantizedDescriptor {
    let mut cells = [0i8; HELPER_LEN];
    for ((cell, t), offset) in cells
        .iter_mut()
        .zip(scaled_ac(descriptor).iter())
        .zip(helper.0.iter())
    {
        *cell = clamp_cell((t - *offset as f64 / OFFSET_STEPS).round() as i64);
    }

    QuantizedDescriptor {
        modality: descriptor.modality(),
        cells,
    }
}

/// Enroll an iris and a fingerprint descriptor together.
///
/// # Errors
///
/// Returns [`Error::Crypto`] if the descriptors are not an iris and a
/// fingerprint, in that order.
pub fn enroll_pair(
    iris: &Descriptor,
    fingerprint: &Descriptor,
) -> Result<(QuantizedDescriptor, QuantizedDescriptor, HelperPair)> {
    check_order(iris, fingerprint)?;
    let (iris, iris_helper) = enroll(iris);
    let (fingerprint, fingerprint_helper) = enroll(fingerprint);
    Ok((
        iris,
        fingerprint,
        HelperPair {
            iris: iris_helper,
            fingerprint: fingerprint_helper,
        },
    ))
}

/// Reproduce both quantized descriptors from a container's helper data.
///
/// # Errors
///
/// Returns [`Error::Crypto`] if the descriptors are not an iris and a
/// fingerprint, in that order.
pub fn reproduce_pair(
    iris: &Descriptor,
    fingerprint: &Descriptor,
    helpers: &HelperPair,
) -> Result<(QuantizedDescriptor, QuantizedDescriptor)> {
    check_order(iris, fingerprint)?;
    Ok((
        reproduce(iris, &helpers.iris),
        reproduce(fingerprint, &helpers.fingerprint),
    ))
}

fn check_order(iris: &Descriptor, fingerprint: &Descriptor) -> Result<()> {
    if iris.modality() != Modality::Iris || fingerprint.modality() != Modality::Fingerprint {
        return Err(Error::Crypto(
            "expected an iris and a fingerprint descriptor".into(),
        ));
    }
    Ok(())
}
