//! Biometric samples and the descriptors extracted from them.
//!
//! A [`Descriptor`] is the only representation of a biometric that leaves the
//! extractor. Its [`QualityStats`] feed the authenticity validator; its
//! coefficients are quantized by [`quantize`] before they reach the key
//! derivation.

pub mod extract;
pub mod quantize;
pub mod validate;

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

pub use extract::FeatureExtractor;
pub use quantize::{HelperData, HelperPair, QuantizedDescriptor};
pub use validate::{AuthenticityScore, AuthenticityScorer, LogisticScorer, ScoringModel, Validator};

/// Number of low-frequency DCT coefficients kept per descriptor (8x8 block).
pub const COEFFICIENTS: usize = 64;
/// Number of AC coefficients in the block.
pub const AC_COEFFICIENTS: usize = COEFFICIENTS - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Iris,
    Fingerprint,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Iris => "iris",
            Modality::Fingerprint => "fingerprint",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Modality::Iris => 1,
            Modality::Fingerprint => 2,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw image bytes with the modality the caller declares for them.
pub struct BiometricSample<'a> {
    bytes: &'a [u8],
    modality: Modality,
}

impl<'a> BiometricSample<'a> {
    pub fn new(bytes: &'a [u8], modality: Modality) -> Self {
        Self { bytes, modality }
    }

    pub fn iris(bytes: &'a [u8]) -> Self {
        Self::new(bytes, Modality::Iris)
    }

    pub fn fingerprint(bytes: &'a [u8]) -> Self {
        Self::new(bytes, Modality::Fingerprint)
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }
}

/// Image statistics used by the authenticity validator. All values are in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityStats {
    /// Standard deviation of the luma channel over 127.5.
    pub contrast: f64,
    /// Share of pixels whose gradient magnitude exceeds the edge threshold.
    pub edge_density: f64,
    /// Histogram entropy in bits over 8.
    pub entropy: f64,
    /// Share of pixels clipped to pure black or pure white.
    pub saturation: f64,
}

impl QualityStats {
    pub fn as_features(&self) -> [f64; 4] {
        [self.contrast, self.edge_density, self.entropy, self.saturation]
    }
}

/// Deterministic numeric description of one biometric image.
pub struct Descriptor {
    modality: Modality,
    coefficients: Vec<f64>,
    quality: QualityStats,
}

impl Descriptor {
    pub(crate) fn new(
        modality: Modality,
        coefficients: Vec<f64>,
        quality: QualityStats,
    ) -> Self {
        debug_assert_eq!(coefficients.len(), COEFFICIENTS);
        Self {
            modality,
            coefficients,
            quality,
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// Low-frequency DCT coefficients, row-major, DC first.
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn quality(&self) -> &QualityStats {
        &self.quality
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        self.coefficients.zeroize();
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("modality", &self.modality)
            .field("quality", &self.quality)
            .finish_non_exhaustive()
    }
}
