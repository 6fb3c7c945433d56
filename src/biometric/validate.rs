//! Authenticity validation of descriptors.
//!
//! The scorer is a trait object so the model can be swapped (or stubbed in
//! tests) without touching the encryption pipeline. The default
//! [`LogisticScorer`] is a per-modality logistic model over the descriptor's
//! [`QualityStats`]; its weights ship with the crate and can be replaced by a
//! JSON model file.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Descriptor, Modality};
use crate::error::{Error, Result};

/// Default acceptance threshold on the genuine-capture probability.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuthenticityScore {
    modality: Modality,
    probability: f64,
}

impl AuthenticityScore {
    pub fn new(modality: Modality, probability: f64) -> Self {
        Self {
            modality,
            probability: probability.clamp(0.0, 1.0),
        }
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// Probability that the descriptor comes from a genuine capture.
    pub fn probability(&self) -> f64 {
        self.probability
    }
}

pub trait AuthenticityScorer: Send + Sync {
    fn score(&self, descriptor: &Descriptor) -> AuthenticityScore;
}

/// Logistic regression over `[contrast, edge_density, entropy, saturation]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringModel {
    pub bias: f64,
    pub weights: [f64; 4],
}

impl ScoringModel {
    pub fn probability(&self, features: [f64; 4]) -> f64 {
        let z = self.bias
            + self
                .weights
                .iter()
                .zip(features.iter())
                .map(|(w, x)| w * x)
                .sum::<f64>();
        1.0 / (1.0 + (-z).exp())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticScorer {
    pub iris: ScoringModel,
    pub fingerprint: ScoringModel,
}

impl Default for LogisticScorer {
    fn default() -> Self {
        Self {
            iris: ScoringModel {
                bias: -3.5,
                weights: [3.5, 2.5, 3.0, -3.0],
            },
            fingerprint: ScoringModel {
                bias: -4.0,
                weights: [3.0, 4.0, 3.0, -3.0],
            },
        }
    }
}

impl LogisticScorer {
    /// Load model weights from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| Error::Config(format!("reading model {}: {e}", path.display())))?;
        Self::from_json(&data)
            .map_err(|e| Error::Config(format!("parsing model {}: {e}", path.display())))
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    fn model(&self, modality: Modality) -> &ScoringModel {
        match modality {
            Modality::Iris => &self.iris,
            Modality::Fingerprint => &self.fingerprint,
        }
    }
}

impl AuthenticityScorer for LogisticScorer {
    fn score(&self, descriptor: &Descriptor) -> AuthenticityScore {
        let modality = descriptor.modality();
        let probability = self
            .model(modality)
            .probability(descriptor.quality().as_features());
        AuthenticityScore::new(modality, probability)
    }
}

/// Scorer plus acceptance threshold.
#[derive(Clone)]
pub struct Validator {
    scorer: Arc<dyn AuthenticityScorer>,
    threshold: f64,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(Arc::new(LogisticScorer::default()), DEFAULT_THRESHOLD)
    }
}

impl Validator {
    pub fn new(scorer: Arc<dyn AuthenticityScorer>, threshold: f64) -> Self {
        Self { scorer, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn validate(&self, descriptor: &Descriptor) -> AuthenticityScore {
        self.scorer.score(descriptor)
    }

    pub fn accept(&self, score: &AuthenticityScore) -> bool {
        score.probability() >= self.threshold
    }

    /// Score both modalities; the pair is rejected if either one is below the
    /// threshold. Both are always scored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBiometric`] naming the first rejected modality.
    pub fn check_pair(&self, iris: &Descriptor, fingerprint: &Descriptor) -> Result<()> {
        let scores = [self.validate(iris), self.validate(fingerprint)];
        for score in &scores {
            debug!(
                modality = %score.modality(),
                probability = score.probability(),
                "authenticity scored"
            );
        }

        match scores.iter().find(|score| !self.accept(score)) {
            Some(rejected) => {
                warn!(
                    modality = %rejected.modality(),
                    probability = rejected.probability(),
                    threshold = self.threshold,
                    "biometric rejected by validator"
                );
                Err(Error::InvalidBiometric {
                    modality: rejected.modality(),
                    score: rejected.probability(),
                })
            }
            None => Ok(()),
        }
    }
}
