//! Runtime settings, loaded from `config.toml`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::biometric::validate::DEFAULT_THRESHOLD;
use crate::biometric::{FeatureExtractor, LogisticScorer, Validator};
use crate::biometric::extract::{DEFAULT_MAX_SIDE, DEFAULT_MIN_SIDE};
use crate::crypto::KdfParams;
use crate::error::{Error, Result};
use crate::limiter::LimiterPolicy;

/// Largest plaintext accepted by `register`.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

const DEFAULT_EXTENSIONS: &[&str] = &[
    ".txt", ".pdf", ".png", ".jpg", ".jpeg", ".csv", ".json", ".docx", ".doc", ".xlsx", ".xls",
    ".pptx", ".zip",
];

/// Top-level configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Argon2id cost for newly registered containers
    pub kdf: KdfParams,
    pub limiter: LimiterConfig,
    pub validator: ValidatorConfig,
    pub extractor: ExtractorConfig,
    pub pool: PoolConfig,
    pub limits: LimitsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Failures before an identity is locked (default: 5)
    pub max_attempts: u32,
    /// Lockout length in seconds (default: 300)
    pub lockout_secs: u64,
    /// Failures older than this many seconds are forgotten (default: 3600)
    pub window_secs: u64,
    /// Attempt ledger file (default: platform data dir)
    pub ledger: Option<PathBuf>,
    /// Identities tracked at once before older records are evicted (default: 10000)
    pub max_records: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        let policy = LimiterPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            lockout_secs: policy.lockout.as_secs(),
            window_secs: policy.window.as_secs(),
            ledger: None,
            max_records: policy.max_records,
        }
    }
}

impl LimiterConfig {
    pub fn policy(&self) -> LimiterPolicy {
        LimiterPolicy {
            max_attempts: self.max_attempts,
            lockout: Duration::from_secs(self.lockout_secs),
            window: Duration::from_secs(self.window_secs),
            max_records: self.max_records,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Minimum authenticity probability per modality (default: 0.5)
    pub threshold: f64,
    /// JSON file with scoring weights; built-in weights when unset
    pub model_path: Option<PathBuf>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            model_path: None,
        }
    }
}

impl ValidatorConfig {
    pub fn build(&self) -> Result<Validator> {
        let scorer = match &self.model_path {
            Some(path) => LogisticScorer::from_file(path)?,
            None => LogisticScorer::default(),
        };
        Ok(Validator::new(Arc::new(scorer), self.threshold))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub min_side: u32,
    pub max_side: u32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            min_side: DEFAULT_MIN_SIDE,
            max_side: DEFAULT_MAX_SIDE,
        }
    }
}

impl ExtractorConfig {
    pub fn extractor(&self) -> FeatureExtractor {
        FeatureExtractor::new(self.min_side, self.max_side)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Extraction threads (0 = cpu_count)
    pub workers: usize,
    /// Requests admitted at once before `Busy` (default: 32)
    pub max_in_flight: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_in_flight: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum plaintext size in bytes (default: 100 MiB)
    pub max_file_size: u64,
    /// Accepted file name extensions, with leading dot; empty accepts all
    pub allowed_extensions: Vec<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl LimitsConfig {
    /// Check a plaintext before it is sealed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileTooLarge`] or [`Error::UnsupportedFileType`].
    pub fn check(&self, file_name: Option<&str>, size: u64) -> Result<()> {
        if size > self.max_file_size {
            return Err(Error::FileTooLarge {
                size,
                max: self.max_file_size,
            });
        }

        let Some(name) = file_name else {
            return Ok(());
        };
        if self.allowed_extensions.is_empty() {
            return Ok(());
        }

        let extension = Path::new(name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()));
        match extension {
            Some(ext)
                if self
                    .allowed_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(&ext)) =>
            {
                Ok(())
            }
            Some(ext) => Err(Error::UnsupportedFileType(ext)),
            None => Err(Error::UnsupportedFileType(format!("{name} has no extension"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, falling back to defaults when the file is
    /// missing. Reporting the fallback is left to the caller, which may not
    /// have logging set up yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file exists but cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading config {}: {e}", path.display())))?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("parsing config {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.kdf.validate()?;

        if self.limiter.max_attempts == 0 {
            return Err(Error::Config("limiter.max_attempts must be at least 1".into()));
        }
        if self.limiter.lockout_secs == 0 {
            return Err(Error::Config("limiter.lockout_secs must be at least 1".into()));
        }
        if self.limiter.window_secs < self.limiter.lockout_secs {
            return Err(Error::Config(
                "limiter.window_secs must not be shorter than lockout_secs".into(),
            ));
        }
        if self.limiter.max_records == 0 {
            return Err(Error::Config("limiter.max_records must be at least 1".into()));
        }
        if !(self.validator.threshold > 0.0 && self.validator.threshold < 1.0) {
            return Err(Error::Config(
                "validator.threshold must lie strictly between 0 and 1".into(),
            ));
        }
        if self.extractor.min_side < 8 || self.extractor.min_side > self.extractor.max_side {
            return Err(Error::Config(
                "extractor.min_side must be >= 8 and <= max_side".into(),
            ));
        }
        if self.pool.max_in_flight == 0 {
            return Err(Error::Config("pool.max_in_flight must be at least 1".into()));
        }
        if let Some(bad) = self
            .limits
            .allowed_extensions
            .iter()
            .find(|ext| !ext.starts_with('.') || ext.len() < 2)
        {
            return Err(Error::Config(format!(
                "allowed extension {bad:?} must start with a dot"
            )));
        }
        if !matches!(self.log.format.as_str(), "json" | "text") {
            return Err(Error::Config(format!(
                "log.format must be \"json\" or \"text\", got {:?}",
                self.log.format
            )));
        }
        Ok(())
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "biolock")
        .ok_or_else(|| Error::Config("could not determine platform directories".into()))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

pub fn default_ledger_path() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().join("attempts.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.limits.max_file_size, 100 * 1024 * 1024);
        assert_eq!(settings.limiter.policy(), LimiterPolicy::default());
        assert_eq!(settings.pool.max_in_flight, 32);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let settings = Settings::from_toml(
            r#"
            [kdf]
            mem_cost_kib = 1024
            time_cost = 1

            [limiter]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(settings.kdf.mem_cost_kib(), 1024);
        assert_eq!(settings.kdf.time_cost(), 1);
        assert_eq!(settings.kdf.parallelism(), KdfParams::default().parallelism());
        assert_eq!(settings.limiter.max_attempts, 3);
        assert_eq!(settings.limiter.lockout_secs, 300);
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for toml in [
            "[kdf]\nmem_cost_kib = 1",
            "[limiter]\nmax_attempts = 0",
            "[limiter]\nmax_records = 0",
            "[validator]\nthreshold = 1.5",
            "[extractor]\nmin_side = 512\nmax_side = 256",
            "[pool]\nmax_in_flight = 0",
            "[limits]\nallowed_extensions = [\"txt\"]",
            "[log]\nformat = \"xml\"",
            "not = [valid",
        ] {
            assert!(
                matches!(Settings::from_toml(toml), Err(Error::Config(_))),
                "accepted: {toml}"
            );
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.limiter.max_attempts, 5);
    }

    #[test]
    fn unreadable_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[limiter]\nmax_attempts = \"five\"").unwrap();
        assert!(matches!(Settings::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn limits_check_size_and_extension() {
        let limits = LimitsConfig {
            max_file_size: 10,
            ..LimitsConfig::default()
        };
        assert!(limits.check(Some("notes.TXT"), 10).is_ok());
        assert!(limits.check(None, 5).is_ok());
        assert!(matches!(
            limits.check(Some("notes.txt"), 11),
            Err(Error::FileTooLarge { size: 11, max: 10 })
        ));
        assert!(matches!(
            limits.check(Some("run.exe"), 1),
            Err(Error::UnsupportedFileType(_))
        ));
        assert!(matches!(
            limits.check(Some("Makefile"), 1),
            Err(Error::UnsupportedFileType(_))
        ));

        let open = LimitsConfig {
            allowed_extensions: Vec::new(),
            ..LimitsConfig::default()
        };
        assert!(open.check(Some("run.exe"), 1).is_ok());
    }

    #[test]
    fn validator_model_path_is_loaded() {
        let dir = tempdir().unwrap();
        let config = ValidatorConfig {
            threshold: 0.5,
            model_path: Some(dir.path().join("missing.json")),
        };
        assert!(matches!(config.build(), Err(Error::Config(_))));
        assert!(ValidatorConfig::default().build().is_ok());
    }
}
