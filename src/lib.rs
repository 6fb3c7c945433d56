pub mod biometric;
pub mod config;
pub mod crypto;
pub mod error;
pub mod format;
pub mod limiter;
pub mod pool;
pub mod storage;
pub mod watermark;

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub use crate::biometric::{BiometricSample, Descriptor, FeatureExtractor, Modality, Validator};
pub use crate::config::Settings;
pub use crate::crypto::{IdentityFingerprint, KdfParams};
pub use crate::error::{Error, Result};
pub use crate::format::{Container, ContainerInfo, ContainerMetadata};
pub use crate::limiter::{AttemptLimiter, AttemptState, FileAttemptStore, SystemClock};
pub use crate::storage::Storage;

use crate::biometric::quantize;
use crate::config::LimitsConfig;
use crate::crypto::derive_key;
use crate::pool::ExtractionPool;

/// Inputs of a registration. Images are raw encoded bytes (PNG, JPEG, ...).
#[derive(Debug, Clone, Copy)]
pub struct RegisterRequest<'a> {
    pub file: &'a [u8],
    pub file_name: Option<&'a str>,
    pub iris: &'a [u8],
    pub fingerprint: &'a [u8],
}

#[derive(Debug)]
pub struct RegisterOutput {
    /// Serialized container
    pub container: Vec<u8>,
    /// PNG preview; `None` when rendering failed
    pub watermark: Option<Vec<u8>>,
    pub identity: IdentityFingerprint,
    pub metadata: ContainerMetadata,
}

#[derive(Debug)]
pub struct AccessOutput {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub metadata: ContainerMetadata,
    pub identity: IdentityFingerprint,
}

impl AccessOutput {
    /// Name for the decrypted file: `decrypted_` plus the recorded name, or
    /// plus the container name without its `.enc` suffix when none was
    /// recorded.
    pub fn output_name(&self, container_name: &str) -> String {
        let name = match self.metadata.file_name.as_deref().and_then(base_name) {
            Some(name) => name,
            None => container_name
                .strip_suffix(".enc")
                .unwrap_or(container_name)
                .to_string(),
        };
        format!("decrypted_{name}")
    }
}

/// Final path component of `name`, if it has one.
fn base_name(name: &str) -> Option<String> {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
}

/// Registration and access of biometric-bound containers.
///
/// `Engine` is `Send + Sync`; concurrent requests share only the attempt
/// limiter and the extraction pool.
pub struct Engine {
    extractor: FeatureExtractor,
    validator: Validator,
    limiter: AttemptLimiter,
    pool: ExtractionPool,
    kdf: KdfParams,
    limits: LimitsConfig,
}

impl Engine {
    /// Engine with an in-memory attempt limiter.
    pub fn new(settings: &Settings) -> Result<Self> {
        let limiter = AttemptLimiter::in_memory(settings.limiter.policy());
        Self::with_limiter(settings, limiter)
    }

    pub fn with_limiter(settings: &Settings, limiter: AttemptLimiter) -> Result<Self> {
        let validator = settings.validator.build()?;
        Self::with_components(settings, validator, limiter)
    }

    pub fn with_components(
        settings: &Settings,
        validator: Validator,
        limiter: AttemptLimiter,
    ) -> Result<Self> {
        settings.validate()?;
        let pool = ExtractionPool::new(settings.pool.workers, settings.pool.max_in_flight)?;
        debug!(
            workers = pool.workers(),
            max_in_flight = pool.capacity(),
            "engine ready"
        );
        Ok(Self {
            extractor: settings.extractor.extractor(),
            validator,
            limiter,
            pool,
            kdf: settings.kdf,
            limits: settings.limits.clone(),
        })
    }

    pub fn limiter(&self) -> &AttemptLimiter {
        &self.limiter
    }

    fn extract_pair(&self, iris: &[u8], fingerprint: &[u8]) -> Result<(Descriptor, Descriptor)> {
        let extractor = self.extractor;
        let (iris, fingerprint) = self.pool.join(
            || extractor.extract(&BiometricSample::iris(iris)),
            || extractor.extract(&BiometricSample::fingerprint(fingerprint)),
        );
        Ok((iris?, fingerprint?))
    }

    /// Seal a file under the key derived from an iris and a fingerprint capture.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`] when too many requests are in flight
    /// - [`Error::FileTooLarge`] / [`Error::UnsupportedFileType`] from the upload limits
    /// - [`Error::InvalidImage`] if a capture cannot be decoded
    /// - [`Error::InvalidBiometric`] if the validator rejects either capture
    pub fn register(&self, request: RegisterRequest<'_>) -> Result<RegisterOutput> {
        let _permit = self.pool.try_acquire()?;
        self.limits
            .check(request.file_name, request.file.len() as u64)?;

        let (iris, fingerprint) = self.extract_pair(request.iris, request.fingerprint)?;
        self.validator.check_pair(&iris, &fingerprint)?;
        let (iris, fingerprint, helpers) = quantize::enroll_pair(&iris, &fingerprint)?;

        let salt = crypto::generate_salt()?;
        let kdf = self.kdf;
        let material = self
            .pool
            .install(|| derive_key(&iris, &fingerprint, &salt, kdf))?;

        let metadata = ContainerMetadata::new(
            request.file_name.and_then(base_name),
            request.file.len() as u64,
        );
        let container = Container::seal(
            material.key(),
            kdf,
            salt,
            helpers,
            metadata.clone(),
            request.file,
        )?;
        let bytes = format::serialize(&container)?;

        let watermark = match watermark::render(&iris, &fingerprint) {
            Ok(png) => Some(png),
            Err(e) => {
                warn!(error = %e, "watermark rendering failed");
                None
            }
        };

        info!(
            identity = %material.identity(),
            size = request.file.len(),
            container_len = bytes.len(),
            "file registered"
        );

        Ok(RegisterOutput {
            container: bytes,
            watermark,
            identity: material.identity(),
            metadata,
        })
    }

    /// Open a container with an iris and a fingerprint capture.
    ///
    /// Validator rejections and wrong keys both count against the container's
    /// attempt budget; undecodable captures do not.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`] when too many requests are in flight
    /// - [`Error::CorruptContainer`] if the container cannot be parsed
    /// - [`Error::RateLimited`] while the container is locked
    /// - [`Error::InvalidImage`] if a capture cannot be decoded
    /// - [`Error::InvalidBiometric`] or [`Error::AccessDenied`] on a failed attempt
    pub fn access(&self, container: &[u8], iris: &[u8], fingerprint: &[u8]) -> Result<AccessOutput> {
        let _permit = self.pool.try_acquire()?;
        let container = format::parse(container)?;
        let attempt_key = container.identity_key();
        self.limiter.check_allowed(&attempt_key)?;

        let (iris, fingerprint) = self.extract_pair(iris, fingerprint)?;
        let verdict = self.validator.check_pair(&iris, &fingerprint);

        // derivation and decryption both run after a rejection too
        let (iris, fingerprint) =
            quantize::reproduce_pair(&iris, &fingerprint, container.helpers())?;
        let kdf = *container.kdf();
        let material = self
            .pool
            .install(|| derive_key(&iris, &fingerprint, container.salt(), kdf))?;
        let opened = container.open(material.key());

        match verdict.and(opened) {
            Ok(plaintext) => {
                self.limiter.record_success(&attempt_key)?;
                info!(identity = %material.identity(), size = plaintext.len(), "access granted");
                Ok(AccessOutput {
                    plaintext,
                    metadata: container.metadata().clone(),
                    identity: material.identity(),
                })
            }
            Err(e) if e.is_recorded_failure() => {
                let state = self.limiter.record_failure(&attempt_key)?;
                warn!(state = ?state, "access failed");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Non-secret summary of a container header.
    pub fn inspect(&self, container: &[u8]) -> Result<ContainerInfo> {
        Ok(format::parse(container)?.info())
    }

    /// Limiter state of a serialized container.
    pub fn attempt_state(&self, container: &[u8]) -> Result<AttemptState> {
        let container = format::parse(container)?;
        self.limiter.state(&container.identity_key())
    }
}

/// Attempt limiter persisted in the JSON ledger at `storage`, with the store
/// itself for listing its records.
pub fn file_limiter(
    settings: &Settings,
    storage: Storage,
) -> Result<(AttemptLimiter, Arc<FileAttemptStore>)> {
    let store = Arc::new(FileAttemptStore::open(storage)?);
    let limiter = AttemptLimiter::new(
        store.clone(),
        Arc::new(SystemClock),
        settings.limiter.policy(),
    );
    Ok((limiter, store))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::biometric::testutil::{blank_png, jpeg, noisy, png, ridge_image, shifted, subject_png};
    use crate::limiter::testutil::ManualClock;
    use crate::limiter::{LimiterPolicy, MemoryAttemptStore};

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.kdf = KdfParams::new(1024, 1, 1).unwrap();
        settings.pool.workers = 2;
        settings
    }

    fn engine(max_attempts: u32) -> (Engine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = AttemptLimiter::new(
            Arc::new(MemoryAttemptStore::default()),
            clock.clone(),
            LimiterPolicy {
                max_attempts,
                ..LimiterPolicy::default()
            },
        );
        (Engine::with_limiter(&settings(), limiter).unwrap(), clock)
    }

    fn register(engine: &Engine, file: &[u8], iris: u32, fingerprint: u32) -> RegisterOutput {
        engine
            .register(RegisterRequest {
                file,
                file_name: Some("notes.txt"),
                iris: &subject_png(iris),
                fingerprint: &subject_png(fingerprint),
            })
            .unwrap()
    }

    fn access(engine: &Engine, container: &[u8], iris: u32, fingerprint: u32) -> Result<AccessOutput> {
        engine.access(container, &subject_png(iris), &subject_png(fingerprint))
    }

    #[test]
    fn hello_world_roundtrip() {
        let (engine, _) = engine(5);
        let registered = register(&engine, b"hello world", 1, 2);
        assert!(registered.watermark.is_some());

        let opened = access(&engine, &registered.container, 1, 2).unwrap();
        assert_eq!(opened.plaintext.as_slice(), b"hello world");
        assert_eq!(opened.metadata.file_name.as_deref(), Some("notes.txt"));
        assert_eq!(opened.metadata.size, 11);
        assert_eq!(opened.identity, registered.identity);
        assert_eq!(opened.output_name("notes.txt.enc"), "decrypted_notes.txt");
    }

    #[test]
    fn different_captures_are_denied() {
        let (engine, _) = engine(100);
        let registered = register(&engine, b"hello world", 1, 2);

        for (iris, fingerprint) in [(1, 3), (4, 2), (5, 6), (2, 1)] {
            assert!(
                matches!(
                    access(&engine, &registered.container, iris, fingerprint),
                    Err(Error::AccessDenied)
                ),
                "subjects ({iris}, {fingerprint}) opened the container"
            );
        }
        assert_eq!(
            engine.attempt_state(&registered.container).unwrap(),
            AttemptState::Warned { failures: 4 }
        );
    }

    #[test]
    fn tampering_anywhere_is_detected() {
        let (engine, _) = engine(10_000);
        let registered = register(&engine, b"hello world", 1, 2);

        for i in 0..registered.container.len() {
            let mut tampered = registered.container.clone();
            tampered[i] ^= 0x01;
            let outcome = access(&engine, &tampered, 1, 2);
            assert!(
                matches!(outcome, Err(Error::AccessDenied) | Err(Error::CorruptContainer(_))),
                "flip at byte {i} gave {outcome:?}"
            );
        }
    }

    #[test]
    fn lockout_then_recovery_after_cooldown() {
        let (engine, clock) = engine(3);
        let registered = register(&engine, b"hello world", 1, 2);

        for _ in 0..3 {
            assert!(matches!(
                access(&engine, &registered.container, 1, 3),
                Err(Error::AccessDenied)
            ));
        }

        // correct captures are refused while locked
        match access(&engine, &registered.container, 1, 2) {
            Err(Error::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(300))
            }
            other => panic!("expected RateLimited, got: {other:?}"),
        }

        clock.advance(300);
        assert!(access(&engine, &registered.container, 1, 2).is_ok());
        assert_eq!(
            engine.attempt_state(&registered.container).unwrap(),
            AttemptState::Clean
        );
    }

    #[test]
    fn containers_are_limited_independently() {
        let (engine, _) = engine(1);
        let a = register(&engine, b"a", 1, 2);
        let b = register(&engine, b"b", 1, 2);

        assert!(access(&engine, &a.container, 3, 4).is_err());
        assert!(matches!(
            access(&engine, &a.container, 1, 2),
            Err(Error::RateLimited { .. })
        ));
        assert!(access(&engine, &b.container, 1, 2).is_ok());
    }

    #[test]
    fn registering_twice_gives_distinct_containers() {
        let (engine, _) = engine(5);
        let first = register(&engine, b"same input", 1, 2);
        let second = register(&engine, b"same input", 1, 2);

        assert_ne!(first.container, second.container);
        assert_ne!(first.identity, second.identity);
        let a = access(&engine, &first.container, 1, 2).unwrap();
        let b = access(&engine, &second.container, 1, 2).unwrap();
        assert_eq!(a.plaintext.as_slice(), b.plaintext.as_slice());
    }

    #[test]
    fn undecodable_capture_is_not_counted() {
        let (engine, _) = engine(1);
        let registered = register(&engine, b"hello world", 1, 2);

        let outcome = engine.access(&registered.container, b"not an image", &subject_png(2));
        assert!(matches!(outcome, Err(Error::InvalidImage(_))));
        assert_eq!(
            engine.attempt_state(&registered.container).unwrap(),
            AttemptState::Clean
        );
        assert!(access(&engine, &registered.container, 1, 2).is_ok());
    }

    #[test]
    fn rejected_capture_is_counted_and_looks_like_denial() {
        let (engine, _) = engine(5);
        let registered = register(&engine, b"hello world", 1, 2);

        let outcome = engine.access(&registered.container, &blank_png(128, 128), &subject_png(2));
        match outcome {
            Err(e @ Error::InvalidBiometric { .. }) => {
                assert_eq!(e.to_string(), Error::AccessDenied.to_string())
            }
            other => panic!("expected InvalidBiometric, got: {other:?}"),
        }
        assert_eq!(
            engine.attempt_state(&registered.container).unwrap(),
            AttemptState::Warned { failures: 1 }
        );
    }

    #[test]
    fn register_rejects_implausible_capture() {
        let (engine, _) = engine(5);
        let outcome = engine.register(RegisterRequest {
            file: b"x",
            file_name: None,
            iris: &subject_png(1),
            fingerprint: &blank_png(128, 200),
        });
        assert!(matches!(
            outcome,
            Err(Error::InvalidBiometric {
                modality: Modality::Fingerprint,
                ..
            })
        ));
    }

    #[test]
    fn register_enforces_limits() {
        let mut settings = settings();
        settings.limits.max_file_size = 4;
        let engine = Engine::new(&settings).unwrap();
        let (iris, fingerprint) = (subject_png(1), subject_png(2));

        let too_large = engine.register(RegisterRequest {
            file: b"12345",
            file_name: Some("a.txt"),
            iris: &iris,
            fingerprint: &fingerprint,
        });
        assert!(matches!(too_large, Err(Error::FileTooLarge { size: 5, max: 4 })));

        let wrong_type = engine.register(RegisterRequest {
            file: b"1",
            file_name: Some("a.exe"),
            iris: &iris,
            fingerprint: &fingerprint,
        });
        assert!(matches!(wrong_type, Err(Error::UnsupportedFileType(_))));
    }

    #[test]
    fn stored_file_name_is_reduced_to_base_name() {
        let (engine, _) = engine(5);
        let registered = engine
            .register(RegisterRequest {
                file: b"x",
                file_name: Some("../../etc/notes.txt"),
                iris: &subject_png(1),
                fingerprint: &subject_png(2),
            })
            .unwrap();
        assert_eq!(registered.metadata.file_name.as_deref(), Some("notes.txt"));
    }

    #[test]
    fn output_name_falls_back_to_container_name() {
        let (engine, _) = engine(5);
        let registered = engine
            .register(RegisterRequest {
                file: b"x",
                file_name: None,
                iris: &subject_png(1),
                fingerprint: &subject_png(2),
            })
            .unwrap();
        let opened = access(&engine, &registered.container, 1, 2).unwrap();
        assert_eq!(opened.output_name("report.enc"), "decrypted_report");
    }

    #[test]
    fn saturated_engine_is_busy() {
        let mut settings = settings();
        settings.pool.max_in_flight = 1;
        let engine = Engine::new(&settings).unwrap();

        let _held = engine.pool.try_acquire().unwrap();
        let outcome = engine.register(RegisterRequest {
            file: b"x",
            file_name: None,
            iris: &subject_png(1),
            fingerprint: &subject_png(2),
        });
        assert!(matches!(outcome, Err(Error::Busy)));
    }

    #[test]
    fn concurrent_access_succeeds() {
        let (engine, _) = engine(5);
        let registered = register(&engine, b"shared", 1, 2);

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| access(&engine, &registered.container, 1, 2)))
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap().unwrap().plaintext.as_slice(), b"shared");
            }
        });
    }

    #[test]
    fn inspect_reads_header_without_captures() {
        let (engine, _) = engine(5);
        let registered = register(&engine, b"hello world", 1, 2);

        let info = engine.inspect(&registered.container).unwrap();
        assert_eq!(info.version, format::CURRENT_VERSION);
        assert_eq!(info.mem_cost_kib, 1024);
        assert_eq!(info.file_name.as_deref(), Some("notes.txt"));
        assert_eq!(info.size, 11);

        assert!(matches!(
            engine.inspect(b"garbage"),
            Err(Error::CorruptContainer(_))
        ));
    }

    #[test]
    fn file_limiter_survives_engine_restart() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Storage::new(dir.path().join("attempts.json"));
        let mut settings = settings();
        settings.limiter.max_attempts = 2;

        let (limiter, _) = file_limiter(&settings, ledger.clone()).unwrap();
        let engine = Engine::with_limiter(&settings, limiter).unwrap();
        let registered = register(&engine, b"hello world", 1, 2);
        assert!(access(&engine, &registered.container, 1, 3).is_err());
        assert!(access(&engine, &registered.container, 1, 3).is_err());
        drop(engine);

        let (limiter, store) = file_limiter(&settings, ledger).unwrap();
        assert_eq!(store.snapshot().len(), 1);
        let restarted = Engine::with_limiter(&settings, limiter).unwrap();
        assert!(matches!(
            access(&restarted, &registered.container, 1, 2),
            Err(Error::RateLimited { .. })
        ));
    }

    fn register_images(engine: &Engine, iris: &[u8], fingerprint: &[u8]) -> RegisterOutput {
        engine
            .register(RegisterRequest {
                file: b"hello world",
                file_name: Some("notes.txt"),
                iris,
                fingerprint,
            })
            .unwrap()
    }

    #[test]
    fn genuine_recaptures_open_and_other_subjects_are_denied() {
        let (engine, _) = engine(1000);
        let subjects: Vec<_> = (0..8)
            .map(|s| (ridge_image(s, 128), ridge_image(s + 10, 128)))
            .collect();
        let containers: Vec<_> = subjects
            .iter()
            .map(|(iris, fp)| register_images(&engine, &png(iris), &png(fp)).container)
            .collect();

        let mut genuine = 0;
        for (s, ((iris, fp), container)) in subjects.iter().zip(&containers).enumerate() {
            let seed = s as u64 * 2 + 1;
            let recaptures = [
                ("noise", png(&noisy(iris, seed, 2)), png(&noisy(fp, seed + 1, 2))),
                ("noise again", png(&noisy(iris, seed + 40, 2)), png(&noisy(fp, seed + 41, 2))),
                ("shift x", png(&shifted(iris, 1, 0)), png(&shifted(fp, 1, 0))),
                ("shift y", png(&shifted(iris, 0, 1)), png(&shifted(fp, 0, -1))),
                ("jpeg", jpeg(iris, 95), jpeg(fp, 95)),
            ];
            for (name, iris, fp) in recaptures {
                let opened = engine.access(container, &iris, &fp);
                assert!(opened.is_ok(), "subject {s}, {name}: {opened:?}");
                genuine += 1;
            }
        }
        assert_eq!(genuine, 40);

        let mut impostors = 0;
        for (s, container) in containers.iter().enumerate() {
            for (t, (iris, fp)) in subjects.iter().enumerate() {
                if s == t {
                    continue;
                }
                let outcome = engine.access(container, &png(iris), &png(fp));
                assert!(
                    matches!(outcome, Err(Error::AccessDenied)),
                    "subject {t} opened container of subject {s}"
                );
                impostors += 1;
            }
            // genuine iris, someone else's fingerprint
            let (iris, _) = &subjects[s];
            let (_, other_fp) = &subjects[(s + 1) % subjects.len()];
            assert!(matches!(
                engine.access(container, &png(iris), &png(other_fp)),
                Err(Error::AccessDenied)
            ));
        }
        assert_eq!(impostors, 56);
    }

    #[test]
    fn rejection_costs_as_much_as_denial() {
        let (engine, _) = engine(1000);
        let file = vec![7u8; 8 * 1024 * 1024];
        let registered = engine
            .register(RegisterRequest {
                file: &file,
                file_name: Some("large.bin"),
                iris: &subject_png(1),
                fingerprint: &subject_png(2),
            })
            .unwrap();

        let fastest = |iris: &[u8], fp: &[u8]| {
            (0..3)
                .map(|_| {
                    let started = std::time::Instant::now();
                    assert!(engine.access(&registered.container, iris, fp).is_err());
                    started.elapsed()
                })
                .min()
                .unwrap()
        };
        let denied = fastest(&subject_png(1), &subject_png(3));
        let rejected = fastest(&blank_png(128, 128), &subject_png(2));

        // a skipped decryption of 8 MiB would show as a large gap
        assert!(
            rejected * 2 >= denied,
            "rejected in {rejected:?}, denied in {denied:?}"
        );
    }

    #[test]
    fn forged_nonces_do_not_grow_the_limiter_without_bound() {
        let store = Arc::new(MemoryAttemptStore::default());
        let limiter = AttemptLimiter::new(
            store.clone(),
            Arc::new(ManualClock::new()),
            LimiterPolicy {
                max_records: 16,
                ..LimiterPolicy::default()
            },
        );
        let engine = Engine::with_limiter(&settings(), limiter).unwrap();
        let registered = register(&engine, b"hello world", 1, 2);

        let nonce_at = format::MAGIC_LEN + format::VER_LEN + 12 + crypto::SALT_LEN;
        for i in 0..50 {
            let mut forged = registered.container.clone();
            forged[nonce_at + i % crypto::NONCE_LEN] ^= 1 + (i / crypto::NONCE_LEN) as u8;
            assert!(matches!(
                access(&engine, &forged, 1, 2),
                Err(Error::AccessDenied)
            ));
            assert!(store.len() <= 16, "{} records after {i} forgeries", store.len());
        }
        assert!(access(&engine, &registered.container, 1, 2).is_ok());
    }
}
