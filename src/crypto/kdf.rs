//! Biometric key derivation.
//!
//! ```text
//! iris cells, fingerprint cells --SHA-256--> extracted secret
//!   --Argon2id(salt, params)--> stretched secret
//!     --HKDF-SHA256 "biolock/file-key"--> file key (256-bit)
//!     --HKDF-SHA256 "biolock/identity"--> identity fingerprint (128-bit)
//! ```

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use super::{IDENTITY_LEN, KEY_LEN};
use crate::biometric::{Modality, QuantizedDescriptor};
use crate::error::{Error, Result};

const EXTRACT_DOMAIN: &[u8] = b"biolock/v1/quantized-pair";
const FILE_KEY_INFO: &[u8] = b"biolock/file-key";
const IDENTITY_INFO: &[u8] = b"biolock/identity";

/// Largest Argon2 parameters accepted from config or from a container header.
pub const MAX_MEM_COST_KIB: u32 = 1024 * 1024;
pub const MAX_TIME_COST: u32 = 16;
pub const MAX_PARALLELISM: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    mem_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            // default memory cost
            mem_cost_kib: 64 * 1024, // 64 MiB
            // default number of iterations
            time_cost: 3,
            // default number of lanes
            parallelism: 1,
        }
    }
}

impl KdfParams {
    pub fn new(mem_cost_kib: u32, time_cost: u32, parallelism: u32) -> Result<Self> {
        let params = Self {
            mem_cost_kib,
            time_cost,
            parallelism,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn mem_cost_kib(&self) -> u32 {
        self.mem_cost_kib
    }

    pub fn time_cost(&self) -> u32 {
        self.time_cost
    }

    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));
        if self.mem_cost_kib < 8 {
            return fail("argon2 memory cost too low");
        }
        if self.time_cost < 1 {
            return fail("argon2 time cost must be >= 1");
        }
        if self.parallelism < 1 {
            return fail("argon2 parallelism must be >= 1");
        }
        if self.mem_cost_kib < 8 * self.parallelism {
            return fail("argon2 memory cost must be at least 8 * parallelism");
        }
        if self.mem_cost_kib > MAX_MEM_COST_KIB
            || self.time_cost > MAX_TIME_COST
            || self.parallelism > MAX_PARALLELISM
        {
            return fail("argon2 parameters exceed supported maximum");
        }
        Ok(())
    }
}

/// A 256-bit file key. Zeroized on drop.
pub struct DerivedKey {
    bytes: [u8; KEY_LEN],
}

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// One-way identifier of a descriptor pair under a given salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityFingerprint([u8; IDENTITY_LEN]);

impl IdentityFingerprint {
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for IdentityFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug)]
pub struct KeyMaterial {
    key: DerivedKey,
    identity: IdentityFingerprint,
}

impl KeyMaterial {
    pub fn key(&self) -> &DerivedKey {
        &self.key
    }

    pub fn identity(&self) -> IdentityFingerprint {
        self.identity
    }
}

/// Derive the file key and identity fingerprint from an iris and a
/// fingerprint descriptor, both quantized.
///
/// The argument order is fixed: passing the descriptors swapped is an error
/// rather than a different key.
pub fn derive_key(
    iris: &QuantizedDescriptor,
    fingerprint: &QuantizedDescriptor,
    salt: &[u8],
    kdf: KdfParams,
) -> Result<KeyMaterial> {
    if iris.modality() != Modality::Iris || fingerprint.modality() != Modality::Fingerprint {
        return Err(Error::Crypto(
            "key derivation expects an iris and a fingerprint descriptor".into(),
        ));
    }
    kdf.validate()?;

    let mut extractor = Sha256::new();
    extractor.update(EXTRACT_DOMAIN);
    for descriptor in [iris, fingerprint] {
        let material = Zeroizing::new(descriptor.key_material());
        extractor.update([material.len() as u8]);
        extractor.update(&material[..]);
    }
    let mut extracted = Zeroizing::new([0u8; KEY_LEN]);
    extracted.copy_from_slice(&extractor.finalize());

    let params = Params::new(
        kdf.mem_cost_kib,
        kdf.time_cost,
        kdf.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| Error::Crypto(format!("failed to construct Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut stretched = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(&extracted[..], salt, &mut stretched[..])
        .map_err(|e| Error::Crypto(format!("argon2 key derivation failed: {e}")))?;

    let hkdf = Hkdf::<Sha256>::new(None, &stretched[..]);

    let mut key = [0u8; KEY_LEN];
    hkdf.expand(FILE_KEY_INFO, &mut key)
        .map_err(|e| Error::Crypto(format!("HKDF expand failed: {e}")))?;
    let key = DerivedKey::from_bytes(key);

    let mut identity = [0u8; IDENTITY_LEN];
    hkdf.expand(IDENTITY_INFO, &mut identity)
        .map_err(|e| Error::Crypto(format!("HKDF expand failed: {e}")))?;

    Ok(KeyMaterial {
        key,
        identity: IdentityFingerprint(identity),
    })
}
