//! Container format for encrypted files.
//!
//! Provides version-aware parsing and serialization of `.enc` containers and
//! the seal/open operations that bind the header to the ciphertext.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::biometric::HelperPair;
use crate::crypto::{self, DerivedKey, KdfParams, NONCE_LEN, SALT_LEN};
use crate::error::{Error, Result};

pub mod v1;

/// Magic bytes identifying a biolock container ("BIOL").
pub const MAGIC: &[u8; 4] = b"BIOL";
/// Length of magic bytes.
pub const MAGIC_LEN: usize = 4;
/// Length of version field.
pub const VER_LEN: usize = 1;
/// Latest format version
pub const CURRENT_VERSION: u8 = v1::VERSION_V1;
/// Largest metadata block accepted by the parser.
pub const MAX_METADATA_LEN: usize = 64 * 1024;

const IDENTITY_DOMAIN: &[u8] = b"biolock/attempt-identity";

/// Non-secret description of the protected file, stored in clear and
/// authenticated as associated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub file_name: Option<String>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl ContainerMetadata {
    pub fn new(file_name: Option<String>, size: u64) -> Self {
        Self {
            file_name,
            size,
            created_at: Utc::now(),
        }
    }
}

/// A parsed container with all components.
#[derive(Debug, Clone)]
pub struct Container {
    version: u8,
    kdf: KdfParams,
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
    helpers: HelperPair,
    metadata: ContainerMetadata,
    raw_metadata: Vec<u8>,
    ciphertext: Vec<u8>,
}

/// Fields shared by every version's header.
pub(crate) struct Header {
    pub kdf: KdfParams,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub helpers: HelperPair,
}

impl Container {
    pub(crate) fn from_parts(
        version: u8,
        header: Header,
        raw_metadata: Vec<u8>,
        ciphertext: Vec<u8>,
    ) -> Result<Self> {
        let metadata = serde_json::from_slice(&raw_metadata)
            .map_err(|e| Error::CorruptContainer(format!("invalid metadata: {e}")))?;
        let Header {
            kdf,
            salt,
            nonce,
            helpers,
        } = header;
        Ok(Self {
            version,
            kdf,
            salt,
            nonce,
            helpers,
            metadata,
            raw_metadata,
            ciphertext,
        })
    }

    /// Encrypt `plaintext` into a new container of the current version.
    pub fn seal(
        key: &DerivedKey,
        kdf: KdfParams,
        salt: [u8; SALT_LEN],
        helpers: HelperPair,
        metadata: ContainerMetadata,
        plaintext: &[u8],
    ) -> Result<Self> {
        let raw_metadata = serde_json::to_vec(&metadata)
            .map_err(|e| Error::Crypto(format!("cannot encode metadata: {e}")))?;
        if raw_metadata.len() > MAX_METADATA_LEN {
            return Err(Error::Crypto("metadata too large".into()));
        }

        let aad = associated_data(CURRENT_VERSION, &kdf, &salt, &helpers, &raw_metadata)?;
        let (ciphertext, nonce) = crypto::encrypt(key, &aad, plaintext)?;

        Ok(Self {
            version: CURRENT_VERSION,
            kdf,
            salt,
            nonce,
            helpers,
            metadata,
            raw_metadata,
            ciphertext,
        })
    }

    /// Decrypt the payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessDenied`] on a wrong key or any modification of
    /// the authenticated header, metadata or ciphertext.
    pub fn open(&self, key: &DerivedKey) -> Result<Zeroizing<Vec<u8>>> {
        let aad = associated_data(
            self.version,
            &self.kdf,
            &self.salt,
            &self.helpers,
            &self.raw_metadata,
        )?;
        crypto::decrypt(key, &self.nonce, &aad, &self.ciphertext)
    }

    /// Returns the file format version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the KDF parameters used for key derivation.
    pub fn kdf(&self) -> &KdfParams {
        &self.kdf
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// Quantization helper data recorded at registration.
    pub fn helpers(&self) -> &HelperPair {
        &self.helpers
    }

    pub fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    pub(crate) fn raw_metadata(&self) -> &[u8] {
        &self.raw_metadata
    }

    /// Returns the encrypted payload including the authentication tag.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Attempt-limiter key of this container: a hash of its salt and nonce.
    ///
    /// Altering either field yields a new key, but also a container that can
    /// no longer be opened by anyone.
    pub fn identity_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(IDENTITY_DOMAIN);
        hasher.update(self.salt);
        hasher.update(self.nonce);
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    pub fn info(&self) -> ContainerInfo {
        ContainerInfo {
            version: self.version,
            mem_cost_kib: self.kdf.mem_cost_kib(),
            time_cost: self.kdf.time_cost(),
            parallelism: self.kdf.parallelism(),
            file_name: self.metadata.file_name.clone(),
            size: self.metadata.size,
            created_at: self.metadata.created_at,
            ciphertext_len: self.ciphertext.len(),
        }
    }
}

/// Header summary shown by `inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub version: u8,
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
    pub file_name: Option<String>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub ciphertext_len: usize,
}

fn associated_data(
    version: u8,
    kdf: &KdfParams,
    salt: &[u8; SALT_LEN],
    helpers: &HelperPair,
    raw_metadata: &[u8],
) -> Result<Vec<u8>> {
    match version {
        v1::VERSION_V1 => Ok(v1::associated_data(kdf, salt, helpers, raw_metadata)),
        _ => Err(Error::CorruptContainer(format!("unsupported version {version}"))),
    }
}

/// Parses a container and dispatches to the matching version parser.
///
/// # Errors
///
/// Returns [`Error::CorruptContainer`] if:
/// - The data is too short
/// - The magic bytes are invalid
/// - The version is unsupported
/// - The version parser rejects the layout
pub fn parse(data: &[u8]) -> Result<Container> {
    if data.len() < MAGIC_LEN + VER_LEN {
        return Err(Error::CorruptContainer("file too short".into()));
    }

    if &data[..MAGIC_LEN] != MAGIC {
        return Err(Error::CorruptContainer("invalid magic".into()));
    }

    let version = data[MAGIC_LEN];

    match version {
        v1::VERSION_V1 => v1::parse(data),
        _ => Err(Error::CorruptContainer(format!("unsupported version {version}"))),
    }
}

/// Serializes a container to bytes.
pub fn serialize(container: &Container) -> Result<Vec<u8>> {
    match container.version() {
        v1::VERSION_V1 => v1::serialize(container),
        version => Err(Error::CorruptContainer(format!("unsupported version {version}"))),
    }
}
