//! Container format v1.
//!
//! V1 layout (integers little-endian):
//! ```text
//! MAGIC (4) | VERSION (1) | MEM_COST (4) | TIME_COST (4) | PARALLELISM (4) | SALT (16) | NONCE (24)
//! | IRIS_HELPER (63) | FINGERPRINT_HELPER (63) | META_LEN (4) | META (JSON) | CIPHERTEXT | TAG (16)
//! ```
//!
//! Associated data is every field except the nonce and the ciphertext.

use super::{Container, Header, MAGIC, MAX_METADATA_LEN};
use crate::{
    biometric::{HelperData, HelperPair, quantize::HELPER_LEN},
    crypto::{KdfParams, NONCE_LEN, SALT_LEN, TAG_LEN},
    error::{Error, Result},
    format::{MAGIC_LEN, VER_LEN},
};

/// Current file format version.
pub const VERSION_V1: u8 = 1;

const MEM_LEN: usize = 4;
const TIME_LEN: usize = 4;
const PAR_LEN: usize = 4;
const META_LEN_LEN: usize = 4;

/// Size of the fixed part of the header.
pub const HEADER_LEN: usize = MAGIC_LEN
    + VER_LEN
    + MEM_LEN
    + TIME_LEN
    + PAR_LEN
    + SALT_LEN
    + NONCE_LEN
    + 2 * HELPER_LEN
    + META_LEN_LEN;

fn corrupt(msg: &str) -> Error {
    Error::CorruptContainer(msg.to_string())
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    let bytes: [u8; 4] = data[*offset..*offset + 4]
        .try_into()
        .map_err(|_| corrupt("truncated integer field"))?;
    *offset += 4;
    Ok(u32::from_le_bytes(bytes))
}

fn read_helper(data: &[u8], offset: &mut usize) -> Result<HelperData> {
    let bytes: [u8; HELPER_LEN] = data[*offset..*offset + HELPER_LEN]
        .try_into()
        .map_err(|_| corrupt("invalid helper data length"))?;
    *offset += HELPER_LEN;
    Ok(HelperData::from_bytes(bytes))
}

/// Parses a v1 container.
///
/// # Errors
///
/// Returns [`Error::CorruptContainer`] if the data is too short, the KDF
/// parameters are out of range or the metadata block is malformed.
pub fn parse(data: &[u8]) -> Result<Container> {
    if data.len() < HEADER_LEN {
        return Err(corrupt("file too short for v1"));
    }

    let mut offset = MAGIC_LEN + VER_LEN;

    let mem_cost = read_u32(data, &mut offset)?;
    let time_cost = read_u32(data, &mut offset)?;
    let parallelism = read_u32(data, &mut offset)?;

    let salt: [u8; SALT_LEN] = data[offset..offset + SALT_LEN]
        .try_into()
        .map_err(|_| corrupt("invalid salt length"))?;
    offset += SALT_LEN;

    let nonce: [u8; NONCE_LEN] = data[offset..offset + NONCE_LEN]
        .try_into()
        .map_err(|_| corrupt("invalid nonce length"))?;
    offset += NONCE_LEN;

    let helpers = HelperPair {
        iris: read_helper(data, &mut offset)?,
        fingerprint: read_helper(data, &mut offset)?,
    };

    let meta_len = read_u32(data, &mut offset)? as usize;
    if meta_len > MAX_METADATA_LEN {
        return Err(corrupt("metadata block too large"));
    }
    if data.len() < offset + meta_len + TAG_LEN {
        return Err(corrupt("file too short for declared metadata"));
    }

    let raw_metadata = data[offset..offset + meta_len].to_vec();
    offset += meta_len;

    let ciphertext = data[offset..].to_vec();

    let kdf = KdfParams::new(mem_cost, time_cost, parallelism)
        .map_err(|e| Error::CorruptContainer(format!("invalid KDF parameters: {e}")))?;

    let header = Header {
        kdf,
        salt,
        nonce,
        helpers,
    };
    Container::from_parts(VERSION_V1, header, raw_metadata, ciphertext)
}

/// Associated data bound to the ciphertext.
pub fn associated_data(
    kdf: &KdfParams,
    salt: &[u8; SALT_LEN],
    helpers: &HelperPair,
    raw_metadata: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN - NONCE_LEN + raw_metadata.len());

    buf.extend_from_slice(MAGIC);
    buf.push(VERSION_V1);

    buf.extend_from_slice(&kdf.mem_cost_kib().to_le_bytes());
    buf.extend_from_slice(&kdf.time_cost().to_le_bytes());
    buf.extend_from_slice(&kdf.parallelism().to_le_bytes());

    buf.extend_from_slice(salt);
    buf.extend_from_slice(helpers.iris.as_bytes());
    buf.extend_from_slice(helpers.fingerprint.as_bytes());
    buf.extend_from_slice(&(raw_metadata.len() as u32).to_le_bytes());
    buf.extend_from_slice(raw_metadata);

    buf
}

/// Serializes a container to v1 bytes.
///
/// # Errors
///
/// Returns an error if the container is not v1 or its metadata is too large.
pub fn serialize(container: &Container) -> Result<Vec<u8>> {
    if container.version() != VERSION_V1 {
        return Err(Error::CorruptContainer("wrong version for v1 serializer".into()));
    }

    let raw_metadata = container.raw_metadata();
    if raw_metadata.len() > MAX_METADATA_LEN {
        return Err(corrupt("metadata block too large"));
    }

    let mut buf =
        Vec::with_capacity(HEADER_LEN + raw_metadata.len() + container.ciphertext().len());

    buf.extend_from_slice(MAGIC);
    buf.push(VERSION_V1);

    buf.extend_from_slice(&container.kdf().mem_cost_kib().to_le_bytes());
    buf.extend_from_slice(&container.kdf().time_cost().to_le_bytes());
    buf.extend_from_slice(&container.kdf().parallelism().to_le_bytes());

    buf.extend_from_slice(container.salt());
    buf.extend_from_slice(container.nonce());
    buf.extend_from_slice(container.helpers().iris.as_bytes());
    buf.extend_from_slice(container.helpers().fingerprint.as_bytes());

    buf.extend_from_slice(&(raw_metadata.len() as u32).to_le_bytes());
    buf.extend_from_slice(raw_metadata);
    buf.extend_from_slice(container.ciphertext());

    Ok(buf)
}
