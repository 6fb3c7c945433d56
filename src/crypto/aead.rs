use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use getrandom::fill;
use zeroize::Zeroizing;

use super::{NONCE_LEN, SALT_LEN, TAG_LEN, kdf::DerivedKey};
use crate::error::{Error, Result};

/// Fill buffer with cryptographically secure random bytes
fn secure_random(buf: &mut [u8]) -> Result<()> {
    fill(buf).map_err(|_| Error::Crypto("OS random generator unavailable".into()))
}

/// Generate salt
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    secure_random(&mut salt)?;
    Ok(salt)
}

/// Encrypt plaintext under a fresh random nonce, binding `aad`.
///
/// Returns `ciphertext || tag` and the nonce.
pub fn encrypt(key: &DerivedKey, aad: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_LEN];
    secure_random(&mut nonce)?;

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Crypto("encryption failed".into()))?;

    Ok((ciphertext, nonce))
}

/// Decrypt `ciphertext || tag`.
///
/// A wrong key, a different `aad` and a modified ciphertext are all reported
/// as [`Error::AccessDenied`].
pub fn decrypt(
    key: &DerivedKey,
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if ciphertext.len() < TAG_LEN {
        return Err(Error::CorruptContainer("ciphertext shorter than tag".into()));
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::AccessDenied)?;
    Ok(Zeroizing::new(plaintext))
}
