//! Symmetric encryption for secrets copied into Backup annotations
//!
//! AES-256-GCM with a key derived from the operator's configured passphrase
//! (SHA-256). Ciphertexts are `base64(nonce || sealed)` so a restore can
//! decrypt them with nothing but the same passphrase.

use aws_lc_rs::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use aws_lc_rs::digest;
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::Error;

/// Encrypts and decrypts short values with a passphrase-derived key
#[derive(Clone)]
pub struct Encryptor {
    key: [u8; 32],
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor").finish_non_exhaustive()
    }
}

impl Encryptor {
    /// Derive the key from a passphrase
    pub fn new(passphrase: &str) -> Self {
        let hash = digest::digest(&digest::SHA256, passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(hash.as_ref());
        Self { key }
    }

    fn sealing_key(&self) -> Result<LessSafeKey, Error> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|_| Error::internal_with_context("encrypt", "invalid AES-256-GCM key"))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Encrypt `plaintext` under a fresh random nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, Error> {
        let mut nonce = [0u8; NONCE_LEN];
        aws_lc_rs::rand::fill(&mut nonce)
            .map_err(|_| Error::internal_with_context("encrypt", "random generation failed"))?;

        let mut sealed = plaintext.to_vec();
        self.sealing_key()?
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut sealed,
            )
            .map_err(|_| Error::internal_with_context("encrypt", "sealing failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    /// Decrypt a value produced by [`Encryptor::encrypt`]
    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, Error> {
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| Error::validation_for("ciphertext", e.to_string()))?;
        if raw.len() < NONCE_LEN {
            return Err(Error::validation_for("ciphertext", "shorter than a nonce"));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| Error::validation_for("ciphertext", "invalid nonce"))?;

        let mut in_out = sealed.to_vec();
        let plain = self
            .sealing_key()?
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| Error::validation_for("ciphertext", "authentication failed"))?;
        Ok(plain.to_vec())
    }
}
