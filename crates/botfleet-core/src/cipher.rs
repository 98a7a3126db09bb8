//! Bot credential encryption
//!
//! Credentials are stored as URL-safe base64 of `nonce || ciphertext+tag`,
//! sealed with AES-256-GCM under a key derived from the configured secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;
use std::num::NonZeroU32;
use thiserror::Error;

const MIN_SECRET_LEN: usize = 32;
const KEY_SALT: &[u8] = b"botfleet_credential_salt";
const PBKDF2_ITERATIONS: NonZeroU32 = NonZeroU32::MIN.saturating_add(99_999);

/// Credential encryption errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The configured secret is shorter than 32 characters
    #[error("encryption key must be at least {MIN_SECRET_LEN} characters")]
    KeyTooShort,
    /// Stored credential is not valid base64 or UTF-8
    #[error("credential encoding is invalid")]
    Encoding,
    /// Wrong key or tampered ciphertext
    #[error("credential decryption failed")]
    Decrypt,
    /// Sealing failed
    #[error("credential encryption failed")]
    Encrypt,
}

/// AES-256-GCM cipher for bot credentials
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl CredentialCipher {
    /// Derive the cipher key from `secret`
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::KeyTooShort` if `secret` has fewer than 32 characters.
    pub fn from_secret(secret: &str) -> Result<Self, CredentialError> {
        if secret.chars().count() < MIN_SECRET_LEN {
            return Err(CredentialError::KeyTooShort);
        }
        let mut key = [0u8; 32];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            PBKDF2_ITERATIONS,
            KEY_SALT,
            secret.as_bytes(),
            &mut key,
        );
        Ok(Self { key })
    }

    fn sealing_key(&self) -> Result<LessSafeKey, CredentialError> {
        UnboundKey::new(&AES_256_GCM, &self.key)
            .map(LessSafeKey::new)
            .map_err(|_| CredentialError::Encrypt)
    }

    /// Encrypt a plaintext credential
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::Encrypt` if the random nonce or sealing fails.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let key = self.sealing_key()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| CredentialError::Encrypt)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| CredentialError::Encrypt)?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&in_out);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Decrypt a stored credential
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::Encoding` for malformed input and
    /// `CredentialError::Decrypt` for a wrong key or tampered data.
    pub fn decrypt(&self, encoded: &str) -> Result<String, CredentialError> {
        let sealed = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|_| CredentialError::Encoding)?;
        if sealed.len() <= NONCE_LEN {
            return Err(CredentialError::Encoding);
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CredentialError::Encoding)?;

        let key = self.sealing_key().map_err(|_| CredentialError::Decrypt)?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CredentialError::Decrypt)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| CredentialError::Encoding)
    }
}
