//! Cloak codec error types.

use thiserror::Error;

/// Errors produced while cloaking or decloaking a payload.
#[derive(Debug, Error)]
pub enum CloakError {
    /// Secret outside the 6-digit range
    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    /// Argon2 parameters rejected
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Random number generation failed with details
    #[error("random generation failed: {0}")]
    RandomGenerationFailed(String),

    /// AEAD sealing failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Wrong secret or tampered artifact
    #[error("decryption failed: wrong secret or corrupted artifact")]
    Decrypt,

    /// Artifact does not follow the container layout
    #[error("malformed artifact: {0}")]
    Format(String),

    /// Recovered content does not match the sealed digest
    #[error("content digest mismatch")]
    DigestMismatch,

    /// Input or output file problem
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloakError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }
}
