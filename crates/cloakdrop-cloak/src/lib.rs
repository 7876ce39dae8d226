//! # CloakDrop Cloak
//!
//! Payload disguise for CloakDrop drops.
//!
//! This crate provides:
//! - The [`Cloak`] capability consumed by the transfer orchestrator
//! - [`LogCloak`], which turns any file into an encrypted container that
//!   reads like an ordinary application log
//! - The 6-digit [`Secret`] shared between sender and receiver
//!
//! ## Primitive Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key Derivation | Argon2id |
//! | AEAD | XChaCha20-Poly1305 (64 KiB records) |
//! | Content Digest | BLAKE3 |
//! | Text Encoding | Base64 (standard alphabet) |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod secret;

pub use codec::{Cloak, CloakParams, CloakedArtifact, LogCloak, MAX_MEMORY_COST_KIB};
pub use error::CloakError;
pub use secret::Secret;

/// Extension every cloaked artifact carries.
pub const CLOAKED_EXTENSION: &str = "log";

/// Plaintext bytes sealed per record.
pub const RECORD_SIZE: usize = 64 * 1024;
