//! # Log Cloak Container
//!
//! Disguises a payload as a plain-text application log.
//!
//! ## Security Properties
//!
//! - **Key Derivation:** Argon2id over the 6 secret digits and a random salt
//! - **Encryption:** XChaCha20-Poly1305, one record per 64 KiB of payload
//! - **Ordering:** nonce = random prefix ‖ record counter, so records cannot
//!   be reordered
//! - **Truncation:** the final record carries its own kind in the associated
//!   data and seals the BLAKE3 digest of the content
//!
//! ## File Format
//!
//! Every line is `<unix-secs>.<millis> <LEVEL> syncd: <base64>`.
//!
//! ```text
//! line 0    INFO   header  [version 1B][argon2 params 6B][salt 16B][nonce prefix 16B]
//! line 1    DEBUG  meta    seal([name len 2B][name][content len 8B])
//! line 2..n DEBUG  data    seal(content[i * 64 KiB ..])
//! line n+1  DEBUG  final   seal(blake3(content))
//! ```
//!
//! The associated data of each record is the raw header followed by the
//! record kind byte.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use argon2::{Algorithm, Argon2, Params, ParamsBuilder, Version};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::CloakError;
use crate::secret::Secret;
use crate::{CLOAKED_EXTENSION, RECORD_SIZE};

/// Current container format version.
const FORMAT_VERSION: u8 = 1;

/// Size of salt for Argon2 key derivation.
const SALT_SIZE: usize = 16;

/// Random part of every record nonce.
const NONCE_PREFIX_SIZE: usize = 16;

/// Size of the unencrypted header.
const HEADER_SIZE: usize = 1 + 6 + SALT_SIZE + NONCE_PREFIX_SIZE;

/// Longest original file name accepted in the meta record.
const MAX_NAME_LEN: usize = 1024;

/// Largest Argon2 memory cost accepted from an artifact header (1 GiB).
pub const MAX_MEMORY_COST_KIB: u32 = 1 << 20;

/// Process name written into every log line.
const COMPONENT: &str = "syncd";

const KIND_META: u8 = 0;
const KIND_DATA: u8 = 1;
const KIND_FINAL: u8 = 2;

/// Parameters for Argon2id key derivation.
///
/// The secret only has 900,000 possible values, so the work factor is what
/// makes an offline guess expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloakParams {
    /// Memory cost in KiB (default: 19456 = 19 MiB)
    pub memory_cost_kib: u32,
    /// Number of iterations (default: 2)
    pub iterations: u32,
    /// Degree of parallelism (default: 1)
    pub parallelism: u32,
}

impl Default for CloakParams {
    fn default() -> Self {
        Self {
            memory_cost_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl CloakParams {
    /// Low-cost parameters for tests.
    ///
    /// **Warning:** Only use for testing.
    #[must_use]
    pub fn low_security() -> Self {
        Self {
            memory_cost_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    /// Validate parameters are within acceptable bounds.
    ///
    /// # Errors
    ///
    /// Returns [`CloakError::InvalidParameter`] naming the first bad field.
    pub fn validate(&self) -> Result<(), CloakError> {
        if self.memory_cost_kib < 8 {
            return Err(CloakError::InvalidParameter(
                "memory_cost_kib must be at least 8 KiB".into(),
            ));
        }
        if self.memory_cost_kib > MAX_MEMORY_COST_KIB {
            return Err(CloakError::InvalidParameter(format!(
                "memory_cost_kib {} exceeds the {} KiB ceiling",
                self.memory_cost_kib, MAX_MEMORY_COST_KIB
            )));
        }
        if self.iterations < 1 || self.iterations > u32::from(u16::MAX) {
            return Err(CloakError::InvalidParameter(
                "iterations must be between 1 and 65535".into(),
            ));
        }
        if self.parallelism < 1 || self.parallelism > 255 {
            return Err(CloakError::InvalidParameter(
                "parallelism must be between 1 and 255".into(),
            ));
        }
        Ok(())
    }

    fn build_argon2_params(&self) -> Result<Params, CloakError> {
        self.validate()?;

        ParamsBuilder::new()
            .m_cost(self.memory_cost_kib)
            .t_cost(self.iterations)
            .p_cost(self.parallelism)
            .build()
            .map_err(|e| CloakError::InvalidParameter(format!("Argon2 params: {e}")))
    }

    fn to_bytes(self) -> [u8; 6] {
        let mut bytes = [0u8; 6];
        bytes[0..3].copy_from_slice(&self.memory_cost_kib.to_le_bytes()[0..3]);
        bytes[3..5].copy_from_slice(&(self.iterations as u16).to_le_bytes());
        bytes[5] = self.parallelism as u8;
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut mem_bytes = [0u8; 4];
        mem_bytes[0..3].copy_from_slice(&bytes[0..3]);

        Self {
            memory_cost_kib: u32::from_le_bytes(mem_bytes),
            iterations: u32::from(u16::from_le_bytes([bytes[3], bytes[4]])),
            parallelism: u32::from(bytes[5]),
        }
    }
}

/// A disguised payload on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloakedArtifact {
    /// Where the artifact lives.
    pub path: PathBuf,
    /// Generated file name (never the original).
    pub name: String,
    /// Size of the artifact in bytes.
    pub size: u64,
}

/// Capability that disguises a file under a shared secret and reverses it.
pub trait Cloak: Send + Sync {
    /// Produce a disguised, encrypted copy of `input`.
    ///
    /// # Errors
    ///
    /// Fails when the input cannot be read or the artifact cannot be written.
    /// No partial artifact is left behind.
    fn cloak(&self, input: &Path, secret: &Secret) -> Result<CloakedArtifact, CloakError>;

    /// Recover the original file from an artifact into `out_dir`.
    ///
    /// Returns the path of the restored file, named after the original.
    ///
    /// # Errors
    ///
    /// Fails on a wrong secret, a tampered or truncated artifact, or I/O
    /// trouble. No partial output is left behind.
    fn decloak(&self, input: &Path, secret: &Secret, out_dir: &Path)
    -> Result<PathBuf, CloakError>;
}

/// Cloak that writes artifacts as `syncd-<secs>-<tag>.log` files.
#[derive(Debug, Clone)]
pub struct LogCloak {
    params: CloakParams,
    work_dir: PathBuf,
}

impl LogCloak {
    /// Create a codec writing artifacts into `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>, params: CloakParams) -> Self {
        Self {
            params,
            work_dir: work_dir.into(),
        }
    }

    /// Directory receiving new artifacts.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Key derivation parameters for new artifacts.
    #[must_use]
    pub fn params(&self) -> CloakParams {
        self.params
    }

    fn write_container(
        &self,
        input: &Path,
        output: &Path,
        original_name: &str,
        content_len: u64,
        secret: &Secret,
    ) -> Result<(), CloakError> {
        let mut salt = [0u8; SALT_SIZE];
        getrandom::getrandom(&mut salt)
            .map_err(|e| CloakError::RandomGenerationFailed(e.to_string()))?;
        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        getrandom::getrandom(&mut nonce_prefix)
            .map_err(|e| CloakError::RandomGenerationFailed(e.to_string()))?;

        let header = Header {
            params: self.params,
            salt,
            nonce_prefix,
        };
        let sealer = RecordCipher::new(secret, &header)?;

        let mut out = BufWriter::new(File::create(output)?);
        write_line(&mut out, "INFO", &header.to_bytes())?;

        let mut meta = Vec::with_capacity(2 + original_name.len() + 8);
        meta.extend_from_slice(&(original_name.len() as u16).to_le_bytes());
        meta.extend_from_slice(original_name.as_bytes());
        meta.extend_from_slice(&content_len.to_le_bytes());
        write_line(&mut out, "DEBUG", &sealer.seal(0, KIND_META, &meta)?)?;

        let mut src = File::open(input)?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; RECORD_SIZE];
        let mut counter = 1u64;
        let mut total = 0u64;
        loop {
            let n = read_full(&mut src, &mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            write_line(&mut out, "DEBUG", &sealer.seal(counter, KIND_DATA, &buf[..n])?)?;
            counter += 1;
            total += n as u64;
        }
        if total != content_len {
            return Err(CloakError::format("input changed size while cloaking"));
        }

        let digest = hasher.finalize();
        write_line(
            &mut out,
            "DEBUG",
            &sealer.seal(counter, KIND_FINAL, digest.as_bytes())?,
        )?;
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    }

    fn write_plain<I>(
        lines: &mut I,
        opener: &RecordCipher,
        content_len: u64,
        output: &Path,
    ) -> Result<(), CloakError>
    where
        I: Iterator<Item = io::Result<String>>,
    {
        let mut out = BufWriter::new(File::create(output)?);
        let mut hasher = blake3::Hasher::new();
        let records = content_len.div_ceil(RECORD_SIZE as u64);
        let mut remaining = content_len;

        for counter in 1..=records {
            let sealed = next_payload(lines)?
                .ok_or_else(|| CloakError::format("artifact truncated"))?;
            let plain = opener.open(counter, KIND_DATA, &sealed)?;
            let expected = remaining.min(RECORD_SIZE as u64) as usize;
            if plain.len() != expected {
                return Err(CloakError::format("record length mismatch"));
            }
            hasher.update(&plain);
            out.write_all(&plain)?;
            remaining -= expected as u64;
        }

        let sealed =
            next_payload(lines)?.ok_or_else(|| CloakError::format("artifact truncated"))?;
        let digest = opener.open(records + 1, KIND_FINAL, &sealed)?;
        if digest.len() != blake3::OUT_LEN {
            return Err(CloakError::format("final record has wrong size"));
        }
        let mut expected = [0u8; blake3::OUT_LEN];
        expected.copy_from_slice(&digest);
        if hasher.finalize() != blake3::Hash::from(expected) {
            return Err(CloakError::DigestMismatch);
        }
        if next_payload(lines)?.is_some() {
            return Err(CloakError::format("trailing records after final record"));
        }

        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    }
}

impl Cloak for LogCloak {
    fn cloak(&self, input: &Path, secret: &Secret) -> Result<CloakedArtifact, CloakError> {
        let meta = fs::metadata(input)?;
        if !meta.is_file() {
            return Err(CloakError::format("input is not a regular file"));
        }
        let original_name = input
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CloakError::format("input has no UTF-8 file name"))?;
        if original_name.len() > MAX_NAME_LEN {
            return Err(CloakError::format("input file name too long"));
        }

        fs::create_dir_all(&self.work_dir)?;
        let name = cloaked_name()?;
        let path = self.work_dir.join(&name);

        if let Err(e) = self.write_container(input, &path, original_name, meta.len(), secret) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        let size = fs::metadata(&path)?.len();
        tracing::debug!(
            "Cloaked {} ({} bytes) into {} ({} bytes)",
            original_name,
            meta.len(),
            name,
            size
        );

        Ok(CloakedArtifact { path, name, size })
    }

    fn decloak(
        &self,
        input: &Path,
        secret: &Secret,
        out_dir: &Path,
    ) -> Result<PathBuf, CloakError> {
        let mut lines = BufReader::new(File::open(input)?).lines();

        let header_bytes =
            next_payload(&mut lines)?.ok_or_else(|| CloakError::format("empty artifact"))?;
        let header = Header::from_bytes(&header_bytes)?;
        let opener = RecordCipher::new(secret, &header)?;

        let meta_sealed =
            next_payload(&mut lines)?.ok_or_else(|| CloakError::format("artifact truncated"))?;
        let meta = opener.open(0, KIND_META, &meta_sealed)?;
        let (original_name, content_len) = parse_meta(&meta)?;

        fs::create_dir_all(out_dir)?;
        let final_path = unique_path(out_dir, &original_name);
        let part_path = out_dir.join(format!(".{original_name}.part"));

        if let Err(e) = Self::write_plain(&mut lines, &opener, content_len, &part_path) {
            let _ = fs::remove_file(&part_path);
            return Err(e);
        }
        fs::rename(&part_path, &final_path)?;

        tracing::debug!(
            "Decloaked {} into {} ({} bytes)",
            input.display(),
            final_path.display(),
            content_len
        );

        Ok(final_path)
    }
}

struct Header {
    params: CloakParams,
    salt: [u8; SALT_SIZE],
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = FORMAT_VERSION;
        bytes[1..7].copy_from_slice(&self.params.to_bytes());
        bytes[7..7 + SALT_SIZE].copy_from_slice(&self.salt);
        bytes[7 + SALT_SIZE..].copy_from_slice(&self.nonce_prefix);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CloakError> {
        if bytes.len() != HEADER_SIZE {
            return Err(CloakError::format("bad header length"));
        }
        if bytes[0] != FORMAT_VERSION {
            return Err(CloakError::format(format!(
                "unsupported format version: {}",
                bytes[0]
            )));
        }

        let params = CloakParams::from_bytes(&bytes[1..7]);
        params.validate()?;

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[7..7 + SALT_SIZE]);
        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        nonce_prefix.copy_from_slice(&bytes[7 + SALT_SIZE..]);

        Ok(Self {
            params,
            salt,
            nonce_prefix,
        })
    }
}

/// Seals and opens numbered records under one derived key.
struct RecordCipher {
    cipher: XChaCha20Poly1305,
    header: [u8; HEADER_SIZE],
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
}

impl RecordCipher {
    fn new(secret: &Secret, header: &Header) -> Result<Self, CloakError> {
        let mut digits = secret.to_digits();
        let key = derive_key(&digits, &header.salt, &header.params);
        digits.zeroize();
        let mut key = key?;

        let cipher = XChaCha20Poly1305::new_from_slice(&key)
            .map_err(|_| CloakError::KeyDerivationFailed)?;
        key.zeroize();

        Ok(Self {
            cipher,
            header: header.to_bytes(),
            nonce_prefix: header.nonce_prefix,
        })
    }

    fn nonce(&self, counter: u64) -> [u8; 24] {
        let mut nonce = [0u8; 24];
        nonce[..NONCE_PREFIX_SIZE].copy_from_slice(&self.nonce_prefix);
        nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&counter.to_le_bytes());
        nonce
    }

    fn aad(&self, kind: u8) -> [u8; HEADER_SIZE + 1] {
        let mut aad = [0u8; HEADER_SIZE + 1];
        aad[..HEADER_SIZE].copy_from_slice(&self.header);
        aad[HEADER_SIZE] = kind;
        aad
    }

    fn seal(&self, counter: u64, kind: u8, msg: &[u8]) -> Result<Vec<u8>, CloakError> {
        let nonce = self.nonce(counter);
        let aad = self.aad(kind);
        self.cipher
            .encrypt(XNonce::from_slice(&nonce), Payload { msg, aad: &aad })
            .map_err(|_| CloakError::EncryptionFailed)
    }

    fn open(&self, counter: u64, kind: u8, msg: &[u8]) -> Result<Vec<u8>, CloakError> {
        let nonce = self.nonce(counter);
        let aad = self.aad(kind);
        self.cipher
            .decrypt(XNonce::from_slice(&nonce), Payload { msg, aad: &aad })
            .map_err(|_| CloakError::Decrypt)
    }
}

/// Derive an encryption key from the secret digits using Argon2id.
fn derive_key(
    digits: &[u8],
    salt: &[u8; SALT_SIZE],
    params: &CloakParams,
) -> Result<[u8; 32], CloakError> {
    let argon2_params = params.build_argon2_params()?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut derived_key = [0u8; 32];
    argon2
        .hash_password_into(digits, salt, &mut derived_key)
        .map_err(|_| CloakError::KeyDerivationFailed)?;

    Ok(derived_key)
}

fn parse_meta(meta: &[u8]) -> Result<(String, u64), CloakError> {
    if meta.len() < 2 {
        return Err(CloakError::format("meta record too short"));
    }
    let name_len = usize::from(u16::from_le_bytes([meta[0], meta[1]]));
    if name_len == 0 || name_len > MAX_NAME_LEN || meta.len() != 2 + name_len + 8 {
        return Err(CloakError::format("meta record has wrong size"));
    }
    let name = std::str::from_utf8(&meta[2..2 + name_len])
        .map_err(|_| CloakError::format("original name is not UTF-8"))?;
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(CloakError::format("unsafe original file name"));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&meta[2 + name_len..]);
    Ok((name.to_string(), u64::from_le_bytes(len_bytes)))
}

/// First free path for `name` in `dir`, appending ` (n)` before the extension.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn cloaked_name() -> Result<String, CloakError> {
    let mut tag = [0u8; 4];
    getrandom::getrandom(&mut tag)
        .map_err(|e| CloakError::RandomGenerationFailed(e.to_string()))?;
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    Ok(format!(
        "{COMPONENT}-{secs}-{}.{CLOAKED_EXTENSION}",
        hex::encode(tag)
    ))
}

fn write_line<W: Write>(out: &mut W, level: &str, payload: &[u8]) -> io::Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    writeln!(
        out,
        "{}.{:03} {:<5} {}: {}",
        now.as_secs(),
        now.subsec_millis(),
        level,
        COMPONENT,
        STANDARD.encode(payload)
    )
}

/// Next decoded record, skipping blank lines.
fn next_payload<I>(lines: &mut I) -> Result<Option<Vec<u8>>, CloakError>
where
    I: Iterator<Item = io::Result<String>>,
{
    for line in lines.by_ref() {
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (_, payload) = line
            .rsplit_once(' ')
            .ok_or_else(|| CloakError::format("line without payload"))?;
        let bytes = STANDARD
            .decode(payload)
            .map_err(|_| CloakError::format("payload is not base64"))?;
        return Ok(Some(bytes));
    }
    Ok(None)
}

fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
