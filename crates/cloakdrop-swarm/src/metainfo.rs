//! Single-file torrent descriptors.

use sha1::{Digest, Sha1};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use crate::bencode::{self, DictBuilder, Value};
use crate::error::SwarmError;

/// Smallest piece size chosen for new torrents.
pub const MIN_PIECE_LENGTH: u32 = 16 * 1024;

/// Largest piece size chosen for new torrents.
pub const MAX_PIECE_LENGTH: u32 = 4 * 1024 * 1024;

/// Piece count new torrents aim for.
const TARGET_PIECES: u64 = 1500;

/// SHA-1 of a bencoded `info` dictionary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Raw hash bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Hash a bencoded `info` dictionary.
    #[must_use]
    pub fn of_info(info_bytes: &[u8]) -> Self {
        Self(Sha1::digest(info_bytes).into())
    }

    /// First 8 hex digits, for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.short())
    }
}

impl FromStr for InfoHash {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 20];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| SwarmError::InvalidMagnet(format!("info-hash {s:?}: {e}")))?;
        Ok(Self(out))
    }
}

/// Pick a power-of-two piece size for a payload of `length` bytes.
#[must_use]
pub fn choose_piece_length(length: u64) -> u32 {
    let ideal = (length / TARGET_PIECES).max(1).next_power_of_two();
    ideal.clamp(u64::from(MIN_PIECE_LENGTH), u64::from(MAX_PIECE_LENGTH)) as u32
}

/// Descriptor of a single-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    name: String,
    length: u64,
    piece_length: u32,
    pieces: Vec<[u8; 20]>,
    info_bytes: Vec<u8>,
    info_hash: InfoHash,
}

impl Metainfo {
    /// Hash every piece of the file at `path`.
    ///
    /// Blocking; run it off the async runtime for large files.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is empty.
    pub fn from_file(path: &Path) -> Result<Self, SwarmError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SwarmError::InvalidMetainfo("file has no UTF-8 name".into()))?
            .to_string();
        let mut file = File::open(path)?;
        let length = file.metadata()?.len();
        Self::from_reader(name, &mut file, length, choose_piece_length(length))
    }

    /// Hash `length` bytes from `reader` into pieces of `piece_length`.
    ///
    /// # Errors
    ///
    /// Fails on read errors, an empty payload, or a short reader.
    pub fn from_reader<R: Read>(
        name: String,
        reader: &mut R,
        length: u64,
        piece_length: u32,
    ) -> Result<Self, SwarmError> {
        if length == 0 {
            return Err(SwarmError::InvalidMetainfo("cannot share an empty file".into()));
        }
        if piece_length == 0 {
            return Err(SwarmError::InvalidMetainfo("piece length is zero".into()));
        }

        let count = length.div_ceil(u64::from(piece_length));
        let mut pieces = Vec::with_capacity(count as usize);
        let mut buffer = vec![0u8; piece_length as usize];
        let mut remaining = length;

        while remaining > 0 {
            let want = remaining.min(u64::from(piece_length)) as usize;
            reader.read_exact(&mut buffer[..want]).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    SwarmError::InvalidMetainfo("file shorter than its length".into())
                } else {
                    SwarmError::Io(e)
                }
            })?;
            pieces.push(Sha1::digest(&buffer[..want]).into());
            remaining -= want as u64;
        }

        Ok(Self::assemble(name, length, piece_length, pieces))
    }

    fn assemble(name: String, length: u64, piece_length: u32, pieces: Vec<[u8; 20]>) -> Self {
        let info = DictBuilder::new()
            .with("length", Value::Int(length as i64))
            .with("name", Value::bytes(&name))
            .with("piece length", Value::Int(i64::from(piece_length)))
            .with("pieces", Value::Bytes(pieces.concat()))
            .build();
        let info_bytes = bencode::encode(&info);
        let info_hash = InfoHash::of_info(&info_bytes);

        Self {
            name,
            length,
            piece_length,
            pieces,
            info_bytes,
            info_hash,
        }
    }

    /// Parse a bencoded `info` dictionary received from a peer.
    ///
    /// The info-hash is taken over the raw bytes as received.
    ///
    /// # Errors
    ///
    /// Fails on malformed or inconsistent dictionaries.
    pub fn from_info_bytes(info_bytes: Vec<u8>) -> Result<Self, SwarmError> {
        let info = bencode::decode(&info_bytes)?;
        let invalid = |msg: &str| SwarmError::InvalidMetainfo(msg.to_string());

        let name = info
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing name"))?
            .to_string();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(invalid("unsafe name"));
        }
        if info.get("files").is_some() {
            return Err(invalid("multi-file torrents are not supported"));
        }

        let length = info
            .get("length")
            .and_then(Value::as_int)
            .filter(|&n| n > 0)
            .ok_or_else(|| invalid("missing length"))? as u64;
        let piece_length = info
            .get("piece length")
            .and_then(Value::as_int)
            .and_then(|n| u32::try_from(n).ok())
            .filter(|&n| n > 0)
            .ok_or_else(|| invalid("missing piece length"))?;
        let raw = info
            .get("pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| invalid("missing pieces"))?;
        if raw.len() % 20 != 0 {
            return Err(invalid("pieces is not a multiple of 20 bytes"));
        }
        if (raw.len() / 20) as u64 != length.div_ceil(u64::from(piece_length)) {
            return Err(invalid("piece count does not match length"));
        }

        let pieces = raw
            .chunks_exact(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();
        let info_hash = InfoHash::of_info(&info_bytes);

        Ok(Self {
            name,
            length,
            piece_length,
            pieces,
            info_bytes,
            info_hash,
        })
    }

    /// Name of the payload file.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total payload length in bytes.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Nominal piece size.
    #[must_use]
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Number of pieces.
    #[must_use]
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Expected SHA-1 of piece `index`.
    #[must_use]
    pub fn piece_hash(&self, index: usize) -> Option<&[u8; 20]> {
        self.pieces.get(index)
    }

    /// Byte offset of piece `index` in the payload.
    #[must_use]
    pub fn piece_offset(&self, index: usize) -> u64 {
        index as u64 * u64::from(self.piece_length)
    }

    /// Size of piece `index`; the last piece may be short.
    #[must_use]
    pub fn piece_size(&self, index: usize) -> u32 {
        let offset = self.piece_offset(index);
        if offset >= self.length {
            return 0;
        }
        (self.length - offset).min(u64::from(self.piece_length)) as u32
    }

    /// Bencoded `info` dictionary, as served over `ut_metadata`.
    #[must_use]
    pub fn info_bytes(&self) -> &[u8] {
        &self.info_bytes
    }

    /// Identity of the torrent.
    #[must_use]
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// A complete `.torrent` file for this descriptor.
    #[must_use]
    pub fn to_torrent_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.info_bytes.len() + 48);
        out.extend_from_slice(b"d10:created by9:cloakdrop4:info");
        out.extend_from_slice(&self.info_bytes);
        out.push(b'e');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample(len: usize, piece_length: u32) -> (Vec<u8>, Metainfo) {
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
        let meta = Metainfo::from_reader(
            "payload.log".into(),
            &mut Cursor::new(&data),
            len as u64,
            piece_length,
        )
        .unwrap();
        (data, meta)
    }

    #[test]
    fn test_piece_length_choice() {
        assert_eq!(choose_piece_length(1), MIN_PIECE_LENGTH);
        assert_eq!(choose_piece_length(10 * 1024 * 1024), MIN_PIECE_LENGTH);
        assert_eq!(choose_piece_length(100 * 1024 * 1024), 128 * 1024);
        assert_eq!(choose_piece_length(1 << 40), MAX_PIECE_LENGTH);
        let mid = choose_piece_length(700 * 1024 * 1024);
        assert!(mid.is_power_of_two());
        assert_eq!(mid, 512 * 1024);
    }

    #[test]
    fn test_pieces_and_sizes() {
        let (data, meta) = sample(40_000, 16_384);
        assert_eq!(meta.piece_count(), 3);
        assert_eq!(meta.piece_size(0), 16_384);
        assert_eq!(meta.piece_size(2), 40_000 - 2 * 16_384);
        assert_eq!(meta.piece_size(3), 0);
        let expected: [u8; 20] = Sha1::digest(&data[16_384..32_768]).into();
        assert_eq!(meta.piece_hash(1), Some(&expected));
    }

    #[test]
    fn test_info_bytes_roundtrip_keeps_hash() {
        let (_, meta) = sample(100_000, 32_768);
        let parsed = Metainfo::from_info_bytes(meta.info_bytes().to_vec()).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.info_hash(), meta.info_hash());
    }

    #[test]
    fn test_from_info_bytes_rejects_inconsistent() {
        let info = DictBuilder::new()
            .with("length", Value::Int(50_000))
            .with("name", Value::bytes("x.log"))
            .with("piece length", Value::Int(16_384))
            .with("pieces", Value::Bytes(vec![0u8; 40]))
            .build();
        assert!(Metainfo::from_info_bytes(bencode::encode(&info)).is_err());

        let traversal = DictBuilder::new()
            .with("length", Value::Int(10))
            .with("name", Value::bytes("../etc/passwd"))
            .with("piece length", Value::Int(16_384))
            .with("pieces", Value::Bytes(vec![0u8; 20]))
            .build();
        assert!(Metainfo::from_info_bytes(bencode::encode(&traversal)).is_err());
    }

    #[test]
    fn test_empty_rejected() {
        let result = Metainfo::from_reader("e".into(), &mut Cursor::new(&[]), 0, 16_384);
        assert!(result.is_err());
    }

    #[test]
    fn test_info_hash_hex() {
        let (_, meta) = sample(20, 16_384);
        let text = meta.info_hash().to_string();
        assert_eq!(text.len(), 40);
        assert_eq!(text.parse::<InfoHash>().unwrap(), meta.info_hash());
        assert!("zz".parse::<InfoHash>().is_err());
    }

    #[test]
    fn test_torrent_file_contains_info() {
        let (_, meta) = sample(20, 16_384);
        let torrent = bencode::decode(&meta.to_torrent_bytes()).unwrap();
        let info = bencode::encode(torrent.get("info").unwrap());
        assert_eq!(InfoHash::of_info(&info), meta.info_hash());
    }
}
