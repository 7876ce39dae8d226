//! Tracker-less magnet links.
//!
//! ```text
//! magnet:?xt=urn:btih:<40 hex>&dn=<name>&x.pe=<host:port>[&x.pe=...]
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use url::{Url, form_urlencoded};

use crate::error::SwarmError;
use crate::metainfo::InfoHash;

const BTIH_PREFIX: &str = "urn:btih:";

/// A parsed magnet link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    /// Torrent identity
    pub info_hash: InfoHash,
    /// Display name
    pub name: Option<String>,
    /// Peers known to hold the torrent
    pub peers: Vec<SocketAddr>,
}

impl MagnetLink {
    /// Link with no name and no peer hints.
    #[must_use]
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            name: None,
            peers: Vec::new(),
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a peer hint.
    #[must_use]
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        if !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
        self
    }
}

impl fmt::Display for MagnetLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "magnet:?xt={BTIH_PREFIX}{}", self.info_hash)?;
        if let Some(name) = &self.name {
            let encoded: String = form_urlencoded::byte_serialize(name.as_bytes()).collect();
            write!(f, "&dn={encoded}")?;
        }
        for peer in &self.peers {
            write!(f, "&x.pe={peer}")?;
        }
        Ok(())
    }
}

impl FromStr for MagnetLink {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s.trim()).map_err(|e| SwarmError::InvalidMagnet(e.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(SwarmError::InvalidMagnet(format!(
                "unexpected scheme {:?}",
                url.scheme()
            )));
        }

        let mut info_hash = None;
        let mut name = None;
        let mut peers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    // Other urn types are allowed alongside btih.
                    if let Some(id) = value.strip_prefix(BTIH_PREFIX) {
                        info_hash = Some(parse_btih(id)?);
                    }
                }
                "dn" => name = Some(value.into_owned()),
                "x.pe" => match value.parse::<SocketAddr>() {
                    Ok(addr) => peers.push(addr),
                    Err(_) => tracing::debug!("Skipping unparsable peer hint {:?}", value),
                },
                _ => {}
            }
        }

        let info_hash =
            info_hash.ok_or_else(|| SwarmError::InvalidMagnet("missing xt=urn:btih".into()))?;
        Ok(Self {
            info_hash,
            name,
            peers,
        })
    }
}

fn parse_btih(id: &str) -> Result<InfoHash, SwarmError> {
    match id.len() {
        40 => id.parse(),
        32 => decode_base32(id)
            .map(InfoHash)
            .ok_or_else(|| SwarmError::InvalidMagnet(format!("bad base32 info-hash {id:?}"))),
        n => Err(SwarmError::InvalidMagnet(format!(
            "info-hash has {n} characters"
        ))),
    }
}

/// RFC 4648 base32, exactly 32 symbols to 20 bytes.
fn decode_base32(text: &str) -> Option<[u8; 20]> {
    let mut out = [0u8; 20];
    let mut acc: u64 = 0;
    let mut bits = 0;
    let mut pos = 0;
    for c in text.bytes() {
        let v = match c.to_ascii_uppercase() {
            c @ b'A'..=b'Z' => c - b'A',
            c @ b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        acc = (acc << 5) | u64::from(v);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            *out.get_mut(pos)? = (acc >> bits) as u8;
            pos += 1;
        }
    }
    (pos == 20).then_some(out)
}
