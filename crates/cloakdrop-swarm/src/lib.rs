//! # CloakDrop Swarm
//!
//! BitTorrent-compatible transport for drops.
//!
//! One [`SwarmSession`] is created at application start and multiplexes every
//! drop by info-hash. The [`SwarmTransportManager`] sits on top of it, maps
//! drop request ids to info-hashes and back, and turns the session's alert
//! stream into [`SwarmEvent`]s keyed by drop request id.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  SwarmTransportManager                   │
//! │   drop id ⇄ info-hash tables ─── alert translation task  │
//! ├──────────────────────────────────────────────────────────┤
//! │                      SwarmSession                        │
//! │  ┌──────────┐  ┌──────────┐  ┌───────────┐  ┌────────┐   │
//! │  │ Listener │  │ Torrents │  │ Downloads │  │ Alerts │   │
//! │  │ (serve)  │  │ (DashMap)│  │ (workers) │  │(bcast) │   │
//! │  └──────────┘  └──────────┘  └───────────┘  └────────┘   │
//! ├──────────────────────────────────────────────────────────┤
//! │  Peer wire (BEP 3) · Extensions (BEP 10) · Metadata (BEP 9)│
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Links are tracker-less: a magnet carries the info-hash plus `x.pe` peer
//! hints pointing at the seeding session.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alert;
pub mod bencode;
pub mod error;
pub mod magnet;
pub mod manager;
pub mod metainfo;
pub mod session;
pub mod wire;

pub use alert::{Alert, TorrentStatus};
pub use error::SwarmError;
pub use magnet::MagnetLink;
pub use manager::{
    SwarmDownload, SwarmEvent, SwarmEventKind, SwarmManagerConfig, SwarmProgress,
    SwarmTransportManager,
};
pub use metainfo::{InfoHash, Metainfo};
pub use session::{SessionConfig, SwarmSession};

/// Size of a block request on the peer wire.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Size of one `ut_metadata` piece.
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;
