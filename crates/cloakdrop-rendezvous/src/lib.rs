//! # CloakDrop Rendezvous
//!
//! Signalling channel between the two peers of a drop.
//!
//! Neither peer has a reachable address up front, so both watch a shared
//! [`DropRequest`] document instead. The sender creates it, the receiver
//! moves it through `accepted`/`declined`/`complete`, and each side sees the
//! other's writes as a pushed [`DocumentChange`].
//!
//! ## Backends
//!
//! - [`MemoryStore`]: in-process store, also the state behind the server
//! - [`RendezvousServer`] / [`RemoteStore`]: the same store over TCP with
//!   length-prefixed bincode frames
//!
//! ```text
//! sender ──create──▶ ┌─────────────────┐ ◀──watch_inbox── receiver
//!        ◀─changes── │ RendezvousStore │ ──changes──▶
//!                    └─────────────────┘ ◀──update_status──
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod memory;
pub mod model;
pub mod protocol;
pub mod server;
pub mod store;

pub use client::RemoteStore;
pub use error::RendezvousError;
pub use memory::MemoryStore;
pub use model::{DocumentChange, DropRequest, DropRequestId, DropStatus, NewDropRequest, SenderAddress};
pub use server::{RendezvousServer, RendezvousServerConfig, RendezvousServerHandle};
pub use store::{Inbox, RendezvousStore, Subscription};
