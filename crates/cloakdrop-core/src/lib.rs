//! # CloakDrop Core
//!
//! Drop transfer orchestration for CloakDrop.
//!
//! This crate provides:
//! - The sender-side [`DropOrchestrator`] and its pure [`SenderMachine`]
//! - The [`DirectTransport`] listener and its [`pull`](direct::pull) client
//! - The receiver-side [`DropReceiver`]
//! - Configuration, the [`DropError`] taxonomy and UI-facing [`DropEvent`]s
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                     DropOrchestrator                           │
//! │  cloak ─▶ listener ─▶ (swarm seed) ─▶ document ─▶ subscribe    │
//! ├────────────────────────────────────────────────────────────────┤
//! │                per-drop task + SenderMachine                   │
//! │   rendezvous pushes │ listener events │ swarm events │ cancel  │
//! ├───────────────────┬──────────────────┬─────────────────────────┤
//! │  DirectTransport  │ SwarmTransport-  │   RendezvousStore       │
//! │  (TCP, per-conn   │ Manager          │   (memory or TCP)       │
//! │   tasks)          │ (one session)    │                         │
//! └───────────────────┴──────────────────┴─────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod direct;
pub mod error;
pub mod events;
pub mod machine;
pub mod orchestrator;
pub mod receiver;

pub use config::{
    CloakConfig, DirectConfig, DropConfig, SwarmConfig, TimeoutConfig, TransferPolicy,
};
pub use direct::{AcceptExit, DirectError, DirectEvent, DirectTransport, ListenerReport};
pub use error::{DropError, Result};
pub use events::{DEFAULT_EVENT_CAPACITY, DropEvent, DropEventKind, EventBus};
pub use machine::{Effect, Input, Notice, Outcome, SenderMachine, SenderState};
pub use orchestrator::{DropOrchestrator, SendHandle, Teardown, TeardownReport, TransferSession};
pub use receiver::{DropReceiver, Route};
