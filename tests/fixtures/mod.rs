//! Test fixtures.

mod drop_pair;
mod stores;

pub use drop_pair::{DropFixture, collect_events, wait_for_status};
pub use stores::{CountingStore, FailingStore};
