//! Rolling retention buffer
//!
//! Producers append frames; exports take snapshots.

pub mod ring;
pub mod snapshot;

pub use ring::{RingBuffer, RingStats};
pub use snapshot::Snapshot;
