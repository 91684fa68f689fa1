//! Embedded, append-only, log-structured store for small records.
//!
//! Two data shapes share one storage substrate (see `substrate`):
//!
//! - [`StateKeeper`] is a partitioned key/value store that reconstructs the
//!   full map of a partition as of any past sequence number.
//! - [`EventLog`] is an append-only record log, in mono (single implicit tag)
//!   and multi (many tags) variants, supporting merged replay by sequence.
//!
//! Serialization, the write-mutex wrapper, logging installation and process
//! packaging are the caller's concern; this crate owns the segmented-log
//! durability model and ordering guarantees only (see `SPEC_FULL.md`).

pub mod codec;
pub mod decorators;
pub mod error;
pub mod event_log;
pub mod replay;
pub mod state_keeper;
pub mod substrate;

pub use decorators::{Locked, SerializingLog, TypeName, WriteGuard};
pub use error::{Error, Result};
pub use event_log::{EventLog, EventRecord, TagFilter};
pub use state_keeper::{
    MergedStateItem, MergedStateReplay, MergedStateValue, StateKeeper, StateReplay,
    StateReplayItem, StateReplayValue,
};

/// Segment size used when a caller doesn't configure one explicitly.
pub const DEFAULT_SEGMENT_SIZE: u64 = 10_000;
