//! Optional wrappers layered on top of the bare engines.
//!
//! Neither `StateKeeper` nor `EventLog` is thread-safe; these decorators
//! translate at the boundary rather than reaching into engine internals
//! (see SPEC_FULL.md §4.5-4.6).

pub mod lock;
pub mod serializing;

pub use lock::{Locked, WriteGuard};
pub use serializing::{SerializingLog, TypeName};
