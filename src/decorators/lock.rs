//! Write-Lock Decorator.
//!
//! Wraps an engine's write path in a caller-supplied mutex, since the bare
//! engines assume a single writer (SPEC_FULL.md §4.6, §5).

use std::cell::{Ref, RefCell};
use std::sync::Mutex;

use crate::error::Result;
use crate::event_log::EventLog;
use crate::state_keeper::StateKeeper;

/// Something that can run a closure "exclusively". Blanket-implemented for
/// `std::sync::Mutex<()>`; implement it for a `parking_lot`-style mutex or a
/// cooperative async lock to plug those in instead.
pub trait WriteGuard {
    fn with_exclusive<R>(&self, f: impl FnOnce() -> R) -> R;
}

impl WriteGuard for Mutex<()> {
    fn with_exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _permit = self.lock().expect("write-lock poisoned");
        f()
    }
}

/// Serializes write access to an inner engine `E` through guard `G`.
/// Reads bypass the guard (see SPEC_FULL.md §5: readers may run
/// concurrently with a writer only when the writer holds this lock).
pub struct Locked<E, G = Mutex<()>> {
    inner: RefCell<E>,
    guard: G,
}

impl<E, G: WriteGuard> Locked<E, G> {
    pub fn new(inner: E, guard: G) -> Self {
        Locked {
            inner: RefCell::new(inner),
            guard,
        }
    }

    /// Runs `f` against the inner engine with the guard held.
    pub fn with_write<R>(&self, f: impl FnOnce(&mut E) -> R) -> R {
        self.guard.with_exclusive(|| f(&mut self.inner.borrow_mut()))
    }

    /// Direct read access, bypassing the guard.
    pub fn read(&self) -> Ref<'_, E> {
        self.inner.borrow()
    }
}

impl<G: WriteGuard> Locked<StateKeeper, G> {
    pub fn write(&self, partition: &str, kv: crate::codec::JsonMap) -> Result<u64> {
        self.with_write(|inner| inner.write(partition, kv))
    }

    pub fn multi_write(
        &self,
        updates: std::collections::BTreeMap<String, crate::codec::JsonMap>,
    ) -> Result<u64> {
        self.with_write(|inner| inner.multi_write(updates))
    }
}

impl<G: WriteGuard> Locked<EventLog, G> {
    pub fn put(&self, payload: &str, tag: Option<&str>) -> Result<u64> {
        self.with_write(|inner| inner.put(payload, tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn locked_state_keeper_serializes_writes() {
        let dir = tempdir().unwrap();
        let keeper = StateKeeper::open(dir.path(), 10).unwrap();
        let locked = Locked::new(keeper, Mutex::new(()));

        let kv: crate::codec::JsonMap = [("k".to_string(), json!(1))].into_iter().collect();
        let seq = locked.write("ns", kv).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(
            locked.read().get_key("ns", "k", None).unwrap(),
            Some(json!(1))
        );
    }

    #[test]
    fn locked_event_log_put() {
        let dir = tempdir().unwrap();
        let log = EventLog::open_multi(dir.path(), 10).unwrap();
        let locked = Locked::new(log, Mutex::new(()));
        let seq = locked.put("hello", Some("greeting")).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(
            locked.read().get(None, None).unwrap(),
            Some("hello".to_string())
        );
    }
}
