//! Serializing Decorator.
//!
//! Wraps an [`EventLog`] with caller-supplied serialize/deserialize so the
//! public API trades in `T` instead of raw payload strings (SPEC_FULL.md
//! §4.5). The core `EventLog` never parses payloads; this is the only layer
//! that does, and it does so entirely at the boundary via closures supplied
//! by the caller — the engine itself stays serialization-agnostic.
//!
//! A Rust `SerializingLog<T>` is specialized to one record type per
//! instance, unlike the dynamically-typed original where any value could be
//! `put` onto the same log. Heterogeneous logs are expressed by making `T`
//! an enum and giving `TypeName::type_name` a per-variant answer (see
//! DESIGN.md).

use crate::error::{Error, Result};
use crate::event_log::{EventLog, TagFilter};

/// Supplies the default tag a record type is filed under when `put` isn't
/// given one explicitly.
pub trait TypeName {
    fn type_name() -> &'static str;
}

/// Wraps an [`EventLog`] so its `put`/`get`/`replay` trade in `T` rather
/// than raw strings.
pub struct SerializingLog<T> {
    inner: EventLog,
    serialize: Box<dyn Fn(&T) -> String>,
    deserialize: Box<dyn Fn(&str) -> Result<T>>,
}

impl<T: TypeName> SerializingLog<T> {
    pub fn new(
        inner: EventLog,
        serialize: impl Fn(&T) -> String + 'static,
        deserialize: impl Fn(&str) -> Result<T> + 'static,
    ) -> Self {
        SerializingLog {
            inner,
            serialize: Box::new(serialize),
            deserialize: Box::new(deserialize),
        }
    }

    pub fn seq(&self) -> u64 {
        self.inner.seq()
    }

    /// Appends `record`, defaulting `tag` to `T::type_name()`. A mono log
    /// has only one implicit tag (its base name); any explicit `tag` here is
    /// ignored for a mono log, matching `EventLog::put`'s own mono behavior.
    pub fn put(&mut self, record: &T, tag: Option<&str>) -> Result<u64> {
        let payload = (self.serialize)(record);
        if payload.contains('\n') {
            return Err(Error::BadArgument(
                "serialized payload must not contain a newline".into(),
            ));
        }
        let effective_tag = if self.inner.is_mono() {
            None
        } else {
            Some(tag.unwrap_or_else(T::type_name))
        };
        self.inner.put(&payload, effective_tag)
    }

    /// Returns the latest matching record (by type-name tag set), or the one
    /// at exactly `seq` among those tags.
    pub fn get(&self, tags: Option<&[String]>, seq: Option<u64>) -> Result<Option<T>> {
        match self.inner.get(tags, seq)? {
            Some(payload) => Ok(Some((self.deserialize)(&payload)?)),
            None => Ok(None),
        }
    }

    pub fn replay<'a>(
        &'a self,
        start_seq: u64,
        tags: Option<TagFilter>,
    ) -> Result<SerializingReplay<'a, T>> {
        Ok(SerializingReplay {
            inner: self.inner.replay(start_seq, tags)?,
            deserialize: &self.deserialize,
        })
    }
}

pub struct SerializingReplay<'a, T> {
    inner: crate::event_log::EventReplay<'a>,
    deserialize: &'a (dyn Fn(&str) -> Result<T> + 'a),
}

impl<'a, T> SerializingReplay<'a, T> {
    pub fn next(&mut self) -> Result<Option<(u64, String, T)>> {
        match self.inner.next()? {
            Some(record) => {
                let value = (self.deserialize)(&record.payload)?;
                Ok(Some((record.seq, record.tag, value)))
            }
            None => Ok(None),
        }
    }
}
