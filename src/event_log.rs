//! Append-only tagged record log (mono and multi variants).
//!
//! Mono and multi share this one implementation and differ only in how tags
//! are embedded on disk: mono uses a single fixed base name as the only
//! label and two-field lines; multi uses the tag as the label and carries it
//! a second time in the line (see SPEC_FULL.md §4.3). `EventLog::open_mono`
//! and `EventLog::open_multi` are the two constructors.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

use regex::Regex;

use crate::codec;
use crate::error::{Error, Result};
use crate::replay::{Arity, RawMerge};
use crate::substrate::Substrate;
use crate::DEFAULT_SEGMENT_SIZE;

/// Tag filter accepted by [`EventLog::replay`]. `get` only accepts the list
/// form (SPEC_FULL.md §4.3).
pub enum TagFilter {
    List(Vec<String>),
    Regex(String),
}

pub struct EventRecord {
    pub seq: u64,
    pub tag: String,
    pub payload: String,
}

pub struct EventLog {
    substrate: Substrate,
    /// `Some(base)` for the mono variant (the one and only label); `None`
    /// for multi, where the label is whatever tag a write names.
    mono_label: Option<String>,
    tails: RefCell<HashMap<String, (u64, String)>>,
    seq: RefCell<u64>,
    loaded: RefCell<bool>,
}

impl EventLog {
    pub fn open_mono(dir: impl AsRef<Path>, segment_size: u64, base_name: &str) -> Result<Self> {
        codec::validate_label(base_name)?;
        let log = Self::open_inner(dir, segment_size, Some(base_name.to_string()))?;
        log.reload()?;
        Ok(log)
    }

    pub fn open_mono_default(dir: impl AsRef<Path>, base_name: &str) -> Result<Self> {
        Self::open_mono(dir, DEFAULT_SEGMENT_SIZE, base_name)
    }

    pub fn open_multi(dir: impl AsRef<Path>, segment_size: u64) -> Result<Self> {
        let log = Self::open_inner(dir, segment_size, None)?;
        log.reload()?;
        Ok(log)
    }

    pub fn open_multi_default(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_multi(dir, DEFAULT_SEGMENT_SIZE)
    }

    fn open_inner(
        dir: impl AsRef<Path>,
        segment_size: u64,
        mono_label: Option<String>,
    ) -> Result<Self> {
        let substrate = Substrate::open(dir, segment_size)?;
        Ok(EventLog {
            substrate,
            mono_label,
            tails: RefCell::new(HashMap::new()),
            seq: RefCell::new(0),
            loaded: RefCell::new(false),
        })
    }

    /// Whether this log is the mono variant (single implicit tag).
    pub fn is_mono(&self) -> bool {
        self.mono_label.is_some()
    }

    fn arity(&self) -> Arity {
        if self.mono_label.is_some() {
            Arity::Two
        } else {
            Arity::Three
        }
    }

    pub fn seq(&self) -> u64 {
        *self.seq.borrow()
    }

    fn current_seq(&self) -> u64 {
        self.seq()
    }

    fn ensure_loaded(&self) -> Result<()> {
        if !*self.loaded.borrow() {
            self.reload()?;
        }
        Ok(())
    }

    /// Rebuilds the per-tag tail cache and the sequence counter from disk.
    pub fn reload(&self) -> Result<()> {
        let labels = self.substrate.enumerate_partitions()?;
        let mut tails = HashMap::new();
        let mut max_seq = 0u64;
        for label in labels {
            if let Some((_, path)) = self.substrate.file_for_seq(&label, None)? {
                if let Some((seq, payload)) = self.last_record(&path, &label)? {
                    max_seq = max_seq.max(seq);
                    tails.insert(label, (seq, payload));
                }
            }
        }

        let mut current = self.seq.borrow_mut();
        if *current != 0 && *current != max_seq {
            log::warn!(
                "event log reload found inconsistent sequence: in-memory {} vs on-disk {}",
                current,
                max_seq
            );
            return Err(Error::Inconsistent {
                expected: *current,
                found: max_seq,
            });
        }
        *current = max_seq;
        *self.tails.borrow_mut() = tails;
        *self.loaded.borrow_mut() = true;
        Ok(())
    }

    fn next_record(
        &self,
        reader: &mut crate::substrate::LineReader,
        label: &str,
    ) -> Result<Option<(u64, String)>> {
        match self.arity() {
            Arity::Two => reader.next_record_2(),
            Arity::Three => Ok(reader.next_record_3()?.map(|(seq, tag, payload)| {
                debug_assert_eq!(tag, label, "tag/filename mismatch");
                (seq, payload)
            })),
        }
    }

    fn last_record(&self, path: &Path, label: &str) -> Result<Option<(u64, String)>> {
        let mut reader = self.substrate.open_reader(path)?;
        let mut last = None;
        while let Some(record) = self.next_record(&mut reader, label)? {
            last = Some(record);
        }
        Ok(last)
    }

    fn label_for_put(&self, tag: Option<&str>) -> Result<String> {
        match (&self.mono_label, tag) {
            (Some(base), None) => Ok(base.clone()),
            (Some(_), Some(_)) => Err(Error::BadArgument(
                "a mono event log does not accept an explicit tag".into(),
            )),
            (None, Some(t)) => {
                codec::validate_label(t)?;
                Ok(t.to_string())
            }
            (None, None) => Err(Error::BadArgument(
                "a multi event log requires a tag".into(),
            )),
        }
    }

    /// Appends `payload` under `tag` (mono: pass `None`), incrementing the
    /// sequence counter by one.
    pub fn put(&mut self, payload: &str, tag: Option<&str>) -> Result<u64> {
        let label = self.label_for_put(tag)?;
        self.ensure_loaded()?;
        let new_seq = self.seq() + 1;
        let g = self.substrate.segment_of(new_seq);
        let path = self.substrate.path_for(&label, g);

        let line = match self.arity() {
            Arity::Two => codec::format_record_2(new_seq, payload)?,
            Arity::Three => codec::format_record_3(new_seq, &label, payload)?,
        };

        if self.substrate.path_exists(&path) {
            self.substrate.append_line(&path, &line)?;
        } else {
            self.substrate.create_with_line(&path, &line)?;
            self.substrate.note_segment_created(&label, g)?;
        }

        self.tails
            .borrow_mut()
            .insert(label, (new_seq, payload.to_string()));
        *self.seq.borrow_mut() = new_seq;
        Ok(new_seq)
    }

    fn resolve_get_labels(&self, tags: Option<&[String]>) -> Vec<String> {
        match &self.mono_label {
            Some(base) => vec![base.clone()],
            None => match tags {
                None => self.tails.borrow().keys().cloned().collect(),
                Some(list) => list.to_vec(),
            },
        }
    }

    /// Returns the payload of the latest record among `tags` (all tags when
    /// omitted), or the record at exactly `seq` among those tags.
    pub fn get(&self, tags: Option<&[String]>, seq: Option<u64>) -> Result<Option<String>> {
        self.ensure_loaded()?;
        let labels = self.resolve_get_labels(tags);
        match seq {
            None => {
                let tails = self.tails.borrow();
                Ok(labels
                    .iter()
                    .filter_map(|l| tails.get(l).cloned())
                    .max_by_key(|(seq, _)| *seq)
                    .map(|(_, payload)| payload))
            }
            Some(0) => Err(Error::BadArgument("seq must be >= 1".into())),
            Some(seq) => {
                for label in &labels {
                    let Some((_, path)) = self.substrate.file_for_seq(label, Some(seq))? else {
                        continue;
                    };
                    let mut reader = self.substrate.open_reader(&path)?;
                    while let Some((found_seq, payload)) = self.next_record(&mut reader, label)? {
                        if found_seq == seq {
                            return Ok(Some(payload));
                        }
                        if found_seq > seq {
                            break;
                        }
                    }
                }
                Ok(None)
            }
        }
    }

    fn resolve_replay_labels(&self, tags: Option<TagFilter>) -> Result<Vec<String>> {
        match &self.mono_label {
            Some(base) => Ok(vec![base.clone()]),
            None => {
                let all = self.substrate.enumerate_partitions()?;
                match tags {
                    None => Ok(all),
                    Some(TagFilter::List(list)) => {
                        Ok(all.into_iter().filter(|t| list.contains(t)).collect())
                    }
                    Some(TagFilter::Regex(pattern)) => {
                        let re = Regex::new(&pattern)
                            .map_err(|e| Error::BadArgument(format!("invalid tag regex: {e}")))?;
                        Ok(all.into_iter().filter(|t| re.is_match(t)).collect())
                    }
                }
            }
        }
    }

    /// Lazy, merged replay across the selected tags, starting literally at
    /// `start_seq` (no reconstructed initial frame — every line is
    /// self-contained, unlike StateKeeper).
    pub fn replay<'a>(
        &'a self,
        start_seq: u64,
        tags: Option<TagFilter>,
    ) -> Result<EventReplay<'a>> {
        if start_seq < 1 {
            return Err(Error::BadArgument("start_seq must be >= 1".into()));
        }
        self.ensure_loaded()?;
        let labels = self.resolve_replay_labels(tags)?;
        let merge = RawMerge::new(&self.substrate, self.arity(), labels, start_seq, move || {
            self.current_seq()
        });
        Ok(EventReplay { merge })
    }

    /// All known tags (the mono variant's single base name, once written).
    pub fn tags(&self) -> Result<Vec<String>> {
        self.substrate.enumerate_partitions()
    }

    fn count_label(&self, label: &str) -> Result<u64> {
        let mut total = 0u64;
        for g in self.substrate.segments_of(label)? {
            let path = self.substrate.path_for(label, g);
            let mut reader = self.substrate.open_reader(&path)?;
            while reader.next_raw_line()?.is_some() {
                total += 1;
            }
        }
        Ok(total)
    }

    /// Counts on-disk records for `tag` (or every tag, when omitted)
    /// without materializing payloads.
    pub fn count(&self, tag: Option<&str>) -> Result<u64> {
        match (&self.mono_label, tag) {
            (Some(base), _) => self.count_label(base),
            (None, Some(t)) => self.count_label(t),
            (None, None) => {
                let mut total = 0;
                for label in self.substrate.enumerate_partitions()? {
                    total += self.count_label(&label)?;
                }
                Ok(total)
            }
        }
    }

    pub fn len(&self) -> Result<u64> {
        self.count(None)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

pub struct EventReplay<'a> {
    merge: RawMerge<'a>,
}

impl<'a> EventReplay<'a> {
    pub fn next(&mut self) -> Result<Option<EventRecord>> {
        Ok(self.merge.next()?.map(|record| EventRecord {
            seq: record.seq,
            tag: record.label,
            payload: record.payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn event_log_multi_merge_scenario() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open_multi(dir.path(), 5).unwrap();
        for i in 1..=12u64 {
            let tag = if i % 2 == 1 { "a" } else { "b" };
            log.put(&format!("v{i}"), Some(tag)).unwrap();
        }

        let mut replay = log.replay(1, None).unwrap();
        for i in 1..=12u64 {
            let record = replay.next().unwrap().unwrap();
            assert_eq!(record.seq, i);
            assert_eq!(record.payload, format!("v{i}"));
        }
        assert!(replay.next().unwrap().is_none());

        let mut only_a = log
            .replay(1, Some(TagFilter::List(vec!["a".to_string()])))
            .unwrap();
        let mut count = 0;
        while let Some(record) = only_a.next().unwrap() {
            assert_eq!(record.tag, "a");
            count += 1;
        }
        assert_eq!(count, 6);
    }

    #[test]
    fn event_log_mono_round_trip() {
        let dir = tempdir().unwrap();
        {
            let mut log = EventLog::open_mono(dir.path(), 10, "events").unwrap();
            log.put("first", None).unwrap();
            log.put("second", None).unwrap();
        }
        let log = EventLog::open_mono(dir.path(), 10, "events").unwrap();
        assert_eq!(log.seq(), 2);
        assert_eq!(log.get(None, None).unwrap(), Some("second".to_string()));
        assert_eq!(log.get(None, Some(1)).unwrap(), Some("first".to_string()));
    }

    #[test]
    fn get_at_seq_returns_none_when_absent() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open_multi(dir.path(), 10).unwrap();
        log.put("a-payload", Some("a")).unwrap();
        assert_eq!(log.get(Some(&["b".to_string()]), None).unwrap(), None);
        assert!(matches!(
            log.get(None, Some(0)),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn tags_and_count_track_writes() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open_multi(dir.path(), 10).unwrap();
        log.put("1", Some("a")).unwrap();
        log.put("2", Some("a")).unwrap();
        log.put("3", Some("b")).unwrap();

        let mut tags = log.tags().unwrap();
        tags.sort();
        assert_eq!(tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(log.count(Some("a")).unwrap(), 2);
        assert_eq!(log.count(Some("b")).unwrap(), 1);
        assert_eq!(log.len().unwrap(), 3);
    }

    #[test]
    fn regex_tag_filter_selects_matching_tags() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open_multi(dir.path(), 10).unwrap();
        log.put("1", Some("orders_created")).unwrap();
        log.put("2", Some("orders_filled")).unwrap();
        log.put("3", Some("accounts_opened")).unwrap();

        let mut replay = log
            .replay(1, Some(TagFilter::Regex("^orders_".to_string())))
            .unwrap();
        let mut seen = vec![];
        while let Some(record) = replay.next().unwrap() {
            seen.push(record.tag);
        }
        seen.sort();
        assert_eq!(seen, vec!["orders_created", "orders_filled"]);
    }

    #[test]
    fn reload_rejects_on_disk_sequence_that_outruns_memory() {
        let _ = env_logger::try_init();
        let dir = tempdir().unwrap();
        let mut log = EventLog::open_multi(dir.path(), 10).unwrap();
        log.put("first", Some("a")).unwrap();

        let path = dir.path().join("a.000000000");
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        use std::io::Write;
        file.write_all(b"2 a second\n").unwrap();

        assert!(matches!(
            log.reload(),
            Err(Error::Inconsistent {
                expected: 1,
                found: 2
            })
        ));
    }
}
