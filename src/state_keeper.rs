//! Partitioned key/value store.
//!
//! See SPEC_FULL.md §4.2 for the write algorithm (snapshot/delta discipline)
//! and read algorithm (current vs. historical reconstruction).

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde_json::Value;

use crate::codec::{self, JsonMap};
use crate::error::{Error, Result};
use crate::replay::{Arity, RawMerge};
use crate::substrate::Substrate;
use crate::DEFAULT_SEGMENT_SIZE;

#[derive(Clone)]
struct PartitionCache {
    last_seq: u64,
    map: JsonMap,
}

struct EngineState {
    seq: u64,
    partitions: HashMap<String, PartitionCache>,
    loaded: bool,
}

/// Partitioned, append-only key/value store with point-in-time reads.
pub struct StateKeeper {
    substrate: Substrate,
    state: RefCell<EngineState>,
}

/// One yield from [`StateKeeper::replay`].
pub struct StateReplayItem {
    pub seq: u64,
    pub value: StateReplayValue,
}

pub enum StateReplayValue {
    /// The full partition map (reconstructed initial frame, or a full delta
    /// when no key filter is in effect).
    Map(JsonMap),
    /// A single key's value, or `None` for NOTFOUND.
    Key(Option<Value>),
}

/// One yield from [`StateKeeper::replay_all`].
pub struct MergedStateItem {
    pub seq: u64,
    pub value: MergedStateValue,
}

pub enum MergedStateValue {
    /// `{partition -> full delta map}`, coalesced from every partition that
    /// shares this sequence (see SPEC_FULL.md §4.4, cross-partition
    /// coalescing).
    ByPartition(BTreeMap<String, JsonMap>),
    /// `{partition -> value-or-NOTFOUND}`, used both for the synthetic
    /// initial frame and for subsequent key-filtered deltas.
    ByPartitionKey(BTreeMap<String, Option<Value>>),
}

impl StateKeeper {
    /// Opens (creating if missing) a StateKeeper rooted at `dir`, performing
    /// the mandatory reload-at-open pass.
    pub fn open(dir: impl AsRef<Path>, segment_size: u64) -> Result<Self> {
        let substrate = Substrate::open(dir, segment_size)?;
        let keeper = StateKeeper {
            substrate,
            state: RefCell::new(EngineState {
                seq: 0,
                partitions: HashMap::new(),
                loaded: false,
            }),
        };
        keeper.reload()?;
        Ok(keeper)
    }

    pub fn open_default(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open(dir, DEFAULT_SEGMENT_SIZE)
    }

    /// Current in-memory sequence counter.
    pub fn seq(&self) -> u64 {
        self.state.borrow().seq
    }

    /// Rebuilds the current-state cache from disk. Fails with
    /// `Error::Inconsistent` if a non-zero in-memory sequence disagrees with
    /// what's on disk now.
    pub fn reload(&self) -> Result<()> {
        let labels = self.substrate.enumerate_partitions()?;
        let mut partitions = HashMap::new();
        let mut max_seq = 0u64;
        for label in labels {
            if let Some((_, path)) = self.substrate.file_for_seq(&label, None)? {
                if let Some((last_seq, map)) = fold_segment(&self.substrate, &path, None)? {
                    max_seq = max_seq.max(last_seq);
                    partitions.insert(label, PartitionCache { last_seq, map });
                }
            }
        }

        let mut state = self.state.borrow_mut();
        if state.seq != 0 && state.seq != max_seq {
            log::warn!(
                "state keeper reload found inconsistent sequence: in-memory {} vs on-disk {}",
                state.seq,
                max_seq
            );
            return Err(Error::Inconsistent {
                expected: state.seq,
                found: max_seq,
            });
        }
        state.seq = max_seq;
        state.partitions = partitions;
        state.loaded = true;
        Ok(())
    }

    fn ensure_loaded(&self) -> Result<()> {
        if !self.state.borrow().loaded {
            self.reload()?;
        }
        Ok(())
    }

    /// Applies one partition's update under an already-assigned `seq`.
    /// Shared by `write` and `multi_write` (the latter calls this once per
    /// touched partition, all under the same `seq`).
    fn apply_write(&self, partition: &str, kv: &JsonMap, seq: u64) -> Result<()> {
        let g = self.substrate.segment_of(seq);
        let path = self.substrate.path_for(partition, g);

        let mut state = self.state.borrow_mut();
        let cache = state
            .partitions
            .entry(partition.to_string())
            .or_insert_with(|| PartitionCache {
                last_seq: 0,
                map: JsonMap::new(),
            });

        if self.substrate.path_exists(&path) {
            let payload = codec::format_json_map(kv)?;
            let line = codec::format_record_2(seq, &payload)?;
            self.substrate.append_line(&path, &line)?;
        } else {
            let mut snapshot = cache.map.clone();
            codec::merge_right_biased(&mut snapshot, kv);
            let payload = codec::format_json_map(&snapshot)?;
            let line = codec::format_record_2(seq, &payload)?;
            self.substrate.create_with_line(&path, &line)?;
            self.substrate.note_segment_created(partition, g)?;
        }

        codec::merge_right_biased(&mut cache.map, kv);
        cache.last_seq = seq;
        Ok(())
    }

    /// Writes `kv` into `partition`, incrementing the sequence counter by
    /// one. Returns the new sequence.
    pub fn write(&mut self, partition: &str, kv: JsonMap) -> Result<u64> {
        codec::validate_label(partition)?;
        self.ensure_loaded()?;
        let new_seq = self.state.borrow().seq + 1;
        self.apply_write(partition, &kv, new_seq)?;
        self.state.borrow_mut().seq = new_seq;
        Ok(new_seq)
    }

    /// Writes every partition's update under a single new sequence number.
    pub fn multi_write(&mut self, updates: BTreeMap<String, JsonMap>) -> Result<u64> {
        for partition in updates.keys() {
            codec::validate_label(partition)?;
        }
        self.ensure_loaded()?;
        let new_seq = self.state.borrow().seq + 1;
        for (partition, kv) in &updates {
            self.apply_write(partition, kv, new_seq)?;
        }
        self.state.borrow_mut().seq = new_seq;
        Ok(new_seq)
    }

    /// Reconstructs `partition`'s map as of `seq`, or the current map when
    /// `seq` is `None` or has caught up with the live sequence.
    pub fn get_partition(&self, partition: &str, seq: Option<u64>) -> Result<JsonMap> {
        self.ensure_loaded()?;
        match seq {
            None => Ok(self.current_map(partition)),
            Some(0) => Err(Error::BadArgument("seq must be >= 1".into())),
            Some(seq) => {
                if seq >= self.state.borrow().seq {
                    Ok(self.current_map(partition))
                } else {
                    Ok(self
                        .resolve_as_of(partition, seq)?
                        .map(|(_, map)| map)
                        .unwrap_or_default())
                }
            }
        }
    }

    /// Returns `key`'s value within `partition` (as of `seq`, or current),
    /// or `None` (NOTFOUND) when the key is absent.
    pub fn get_key(&self, partition: &str, key: &str, seq: Option<u64>) -> Result<Option<Value>> {
        Ok(self.get_partition(partition, seq)?.get(key).cloned())
    }

    /// The set of partitions known to the current-state cache.
    pub fn partitions(&self) -> Result<Vec<String>> {
        self.ensure_loaded()?;
        Ok(self.state.borrow().partitions.keys().cloned().collect())
    }

    fn current_map(&self, partition: &str) -> JsonMap {
        self.state
            .borrow()
            .partitions
            .get(partition)
            .map(|c| c.map.clone())
            .unwrap_or_default()
    }

    /// Finds, among `partition`'s segments at or before `seq`'s segment
    /// index, the closest one with an applicable record, and folds it.
    /// Walks backwards when the first candidate's snapshot already exceeds
    /// `seq` (a sparsely-written partition can leave an otherwise-matching
    /// segment with nothing applicable — see DESIGN.md).
    fn resolve_as_of(&self, partition: &str, seq: u64) -> Result<Option<(u64, JsonMap)>> {
        let target_g = self.substrate.segment_of(seq);
        let mut candidates: Vec<u64> = self
            .substrate
            .segments_of(partition)?
            .into_iter()
            .filter(|&g| g <= target_g)
            .collect();
        while let Some(g) = candidates.pop() {
            let path = self.substrate.path_for(partition, g);
            if let Some(result) = fold_segment(&self.substrate, &path, Some(seq))? {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    fn current_seq(&self) -> u64 {
        self.state.borrow().seq
    }

    /// Lazy replay of one partition, starting with the reconstructed state
    /// at `start_seq` and then every later delta.
    pub fn replay<'a>(
        &'a self,
        partition: &str,
        start_seq: u64,
        key: Option<&str>,
    ) -> Result<StateReplay<'a>> {
        if start_seq < 1 {
            return Err(Error::BadArgument("start_seq must be >= 1".into()));
        }
        self.ensure_loaded()?;
        let map = self
            .resolve_as_of(partition, start_seq)?
            .map(|(_, map)| map)
            .unwrap_or_default();
        let initial_value = match key {
            None => StateReplayValue::Map(map),
            Some(k) => StateReplayValue::Key(map.get(k).cloned()),
        };
        let initial = Some(StateReplayItem {
            seq: start_seq,
            value: initial_value,
        });
        let merge = RawMerge::new(
            &self.substrate,
            Arity::Two,
            vec![partition.to_string()],
            start_seq + 1,
            move || self.current_seq(),
        );
        Ok(StateReplay {
            merge,
            initial,
            key: key.map(str::to_string),
        })
    }

    /// Lazy, merged replay across several partitions (all known partitions
    /// when `partitions` is `None`).
    pub fn replay_all<'a>(
        &'a self,
        start_seq: u64,
        partitions: Option<&[String]>,
        key: Option<&str>,
    ) -> Result<MergedStateReplay<'a>> {
        if start_seq < 1 {
            return Err(Error::BadArgument("start_seq must be >= 1".into()));
        }
        self.ensure_loaded()?;
        let labels = match partitions {
            Some(p) => p.to_vec(),
            None => self.partitions()?,
        };

        let (initial, raw_start) = match key {
            None => (None, start_seq),
            Some(k) => {
                let mut map = BTreeMap::new();
                for partition in &labels {
                    let value = self
                        .resolve_as_of(partition, start_seq)?
                        .and_then(|(_, m)| m.get(k).cloned());
                    map.insert(partition.clone(), value);
                }
                let item = MergedStateItem {
                    seq: start_seq,
                    value: MergedStateValue::ByPartitionKey(map),
                };
                (Some(item), start_seq + 1)
            }
        };

        let merge = RawMerge::new(&self.substrate, Arity::Two, labels, raw_start, move || {
            self.current_seq()
        });
        Ok(MergedStateReplay {
            merge,
            key: key.map(str::to_string),
            initial,
            pending: None,
        })
    }
}

/// Folds one segment from its first line (the snapshot), applying deltas in
/// order. With `limit` set, stops at the first record whose sequence
/// exceeds it and returns `None` if even the snapshot already exceeds it
/// (nothing in this file applies as of `limit`).
fn fold_segment(
    substrate: &Substrate,
    path: &std::path::Path,
    limit: Option<u64>,
) -> Result<Option<(u64, JsonMap)>> {
    let mut reader = substrate.open_reader(path)?;
    let Some((seq0, payload0)) = reader.next_record_2()? else {
        log::warn!("corrupt segment: {} has no snapshot line", path.display());
        return Err(Error::Corrupt(format!(
            "segment {} has no snapshot line",
            path.display()
        )));
    };
    if let Some(l) = limit {
        if seq0 > l {
            return Ok(None);
        }
    }
    let mut map = codec::parse_json_map(&payload0)?;
    let mut last_seq = seq0;
    while let Some((seq, payload)) = reader.next_record_2()? {
        if let Some(l) = limit {
            if seq > l {
                break;
            }
        }
        let delta = codec::parse_json_map(&payload)?;
        codec::merge_right_biased(&mut map, &delta);
        last_seq = seq;
    }
    Ok(Some((last_seq, map)))
}

pub struct StateReplay<'a> {
    merge: RawMerge<'a>,
    initial: Option<StateReplayItem>,
    key: Option<String>,
}

impl<'a> StateReplay<'a> {
    pub fn next(&mut self) -> Result<Option<StateReplayItem>> {
        if let Some(item) = self.initial.take() {
            return Ok(Some(item));
        }
        loop {
            let Some(record) = self.merge.next()? else {
                return Ok(None);
            };
            let delta = codec::parse_json_map(&record.payload)?;
            match &self.key {
                None => {
                    return Ok(Some(StateReplayItem {
                        seq: record.seq,
                        value: StateReplayValue::Map(delta),
                    }))
                }
                Some(k) => {
                    if let Some(v) = delta.get(k) {
                        return Ok(Some(StateReplayItem {
                            seq: record.seq,
                            value: StateReplayValue::Key(Some(v.clone())),
                        }));
                    }
                    continue;
                }
            }
        }
    }
}

pub struct MergedStateReplay<'a> {
    merge: RawMerge<'a>,
    key: Option<String>,
    initial: Option<MergedStateItem>,
    pending: Option<(u64, String, String)>,
}

impl<'a> MergedStateReplay<'a> {
    fn take_or_pull(&mut self) -> Result<Option<(u64, String, String)>> {
        if let Some(p) = self.pending.take() {
            return Ok(Some(p));
        }
        Ok(self
            .merge
            .next()?
            .map(|r| (r.seq, r.label, r.payload)))
    }

    pub fn next(&mut self) -> Result<Option<MergedStateItem>> {
        if let Some(item) = self.initial.take() {
            return Ok(Some(item));
        }

        let Some(first) = self.take_or_pull()? else {
            return Ok(None);
        };
        let seq = first.0;
        let mut group = vec![(first.1, first.2)];
        loop {
            match self.merge.next()? {
                None => {
                    self.pending = None;
                    break;
                }
                Some(record) => {
                    if record.seq == seq {
                        group.push((record.label, record.payload));
                    } else {
                        self.pending = Some((record.seq, record.label, record.payload));
                        break;
                    }
                }
            }
        }

        match &self.key {
            None => {
                let mut map = BTreeMap::new();
                for (label, payload) in group {
                    map.insert(label, codec::parse_json_map(&payload)?);
                }
                Ok(Some(MergedStateItem {
                    seq,
                    value: MergedStateValue::ByPartition(map),
                }))
            }
            Some(k) => {
                let mut map = BTreeMap::new();
                for (label, payload) in group {
                    let delta = codec::parse_json_map(&payload)?;
                    if let Some(v) = delta.get(k) {
                        map.insert(label, Some(v.clone()));
                    }
                }
                if map.is_empty() {
                    return self.next();
                }
                Ok(Some(MergedStateItem {
                    seq,
                    value: MergedStateValue::ByPartitionKey(map),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn kv(pairs: &[(&str, Value)]) -> JsonMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn segmented_single_partition_scenario() {
        let dir = tempdir().unwrap();
        let mut store = StateKeeper::open(dir.path(), 5).unwrap();
        for k in 0..=20u64 {
            store.write("ns", kv(&[("k", json!(k))])).unwrap();
        }

        for g in 0..4 {
            let path = dir.path().join(format!("ns.00000000{g}"));
            let lines = std::fs::read_to_string(&path).unwrap();
            assert_eq!(lines.lines().count(), 5);
        }
        let last = dir.path().join("ns.000000004");
        assert_eq!(std::fs::read_to_string(last).unwrap().lines().count(), 1);

        assert_eq!(store.get_key("ns", "k", None).unwrap(), Some(json!(20)));
        assert_eq!(store.get_key("ns", "k", Some(1)).unwrap(), Some(json!(0)));
        assert_eq!(store.get_key("ns", "k", Some(15)).unwrap(), Some(json!(14)));
    }

    #[test]
    fn multi_write_single_sequence_across_partitions() {
        let dir = tempdir().unwrap();
        let mut store = StateKeeper::open(dir.path(), 10).unwrap();
        let mut updates = BTreeMap::new();
        updates.insert("a".to_string(), kv(&[("x", json!(1))]));
        updates.insert("b".to_string(), kv(&[("y", json!(2))]));
        let seq = store.multi_write(updates).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(store.get_key("a", "x", None).unwrap(), Some(json!(1)));
        assert_eq!(store.get_key("b", "y", None).unwrap(), Some(json!(2)));
        for label in ["a", "b"] {
            let path = dir.path().join(format!("{label}.000000000"));
            assert_eq!(std::fs::read_to_string(path).unwrap().lines().count(), 1);
        }
    }

    #[test]
    fn historical_read_crosses_segment_boundary() {
        let dir = tempdir().unwrap();
        let mut store = StateKeeper::open(dir.path(), 5).unwrap();
        for k in 0..=20u64 {
            store.write("ns", kv(&[("k", json!(k))])).unwrap();
        }
        assert_eq!(store.get_key("ns", "k", Some(6)).unwrap(), Some(json!(5)));
    }

    #[test]
    fn replay_with_key_filter_yields_reconstructed_initial_frame() {
        let dir = tempdir().unwrap();
        let mut store = StateKeeper::open(dir.path(), 5).unwrap();
        for k in 0..=20u64 {
            store.write("ns", kv(&[("k", json!(k))])).unwrap();
        }
        let mut replay = store.replay("ns", 8, Some("k")).unwrap();
        let first = replay.next().unwrap().unwrap();
        assert_eq!(first.seq, 8);
        match first.value {
            StateReplayValue::Key(Some(v)) => assert_eq!(v, json!(7)),
            _ => panic!("expected key value"),
        }
        let mut expect = 8u64;
        while let Some(item) = replay.next().unwrap() {
            expect += 1;
            assert_eq!(item.seq, expect);
            match item.value {
                StateReplayValue::Key(Some(v)) => assert_eq!(v, json!(expect - 1)),
                _ => panic!("expected key value"),
            }
        }
        assert_eq!(expect, 20);
    }

    #[test]
    fn replay_all_coalesces_multi_write_into_one_frame() {
        let dir = tempdir().unwrap();
        let mut store = StateKeeper::open(dir.path(), 10).unwrap();
        let mut updates = BTreeMap::new();
        updates.insert("a".to_string(), kv(&[("x", json!(1))]));
        updates.insert("b".to_string(), kv(&[("y", json!(2))]));
        store.multi_write(updates).unwrap();

        let mut replay = store.replay_all(1, None, None).unwrap();
        let first = replay.next().unwrap().unwrap();
        assert_eq!(first.seq, 1);
        match first.value {
            MergedStateValue::ByPartition(map) => {
                assert_eq!(map.len(), 2);
                assert_eq!(map["a"]["x"], json!(1));
                assert_eq!(map["b"]["y"], json!(2));
            }
            _ => panic!("expected coalesced map"),
        }
        assert!(replay.next().unwrap().is_none());
    }

    #[test]
    fn seq_zero_is_bad_argument() {
        let dir = tempdir().unwrap();
        let store = StateKeeper::open(dir.path(), 10).unwrap();
        assert!(matches!(
            store.get_partition("ns", Some(0)),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn empty_store_has_no_partitions_and_zero_seq() {
        let dir = tempdir().unwrap();
        let store = StateKeeper::open(dir.path(), 10).unwrap();
        assert_eq!(store.seq(), 0);
        assert!(store.partitions().unwrap().is_empty());
        assert!(store.get_partition("ns", None).unwrap().is_empty());
    }

    #[test]
    fn reopen_preserves_sequence_and_values() {
        let dir = tempdir().unwrap();
        {
            let mut store = StateKeeper::open(dir.path(), 10).unwrap();
            store.write("ns", kv(&[("k", json!(1))])).unwrap();
            store.write("ns", kv(&[("k", json!(2))])).unwrap();
        }
        let store = StateKeeper::open(dir.path(), 10).unwrap();
        assert_eq!(store.seq(), 2);
        assert_eq!(store.get_key("ns", "k", None).unwrap(), Some(json!(2)));
    }

    #[test]
    fn reload_rejects_on_disk_sequence_that_outruns_memory() {
        let _ = env_logger::try_init();
        let dir = tempdir().unwrap();
        let mut store = StateKeeper::open(dir.path(), 10).unwrap();
        store.write("ns", kv(&[("k", json!(1))])).unwrap();

        // Simulate a second writer appending past what this handle knows
        // about: the in-memory counter is now stale relative to disk.
        let path = dir.path().join("ns.000000000");
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        use std::io::Write;
        file.write_all(b"2 {\"k\":2}\n").unwrap();

        assert!(matches!(
            store.reload(),
            Err(Error::Inconsistent {
                expected: 1,
                found: 2
            })
        ));
    }
}
