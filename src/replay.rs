//! Merged replay iterator.
//!
//! The primitive that both engines build their public `replay`/`replay_all`
//! on: a lazy, strictly sequence-ordered stream drawn from one segment
//! reader per label (tag or partition), re-opening the next segment index
//! once every current reader is exhausted. See SPEC_FULL.md §4.4.

use crate::error::Result;
use crate::substrate::{LineReader, Substrate};

/// Whether a label's lines carry an embedded tag field (EventLog-multi) or
/// not (StateKeeper, EventLog-mono — the label is known from the filename
/// alone).
pub enum Arity {
    /// `<seq> <payload>\n`
    Two,
    /// `<seq> <tag> <payload>\n`; the tag must equal the owning label.
    Three,
}

pub struct RawRecord {
    pub seq: u64,
    pub label: String,
    pub payload: String,
}

/// K-way merge across one reader per label, re-opened segment index by
/// segment index. Does not snapshot the engine's current sequence at
/// construction: each step re-reads it, so a live iterator can observe
/// writes that happen after it was created.
pub struct RawMerge<'a> {
    substrate: &'a Substrate,
    arity: Arity,
    labels: Vec<String>,
    start_seq: u64,
    current_g: u64,
    current_seq: Box<dyn Fn() -> u64 + 'a>,
    readers: Vec<Option<LineReader>>,
    heads: Vec<Option<(u64, String)>>,
    opened_current_g: bool,
    done: bool,
}

impl<'a> RawMerge<'a> {
    pub fn new(
        substrate: &'a Substrate,
        arity: Arity,
        mut labels: Vec<String>,
        start_seq: u64,
        current_seq: impl Fn() -> u64 + 'a,
    ) -> Self {
        labels.sort();
        labels.dedup();
        let len = labels.len();
        RawMerge {
            substrate,
            arity,
            current_g: substrate.segment_of(start_seq),
            labels,
            start_seq,
            current_seq: Box::new(current_seq),
            readers: (0..len).map(|_| None).collect(),
            heads: (0..len).map(|_| None).collect(),
            opened_current_g: false,
            done: false,
        }
    }

    fn open_current_g(&mut self) -> Result<()> {
        for (idx, label) in self.labels.iter().enumerate() {
            let path = self.substrate.path_for(label, self.current_g);
            self.readers[idx] = if self.substrate.path_exists(&path) {
                Some(self.substrate.open_reader(&path)?)
            } else {
                None
            };
        }
        self.opened_current_g = true;
        Ok(())
    }

    fn pull(&mut self, idx: usize) -> Result<()> {
        let Some(reader) = self.readers[idx].as_mut() else {
            self.heads[idx] = None;
            return Ok(());
        };
        let next = match self.arity {
            Arity::Two => reader.next_record_2()?,
            Arity::Three => {
                let record = reader.next_record_3()?;
                record.map(|(seq, tag, payload)| {
                    debug_assert_eq!(tag, self.labels[idx], "tag/filename mismatch");
                    (seq, payload)
                })
            }
        };
        if next.is_none() {
            self.readers[idx] = None;
        }
        self.heads[idx] = next;
        Ok(())
    }

    fn fill_heads(&mut self) -> Result<()> {
        for idx in 0..self.labels.len() {
            if self.heads[idx].is_none() && self.readers[idx].is_some() {
                self.pull(idx)?;
            }
        }
        Ok(())
    }

    /// Returns the next record in sequence order, or `None` once replay has
    /// caught up with the engine's current sequence.
    pub fn next(&mut self) -> Result<Option<RawRecord>> {
        if self.done {
            return Ok(None);
        }
        loop {
            if !self.opened_current_g {
                self.open_current_g()?;
            }
            self.fill_heads()?;

            let mut best: Option<usize> = None;
            for (idx, head) in self.heads.iter().enumerate() {
                if let Some((seq, _)) = head {
                    match best {
                        None => best = Some(idx),
                        Some(best_idx) => {
                            let (best_seq, _) = self.heads[best_idx].as_ref().unwrap();
                            if seq < best_seq {
                                best = Some(idx);
                            }
                        }
                    }
                }
            }

            if let Some(idx) = best {
                let (seq, payload) = self.heads[idx].take().unwrap();
                self.pull(idx)?;
                if seq >= self.start_seq {
                    return Ok(Some(RawRecord {
                        seq,
                        label: self.labels[idx].clone(),
                        payload,
                    }));
                }
                continue;
            }

            let max_g = self.substrate.segment_of((self.current_seq)());
            if self.current_g >= max_g {
                self.done = true;
                return Ok(None);
            }
            self.current_g += 1;
            self.opened_current_g = false;
        }
    }
}
