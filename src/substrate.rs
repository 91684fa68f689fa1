//! Segmented log substrate.
//!
//! Locates, opens and iterates segment files; computes the segment index for
//! a sequence number; chooses the target file for a write; enumerates
//! partitions. Everything above this module (StateKeeper, EventLog) is built
//! on these primitives and never touches the filesystem directly.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::codec;
use crate::error::{Error, Result};

/// Width of the zero-padded segment index in a segment file name. Part of
/// the on-disk format; not configurable.
const SEGMENT_INDEX_WIDTH: usize = 9;

/// Scans a directory's file names once and remembers them until a write
/// creates a new segment; re-enumerating a large directory is the one
/// "hot" call in this module (see SPEC_FULL.md §4.1).
struct Listing {
    /// partition/tag -> sorted segment indices present on disk.
    by_label: HashMap<String, Vec<u64>>,
    populated: bool,
}

impl Listing {
    fn empty() -> Self {
        Listing {
            by_label: HashMap::new(),
            populated: false,
        }
    }
}

pub struct Substrate {
    dir: PathBuf,
    segment_size: u64,
    listing: RefCell<Listing>,
}

impl Substrate {
    pub fn open(dir: impl AsRef<Path>, segment_size: u64) -> Result<Self> {
        if segment_size == 0 {
            return Err(Error::BadArgument("segment size must be positive".into()));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Substrate {
            dir,
            segment_size,
            listing: RefCell::new(Listing::empty()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Floor(seq / segment_size). Segment `G` covers `[G*size, (G+1)*size - 1]`.
    pub fn segment_of(&self, seq: u64) -> u64 {
        seq / self.segment_size
    }

    pub fn path_for(&self, label: &str, g: u64) -> PathBuf {
        self.dir.join(format!("{label}.{g:0width$}", width = SEGMENT_INDEX_WIDTH))
    }

    fn ensure_scanned(&self) -> Result<()> {
        if self.listing.borrow().populated {
            return Ok(());
        }
        let mut by_label: HashMap<String, Vec<u64>> = HashMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some((label, index)) = name.rsplit_once('.') else {
                continue;
            };
            let Ok(g) = index.parse::<u64>() else {
                continue;
            };
            by_label.entry(label.to_string()).or_default().push(g);
        }
        for segments in by_label.values_mut() {
            segments.sort_unstable();
        }
        let mut listing = self.listing.borrow_mut();
        listing.by_label = by_label;
        listing.populated = true;
        Ok(())
    }

    /// All distinct labels (partitions or tags) with at least one segment.
    pub fn enumerate_partitions(&self) -> Result<Vec<String>> {
        self.ensure_scanned()?;
        Ok(self.listing.borrow().by_label.keys().cloned().collect())
    }

    /// Sorted segment indices present for `label`. Empty if `label` is unknown.
    pub fn segments_of(&self, label: &str) -> Result<Vec<u64>> {
        self.ensure_scanned()?;
        Ok(self
            .listing
            .borrow()
            .by_label
            .get(label)
            .cloned()
            .unwrap_or_default())
    }

    /// Records that a write just created a new segment file, so the next
    /// lookup for `label` observes it without a full directory re-scan.
    pub fn note_segment_created(&self, label: &str, g: u64) -> Result<()> {
        self.ensure_scanned()?;
        let mut listing = self.listing.borrow_mut();
        let segments = listing.by_label.entry(label.to_string()).or_default();
        if !segments.contains(&g) {
            segments.push(g);
            segments.sort_unstable();
        }
        Ok(())
    }

    /// Chooses the file to open to read state/events as of `seq`, or the
    /// latest file when `seq` is `None`. Returns `None` when no segment
    /// qualifies (e.g. the label doesn't exist yet, or `seq` predates any
    /// segment of it).
    pub fn file_for_seq(&self, label: &str, seq: Option<u64>) -> Result<Option<(u64, PathBuf)>> {
        let segments = self.segments_of(label)?;
        let chosen = match seq {
            None => segments.iter().copied().max(),
            Some(seq) => {
                let target = self.segment_of(seq);
                if segments.contains(&target) {
                    Some(target)
                } else {
                    segments.iter().copied().filter(|&g| g < target).max()
                }
            }
        };
        Ok(chosen.map(|g| (g, self.path_for(label, g))))
    }

    /// Appends a record line to an existing segment file.
    pub fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Creates a new segment file containing exactly `line` (the snapshot,
    /// for StateKeeper, or the sole record so far, for EventLog).
    pub fn create_with_line(&self, path: &Path, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    pub fn open_reader(&self, path: &Path) -> Result<LineReader> {
        LineReader::open(path)
    }
}

/// Reads records line-by-line from one segment file, stopping cleanly at
/// EOF and failing on a partial trailing line.
pub struct LineReader {
    reader: BufReader<File>,
}

impl LineReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(LineReader {
            reader: BufReader::new(file),
        })
    }

    /// Reads the next raw line, including its trailing `\n`. Returns `None`
    /// at a clean EOF; fails with `Corrupt` on a non-empty line missing its
    /// terminator.
    pub fn next_raw_line(&mut self) -> Result<Option<String>> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if !buf.ends_with('\n') {
            log::warn!("corrupt segment: ends with a partial trailing line");
            return Err(Error::Corrupt(
                "segment ends with a partial trailing line".into(),
            ));
        }
        Ok(Some(buf))
    }

    pub fn next_record_2(&mut self) -> Result<Option<(u64, String)>> {
        match self.next_raw_line()? {
            Some(line) => Ok(Some(codec::parse_record_2(&line)?)),
            None => Ok(None),
        }
    }

    pub fn next_record_3(&mut self) -> Result<Option<(u64, String, String)>> {
        match self.next_raw_line()? {
            Some(line) => Ok(Some(codec::parse_record_3(&line)?)),
            None => Ok(None),
        }
    }
}
